//! A network abstraction layer for embedded systems
//!
//! This module provides the transport traits the MQTT engine is written against.
//! A transport is split into a [`Connect`]or, which opens byte-stream connections
//! to a remote host, and the [`Connection`] it produces. Connections take `&self`
//! for every operation so that one thread can block in a receive while another
//! thread transmits on the same socket, which is how a TCP socket behaves.
//!

#![deny(unsafe_code)]

use core::time::Duration;

/// Common error types for network operations
pub mod error;

/// `std::net` TCP transport
pub mod tcp;

/// Application layer protocols
pub mod application;

pub use error::Error;

/// Re-exports of common traits
pub mod prelude {
    pub use super::{Connect, Connection};
}

/// An established, bidirectional byte stream.
///
/// Both directions are bounded by an explicit timeout. A receive that returns
/// `Ok(0)` means the peer closed the stream; a receive that waited the full
/// timeout without data returns [`Error::Timeout`].
pub trait Connection: Send + Sync {
    /// Send bytes, waiting at most `timeout`. Returns the number of bytes written.
    fn send_timeout(&self, buf: &[u8], timeout: Duration) -> Result<usize, Error>;

    /// Receive into `buf`, waiting at most `timeout`. Returns the number of bytes read.
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Close the connection. Closing twice is not an error.
    fn close(&self) -> Result<(), Error>;
}

/// A synchronous connector (client)
pub trait Connect: Send {
    /// Associated connection type
    type Connection: Connection + 'static;

    /// Open a connection to `host:port`, waiting at most `timeout`.
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self::Connection, Error>;
}

/// Send the whole buffer, retrying partial writes until `timeout` is used up.
pub fn send_all<C: Connection + ?Sized>(
    connection: &C,
    mut buf: &[u8],
    timeout: Duration,
) -> Result<(), Error> {
    let deadline = std::time::Instant::now() + timeout;
    while !buf.is_empty() {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        if left.is_zero() {
            return Err(Error::Timeout);
        }
        match connection.send_timeout(buf, left)? {
            0 => return Err(Error::ConnectionClosed),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}
