//! TCP transport over `std::net::TcpStream`.
//!
//! ```rust,no_run
//! use core::time::Duration;
//! use libiot_mqtt::network::tcp::TcpConnector;
//! use libiot_mqtt::network::{Connect, Connection};
//!
//! let mut connector = TcpConnector::default();
//! let conn = connector.connect("test.mosquitto.org", 1883, Duration::from_secs(5)).unwrap();
//! conn.send_timeout(&[0xC0, 0x00], Duration::from_secs(1)).unwrap();
//! ```

use core::time::Duration;
use std::io::{Read as StdRead, Write as StdWrite};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use super::{Connect, Connection, Error};

// `set_read_timeout(Some(0))` is rejected by std.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Opens plain TCP connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector {
    /// Disable Nagle's algorithm on new sockets.
    pub nodelay: bool,
}

/// A connected TCP socket.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    /// Wrap an already connected stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Connect for TcpConnector {
    type Connection = TcpConnection;

    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<TcpConnection, Error> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?;

        let mut last = Error::InvalidAddress;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout.max(MIN_TIMEOUT)) {
                Ok(stream) => {
                    stream.set_nodelay(self.nodelay)?;
                    log::debug!("tcp connected to {}", addr);
                    return Ok(TcpConnection::new(stream));
                }
                Err(e) => {
                    log::debug!("tcp connect to {} failed: {}", addr, e);
                    last = e.into();
                }
            }
        }
        Err(last)
    }
}

impl Connection for TcpConnection {
    fn send_timeout(&self, buf: &[u8], timeout: Duration) -> Result<usize, Error> {
        self.stream.set_write_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        (&self.stream).write(buf).map_err(Error::from)
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        self.stream.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        (&self.stream).read(buf).map_err(Error::from)
    }

    fn close(&self) -> Result<(), Error> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
