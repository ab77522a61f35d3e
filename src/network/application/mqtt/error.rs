//! Error types of the MQTT client.

use super::codec::CodecError;
use crate::network;

/// Result alias used throughout the MQTT client.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned synchronously by the client API.
///
/// Failures that happen after a call returned (a broker refusing a
/// subscription, an acknowledgment that never arrives, a dropped connection)
/// are reported through [`Event`](super::event::Event)s instead.
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum Error {
    /// The caller passed an argument that violates the API contract.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// A bounded resource is exhausted.
    #[error("resource exhausted: {0}")]
    Resource(&'static str),
    /// A packet could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The transport failed or timed out.
    #[error("transport: {0}")]
    Transport(#[from] network::Error),
    /// The operation needs an established broker session.
    #[error("client is not connected")]
    NotConnected,
    /// The operation is not valid in the current connection state.
    #[error("operation not valid in the current state")]
    InvalidState,
    /// The client was destroyed.
    #[error("client was destroyed")]
    Destroyed,
    /// The broker or the transport refused the connection.
    #[error("connect failed: {0}")]
    ConnectFailed(ConnectStatus),
}

/// Outcome of a connection attempt.
///
/// Codes 0 to 5 are the CONNACK return codes of MQTT 3.1.1; the remaining
/// variants describe failures that happen before a CONNACK is seen.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectStatus {
    /// 0x00, connection accepted.
    Accepted,
    /// 0x01, the broker does not support protocol level 4.
    UnacceptableProtocolVersion,
    /// 0x02, the client identifier is not allowed.
    IdentifierRejected,
    /// 0x03, the MQTT service is unavailable.
    ServerUnavailable,
    /// 0x04, malformed user name or password.
    BadCredentials,
    /// 0x05, the client is not authorized to connect.
    NotAuthorized,
    /// A CONNACK return code outside the 3.1.1 range.
    Unknown(u8),
    /// The transport could not be opened.
    NetworkError,
    /// The CONNECT packet could not be sent.
    SendFailed,
    /// No CONNACK arrived within the connect timeout.
    Timeout,
    /// Something other than a well formed CONNACK arrived.
    ProtocolError,
}

impl ConnectStatus {
    /// Map a CONNACK return code.
    pub fn from_return_code(code: u8) -> Self {
        match code {
            0 => ConnectStatus::Accepted,
            1 => ConnectStatus::UnacceptableProtocolVersion,
            2 => ConnectStatus::IdentifierRejected,
            3 => ConnectStatus::ServerUnavailable,
            4 => ConnectStatus::BadCredentials,
            5 => ConnectStatus::NotAuthorized,
            other => ConnectStatus::Unknown(other),
        }
    }
}

impl core::fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectStatus::Accepted => write!(f, "accepted"),
            ConnectStatus::UnacceptableProtocolVersion => write!(f, "unacceptable protocol version"),
            ConnectStatus::IdentifierRejected => write!(f, "identifier rejected"),
            ConnectStatus::ServerUnavailable => write!(f, "server unavailable"),
            ConnectStatus::BadCredentials => write!(f, "bad user name or password"),
            ConnectStatus::NotAuthorized => write!(f, "not authorized"),
            ConnectStatus::Unknown(code) => write!(f, "unknown return code {}", code),
            ConnectStatus::NetworkError => write!(f, "network error"),
            ConnectStatus::SendFailed => write!(f, "sending CONNECT failed"),
            ConnectStatus::Timeout => write!(f, "timed out waiting for CONNACK"),
            ConnectStatus::ProtocolError => write!(f, "expected CONNACK"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::InvalidParameter(what) => defmt::write!(f, "InvalidParameter({})", what),
            Error::Resource(what) => defmt::write!(f, "Resource({})", what),
            Error::Codec(e) => defmt::write!(f, "Codec({})", e),
            Error::Transport(e) => defmt::write!(f, "Transport({})", e),
            Error::NotConnected => defmt::write!(f, "NotConnected"),
            Error::InvalidState => defmt::write!(f, "InvalidState"),
            Error::Destroyed => defmt::write!(f, "Destroyed"),
            Error::ConnectFailed(status) => defmt::write!(f, "ConnectFailed({})", status),
        }
    }
}
