//! MQTT 3.1.1 client engine.
//!
//! MQTT (Message Queuing Telemetry Transport) is a lightweight
//! publish-subscribe protocol: clients publish messages to topics on a
//! broker and receive messages from the topics they subscribed to.
//!
//! # Key Features
//!
//! - Quality of Service levels 0, 1 and 2, with resend of unacknowledged
//!   packets
//! - Clean and persistent sessions, re-subscribing when the broker lost
//!   the session
//! - Topic filters with `+` and `#` wildcards
//! - Keep-alive heartbeats and automatic reconnect
//! - Last Will and Testament
//! - Event callback filtered by an [`EventMask`]
//!
//! # Threading
//!
//! Each [`Client`] runs one thread that owns the connection: it reads and
//! dispatches every inbound packet and makes every state transition. Any
//! number of other threads may call [`Client::publish`],
//! [`Client::subscribe`] and [`Client::unsubscribe`] concurrently.
//!
//! The transport is anything implementing
//! [`Connect`](crate::network::Connect); [`TcpConnector`](crate::network::tcp::TcpConnector)
//! covers plain TCP.

/// Pending-acknowledgment registry
pub mod ack;
/// Packet encoding and decoding
pub mod codec;
/// Client configuration
pub mod config;
/// Error types
pub mod error;
/// Callback events
pub mod event;
/// Subscription registry
pub mod message;
/// Wrapping millisecond timers
pub mod timer;
/// Topic matching and validation
pub mod topic;

mod client;
mod dispatch;
mod state;

pub use ack::AckType;
pub use client::{Callback, Client, HandlerCounts, MAX_PACKET_ID};
pub use codec::QoS;
pub use config::{Config, LastWill};
pub use error::{ConnectStatus, Error, Result};
pub use event::{DisconnectReason, Event, EventKind, EventMask, Message};
pub use message::Subscription;
pub use state::{ConnectionState, MAX_MISSED_PINGS};
pub use timer::{Clock, SystemClock};
