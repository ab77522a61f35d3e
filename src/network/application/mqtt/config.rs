//! Client configuration.
//!
//! A [`Config`] is plain data. It is validated when a client is created and
//! whenever it is replaced with [`Client::set_config`](super::Client::set_config);
//! the owning thread reads it at every connection attempt, so changes apply
//! from the next (re)connect on.
//!
//! ```rust
//! use libiot_mqtt::network::application::mqtt::Config;
//!
//! let config = Config::from_json(r#"{
//!     "host": "broker.local",
//!     "client_id": "sensor-7",
//!     "keep_alive_secs": 30,
//!     "auto_reconnect": false
//! }"#).unwrap();
//!
//! assert_eq!(config.port, 1883);
//! assert_eq!(config.keep_alive_secs, 30);
//! assert!(!config.auto_reconnect);
//! ```

use serde::Deserialize;

use super::codec::{MAX_REMAINING_LENGTH, QoS};
use super::error::{Error, Result};
use super::topic;

/// Connection and engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier. Empty lets the broker assign one (clean sessions only).
    pub client_id: String,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password; requires a user name.
    pub password: Option<String>,
    /// Keep-alive interval in seconds, 0 disables heartbeats.
    pub keep_alive_secs: u16,
    /// Ask the broker for a clean session on every connect.
    pub clean_session: bool,
    /// Reconnect automatically after the connection drops.
    pub auto_reconnect: bool,
    /// Bound for every send, in milliseconds.
    pub command_timeout_ms: u32,
    /// Bound for one receive poll of the owning thread, in milliseconds.
    ///
    /// This is also the worst case latency of a destroy request.
    pub read_timeout_ms: u32,
    /// Bound for opening the transport and for waiting on CONNACK.
    pub connect_timeout_ms: u32,
    /// Wait between reconnect attempts, in milliseconds.
    pub reconnect_interval_ms: u32,
    /// Wait for an acknowledgment before resending, in milliseconds.
    pub ack_timeout_ms: u32,
    /// Outstanding transaction count that raises `AckCountWarning`.
    pub ack_count_warning: usize,
    /// Resend count after which a transaction raises `AckRepeatCountWarning`.
    pub repeat_count_warning: u32,
    /// Largest inbound packet body accepted, in bytes.
    pub max_packet_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 1883,
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            clean_session: true,
            auto_reconnect: true,
            command_timeout_ms: 4_000,
            read_timeout_ms: 100,
            connect_timeout_ms: 5_000,
            reconnect_interval_ms: 3_000,
            ack_timeout_ms: 3_000,
            ack_count_warning: 64,
            repeat_count_warning: 5,
            max_packet_size: 64 * 1024,
        }
    }
}

impl Config {
    /// Defaults for `host` and `client_id`.
    pub fn new(host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Set the broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set user name and password.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: Option<impl Into<String>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password.map(Into::into);
        self
    }

    /// Set the keep-alive interval.
    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    /// Enable or disable clean sessions.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Enable or disable automatic reconnects and set the interval between attempts.
    pub fn with_auto_reconnect(mut self, enabled: bool, interval_ms: u32) -> Self {
        self.auto_reconnect = enabled;
        self.reconnect_interval_ms = interval_ms;
        self
    }

    /// Set the acknowledgment timeout and the resend warning count.
    pub fn with_ack_timeout(mut self, timeout_ms: u32, repeat_count_warning: u32) -> Self {
        self.ack_timeout_ms = timeout_ms;
        self.repeat_count_warning = repeat_count_warning;
        self
    }

    /// Check the settings for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidParameter("host is empty"));
        }
        if self.client_id.len() > u16::MAX as usize {
            return Err(Error::InvalidParameter("client id is too long"));
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err(Error::InvalidParameter(
                "an empty client id requires a clean session",
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::InvalidParameter("password given without user name"));
        }
        if self.read_timeout_ms == 0 || self.command_timeout_ms == 0 {
            return Err(Error::InvalidParameter("timeouts must be non-zero"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(Error::InvalidParameter("ack timeout must be non-zero"));
        }
        if self.max_packet_size < 2 || self.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(Error::InvalidParameter("max packet size out of range"));
        }
        Ok(())
    }

    /// Parse a JSON document. Missing fields take their [`Default`] value.
    pub fn from_json(json: &str) -> Result<Self> {
        let (raw, _) = serde_json_core::from_str::<RawConfig<'_>>(json)
            .map_err(|_| Error::InvalidParameter("malformed configuration JSON"))?;

        let mut config = Config::default();
        if let Some(host) = raw.host {
            config.host = host.into();
        }
        if let Some(client_id) = raw.client_id {
            config.client_id = client_id.into();
        }
        config.username = raw.username.map(Into::into);
        config.password = raw.password.map(Into::into);
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(value) = raw.$field {
                    config.$field = value;
                })*
            };
        }
        take!(
            port,
            keep_alive_secs,
            clean_session,
            auto_reconnect,
            command_timeout_ms,
            read_timeout_ms,
            connect_timeout_ms,
            reconnect_interval_ms,
            ack_timeout_ms,
            ack_count_warning,
            repeat_count_warning,
            max_packet_size
        );
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize)]
struct RawConfig<'a> {
    #[serde(borrow)]
    host: Option<&'a str>,
    port: Option<u16>,
    #[serde(borrow)]
    client_id: Option<&'a str>,
    #[serde(borrow)]
    username: Option<&'a str>,
    #[serde(borrow)]
    password: Option<&'a str>,
    keep_alive_secs: Option<u16>,
    clean_session: Option<bool>,
    auto_reconnect: Option<bool>,
    command_timeout_ms: Option<u32>,
    read_timeout_ms: Option<u32>,
    connect_timeout_ms: Option<u32>,
    reconnect_interval_ms: Option<u32>,
    ack_timeout_ms: Option<u32>,
    ack_count_warning: Option<usize>,
    repeat_count_warning: Option<u32>,
    max_packet_size: Option<usize>,
}

/// Last Will and Testament, published by the broker if the client vanishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Topic name.
    pub topic: String,
    /// Will payload.
    pub payload: Vec<u8>,
    /// QoS of the will message.
    pub qos: QoS,
    /// Retain flag of the will message.
    pub retain: bool,
}

impl LastWill {
    /// Build a will message, checking the topic name.
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<Self> {
        let topic = topic.into();
        topic::validate_name(&topic)?;
        Ok(Self {
            topic,
            payload: payload.into(),
            qos,
            retain,
        })
    }
}
