//! # libiot-mqtt - MQTT client engine for IoT devices
//!
//! A threaded MQTT 3.1.1 client for devices that publish telemetry and
//! listen for commands over an unreliable network. One background thread
//! per client owns the connection; application threads publish and
//! subscribe through a cloneable handle and learn about outcomes through an
//! event callback.
//!
//! ## Features
//!
//! - QoS 0, 1 and 2 in both directions, with resend of unacknowledged packets
//! - Subscribe and unsubscribe with several topic filters per request
//! - Keep-alive heartbeats, automatic reconnect and re-subscribe
//! - Last Will and Testament
//! - Configuration from code or JSON
//! - Transport agnostic, with a `std::net` TCP transport included
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libiot-mqtt = "0.1.0"
//! ```
//!
//! ### MQTT Client Example
//!
//! ```rust,no_run
//! use libiot_mqtt::network::application::mqtt::{Client, Config, Event, QoS};
//! use libiot_mqtt::network::tcp::TcpConnector;
//!
//! let config = Config::from_json(r#"{"host":"broker.local","client_id":"my_device"}"#)?;
//! let client = Client::new(TcpConnector::default(), config, |client, event| match event {
//!     Event::Connected { .. } => {
//!         let _ = client.subscribe("devices/my_device/cmd", QoS::AtLeastOnce);
//!     }
//!     Event::Data(message) => log::info!("{} bytes on {}", message.payload.len(), message.topic),
//!     _ => {}
//! })?;
//! client.start()?;
//!
//! // From any thread, once connected:
//! client.publish("sensors/temperature", b"23.5", QoS::AtMostOnce, false)?;
//! # Ok::<(), libiot_mqtt::network::application::mqtt::Error>(())
//! ```
//!
//! ## Features flags
//!
//! - `defmt`: Enable defmt formatting of errors and events for embedded debugging

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![doc(html_root_url = "https://shishir-dey.github.io/libiot/")]

/// Network abstraction layer: transport traits, TCP transport and the MQTT client.
pub mod network;
