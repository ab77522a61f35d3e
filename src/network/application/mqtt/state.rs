//! Connection state machine, run by the client thread.

use core::time::Duration;
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::client::{Client, Control};
use super::codec::{self, Connect as ConnectPacket, PacketType, QoS, Will};
use super::error::{ConnectStatus, Error};
use super::event::{DisconnectReason, Event};
use super::timer::Timer;
use crate::network::Connect;

/// Unanswered PINGREQs after which the connection is considered dead.
pub const MAX_MISSED_PINGS: u8 = 5;

/// Where a client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, thread not started.
    Init = 0,
    /// Thread started, first connect in progress.
    Start = 1,
    /// Session established.
    Connect = 2,
    /// No session; waiting to reconnect or for a request.
    Disconnect = 3,
    /// Reconnect in progress.
    Reconnect = 4,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Start,
            2 => ConnectionState::Connect,
            3 => ConnectionState::Disconnect,
            4 => ConnectionState::Reconnect,
            _ => ConnectionState::Init,
        }
    }
}

/// Heartbeat bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct KeepAlive {
    timer: Timer,
    missed: u8,
}

#[derive(Debug, PartialEq, Eq)]
enum Heartbeat {
    Idle,
    Ping,
    Dead,
}

impl KeepAlive {
    fn reset(&mut self, now: u32, period_ms: u32) {
        self.timer = Timer::new(now, period_ms);
        self.missed = 0;
    }

    pub(crate) fn pong(&mut self, now: u32) {
        self.missed = 0;
        self.timer.restart(now);
    }

    fn poll(&mut self, now: u32) -> Heartbeat {
        if !self.timer.is_expired(now) {
            return Heartbeat::Idle;
        }
        if self.missed >= MAX_MISSED_PINGS {
            return Heartbeat::Dead;
        }
        self.missed += 1;
        self.timer.restart(now);
        Heartbeat::Ping
    }
}

enum Flow {
    Continue,
    Exit,
}

/// State owned by the client thread.
pub(crate) struct Session<N: Connect> {
    client: Client<N>,
    connector: N,
    control: Receiver<Control>,
    /// Set by a user disconnect; suppresses automatic reconnects.
    parked: bool,
}

impl<N: Connect + 'static> Session<N> {
    pub(crate) fn new(client: Client<N>, connector: N, control: Receiver<Control>) -> Self {
        Self {
            client,
            connector,
            control,
            parked: false,
        }
    }

    pub(crate) fn run(mut self) {
        log::info!("client thread started");
        loop {
            if let Flow::Exit = self.drain_control() {
                break;
            }
            let flow = match self.client.state() {
                ConnectionState::Init | ConnectionState::Start | ConnectionState::Reconnect => {
                    self.connect();
                    Flow::Continue
                }
                ConnectionState::Connect => {
                    self.poll();
                    Flow::Continue
                }
                ConnectionState::Disconnect => self.wait(),
            };
            if let Flow::Exit = flow {
                break;
            }
        }
        self.shutdown();
    }

    fn drain_control(&mut self) -> Flow {
        while let Ok(message) = self.control.try_recv() {
            if let Flow::Exit = self.handle_control(message) {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn handle_control(&mut self, message: Control) -> Flow {
        log::debug!("control request {message:?}");
        match message {
            Control::Destroy => return Flow::Exit,
            Control::Reconnect => {
                self.parked = false;
                let was_connected = self.client.state() == ConnectionState::Connect;
                self.client.close_connection();
                if was_connected {
                    self.client.raise(Event::Disconnected {
                        reason: DisconnectReason::UserRequested,
                    });
                }
                self.client.raise(Event::ReconnectBefore);
                self.client.set_state(ConnectionState::Reconnect);
            }
            Control::Disconnect { send_packet } => {
                self.parked = true;
                if self.client.state() == ConnectionState::Connect {
                    if send_packet {
                        if let Err(e) = self.client.send_bytes(&codec::DISCONNECT) {
                            log::debug!("DISCONNECT not sent: {e}");
                        }
                    }
                    self.client.close_connection();
                    self.client.set_state(ConnectionState::Disconnect);
                    self.client.raise(Event::Disconnected {
                        reason: DisconnectReason::UserRequested,
                    });
                } else {
                    self.client.close_connection();
                    self.client.set_state(ConnectionState::Disconnect);
                }
            }
        }
        Flow::Continue
    }

    /// Run one connection attempt and move to `Connect` or `Disconnect`.
    fn connect(&mut self) {
        match self.try_connect() {
            Ok(session_present) => {
                let keep_alive_ms = u32::from(self.client.inner.config.read().keep_alive_secs) * 1_000;
                let now = self.client.now();
                self.client.inner.keepalive.lock().reset(now, keep_alive_ms);
                self.client.set_state(ConnectionState::Connect);
                log::info!("connected, session present: {session_present}");

                self.client.migrate_acks();
                if let Err(e) = self.client.scan_acks(true) {
                    log::warn!("resend after connect failed: {e}");
                    self.lost(DisconnectReason::NetworkFailure);
                    return;
                }
                self.client.raise(Event::Connected { session_present });
                if !session_present {
                    self.resubscribe();
                }
            }
            Err(status) => {
                log::warn!("connect failed: {status}");
                self.client.close_connection();
                self.client.set_state(ConnectionState::Disconnect);
                self.client.raise(Event::Disconnected {
                    reason: DisconnectReason::ConnectFailed(status),
                });
            }
        }
    }

    /// Open the transport, send CONNECT and wait for CONNACK.
    ///
    /// Returns the broker's session-present flag.
    fn try_connect(&mut self) -> Result<bool, ConnectStatus> {
        let config = self.client.config();
        let timeout = Duration::from_millis(u64::from(config.connect_timeout_ms));
        self.client.close_connection();

        log::debug!("connecting to {}:{}", config.host, config.port);
        let connection = self
            .connector
            .connect(&config.host, config.port, timeout)
            .map_err(|e| {
                log::warn!("cannot reach {}:{}: {e}", config.host, config.port);
                ConnectStatus::NetworkError
            })?;
        let connection = Arc::new(connection);
        self.client.set_connection(Some(Arc::clone(&connection)));

        let will = self.client.inner.last_will.lock().clone();
        let packet = ConnectPacket {
            client_id: &config.client_id,
            keep_alive: config.keep_alive_secs,
            clean_session: config.clean_session,
            username: config.username.as_deref(),
            password: config.password.as_deref().map(str::as_bytes),
            will: will.as_ref().map(|w| Will {
                topic: &w.topic,
                payload: &w.payload,
                qos: w.qos,
                retain: w.retain,
            }),
        };
        self.client
            .send_with(|buf| codec::encode_connect(buf, &packet))
            .map_err(|e| {
                log::warn!("CONNECT not sent: {e}");
                ConnectStatus::SendFailed
            })?;

        match self.client.read_incoming_packet(&connection, timeout) {
            Ok(Some(reply)) if reply.header.packet_type == PacketType::ConnAck => {
                let ack = codec::decode_connack(&reply.body).map_err(|_| ConnectStatus::ProtocolError)?;
                match ConnectStatus::from_return_code(ack.return_code) {
                    ConnectStatus::Accepted => Ok(ack.session_present),
                    refused => Err(refused),
                }
            }
            Ok(Some(reply)) => {
                log::warn!("expected CONNACK, got {:?}", reply.header.packet_type);
                Err(ConnectStatus::ProtocolError)
            }
            Ok(None) => Err(ConnectStatus::Timeout),
            Err(DisconnectReason::ProtocolError) => Err(ConnectStatus::ProtocolError),
            Err(_) => Err(ConnectStatus::NetworkError),
        }
    }

    /// Subscribe again to every granted filter after the broker dropped the
    /// session.
    fn resubscribe(&self) {
        let subscriptions = self.client.subscriptions();
        if subscriptions.is_empty() {
            return;
        }
        let filters: Vec<(&str, QoS)> = subscriptions
            .iter()
            .map(|s| (s.topic.as_str(), s.qos))
            .collect();
        match self.client.subscribe_many(&filters) {
            Ok(packet_id) => log::info!("resubscribing {} filter(s) as {packet_id}", filters.len()),
            Err(e) => log::warn!("resubscribe failed: {e}"),
        }
    }

    /// One iteration of the connected state.
    fn poll(&mut self) {
        let Some(connection) = self.client.connection() else {
            self.lost(DisconnectReason::NetworkFailure);
            return;
        };
        let read_timeout = Duration::from_millis(u64::from(self.client.inner.config.read().read_timeout_ms));

        match self.client.read_incoming_packet(&connection, read_timeout) {
            Ok(Some(packet)) => {
                if let Err(e) = self.client.dispatch(&packet) {
                    if is_fatal(&e) {
                        log::warn!("reply failed: {e}");
                        self.lost(DisconnectReason::NetworkFailure);
                        return;
                    }
                }
            }
            Ok(None) => {}
            Err(reason) => {
                self.lost(reason);
                return;
            }
        }

        if let Err(e) = self.client.scan_acks(false) {
            log::warn!("resend failed: {e}");
            self.lost(DisconnectReason::NetworkFailure);
            return;
        }
        self.heartbeat();
    }

    fn heartbeat(&mut self) {
        if self.client.inner.config.read().keep_alive_secs == 0 {
            return;
        }
        let now = self.client.now();
        let step = self.client.inner.keepalive.lock().poll(now);
        match step {
            Heartbeat::Idle => {}
            Heartbeat::Ping => {
                if let Err(e) = self.client.send_bytes(&codec::PINGREQ) {
                    if is_fatal(&e) {
                        log::warn!("PINGREQ failed: {e}");
                        self.lost(DisconnectReason::NetworkFailure);
                    }
                }
            }
            Heartbeat::Dead => {
                log::warn!("{MAX_MISSED_PINGS} heartbeats unanswered");
                self.lost(DisconnectReason::KeepaliveTimeout);
            }
        }
    }

    /// The session dropped without being asked to.
    fn lost(&mut self, reason: DisconnectReason) {
        self.client.close_connection();
        self.client.set_state(ConnectionState::Disconnect);
        log::info!("disconnected: {reason:?}");
        self.client.raise(Event::Disconnected { reason });
    }

    /// Disconnected state: wait for a request, or the reconnect interval.
    fn wait(&mut self) -> Flow {
        let (auto_reconnect, interval) = {
            let config = self.client.inner.config.read();
            (
                config.auto_reconnect,
                Duration::from_millis(u64::from(config.reconnect_interval_ms)),
            )
        };

        if self.parked || !auto_reconnect {
            return match self.control.recv() {
                Ok(message) => self.handle_control(message),
                Err(_) => Flow::Exit,
            };
        }
        match self.control.recv_timeout(interval) {
            Ok(message) => self.handle_control(message),
            Err(RecvTimeoutError::Timeout) => {
                self.client.raise(Event::ReconnectBefore);
                self.client.set_state(ConnectionState::Reconnect);
                Flow::Continue
            }
            Err(RecvTimeoutError::Disconnected) => Flow::Exit,
        }
    }

    fn shutdown(&mut self) {
        self.client.raise(Event::DestroyBefore);
        self.client.release();
        self.client.set_state(ConnectionState::Disconnect);
        log::info!("client thread exiting");
    }
}

/// Anything but a send that merely timed out ends the session.
fn is_fatal(error: &Error) -> bool {
    !matches!(error, Error::Transport(e) if e.is_timeout())
}
