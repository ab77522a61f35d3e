//! MQTT 3.1.1 client handle.
//!
//! A [`Client`] owns one broker session. After [`Client::start`] a dedicated
//! thread performs all receive I/O and every connection state transition:
//! it connects, reads and dispatches packets, resends unacknowledged
//! packets, keeps the session alive and reconnects after a failure.
//!
//! Any thread may publish, subscribe and unsubscribe through a clone of the
//! handle. Those calls encode their packet, register the bookkeeping needed
//! to match the broker's answer and transmit under a send lock shared with
//! the client thread. The broker's answer is reported later as an
//! [`Event`] delivered to the callback given to [`Client::new`], always on
//! the client thread for protocol events.
//!
//! # Example
//!
//! ```rust,no_run
//! use libiot_mqtt::network::tcp::TcpConnector;
//! use libiot_mqtt::network::application::mqtt::{Client, Config, Event, QoS};
//!
//! let config = Config::new("broker.local", "sensor-01");
//! let client = Client::new(TcpConnector::default(), config, |_client, event| {
//!     if let Event::Data(message) = event {
//!         println!("{}: {:?}", message.topic, message.payload);
//!     }
//! })?;
//! client.start()?;
//! // Once connected:
//! client.subscribe("sensors/+/temp", QoS::AtLeastOnce)?;
//! client.publish("sensors/01/temp", b"23.5", QoS::AtLeastOnce, false)?;
//! # Ok::<(), libiot_mqtt::network::application::mqtt::Error>(())
//! ```

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use super::ack::{AckHandler, AckHandlers, AckType, PacketBuffer};
use super::codec::{self, CodecError, Publish, QoS};
use super::config::{Config, LastWill};
use super::error::{Error, Result};
use super::event::{Event, EventMask};
use super::message::{MessageHandler, MessageHandlers, Subscription};
use super::state::{ConnectionState, KeepAlive, Session};
use super::timer::{Clock, SystemClock, Timer};
use super::topic;
use crate::network::{self, Connect, Connection};

/// Largest packet identifier handed out; the allocator wraps back to 1.
pub const MAX_PACKET_ID: u16 = 65_534;

/// Event callback. Receives the client that raised the event.
pub type Callback<N> = dyn Fn(&Client<N>, &Event<'_>) + Send + Sync;

/// Requests from API threads to the client thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Destroy,
    Reconnect,
    Disconnect { send_packet: bool },
}

/// Registry sizes, for diagnostics and leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerCounts {
    /// Subscriptions plus topics of pending subscribe/unsubscribe requests.
    pub message_handlers: usize,
    /// Transactions the client thread is tracking.
    pub ack_handlers: usize,
    /// Transactions registered by API threads and not yet picked up.
    pub staged_ack_handlers: usize,
}

pub(crate) struct Inner<N: Connect> {
    pub(crate) config: RwLock<Config>,
    pub(crate) last_will: Mutex<Option<LastWill>>,
    state: AtomicU8,
    event_mask: AtomicU32,
    destroyed: AtomicBool,
    next_packet_id: Mutex<u16>,
    connection: RwLock<Option<Arc<N::Connection>>>,
    /// Send lock; also the encode buffer for packets that are not kept.
    write_buf: Mutex<Vec<u8>>,
    pub(crate) msg_handlers: MessageHandlers,
    pub(crate) acks: AckHandlers,
    pub(crate) keepalive: Mutex<KeepAlive>,
    clock: Arc<dyn Clock>,
    callback: Box<Callback<N>>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    connector: Mutex<Option<N>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an MQTT client. Cheap to clone; all clones share one session.
pub struct Client<N: Connect> {
    pub(crate) inner: Arc<Inner<N>>,
}

impl<N: Connect> Clone for Client<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: Connect + 'static> fmt::Debug for Client<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.config.read().client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<N: Connect + 'static> Client<N> {
    /// Create a client in the [`ConnectionState::Init`] state.
    ///
    /// Nothing is sent until [`start`](Self::start) is called. All events
    /// are enabled.
    pub fn new<F>(connector: N, config: Config, callback: F) -> Result<Self>
    where
        F: Fn(&Client<N>, &Event<'_>) + Send + Sync + 'static,
    {
        Self::with_clock(connector, config, Arc::new(SystemClock::new()), callback)
    }

    /// Like [`new`](Self::new) with an explicit uptime source.
    pub fn with_clock<F>(connector: N, config: Config, clock: Arc<dyn Clock>, callback: F) -> Result<Self>
    where
        F: Fn(&Client<N>, &Event<'_>) + Send + Sync + 'static,
    {
        config.validate()?;
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let acks = AckHandlers::new(config.ack_count_warning);
        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                last_will: Mutex::new(None),
                state: AtomicU8::new(ConnectionState::Init as u8),
                event_mask: AtomicU32::new(EventMask::ALL.0),
                destroyed: AtomicBool::new(false),
                next_packet_id: Mutex::new(1),
                connection: RwLock::new(None),
                write_buf: Mutex::new(Vec::new()),
                msg_handlers: MessageHandlers::new(),
                acks,
                keepalive: Mutex::new(KeepAlive::default()),
                clock,
                callback: Box::new(callback),
                control_tx,
                control_rx,
                connector: Mutex::new(Some(connector)),
                thread: Mutex::new(None),
            }),
        })
    }

    /// Spawn the client thread, which connects to the broker.
    pub fn start(&self) -> Result<()> {
        self.ensure_alive()?;
        let connector = self.inner.connector.lock().take().ok_or(Error::InvalidState)?;
        let name = format!("mqtt-{}", self.inner.config.read().client_id);
        self.set_state(ConnectionState::Start);

        let session = Session::new(self.clone(), connector, self.inner.control_rx.clone());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || session.run())
            .map_err(|e| {
                log::error!("cannot spawn client thread: {e}");
                self.set_state(ConnectionState::Init);
                Error::Resource("client thread")
            })?;
        *self.inner.thread.lock() = Some(handle);
        Ok(())
    }

    /// Tear the client down.
    ///
    /// The client thread raises [`Event::DestroyBefore`], closes the
    /// transport, drops all state and exits. Returns immediately; use
    /// [`join`](Self::join) to wait for the thread.
    pub fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::Destroyed);
        }
        if self.state() == ConnectionState::Init {
            self.raise(Event::DestroyBefore);
            self.release();
            return Ok(());
        }
        self.control(Control::Destroy)
    }

    /// Wait for the client thread to exit.
    ///
    /// Fails with [`Error::InvalidState`] when called on the client thread
    /// itself.
    pub fn join(&self) -> Result<()> {
        let handle = {
            let mut slot = self.inner.thread.lock();
            match slot.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => {
                    return Err(Error::InvalidState);
                }
                _ => slot.take(),
            }
        };
        match handle {
            Some(handle) => handle.join().map_err(|_| Error::InvalidState),
            None => Ok(()),
        }
    }

    /// Close the session. With `send_packet`, a DISCONNECT is sent first so
    /// the broker discards the last will.
    ///
    /// The client stays disconnected until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self, send_packet: bool) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_started()?;
        self.control(Control::Disconnect { send_packet })
    }

    /// Close the connection if open and connect again.
    pub fn reconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_started()?;
        self.control(Control::Reconnect)
    }

    /// Subscribe to one topic filter. Returns the SUBSCRIBE packet id.
    pub fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<u16> {
        self.subscribe_many(&[(topic_filter, qos)])
    }

    /// Subscribe to several topic filters with one SUBSCRIBE.
    ///
    /// The outcome for each filter is reported as [`Event::Subscribed`] or
    /// [`Event::SubscribeFailed`].
    pub fn subscribe_many(&self, filters: &[(&str, QoS)]) -> Result<u16> {
        let (first, _) = filters
            .first()
            .ok_or(Error::InvalidParameter("no topic filters"))?;
        for (filter, _) in filters {
            topic::validate_filter(filter)?;
        }
        self.ensure_connected()?;

        let (packet_id, packet) = self.begin_transaction(|id| {
            let mut packet = Vec::new();
            codec::encode_subscribe(&mut packet, id, filters)?;
            let transient = filters
                .iter()
                .map(|(filter, qos)| MessageHandler::new(filter, *qos, Some(id)))
                .collect();
            let context = MessageHandler::new(first, filters[0].1, Some(id));
            Ok((packet, AckType::SubAck, context, transient))
        })?;
        self.finish_transaction(AckType::SubAck, packet_id, &packet)?;
        log::debug!("SUBSCRIBE {} filter(s), packet id {packet_id}", filters.len());
        Ok(packet_id)
    }

    /// Unsubscribe from one topic filter. Returns the UNSUBSCRIBE packet id.
    pub fn unsubscribe(&self, topic_filter: &str) -> Result<u16> {
        self.unsubscribe_many(&[topic_filter])
    }

    /// Unsubscribe from several topic filters with one UNSUBSCRIBE.
    pub fn unsubscribe_many(&self, filters: &[&str]) -> Result<u16> {
        let first = filters
            .first()
            .ok_or(Error::InvalidParameter("no topic filters"))?;
        for filter in filters {
            topic::validate_filter(filter)?;
        }
        self.ensure_connected()?;

        let (packet_id, packet) = self.begin_transaction(|id| {
            let mut packet = Vec::new();
            codec::encode_unsubscribe(&mut packet, id, filters)?;
            let transient = filters
                .iter()
                .map(|filter| MessageHandler::new(filter, QoS::AtMostOnce, Some(id)))
                .collect();
            let context = MessageHandler::new(first, QoS::AtMostOnce, Some(id));
            Ok((packet, AckType::UnsubAck, context, transient))
        })?;
        self.finish_transaction(AckType::UnsubAck, packet_id, &packet)?;
        log::debug!("UNSUBSCRIBE {} filter(s), packet id {packet_id}", filters.len());
        Ok(packet_id)
    }

    /// Publish `payload` to `topic`.
    ///
    /// QoS 0 returns `None` once the packet is sent. QoS 1 and 2 return the
    /// packet id under which [`Event::Published`] reports completion.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<Option<u16>> {
        topic::validate_name(topic)?;
        self.ensure_connected()?;

        let mut publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id: None,
            payload,
        };
        if qos == QoS::AtMostOnce {
            self.send_with(|buf| codec::encode_publish(buf, &publish))?;
            return Ok(None);
        }

        let kind = if qos == QoS::AtLeastOnce {
            AckType::PubAck
        } else {
            AckType::PubRec
        };
        let (packet_id, packet) = self.begin_transaction(|id| {
            publish.packet_id = Some(id);
            let mut packet = Vec::new();
            codec::encode_publish(&mut packet, &publish)?;
            Ok((packet, kind, MessageHandler::new(topic, qos, Some(id)), Vec::new()))
        })?;
        self.finish_transaction(kind, packet_id, &packet)?;
        Ok(Some(packet_id))
    }

    /// Drop a pending transaction, typically after
    /// [`Event::AckRepeatCountWarning`]. Raises [`Event::AckHandlerDiscard`].
    pub fn discard_ack_handler(&self, kind: AckType, packet_id: u16) -> Result<()> {
        let handler = self
            .inner
            .acks
            .remove(kind, packet_id)
            .ok_or(Error::InvalidParameter("no such transaction"))?;
        if kind.is_request() {
            self.inner.msg_handlers.take_transaction(packet_id);
        }
        log::info!("discarded {kind:?} transaction {packet_id}");
        self.raise(Event::AckHandlerDiscard {
            kind,
            packet_id,
            topic: handler.context().topic(),
        });
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Granted subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.msg_handlers.subscriptions()
    }

    /// Outstanding transactions, migrated or not.
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.len() + self.inner.acks.staged_len()
    }

    /// Registry sizes.
    pub fn handler_counts(&self) -> HandlerCounts {
        HandlerCounts {
            message_handlers: self.inner.msg_handlers.len(),
            ack_handlers: self.inner.acks.len(),
            staged_ack_handlers: self.inner.acks.staged_len(),
        }
    }

    /// Snapshot of the configuration.
    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// Replace the configuration. Connection parameters apply from the next
    /// connect, typically changed from [`Event::ReconnectBefore`].
    pub fn set_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        self.inner.acks.set_warning_threshold(config.ack_count_warning);
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Set or clear the last will sent with the next CONNECT.
    pub fn set_last_will(&self, will: Option<LastWill>) {
        *self.inner.last_will.lock() = will;
    }

    /// Enable delivery of the events in `mask`.
    pub fn register_events(&self, mask: EventMask) {
        self.inner.event_mask.fetch_or(mask.0, Ordering::AcqRel);
    }

    /// Stop delivery of the events in `mask`.
    pub fn cancel_events(&self, mask: EventMask) {
        self.inner.event_mask.fetch_and(!mask.0, Ordering::AcqRel);
    }

    /// Deliver `event` to the callback if its kind is enabled.
    pub(crate) fn raise(&self, event: Event<'_>) {
        let mask = EventMask(self.inner.event_mask.load(Ordering::Acquire));
        if mask.contains(event.kind()) {
            (self.inner.callback)(self, &event);
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn now(&self) -> u32 {
        self.inner.clock.uptime_ms()
    }

    pub(crate) fn connection(&self) -> Option<Arc<N::Connection>> {
        self.inner.connection.read().clone()
    }

    pub(crate) fn set_connection(&self, connection: Option<Arc<N::Connection>>) {
        *self.inner.connection.write() = connection;
    }

    /// Close and forget the transport.
    pub(crate) fn close_connection(&self) {
        let connection = self.inner.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close() {
                log::debug!("close failed: {e}");
            }
        }
    }

    /// Drop every piece of session state.
    pub(crate) fn release(&self) {
        self.close_connection();
        self.inner.acks.purge();
        self.inner.msg_handlers.purge();
        *self.inner.last_will.lock() = None;
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.inner.config.read().command_timeout_ms))
    }

    /// Send already encoded bytes under the send lock.
    pub(crate) fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        let connection = self.connection().ok_or(Error::NotConnected)?;
        let timeout = self.command_timeout();
        let _guard = self.inner.write_buf.lock();
        network::send_all(&*connection, bytes, timeout)?;
        Ok(())
    }

    /// Encode into the shared buffer and send, holding the send lock
    /// throughout.
    pub(crate) fn send_with<F>(&self, encode: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> core::result::Result<(), CodecError>,
    {
        let connection = self.connection().ok_or(Error::NotConnected)?;
        let timeout = self.command_timeout();
        let mut buf = self.inner.write_buf.lock();
        buf.clear();
        encode(&mut *buf)?;
        network::send_all(&*connection, &buf, timeout)?;
        Ok(())
    }

    /// Allocate a packet id and register everything needed to match the
    /// broker's answer to the packet built by `build`.
    ///
    /// The id lock is held until the ack handler is staged, so no other
    /// request can pick the same id.
    fn begin_transaction<F>(&self, build: F) -> Result<(u16, Vec<u8>)>
    where
        F: FnOnce(u16) -> Result<(Vec<u8>, AckType, MessageHandler, Vec<MessageHandler>)>,
    {
        let mut next = self.inner.next_packet_id.lock();
        let packet_id = self.free_packet_id(&mut next)?;
        let (packet, kind, context, transient) = build(packet_id)?;
        let timeout = self.inner.config.read().ack_timeout_ms;
        self.inner.msg_handlers.add_all(transient);
        self.inner.acks.stage(AckHandler::new(
            kind,
            packet_id,
            PacketBuffer::Owned(packet.clone()),
            context,
            Timer::new(self.now(), timeout),
        ));
        Ok((packet_id, packet))
    }

    /// Transmit a registered request, undoing the registration on failure.
    fn finish_transaction(&self, kind: AckType, packet_id: u16, packet: &[u8]) -> Result<()> {
        if let Err(e) = self.send_bytes(packet) {
            log::warn!("sending {kind:?} transaction {packet_id} failed: {e}");
            self.inner.acks.remove(kind, packet_id);
            self.inner.msg_handlers.take_transaction(packet_id);
            return Err(e);
        }
        Ok(())
    }

    fn free_packet_id(&self, next: &mut u16) -> Result<u16> {
        for _ in 0..MAX_PACKET_ID {
            let candidate = *next;
            *next = if candidate >= MAX_PACKET_ID { 1 } else { candidate + 1 };
            if !self.inner.acks.id_in_use(candidate)
                && self.inner.msg_handlers.count_transaction(candidate) == 0
            {
                return Ok(candidate);
            }
        }
        Err(Error::Resource("packet identifiers"))
    }

    /// Hand out the next free id without registering anything.
    #[cfg(test)]
    pub(crate) fn next_packet_id(&self) -> Result<u16> {
        let mut next = self.inner.next_packet_id.lock();
        self.free_packet_id(&mut next)
    }

    fn control(&self, message: Control) -> Result<()> {
        self.inner
            .control_tx
            .send(message)
            .map_err(|_| Error::Destroyed)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Init => Err(Error::InvalidState),
            _ => Ok(()),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        self.ensure_alive()?;
        match self.state() {
            ConnectionState::Connect => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }
}
