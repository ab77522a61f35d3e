//! Pending-acknowledgment bookkeeping.
//!
//! Every request that expects an answer from the broker (SUBSCRIBE,
//! UNSUBSCRIBE, a QoS 1 or QoS 2 PUBLISH, and both halves of the QoS 2
//! handshakes) is tracked by an [`AckHandler`] until the answer arrives.
//!
//! Handlers created by caller threads go to a staging list first and are
//! moved into the authoritative list by the client thread with
//! [`AckHandlers::migrate`]. Only the authoritative list is scanned for
//! timeouts and matched against incoming acknowledgments, so a handler is
//! never resent before its first transmission had a chance to happen.

use parking_lot::Mutex;

use super::codec::{self, PacketType};
use super::message::MessageHandler;
use super::timer::Timer;

/// The acknowledgment a handler is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AckType {
    /// SUBACK for a SUBSCRIBE.
    SubAck,
    /// UNSUBACK for an UNSUBSCRIBE.
    UnsubAck,
    /// PUBACK for a QoS 1 PUBLISH.
    PubAck,
    /// PUBREC for a QoS 2 PUBLISH.
    PubRec,
    /// PUBREL for a received QoS 2 PUBLISH (we sent PUBREC).
    PubRel,
    /// PUBCOMP for a PUBREL we sent.
    PubComp,
}

impl AckType {
    /// The packet that satisfies this handler.
    pub const fn packet_type(self) -> PacketType {
        match self {
            AckType::SubAck => PacketType::SubAck,
            AckType::UnsubAck => PacketType::UnsubAck,
            AckType::PubAck => PacketType::PubAck,
            AckType::PubRec => PacketType::PubRec,
            AckType::PubRel => PacketType::PubRel,
            AckType::PubComp => PacketType::PubComp,
        }
    }

    /// Subscribe and unsubscribe handlers expire instead of being resent.
    pub const fn is_request(self) -> bool {
        matches!(self, AckType::SubAck | AckType::UnsubAck)
    }

    /// Whether the handler's packet id was allocated by this client.
    ///
    /// A PUBREL handler carries the broker's id for an inbound QoS 2 flow.
    pub const fn uses_local_id(self) -> bool {
        !matches!(self, AckType::PubRel)
    }
}

/// Bytes to send again when a handler times out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBuffer {
    /// A full packet (PUBLISH, SUBSCRIBE, UNSUBSCRIBE).
    Owned(Vec<u8>),
    /// A 4-byte acknowledgment (PUBREC, PUBREL).
    Ack([u8; 4]),
}

impl PacketBuffer {
    /// Wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PacketBuffer::Owned(bytes) => bytes,
            PacketBuffer::Ack(bytes) => bytes,
        }
    }

    /// Mark a PUBLISH as a redelivery. Other packets are left alone.
    pub fn set_dup(&mut self) {
        if let PacketBuffer::Owned(bytes) = self {
            codec::set_dup_flag(bytes);
        }
    }
}

/// One outstanding transaction.
#[derive(Debug, Clone)]
pub struct AckHandler {
    kind: AckType,
    packet_id: u16,
    retry_count: u32,
    timer: Timer,
    packet: PacketBuffer,
    context: MessageHandler,
}

impl AckHandler {
    /// Track `packet` until a `kind` acknowledgment with `packet_id` arrives.
    ///
    /// The timer starts now; `context` names the topic the transaction is
    /// about and is reported in events.
    pub fn new(
        kind: AckType,
        packet_id: u16,
        packet: PacketBuffer,
        context: MessageHandler,
        timer: Timer,
    ) -> Self {
        Self {
            kind,
            packet_id,
            retry_count: 0,
            timer,
            packet,
            context,
        }
    }

    /// Awaited acknowledgment.
    pub fn kind(&self) -> AckType {
        self.kind
    }

    /// Packet identifier of the transaction.
    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// Times the packet was resent.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Topic and QoS the transaction is about.
    pub fn context(&self) -> &MessageHandler {
        &self.context
    }

    /// Consume the handler, keeping its context.
    pub fn into_context(self) -> MessageHandler {
        self.context
    }

    /// Packet that is resent on timeout.
    pub fn packet(&self) -> &PacketBuffer {
        &self.packet
    }

    fn key(&self) -> (AckType, u16) {
        (self.kind, self.packet_id)
    }
}

/// What a timeout scan decided for one handler.
///
/// Produced under the registry lock, acted upon after it was released.
#[derive(Debug)]
pub enum ScanAction {
    /// Send `packet` again.
    Resend {
        /// Awaited acknowledgment.
        kind: AckType,
        /// Packet identifier.
        packet_id: u16,
        /// Resends so far, including this one.
        retry_count: u32,
        /// Bytes to send.
        packet: Vec<u8>,
    },
    /// The resend limit is reached; nothing was sent.
    RepeatWarning {
        /// Awaited acknowledgment.
        kind: AckType,
        /// Packet identifier.
        packet_id: u16,
        /// Resends so far.
        retry_count: u32,
    },
    /// A subscribe or unsubscribe request timed out and was removed.
    Expired(AckHandler),
}

/// Outstanding transactions of one client.
#[derive(Debug)]
pub struct AckHandlers {
    list: Mutex<Vec<AckHandler>>,
    staging: Mutex<Vec<AckHandler>>,
    warning_threshold: Mutex<usize>,
}

impl AckHandlers {
    /// Empty registry that warns once `warning_threshold` transactions
    /// are outstanding.
    pub fn new(warning_threshold: usize) -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            staging: Mutex::new(Vec::new()),
            warning_threshold: Mutex::new(warning_threshold),
        }
    }

    /// Change the warning threshold.
    pub fn set_warning_threshold(&self, threshold: usize) {
        *self.warning_threshold.lock() = threshold;
    }

    /// Add a handler to the authoritative list.
    ///
    /// A handler with the same kind and id replaces the existing one.
    /// Returns the outstanding count if this insert reached the warning
    /// threshold.
    pub fn insert(&self, handler: AckHandler) -> Option<usize> {
        let threshold = *self.warning_threshold.lock();
        let mut list = self.list.lock();
        Self::insert_locked(&mut list, handler, threshold)
    }

    fn insert_locked(list: &mut Vec<AckHandler>, handler: AckHandler, threshold: usize) -> Option<usize> {
        let key = handler.key();
        if let Some(existing) = list.iter_mut().find(|h| h.key() == key) {
            log::warn!(
                "replacing pending {:?} handler for packet id {}",
                key.0,
                key.1
            );
            *existing = handler;
            return None;
        }
        list.push(handler);
        (threshold > 0 && list.len() == threshold).then_some(list.len())
    }

    /// Park a handler until the client thread migrates it.
    pub fn stage(&self, handler: AckHandler) {
        self.staging.lock().push(handler);
    }

    /// Move all staged handlers into the authoritative list.
    ///
    /// Returns the outstanding count if the warning threshold was reached
    /// on the way.
    pub fn migrate(&self) -> Option<usize> {
        let staged: Vec<AckHandler> = {
            let mut staging = self.staging.lock();
            if staging.is_empty() {
                return None;
            }
            staging.drain(..).collect()
        };
        let threshold = *self.warning_threshold.lock();
        let mut list = self.list.lock();
        let mut warning = None;
        for handler in staged {
            if let Some(count) = Self::insert_locked(&mut list, handler, threshold) {
                warning = Some(count);
            }
        }
        warning
    }

    /// Remove and return the authoritative handler for `kind` and `packet_id`.
    pub fn take(&self, kind: AckType, packet_id: u16) -> Option<AckHandler> {
        let mut list = self.list.lock();
        let index = list
            .iter()
            .position(|h| h.kind == kind && h.packet_id == packet_id)?;
        Some(list.remove(index))
    }

    /// Remove a handler wherever it currently lives.
    pub fn remove(&self, kind: AckType, packet_id: u16) -> Option<AckHandler> {
        {
            let mut staging = self.staging.lock();
            if let Some(index) = staging
                .iter()
                .position(|h| h.kind == kind && h.packet_id == packet_id)
            {
                return Some(staging.remove(index));
            }
        }
        self.take(kind, packet_id)
    }

    /// Whether an authoritative handler exists for `kind` and `packet_id`.
    pub fn contains(&self, kind: AckType, packet_id: u16) -> bool {
        self.list
            .lock()
            .iter()
            .any(|h| h.kind == kind && h.packet_id == packet_id)
    }

    /// Whether `packet_id` belongs to a locally started transaction.
    pub fn id_in_use(&self, packet_id: u16) -> bool {
        let in_use = |h: &AckHandler| h.kind.uses_local_id() && h.packet_id == packet_id;
        // One list lock at a time.
        let staged = self.staging.lock().iter().any(in_use);
        staged || self.list.lock().iter().any(in_use)
    }

    /// Check the authoritative list for expired handlers.
    ///
    /// Publish-side handlers whose timer ran out are resent, or reported
    /// once they were resent `repeat_warning` times. Subscribe and
    /// unsubscribe handlers are removed and returned when they expire.
    /// With `force`, publish-side handlers are resent regardless of their
    /// timers.
    pub fn scan(&self, now: u32, repeat_warning: u32, force: bool) -> Vec<ScanAction> {
        let mut actions = Vec::new();
        let mut list = self.list.lock();
        let mut index = 0;
        while index < list.len() {
            let handler = &mut list[index];
            if handler.kind.is_request() {
                if handler.timer.is_expired(now) {
                    actions.push(ScanAction::Expired(list.remove(index)));
                    continue;
                }
                index += 1;
                continue;
            }

            if force || handler.timer.is_expired(now) {
                if matches!(handler.kind, AckType::PubAck | AckType::PubRec) {
                    handler.packet.set_dup();
                }
                handler.timer.restart(now);
                if handler.retry_count >= repeat_warning {
                    actions.push(ScanAction::RepeatWarning {
                        kind: handler.kind,
                        packet_id: handler.packet_id,
                        retry_count: handler.retry_count,
                    });
                } else {
                    handler.retry_count += 1;
                    actions.push(ScanAction::Resend {
                        kind: handler.kind,
                        packet_id: handler.packet_id,
                        retry_count: handler.retry_count,
                        packet: handler.packet.as_bytes().to_vec(),
                    });
                }
            }
            index += 1;
        }
        actions
    }

    /// Authoritative handlers.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Whether no handler is outstanding in either list.
    pub fn is_empty(&self) -> bool {
        let staged = self.staging.lock().is_empty();
        staged && self.list.lock().is_empty()
    }

    /// Handlers still waiting for migration.
    pub fn staged_len(&self) -> usize {
        self.staging.lock().len()
    }

    /// Drop every handler in both lists.
    pub fn purge(&self) {
        self.staging.lock().clear();
        self.list.lock().clear();
    }
}
