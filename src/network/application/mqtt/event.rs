//! Events delivered to the application callback.

use super::ack::AckType;
use super::codec::QoS;
use super::error::ConnectStatus;

/// An inbound PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message<'a> {
    /// Topic name the broker published on.
    pub topic: &'a str,
    /// Application payload.
    pub payload: &'a [u8],
    /// QoS the message was delivered with.
    pub qos: QoS,
    /// Retained message flag.
    pub retain: bool,
    /// Broker re-delivery flag.
    pub dup: bool,
    /// Packet identifier for QoS 1 and 2.
    pub packet_id: Option<u16>,
}

/// Why the connection went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// The transport failed while connected.
    NetworkFailure,
    /// Five heartbeats went unanswered.
    KeepaliveTimeout,
    /// An inbound packet could not be framed.
    ProtocolError,
    /// A connection attempt failed.
    ConnectFailed(ConnectStatus),
    /// The application called `disconnect`.
    UserRequested,
}

/// Something the client wants the application to know.
///
/// Borrowed fields are only valid for the duration of the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<'a> {
    /// The broker accepted the connection.
    Connected {
        /// The broker resumed a stored session.
        session_present: bool,
    },
    /// The connection went down or could not be established.
    Disconnected {
        /// Cause.
        reason: DisconnectReason,
    },
    /// The broker granted a subscription.
    Subscribed {
        /// Topic filter.
        topic: &'a str,
        /// Granted QoS.
        qos: QoS,
        /// Packet identifier of the SUBSCRIBE.
        packet_id: u16,
    },
    /// The broker refused a subscription or never answered.
    SubscribeFailed {
        /// Topic filter.
        topic: &'a str,
        /// Packet identifier of the SUBSCRIBE.
        packet_id: u16,
    },
    /// The broker confirmed an unsubscribe.
    Unsubscribed {
        /// Topic filter.
        topic: &'a str,
        /// Packet identifier of the UNSUBSCRIBE.
        packet_id: u16,
    },
    /// An unsubscribe was never confirmed.
    UnsubscribeFailed {
        /// Topic filter.
        topic: &'a str,
        /// Packet identifier of the UNSUBSCRIBE.
        packet_id: u16,
    },
    /// A QoS 1 or QoS 2 publish completed its handshake.
    Published {
        /// Topic name.
        topic: &'a str,
        /// QoS of the publish.
        qos: QoS,
        /// Packet identifier returned by `publish`.
        packet_id: u16,
    },
    /// A message arrived on a subscribed topic.
    Data(Message<'a>),
    /// A message arrived that matches no subscription.
    UnsubscribedData(Message<'a>),
    /// A packet was sent again after its acknowledgment timed out.
    RepeatPublishPacket {
        /// The acknowledgment being waited for.
        kind: AckType,
        /// Packet identifier.
        packet_id: u16,
        /// Resends so far, including this one.
        retry_count: u32,
    },
    /// The number of outstanding transactions reached the warning threshold.
    AckCountWarning {
        /// Outstanding transactions.
        count: usize,
    },
    /// A transaction hit the resend limit and is no longer resent.
    ///
    /// The application may drop it with `discard_ack_handler`.
    AckRepeatCountWarning {
        /// The acknowledgment being waited for.
        kind: AckType,
        /// Packet identifier.
        packet_id: u16,
        /// Resends so far.
        retry_count: u32,
    },
    /// A transaction was discarded on request.
    AckHandlerDiscard {
        /// The acknowledgment that was being waited for.
        kind: AckType,
        /// Packet identifier.
        packet_id: u16,
        /// Topic the transaction was about.
        topic: &'a str,
    },
    /// About to reconnect; configuration changes made now are used.
    ReconnectBefore,
    /// About to tear the client down.
    DestroyBefore,
}

impl Event<'_> {
    /// Kind of this event, for filtering against an [`EventMask`].
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected { .. } => EventKind::Connected,
            Event::Disconnected { .. } => EventKind::Disconnected,
            Event::Subscribed { .. } => EventKind::Subscribed,
            Event::SubscribeFailed { .. } => EventKind::SubscribeFailed,
            Event::Unsubscribed { .. } => EventKind::Unsubscribed,
            Event::UnsubscribeFailed { .. } => EventKind::UnsubscribeFailed,
            Event::Published { .. } => EventKind::Published,
            Event::Data(_) => EventKind::Data,
            Event::UnsubscribedData(_) => EventKind::UnsubscribedData,
            Event::RepeatPublishPacket { .. } => EventKind::RepeatPublishPacket,
            Event::AckCountWarning { .. } => EventKind::AckCountWarning,
            Event::AckRepeatCountWarning { .. } => EventKind::AckRepeatCountWarning,
            Event::AckHandlerDiscard { .. } => EventKind::AckHandlerDiscard,
            Event::ReconnectBefore => EventKind::ReconnectBefore,
            Event::DestroyBefore => EventKind::DestroyBefore,
        }
    }
}

/// Event kinds, one bit each.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum EventKind {
    Connected = 1 << 0,
    Disconnected = 1 << 1,
    Subscribed = 1 << 2,
    SubscribeFailed = 1 << 3,
    Unsubscribed = 1 << 4,
    UnsubscribeFailed = 1 << 5,
    Published = 1 << 6,
    Data = 1 << 7,
    UnsubscribedData = 1 << 8,
    RepeatPublishPacket = 1 << 9,
    AckCountWarning = 1 << 10,
    AckRepeatCountWarning = 1 << 11,
    AckHandlerDiscard = 1 << 12,
    ReconnectBefore = 1 << 13,
    DestroyBefore = 1 << 14,
}

/// A set of [`EventKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventMask(pub u32);

impl EventMask {
    /// No events.
    pub const NONE: EventMask = EventMask(0);
    /// Every event kind.
    pub const ALL: EventMask = EventMask((1 << 15) - 1);

    /// Whether `kind` is in the set.
    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind as u32 != 0
    }

    /// The set plus `other`.
    pub const fn union(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }

    /// The set without `other`.
    pub const fn difference(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        EventMask(kind as u32)
    }
}

impl core::ops::BitOr for EventKind {
    type Output = EventMask;

    fn bitor(self, rhs: EventKind) -> EventMask {
        EventMask(self as u32 | rhs as u32)
    }
}

impl core::ops::BitOr<EventKind> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventKind) -> EventMask {
        EventMask(self.0 | rhs as u32)
    }
}
