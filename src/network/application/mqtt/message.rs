//! Subscription bookkeeping.
//!
//! The registry holds two kinds of [`MessageHandler`]s side by side:
//! confirmed subscriptions (no transaction id) and transient entries for a
//! SUBSCRIBE or UNSUBSCRIBE still waiting for its acknowledgment (tagged with
//! that request's packet id). Confirmed topics are unique.

use parking_lot::Mutex;

use super::codec::QoS;
use super::topic;

/// One subscription, or one topic of a pending subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandler {
    topic: Box<str>,
    qos: QoS,
    transaction_id: Option<u16>,
}

impl MessageHandler {
    /// Create a handler for `topic`.
    pub fn new(topic: &str, qos: QoS, transaction_id: Option<u16>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            transaction_id,
        }
    }

    /// Topic filter (or topic name for publish contexts).
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Requested or granted QoS.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Packet id of the pending request this entry belongs to.
    pub fn transaction_id(&self) -> Option<u16> {
        self.transaction_id
    }

    /// Whether this entry is a granted subscription.
    pub fn is_confirmed(&self) -> bool {
        self.transaction_id.is_none()
    }

    /// The same topic as a granted subscription at `qos`.
    pub fn into_confirmed(self, qos: QoS) -> Self {
        Self {
            topic: self.topic,
            qos,
            transaction_id: None,
        }
    }

    fn topic_matches(&self, criteria: &str, wildcard_allowed: bool) -> bool {
        if wildcard_allowed {
            topic::matches(criteria, &self.topic)
        } else {
            *self.topic == *criteria
        }
    }
}

/// A granted subscription as reported by [`Client::subscriptions`](super::Client::subscriptions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter.
    pub topic: String,
    /// Granted QoS.
    pub qos: QoS,
}

/// Registry of [`MessageHandler`]s behind one mutex.
#[derive(Debug, Default)]
pub struct MessageHandlers {
    list: Mutex<Vec<MessageHandler>>,
}

impl MessageHandlers {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler.
    pub fn add(&self, handler: MessageHandler) {
        self.list.lock().push(handler);
    }

    /// Append several handlers in order.
    pub fn add_all(&self, handlers: impl IntoIterator<Item = MessageHandler>) {
        self.list.lock().extend(handlers);
    }

    /// First confirmed handler matching `criteria`.
    ///
    /// With `wildcard_allowed` the stored topics are treated as filters and
    /// `criteria` as a topic name; otherwise topics must be byte-equal.
    pub fn find(&self, criteria: &str, wildcard_allowed: bool) -> Option<MessageHandler> {
        self.list
            .lock()
            .iter()
            .find(|h| h.is_confirmed() && h.topic_matches(criteria, wildcard_allowed))
            .cloned()
    }

    /// Remove confirmed handlers for `criteria` that do not belong to
    /// `exclude_transaction_id`. Returns how many were removed.
    pub fn find_and_destroy_duplicates(&self, criteria: &str, exclude_transaction_id: u16) -> usize {
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|h| {
            !(h.transaction_id != Some(exclude_transaction_id)
                && h.is_confirmed()
                && *h.topic == *criteria)
        });
        before - list.len()
    }

    /// Remove the confirmed handler whose topic equals `topic`.
    pub fn remove(&self, topic: &str) -> Option<MessageHandler> {
        let mut list = self.list.lock();
        let index = list
            .iter()
            .position(|h| h.is_confirmed() && *h.topic == *topic)?;
        Some(list.remove(index))
    }

    /// Number of transient entries belonging to `transaction_id`.
    pub fn count_transaction(&self, transaction_id: u16) -> usize {
        self.list
            .lock()
            .iter()
            .filter(|h| h.transaction_id == Some(transaction_id))
            .count()
    }

    /// Remove and return the entries of `transaction_id`, in request order.
    pub fn take_transaction(&self, transaction_id: u16) -> Vec<MessageHandler> {
        let mut list = self.list.lock();
        let mut taken = Vec::new();
        list.retain(|h| {
            if h.transaction_id == Some(transaction_id) {
                taken.push(h.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Snapshot of the confirmed subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.list
            .lock()
            .iter()
            .filter(|h| h.is_confirmed())
            .map(|h| Subscription {
                topic: String::from(&*h.topic),
                qos: h.qos,
            })
            .collect()
    }

    /// Total entries, confirmed and transient.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Drop every entry.
    pub fn purge(&self) {
        self.list.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(registry: &MessageHandlers, topic: &str, qos: QoS) {
        registry.add(MessageHandler::new(topic, qos, None));
    }

    #[test]
    fn find_exact_and_wildcard() {
        let registry = MessageHandlers::new();
        confirmed(&registry, "sensors/+/temp", QoS::AtLeastOnce);

        assert!(registry.find("sensors/+/temp", false).is_some());
        assert!(registry.find("sensors/kitchen/temp", false).is_none());
        let found = registry.find("sensors/kitchen/temp", true).unwrap();
        assert_eq!(found.topic(), "sensors/+/temp");
        assert_eq!(found.qos(), QoS::AtLeastOnce);
    }

    #[test]
    fn transient_entries_do_not_receive_data() {
        let registry = MessageHandlers::new();
        registry.add(MessageHandler::new("a/b", QoS::AtMostOnce, Some(4)));
        assert!(registry.find("a/b", true).is_none());
        assert_eq!(registry.count_transaction(4), 1);
    }

    #[test]
    fn confirm_replaces_previous_grant() {
        let registry = MessageHandlers::new();
        confirmed(&registry, "a/b", QoS::AtMostOnce);
        registry.add(MessageHandler::new("a/b", QoS::ExactlyOnce, Some(9)));

        for handler in registry.take_transaction(9) {
            registry.find_and_destroy_duplicates(handler.topic(), 9);
            registry.add(handler.into_confirmed(QoS::AtLeastOnce));
        }
        assert_eq!(
            registry.subscriptions(),
            [Subscription {
                topic: "a/b".into(),
                qos: QoS::AtLeastOnce
            }]
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicates_are_collapsed_except_the_request() {
        let registry = MessageHandlers::new();
        confirmed(&registry, "x", QoS::AtMostOnce);
        confirmed(&registry, "y", QoS::AtMostOnce);
        registry.add(MessageHandler::new("x", QoS::AtLeastOnce, Some(2)));

        assert_eq!(registry.find_and_destroy_duplicates("x", 2), 1);
        assert_eq!(registry.count_transaction(2), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn take_transaction_keeps_request_order() {
        let registry = MessageHandlers::new();
        registry.add_all([
            MessageHandler::new("one", QoS::AtMostOnce, Some(1)),
            MessageHandler::new("other", QoS::AtMostOnce, Some(2)),
            MessageHandler::new("two", QoS::AtMostOnce, Some(1)),
        ]);
        let taken: Vec<_> = registry
            .take_transaction(1)
            .into_iter()
            .map(|h| h.topic().to_owned())
            .collect();
        assert_eq!(taken, ["one", "two"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_only_touches_confirmed() {
        let registry = MessageHandlers::new();
        registry.add(MessageHandler::new("a", QoS::AtMostOnce, Some(3)));
        assert!(registry.remove("a").is_none());
        confirmed(&registry, "a", QoS::AtMostOnce);
        assert!(registry.remove("a").is_some());
        assert_eq!(registry.len(), 1);
        registry.purge();
        assert!(registry.is_empty());
    }
}
