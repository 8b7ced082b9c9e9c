// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Maps incoming publish topics to the handlers registered for matching
//! topic filters.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use codec::topic::SubTopic;
use codec::{Properties, PublishPacket, QoS};

/// An application message delivered to subscription handlers.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,

    /// Publish properties: content type, response topic, correlation data,
    /// user properties, subscription identifiers and the rest.
    pub properties: Properties,
}

impl ReceivedMessage {
    /// Build a message from a decoded publish packet, with the topic alias
    /// already resolved to `topic`.
    #[must_use]
    pub(crate) fn from_packet(packet: &PublishPacket, topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            payload: packet.message_bytes(),
            qos: packet.qos(),
            retain: packet.retain(),
            dup: packet.dup(),
            properties: packet.properties().clone(),
        }
    }
}

/// Callback invoked by the dispatcher for every matching message.
pub type MessageHandler = Arc<dyn Fn(&ReceivedMessage) + Send + Sync>;

/// One registered subscription.
pub struct Subscription {
    filter: SubTopic,
    qos: QoS,
    subscription_id: Option<usize>,
    handler: Option<MessageHandler>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter.filter())
            .field("qos", &self.qos)
            .field("subscription_id", &self.subscription_id)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Subscription {
    #[must_use]
    pub const fn filter(&self) -> &SubTopic {
        &self.filter
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn subscription_id(&self) -> Option<usize> {
        self.subscription_id
    }
}

/// All active subscriptions of one client, in subscribe order.
///
/// Handlers are plain values owned by the registry; nothing in here refers
/// back to the client.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
    next_subscription_id: usize,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            next_subscription_id: 1,
        }
    }

    /// Hand out the next subscription identifier.
    pub fn next_subscription_id(&mut self) -> usize {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        id
    }

    /// Register a subscription. An existing entry with the same filter is
    /// replaced, matching the server behavior for overlapping subscribes
    /// [MQTT-3.8.4-3].
    pub fn add(
        &mut self,
        filter: SubTopic,
        qos: QoS,
        subscription_id: Option<usize>,
        handler: Option<MessageHandler>,
    ) {
        self.subscriptions
            .retain(|sub| sub.filter.filter() != filter.filter());
        self.subscriptions.push(Subscription {
            filter,
            qos,
            subscription_id,
            handler,
        });
    }

    /// Remove subscriptions whose filter string is in `filters`.
    ///
    /// Returns the number of removed entries. In-flight deliveries that
    /// already passed matching are not affected.
    pub fn remove(&mut self, filters: &[String]) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|sub| !filters.iter().any(|f| f == sub.filter.filter()));
        before - self.subscriptions.len()
    }

    /// Collect handlers of every subscription matching `topic`.
    ///
    /// Returns the number of matching subscriptions and the handlers to
    /// invoke; a subscription without a handler still counts as a match.
    #[must_use]
    pub fn find_matches(&self, topic: &str) -> (usize, Vec<MessageHandler>) {
        let mut matched = 0;
        let mut handlers = Vec::new();
        for sub in &self.subscriptions {
            if sub.filter.is_match(topic) {
                matched += 1;
                if let Some(handler) = &sub.handler {
                    handlers.push(Arc::clone(handler));
                }
            }
        }
        (matched, handlers)
    }

    /// Drop subscription identifiers after a session was not resumed;
    /// they are reassigned by the next subscribe exchange.
    pub fn reset_identifiers(&mut self) {
        for sub in &mut self.subscriptions {
            sub.subscription_id = None;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn filter(s: &str) -> SubTopic {
        SubTopic::parse(s).unwrap()
    }

    #[test]
    fn test_registry_matching_routes_to_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handler: MessageHandler = {
            let counter = Arc::clone(&counter);
            Arc::new(move |_msg| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        let mut registry = SubscriptionRegistry::new();
        registry.add(filter("sensor/+/temp"), QoS::AtLeastOnce, None, Some(handler));
        registry.add(filter("state/#"), QoS::AtMostOnce, None, None);

        let (matched, handlers) = registry.find_matches("sensor/kitchen/temp");
        assert_eq!(matched, 1);
        assert_eq!(handlers.len(), 1);

        let message = ReceivedMessage {
            topic: "sensor/kitchen/temp".to_string(),
            payload: Bytes::from_static(b"21.5"),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            properties: Properties::new(),
        };
        for handler in &handlers {
            handler(&message);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let (matched, handlers) = registry.find_matches("state/lamp");
        assert_eq!(matched, 1);
        assert!(handlers.is_empty());

        let (matched, _) = registry.find_matches("other/topic");
        assert_eq!(matched, 0);
    }

    #[test]
    fn test_registry_same_filter_replaces() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(filter("a/b"), QoS::AtMostOnce, Some(1), None);
        registry.add(filter("a/b"), QoS::AtLeastOnce, Some(2), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscriptions()[0].qos(), QoS::AtLeastOnce);
    }

    #[test]
    fn test_registry_remove_by_filter_string() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(filter("a/b"), QoS::AtMostOnce, None, None);
        registry.add(filter("c/+"), QoS::AtMostOnce, None, None);
        let removed = registry.remove(&["a/b".to_string()]);
        assert_eq!(removed, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_shared_subscription_matches_plain_topic() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(
            filter("$share/group-a/sensor/+"),
            QoS::AtLeastOnce,
            None,
            None,
        );
        let (matched, _) = registry.find_matches("sensor/kitchen");
        assert_eq!(matched, 1);
    }

    #[test]
    fn test_registry_reset_identifiers() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.next_subscription_id();
        registry.add(filter("a/b"), QoS::AtMostOnce, Some(id), None);
        registry.reset_identifiers();
        assert_eq!(registry.subscriptions()[0].subscription_id(), None);
    }
}
