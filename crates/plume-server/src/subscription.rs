//! Subscription store with trie-based topic matching.

use std::collections::HashMap;
use std::sync::Arc;

use plume_core::packet::QoS;

/// One subscription: (client_id, filter) pairs are unique in the store.
#[derive(Debug, Clone)]
pub struct SubscribeSet {
    pub filter: Arc<str>,
    pub client_id: Arc<str>,
    pub qos: QoS,
}

/// A node in the subscription trie, keyed by topic level.
#[derive(Default)]
struct TrieNode {
    /// Subscribers whose filter ends at this node.
    subscribers: Vec<SubscribeSet>,
    children: HashMap<String, TrieNode>,
    /// '+' child: matches exactly one level.
    single_wildcard: Option<Box<TrieNode>>,
    /// '#' subscribers: match everything from here down.
    multi_wildcard: Vec<SubscribeSet>,
}

impl TrieNode {
    fn insert(&mut self, levels: &[&str], set: SubscribeSet) -> bool {
        if levels.is_empty() {
            return Self::push_unique(&mut self.subscribers, set);
        }

        let level = levels[0];
        let remaining = &levels[1..];

        match level {
            "#" => Self::push_unique(&mut self.multi_wildcard, set),
            "+" => self
                .single_wildcard
                .get_or_insert_with(Box::default)
                .insert(remaining, set),
            _ => self
                .children
                .entry(level.to_string())
                .or_default()
                .insert(remaining, set),
        }
    }

    /// Insert keeping (client, filter) unique. Returns true if this is a new
    /// subscription rather than a replacement.
    fn push_unique(list: &mut Vec<SubscribeSet>, set: SubscribeSet) -> bool {
        let before = list.len();
        list.retain(|s| s.client_id != set.client_id);
        let replaced = list.len() < before;
        list.push(set);
        !replaced
    }

    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        if levels.is_empty() {
            let before = self.subscribers.len();
            self.subscribers.retain(|s| &*s.client_id != client_id);
            return self.subscribers.len() < before;
        }

        let level = levels[0];
        let remaining = &levels[1..];

        match level {
            "#" => {
                let before = self.multi_wildcard.len();
                self.multi_wildcard.retain(|s| &*s.client_id != client_id);
                self.multi_wildcard.len() < before
            }
            "+" => match &mut self.single_wildcard {
                Some(child) => child.remove(remaining, client_id),
                None => false,
            },
            _ => match self.children.get_mut(level) {
                Some(child) => child.remove(remaining, client_id),
                None => false,
            },
        }
    }

    fn remove_client(&mut self, client_id: &str) -> usize {
        let mut removed = 0;

        let before = self.subscribers.len();
        self.subscribers.retain(|s| &*s.client_id != client_id);
        removed += before - self.subscribers.len();

        let before = self.multi_wildcard.len();
        self.multi_wildcard.retain(|s| &*s.client_id != client_id);
        removed += before - self.multi_wildcard.len();

        if let Some(child) = &mut self.single_wildcard {
            removed += child.remove_client(client_id);
        }
        for child in self.children.values_mut() {
            removed += child.remove_client(client_id);
        }

        removed
    }

    fn collect(&self, levels: &[&str], is_root: bool, out: &mut Vec<SubscribeSet>) {
        // MQTT-4.7.2-1: wildcard-led filters never match '$'-led topics
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            out.extend(self.multi_wildcard.iter().cloned());
        }

        if levels.is_empty() {
            out.extend(self.subscribers.iter().cloned());
            return;
        }

        let level = levels[0];
        let remaining = &levels[1..];

        if !skip_wildcards {
            if let Some(child) = &self.single_wildcard {
                child.collect(remaining, false, out);
            }
        }

        if let Some(child) = self.children.get(level) {
            child.collect(remaining, false, out);
        }
    }
}

/// Subscription store using a trie for O(depth) topic matching.
pub struct SubscriptionStore {
    root: TrieNode,
    count: usize,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
            count: 0,
        }
    }

    /// Add a subscription; a second subscribe by the same client to the same
    /// filter replaces it.
    pub fn subscribe(&mut self, filter: &str, set: SubscribeSet) {
        let levels: Vec<&str> = filter.split('/').collect();
        if self.root.insert(&levels, set) {
            self.count += 1;
        }
    }

    /// Remove one (client, filter) subscription.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let removed = self.root.remove(&levels, client_id);
        if removed {
            self.count -= 1;
        }
        removed
    }

    /// Remove every subscription of one client (clean-session teardown).
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let removed = self.root.remove_client(client_id);
        self.count -= removed;
        removed
    }

    /// Collect every subscription matching a concrete topic.
    pub fn matches(&self, topic: &str, out: &mut Vec<SubscribeSet>) {
        out.clear();
        if topic.is_empty() {
            return;
        }
        let levels: Vec<&str> = topic.split('/').collect();
        self.root.collect(&levels, true, out);
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Level-by-level match of a concrete topic against a filter. Used for the
/// retained-store scan; the MQTT-4.7.2-1 '$' rule is enforced by callers
/// that deal with '$'-prefixed topics.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.is_empty() || filter.is_empty() {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        let Some(filter_level) = filter_levels.next() else {
            // Filter consumed: match iff topic is too
            return topic_levels.next().is_none();
        };

        // '#' swallows the rest, including the parent level itself
        // ("a/#" matches "a")
        if filter_level == "#" {
            return true;
        }

        let Some(topic_level) = topic_levels.next() else {
            return false;
        };

        if filter_level != "+" && filter_level != topic_level {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(client: &str, qos: QoS, filter: &str) -> SubscribeSet {
        SubscribeSet {
            filter: Arc::from(filter),
            client_id: Arc::from(client),
            qos,
        }
    }

    fn matched(store: &SubscriptionStore, topic: &str) -> Vec<String> {
        let mut out = Vec::new();
        store.matches(topic, &mut out);
        let mut ids: Vec<String> = out.iter().map(|s| s.client_id.to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_exact_match() {
        let mut store = SubscriptionStore::new();
        store.subscribe("sensors/temp", set("a", QoS::AtMostOnce, "sensors/temp"));

        assert_eq!(matched(&store, "sensors/temp"), vec!["a"]);
        assert!(matched(&store, "sensors/humidity").is_empty());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_single_wildcard() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/+/c", set("a", QoS::AtMostOnce, "a/+/c"));

        assert_eq!(matched(&store, "a/x/c"), vec!["a"]);
        assert_eq!(matched(&store, "a/y/c"), vec!["a"]);
        assert!(matched(&store, "a/x/d").is_empty());
        assert!(matched(&store, "a/c").is_empty());
        assert!(matched(&store, "a/x/y/c").is_empty());
    }

    #[test]
    fn test_multi_wildcard() {
        let mut store = SubscriptionStore::new();
        store.subscribe("sensors/#", set("a", QoS::AtMostOnce, "sensors/#"));

        assert_eq!(matched(&store, "sensors/temp"), vec!["a"]);
        assert_eq!(matched(&store, "sensors/room1/temp"), vec!["a"]);
        // "sensors/#" also matches the parent level itself
        assert_eq!(matched(&store, "sensors"), vec!["a"]);
        assert!(matched(&store, "actuators/light").is_empty());
    }

    #[test]
    fn test_dollar_topics_not_matched_by_wildcards() {
        let mut store = SubscriptionStore::new();
        store.subscribe("#", set("a", QoS::AtMostOnce, "#"));
        store.subscribe("+/broker/uptime", set("b", QoS::AtMostOnce, "+/broker/uptime"));
        store.subscribe("$SYS/#", set("c", QoS::AtMostOnce, "$SYS/#"));

        assert_eq!(matched(&store, "$SYS/broker/uptime"), vec!["c"]);
        assert_eq!(matched(&store, "normal/topic"), vec!["a"]);
    }

    #[test]
    fn test_duplicate_subscription_replaces() {
        let mut store = SubscriptionStore::new();
        store.subscribe("t", set("a", QoS::AtMostOnce, "t"));
        store.subscribe("t", set("a", QoS::ExactlyOnce, "t"));

        let mut out = Vec::new();
        store.matches("t", &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].qos, QoS::ExactlyOnce);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut store = SubscriptionStore::new();
        store.subscribe("t", set("a", QoS::AtMostOnce, "t"));
        store.subscribe("t", set("b", QoS::AtMostOnce, "t"));

        assert!(store.unsubscribe("t", "a"));
        assert!(!store.unsubscribe("t", "a"));
        assert_eq!(matched(&store, "t"), vec!["b"]);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/b", set("a", QoS::AtMostOnce, "a/b"));
        store.subscribe("a/+", set("a", QoS::AtMostOnce, "a/+"));
        store.subscribe("#", set("a", QoS::AtMostOnce, "#"));
        store.subscribe("a/b", set("b", QoS::AtMostOnce, "a/b"));

        assert_eq!(store.remove_client("a"), 3);
        assert_eq!(matched(&store, "a/b"), vec!["b"]);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_topic_matches_filter() {
        assert!(topic_matches_filter("a/x/c", "a/+/c"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "#"));
        assert!(topic_matches_filter("t", "t"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));
        assert!(!topic_matches_filter("", "#"));
    }
}
