//! Local event subscriptions.
//!
//! A notification arriving on any connection is published to every
//! subscriber registered under its method name. Subscribers run inline on
//! the reader task, so they should hand heavy work off to a spawned task.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error};

use crate::connection::ConnectionId;

/// Callback invoked with the event name and its params.
pub type Subscriber = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

/// Handle returned by [`SubscriptionTable::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Entry {
    id: SubscriberId,
    owner: Option<ConnectionId>,
    callback: Subscriber,
}

/// Event name to subscriber list, in registration order.
#[derive(Default)]
pub struct SubscriptionTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<String, Vec<Entry>>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a local subscriber for `name`.
    pub fn subscribe(&self, name: &str, callback: Subscriber) -> SubscriberId {
        self.insert(name, None, callback)
    }

    /// Add a subscriber installed on behalf of `owner`.
    pub fn subscribe_owned(&self, name: &str, owner: ConnectionId, callback: Subscriber) -> SubscriberId {
        self.insert(name, Some(owner), callback)
    }

    fn insert(&self, name: &str, owner: Option<ConnectionId>, callback: Subscriber) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .entry(name.to_owned())
            .or_default()
            .push(Entry { id, owner, callback });
        id
    }

    /// Remove one subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.write();
        let mut found = false;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|entry| entry.id != id);
            found |= list.len() != before;
            !list.is_empty()
        });
        found
    }

    /// Remove every subscriber owned by `owner`; returns how many went.
    pub fn unsubscribe_owned_by(&self, owner: &ConnectionId) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|entry| entry.owner.as_ref() != Some(owner));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Whether `owner` already holds a subscriber under `name`.
    pub fn is_subscribed_by(&self, name: &str, owner: &ConnectionId) -> bool {
        self.entries
            .read()
            .get(name)
            .is_some_and(|list| list.iter().any(|entry| entry.owner.as_ref() == Some(owner)))
    }

    /// Deliver an event to every subscriber of `name`.
    ///
    /// Works on a snapshot, so callbacks may subscribe or unsubscribe
    /// without deadlocking. A panicking callback is logged and skipped.
    /// Returns the number of callbacks invoked.
    pub fn publish(&self, name: &str, params: Option<Value>) -> usize {
        let callbacks: Vec<Subscriber> = self
            .entries
            .read()
            .get(name)
            .map(|list| list.iter().map(|entry| Arc::clone(&entry.callback)).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            debug!(event = name, "no subscribers for notification");
            return 0;
        }

        for callback in &callbacks {
            let params = params.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(name, params))).is_err() {
                error!(event = name, "subscriber panicked");
            }
        }
        callbacks.len()
    }

    /// Event names with at least one subscriber (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of subscribers for `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.entries.read().get(name).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    type Seen = Arc<Mutex<Vec<(String, Option<Value>)>>>;

    fn recorder() -> (Seen, Subscriber) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Subscriber = Arc::new(move |name: &str, params: Option<Value>| {
            sink.lock().push((name.to_owned(), params));
        });
        (seen, callback)
    }

    #[test]
    fn publish_reaches_all_subscribers_in_order() {
        let table = SubscriptionTable::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            let _ = table.subscribe("hello", Arc::new(move |_: &str, _| order.lock().push(tag)));
        }
        assert_eq!(table.publish("hello", None), 2);
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn publish_passes_name_and_params() {
        let table = SubscriptionTable::new();
        let (seen, callback) = recorder();
        let _ = table.subscribe("alice.news", callback);
        let _ = table.publish("alice.news", Some(json!({"x": 1})));
        assert_eq!(
            *seen.lock(),
            vec![("alice.news".to_owned(), Some(json!({"x": 1})))]
        );
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let table = SubscriptionTable::new();
        assert_eq!(table.publish("nobody", None), 0);
    }

    #[test]
    fn unsubscribe_removes_one() {
        let table = SubscriptionTable::new();
        let (seen, callback) = recorder();
        let id = table.subscribe("e", Arc::clone(&callback));
        let _ = table.subscribe("e", callback);
        assert!(table.unsubscribe(id));
        assert!(!table.unsubscribe(id));
        assert_eq!(table.publish("e", None), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn owned_subscribers_dropped_together() {
        let table = SubscriptionTable::new();
        let owner = ConnectionId::from("c1");
        let (_seen, callback) = recorder();
        let _ = table.subscribe_owned("a.x", owner.clone(), Arc::clone(&callback));
        let _ = table.subscribe_owned("b.y", owner.clone(), Arc::clone(&callback));
        let _ = table.subscribe("a.x", callback);

        assert!(table.is_subscribed_by("a.x", &owner));
        assert_eq!(table.unsubscribe_owned_by(&owner), 2);
        assert!(!table.is_subscribed_by("a.x", &owner));
        assert_eq!(table.names(), vec!["a.x"]);
        assert_eq!(table.subscriber_count("b.y"), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let table = SubscriptionTable::new();
        let _ = table.subscribe("e", Arc::new(|_: &str, _| panic!("bad subscriber")));
        let (seen, callback) = recorder();
        let _ = table.subscribe("e", callback);
        assert_eq!(table.publish("e", None), 2);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn subscriber_may_resubscribe_during_publish() {
        let table = Arc::new(SubscriptionTable::new());
        let inner = Arc::clone(&table);
        let _ = table.subscribe(
            "e",
            Arc::new(move |_: &str, _| {
                let _ = inner.subscribe("f", Arc::new(|_: &str, _| {}));
            }),
        );
        assert_eq!(table.publish("e", None), 1);
        assert_eq!(table.subscriber_count("f"), 1);
    }
}
