//! Subscriptions: persistent stores and the cached topic router.

pub mod rocks;
pub mod router;

pub use rocks::RocksSubscriptionStore;
pub use router::{RouterConfig, SubscriptionRouter};

use crate::Result;
use feedspool_core::Subscription;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

/// Persistent storage of subscriptions.
pub trait SubscriptionStore: Send + Sync {
    /// Store a subscription, returning its assigned id.
    fn insert(&self, subscription: Subscription) -> Result<u64>;

    /// Remove a subscription, returning it if it existed.
    fn delete(&self, id: u64) -> Result<Option<Subscription>>;

    fn load(&self, id: u64) -> Result<Option<Subscription>>;

    /// Subscriptions whose topic equals `topic`.
    fn load_by_topic(&self, topic: &str) -> Result<HashSet<Subscription>>;

    /// Subscriptions whose topic starts with `prefix`.
    fn load_by_starts_with_topic(&self, prefix: &str) -> Result<HashSet<Subscription>>;

    /// Subscriptions that feed `feed`.
    fn load_by_feed(&self, feed: &str) -> Result<HashSet<Subscription>>;

    /// Release resources at shutdown.
    fn clean_up(&self) {}
}

/// In-memory store ordered by topic.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    by_topic: RwLock<BTreeMap<(String, u64), Subscription>>,
    next_id: AtomicU64,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_topic.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.read().is_empty()
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn insert(&self, mut subscription: Subscription) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        subscription.id = id;
        self.by_topic
            .write()
            .insert((subscription.topic.clone(), id), subscription);
        Ok(id)
    }

    fn delete(&self, id: u64) -> Result<Option<Subscription>> {
        let mut by_topic = self.by_topic.write();
        let key = by_topic.keys().find(|(_, sid)| *sid == id).cloned();
        Ok(key.and_then(|key| by_topic.remove(&key)))
    }

    fn load(&self, id: u64) -> Result<Option<Subscription>> {
        Ok(self.by_topic.read().values().find(|s| s.id == id).cloned())
    }

    fn load_by_topic(&self, topic: &str) -> Result<HashSet<Subscription>> {
        let by_topic = self.by_topic.read();
        let start = (topic.to_string(), 0);
        let end = (topic.to_string(), u64::MAX);
        Ok(by_topic
            .range((Bound::Included(start), Bound::Included(end)))
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn load_by_starts_with_topic(&self, prefix: &str) -> Result<HashSet<Subscription>> {
        let by_topic = self.by_topic.read();
        Ok(by_topic
            .range((Bound::Included((prefix.to_string(), 0)), Bound::Unbounded))
            .take_while(|((topic, _), _)| topic.starts_with(prefix))
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn load_by_feed(&self, feed: &str) -> Result<HashSet<Subscription>> {
        Ok(self
            .by_topic
            .read()
            .values()
            .filter(|s| s.metadata.feed == feed)
            .cloned()
            .collect())
    }
}
