//! Topic → subscription resolution with a read-through cache.
//!
//! Normal events match subscriptions by exact topic. Suppress events match
//! every subscription whose topic *starts with* the event topic, so one
//! suppression masks a whole family of narrower topics.
//!
//! Exact, prefix and feed lookups are cached separately. Adding or removing
//! a subscription invalidates the exact entry of its topic, every prefix
//! entry that is a prefix of its topic and the entry of its feed, before the
//! call returns.

use super::SubscriptionStore;
use crate::Result;
use feedspool_core::Subscription;
use moka::sync::Cache;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Entry = Arc<HashSet<Subscription>>;

/// Cache sizing for [`SubscriptionRouter`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum entries per cache.
    pub max_capacity: u64,
    /// Entries expire after this long even without invalidation.
    pub time_to_live: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            time_to_live: Duration::from_secs(600),
        }
    }
}

/// Resolves event topics to subscriptions.
pub struct SubscriptionRouter {
    store: Arc<dyn SubscriptionStore>,
    exact: Cache<String, Entry>,
    prefix: Cache<String, Entry>,
    feed: Cache<String, Entry>,
    // Held for writing across a store change and its invalidation, so a
    // concurrent load can never cache a pre-change result afterwards.
    epoch: RwLock<()>,
}

impl SubscriptionRouter {
    pub fn new(store: Arc<dyn SubscriptionStore>, config: RouterConfig) -> Self {
        let build = || {
            Cache::builder()
                .max_capacity(config.max_capacity)
                .time_to_live(config.time_to_live)
                .build()
        };

        Self {
            store,
            exact: build(),
            prefix: build(),
            feed: build(),
            epoch: RwLock::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// Union of the subscriptions matching any of `topics`.
    pub fn resolve<'a, I>(&self, topics: I, is_suppress: bool) -> Result<HashSet<Subscription>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut subscriptions = HashSet::new();
        for topic in topics {
            let entry = if is_suppress {
                self.lookup(&self.prefix, topic, |t| self.store.load_by_starts_with_topic(t))?
            } else {
                self.lookup(&self.exact, topic, |t| self.store.load_by_topic(t))?
            };
            subscriptions.extend(entry.iter().cloned());
        }
        Ok(subscriptions)
    }

    /// Subscriptions that feed `feed`.
    pub fn resolve_feed(&self, feed: &str) -> Result<HashSet<Subscription>> {
        let entry = self.lookup(&self.feed, feed, |f| self.store.load_by_feed(f))?;
        Ok(entry.as_ref().clone())
    }

    fn lookup<F>(&self, cache: &Cache<String, Entry>, key: &str, load: F) -> Result<Entry>
    where
        F: FnOnce(&str) -> Result<HashSet<Subscription>>,
    {
        let _epoch = self.epoch.read();
        if let Some(entry) = cache.get(key) {
            return Ok(entry);
        }

        let entry = Arc::new(load(key)?);
        cache.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    /// Store a subscription and make it visible to the next resolve.
    pub fn add_subscription(&self, subscription: Subscription) -> Result<u64> {
        let _epoch = self.epoch.write();
        let topic = subscription.topic.clone();
        let feed = subscription.metadata.feed.clone();

        let id = self.store.insert(subscription)?;
        self.invalidate(&topic, &feed);
        debug!(id, topic = %topic, "Subscription added");
        Ok(id)
    }

    /// Remove a subscription and make the removal visible to the next resolve.
    pub fn remove_subscription(&self, id: u64) -> Result<Option<Subscription>> {
        let _epoch = self.epoch.write();

        let removed = self.store.delete(id)?;
        if let Some(subscription) = &removed {
            self.invalidate(&subscription.topic, &subscription.metadata.feed);
            debug!(id, topic = %subscription.topic, "Subscription removed");
        }
        Ok(removed)
    }

    fn invalidate(&self, topic: &str, feed: &str) {
        self.exact.invalidate(topic);
        self.feed.invalidate(feed);

        let stale: Vec<Arc<String>> = self
            .prefix
            .iter()
            .map(|(key, _)| key)
            .filter(|key| topic.starts_with(key.as_str()))
            .collect();
        for key in stale {
            self.prefix.invalidate(key.as_str());
        }
    }

    /// Drop every cached entry and release the store.
    pub fn clean_up(&self) {
        self.exact.invalidate_all();
        self.prefix.invalidate_all();
        self.feed.invalidate_all();
        self.store.clean_up();
    }
}
