//! Persistent feed event storage.

pub mod clickhouse;

pub use self::clickhouse::{ClickHouseConfig, ClickHouseFeedEventStore};

use crate::Result;
use chrono::Utc;
use feedspool_core::FeedEvent;
use parking_lot::RwLock;
use std::time::Duration;
use uuid::Uuid;

/// Storage of routed feed events.
pub trait FeedEventStore: Send + Sync {
    /// Persist a batch, returning the generated ids in input order.
    fn insert(&self, events: &[FeedEvent]) -> Result<Vec<String>>;

    /// Newest-first events of `channel`, restricted to `ids` when non-empty.
    fn load(&self, channel: &str, ids: &[String], count: usize) -> Result<Vec<FeedEvent>>;

    /// Remove events older than the retention period, returning how many.
    fn clean_old_feed_events(&self) -> Result<usize>;

    /// Release resources at shutdown.
    fn clean_up(&self) {}
}

/// In-memory store, mostly for tests and single-node trials.
pub struct MemoryFeedEventStore {
    events: RwLock<Vec<FeedEvent>>,
    retention: Duration,
}

impl MemoryFeedEventStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Every stored event, in insertion order.
    pub fn all(&self) -> Vec<FeedEvent> {
        self.events.read().clone()
    }
}

impl FeedEventStore for MemoryFeedEventStore {
    fn insert(&self, events: &[FeedEvent]) -> Result<Vec<String>> {
        let mut stored = self.events.write();
        let mut ids = Vec::with_capacity(events.len());

        for event in events {
            let id = Uuid::new_v4().to_string();
            let mut event = event.clone();
            event.id = Some(id.clone());
            stored.push(event);
            ids.push(id);
        }
        Ok(ids)
    }

    fn load(&self, channel: &str, ids: &[String], count: usize) -> Result<Vec<FeedEvent>> {
        let mut events: Vec<FeedEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.channel == channel)
            .filter(|e| ids.is_empty() || e.id.as_ref().is_some_and(|id| ids.contains(id)))
            .cloned()
            .collect();

        events.sort_by_key(|e| std::cmp::Reverse(e.created_date()));
        events.truncate(count);
        Ok(events)
    }

    fn clean_old_feed_events(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or(chrono::Duration::MAX);
        let threshold = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.created_date() >= threshold);
        Ok(before - events.len())
    }
}
