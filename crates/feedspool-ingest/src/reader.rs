//! Read path: stored feed events of a channel, rolled up into a [`Feed`].

use crate::Result;
use crate::store::FeedEventStore;
use feedspool_core::{Feed, RollUpEngine};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Loads a channel's feed events and compacts them.
pub struct FeedReader {
    store: Arc<dyn FeedEventStore>,
    engine: RollUpEngine,
}

impl FeedReader {
    pub fn new(store: Arc<dyn FeedEventStore>, engine: RollUpEngine) -> Self {
        Self { store, engine }
    }

    /// Roll up the newest `count` events of `channel` (restricted to `ids`
    /// when non-empty), keeping events matching any pair of `filter`.
    pub fn load_feed(
        &self,
        channel: &str,
        ids: &[String],
        count: usize,
        filter: Option<&Map<String, Value>>,
    ) -> Result<Feed> {
        let events = self.store.load(channel, ids, count)?;
        let loaded = events.len();
        let feed = self.engine.apply(events, filter);
        debug!(channel, loaded, items = feed.len(), "Feed rolled up");
        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFeedEventStore;
    use chrono::Utc;
    use feedspool_core::{EventMetadata, FeedEvent, FeedEventData, FeedItem, Subscription};
    use serde_json::json;
    use std::time::Duration;

    fn stored(store: &MemoryFeedEventStore, channel: &str, payload: Value) {
        let data = FeedEventData::from_value(payload).unwrap();
        let subscription = Subscription::new("t", EventMetadata::new("home"), channel);
        store
            .insert(&[FeedEvent::for_subscription(data, &subscription)])
            .unwrap();
    }

    fn at(minutes_ago: i64) -> String {
        (Utc::now() - chrono::Duration::minutes(minutes_ago)).to_rfc3339()
    }

    #[test]
    fn test_rolls_up_and_suppresses_channel_events() {
        let store = Arc::new(MemoryFeedEventStore::new(Duration::from_secs(86_400)));
        stored(&store, "alice", json!({ "event-type": "like", "created-date": at(3), "visibility": "public" }));
        stored(&store, "alice", json!({ "event-type": "like", "created-date": at(5), "visibility": "public" }));
        stored(&store, "alice", json!({
            "event-type": "post", "created-date": at(10),
            "removal-targets": ["post:1"], "visibility": "public"
        }));
        stored(&store, "alice", json!({
            "event-type": "suppress", "created-date": at(1), "removal-targets": ["post:1"]
        }));
        stored(&store, "bob", json!({ "event-type": "like", "created-date": at(2) }));

        let reader = FeedReader::new(store, RollUpEngine::default());
        let feed = reader.load_feed("alice", &[], 10, None).unwrap();

        assert_eq!(feed.len(), 1);
        match &feed.items[0] {
            FeedItem::RolledUp(group) => {
                assert_eq!(group.event_type, "like");
                assert_eq!(group.events.len(), 2);
                assert!(group.events.iter().all(|e| e.channel == "alice"));
            }
            other => panic!("expected a rolled up group, got {other:?}"),
        }
    }

    #[test]
    fn test_filter_applies_before_roll_up() {
        let store = Arc::new(MemoryFeedEventStore::new(Duration::from_secs(86_400)));
        stored(&store, "alice", json!({ "event-type": "post", "created-date": at(1), "visibility": "public" }));
        stored(&store, "alice", json!({ "event-type": "post", "created-date": at(2), "visibility": "private" }));

        let reader = FeedReader::new(store, RollUpEngine::default());
        let mut filter = Map::new();
        filter.insert("visibility".to_string(), json!("public"));

        let feed = reader.load_feed("alice", &[], 10, Some(&filter)).unwrap();
        assert_eq!(feed.len(), 1);
        assert!(matches!(&feed.items[0], FeedItem::Event(e) if e.event_type() == "post"));
    }
}
