//! Feed roll-up: compaction of a channel's raw feed events.
//!
//! [`RollUpEngine::apply`] turns the stored feed events of a channel into a
//! presentable [`Feed`]:
//!
//! 1. Optional filter: keep events matching *any* `(key, value)` pair.
//! 2. Sort newest first.
//! 3. One pass over the sorted events. Suppress events add their removal
//!    targets to the suppression set and are dropped. Older events whose
//!    removal targets intersect that set are dropped. Events of a roll-up
//!    eligible type are grouped with the newest event of that type (the
//!    anchor) while they fall within the window ending at the anchor.
//! 4. Output the groups, then every remaining event in descending time.
//!
//! The ordering in step 2 is what makes "already seen" mean "more recent".

use crate::event::FeedEvent;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Default roll-up window.
pub const DEFAULT_ROLL_UP_WINDOW_HOURS: i64 = 24;

/// Event types rolled up when no explicit set is configured.
pub const DEFAULT_ROLL_UP_TYPES: &[&str] = &["like", "follow", "comment"];

/// A group of same-type events compacted into one feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolledUpFeedEvent {
    pub event_type: String,
    /// Members, newest (the anchor) first.
    pub events: Vec<FeedEvent>,
}

/// One entry of a [`Feed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedItem {
    Event(FeedEvent),
    RolledUp(RolledUpFeedEvent),
}

/// A compacted feed, produced fresh on every roll-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub items: Vec<FeedItem>,
}

impl Feed {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Roll-up configuration and algorithm.
#[derive(Debug, Clone)]
pub struct RollUpEngine {
    rolled_up_types: HashSet<String>,
    window: Duration,
}

impl Default for RollUpEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ROLL_UP_TYPES.iter().map(|s| s.to_string()))
    }
}

impl RollUpEngine {
    /// Create an engine rolling up the given event types over a 24 hour window.
    pub fn new<I>(rolled_up_types: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            rolled_up_types: rolled_up_types.into_iter().collect(),
            window: Duration::hours(DEFAULT_ROLL_UP_WINDOW_HOURS),
        }
    }

    /// Override the roll-up window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn is_rolled_up_type(&self, event_type: &str) -> bool {
        self.rolled_up_types.contains(event_type)
    }

    /// Compact `events` into a feed.
    pub fn apply(&self, events: Vec<FeedEvent>, filter: Option<&Map<String, Value>>) -> Feed {
        let mut events: Vec<FeedEvent> = match filter {
            Some(filter) if !filter.is_empty() => events
                .into_iter()
                .filter(|event| event.matches_any(filter))
                .collect(),
            _ => events,
        };

        if events.is_empty() {
            return Feed::default();
        }

        // Stable sort: equal timestamps keep their stored order.
        events.sort_by(|a, b| b.created_date().cmp(&a.created_date()));

        let mut suppressed: BTreeSet<String> = BTreeSet::new();
        let mut groups: Vec<RolledUpFeedEvent> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        let mut remaining = Vec::with_capacity(events.len());

        for event in events {
            if event.event.is_suppress() {
                suppressed.extend(event.event.removal_targets.iter().cloned());
                continue;
            }

            if !suppressed.is_empty()
                && event
                    .event
                    .removal_targets
                    .iter()
                    .any(|target| suppressed.contains(target))
            {
                continue;
            }

            if !self.is_rolled_up_type(event.event_type()) {
                remaining.push(event);
                continue;
            }

            match group_index.get(event.event_type()) {
                None => {
                    group_index.insert(event.event_type().to_string(), groups.len());
                    groups.push(RolledUpFeedEvent {
                        event_type: event.event_type().to_string(),
                        events: vec![event],
                    });
                }
                Some(&index) => {
                    let group = &mut groups[index];
                    let anchor = group.events[0].created_date();
                    if event.created_date() + self.window > anchor {
                        group.events.push(event);
                    } else {
                        remaining.push(event);
                    }
                }
            }
        }

        let mut items: Vec<FeedItem> = groups.into_iter().map(FeedItem::RolledUp).collect();
        items.extend(remaining.into_iter().map(FeedItem::Event));

        Feed { items }
    }
}
