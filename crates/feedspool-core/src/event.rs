//! Event and subscription types.
//!
//! A [`RawEvent`] is what the spool writer stores: an event name plus an opaque
//! JSON payload. Events named [`FEED_EVENT_NAME`] carry a [`FeedEventData`]
//! payload, which the subscription router fans out into one [`FeedEvent`] per
//! matching [`Subscription`].

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Name of the raw event type that carries feed event payloads.
pub const FEED_EVENT_NAME: &str = "FeedEvent";

/// Event type of ordinary feed events.
pub const EVENT_TYPE_NORMAL: &str = "normal";

/// Event type of events that mask other events via their removal targets.
pub const EVENT_TYPE_SUPPRESS: &str = "suppress";

/// Encoding of event payloads inside a spool file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum SerializationType {
    /// Length-prefixed JSON frames.
    Json,
}

impl SerializationType {
    /// Lowercase name used in directory names and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            SerializationType::Json => "json",
        }
    }

    /// File extension of archived files in this encoding.
    pub fn extension(&self) -> &'static str {
        match self {
            SerializationType::Json => "json.spool",
        }
    }
}

impl fmt::Display for SerializationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerializationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(SerializationType::Json),
            other => Err(Error::UnknownSerialization(other.to_string())),
        }
    }
}

/// An event as stored in spool files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name; selects the writer (and spool directory) it lands in.
    pub name: String,

    /// Opaque payload, interpreted by processors.
    pub payload: Value,
}

impl RawEvent {
    /// Create a raw event.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Whether this raw event carries a feed event payload.
    pub fn is_feed_event(&self) -> bool {
        self.name.eq_ignore_ascii_case(FEED_EVENT_NAME)
    }
}

fn default_event_type() -> String {
    EVENT_TYPE_NORMAL.to_string()
}

/// Decoded feed event payload.
///
/// Known fields are typed; every other key of the JSON object is kept in
/// `fields` and participates in feed filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeedEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Routing keys matched against subscription topics.
    #[serde(default)]
    pub topics: BTreeSet<String>,

    /// `normal`, `suppress`, or an application type (some of which roll up).
    #[serde(default = "default_event_type")]
    pub event_type: String,

    /// Targets masked by a suppress event, or the targets this event can be
    /// masked by.
    #[serde(default)]
    pub removal_targets: BTreeSet<String>,

    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl FeedEventData {
    /// Parse a feed event payload.
    pub fn from_value(payload: Value) -> Result<Self> {
        Ok(serde_json::from_value(payload)?)
    }

    /// Whether this event suppresses others.
    pub fn is_suppress(&self) -> bool {
        self.event_type == EVENT_TYPE_SUPPRESS
    }

    /// Look up a field by its JSON key.
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "content-id" => self.content_id.clone().map(Value::String),
            "content-type" => self.content_type.clone().map(Value::String),
            "event-type" => Some(Value::String(self.event_type.clone())),
            "topics" => Some(string_array(&self.topics)),
            "removal-targets" => Some(string_array(&self.removal_targets)),
            "created-date" => serde_json::to_value(self.created_date).ok(),
            _ => self.fields.get(key).cloned(),
        }
    }
}

fn string_array(values: &BTreeSet<String>) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

/// Subscriber metadata carried onto every routed event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Identifier of the feed this subscription belongs to.
    pub feed: String,
}

impl EventMetadata {
    pub fn new(feed: impl Into<String>) -> Self {
        Self { feed: feed.into() }
    }
}

/// A subscription of a channel to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Store-assigned identifier (0 until stored).
    #[serde(default)]
    pub id: u64,
    pub topic: String,
    pub channel: String,
    pub metadata: EventMetadata,
}

impl Subscription {
    /// Create an unsaved subscription.
    pub fn new(topic: impl Into<String>, metadata: EventMetadata, channel: impl Into<String>) -> Self {
        Self {
            id: 0,
            topic: topic.into(),
            channel: channel.into(),
            metadata,
        }
    }
}

/// A feed event bound to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Store-assigned identifier, set once persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub event: FeedEventData,
    pub channel: String,
    pub subscription_id: u64,
    pub metadata: EventMetadata,
}

impl FeedEvent {
    /// Bind event data to a subscription.
    pub fn for_subscription(event: FeedEventData, subscription: &Subscription) -> Self {
        Self {
            id: None,
            event,
            channel: subscription.channel.clone(),
            subscription_id: subscription.id,
            metadata: subscription.metadata.clone(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn created_date(&self) -> DateTime<Utc> {
        self.event.created_date
    }

    /// True if any `(key, value)` pair of `filter` matches this event.
    ///
    /// A scalar filter value matches a list field when the list contains it.
    pub fn matches_any(&self, filter: &Map<String, Value>) -> bool {
        filter.iter().any(|(key, expected)| match self.event.field(key) {
            Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
            Some(actual) => actual == *expected,
            None => false,
        })
    }
}
