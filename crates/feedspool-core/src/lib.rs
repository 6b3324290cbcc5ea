//! Core types, spool codec and feed roll-up for the feedspool pipeline.
//!
//! This crate provides:
//! - Event, subscription and feed event types
//! - The length-prefixed frame codec used by spool files
//! - The [`RollUpEngine`] that compacts a channel's events into a [`Feed`]
//! - Prometheus metrics helpers
//! - Shared error types

pub mod codec;
mod error;
mod event;
pub mod metrics;
pub mod rollup;

pub use codec::{EventDecoder, open_spool_file, write_frame};
pub use error::{Error, Result};
pub use event::{
    EVENT_TYPE_NORMAL, EVENT_TYPE_SUPPRESS, EventMetadata, FEED_EVENT_NAME, FeedEvent,
    FeedEventData, RawEvent, SerializationType, Subscription,
};
pub use rollup::{Feed, FeedItem, RollUpEngine, RolledUpFeedEvent};
