//! Feedspool ingestion pipeline.
//!
//! Raw events are spooled to local disk, flushed to a set of processors in
//! parallel, and feed events are fanned out to subscribed channels and
//! persisted in batches.
//!
//! # Modules
//!
//! - [`spool`] - Directory layout, spool writers, processor pool, flush orchestrator
//! - [`processor`] - Spool processors (archive, feed event fan-out) and the insertion buffer
//! - [`subscription`] - Subscription stores and the cached topic router
//! - [`store`] - Feed event stores (in-memory, ClickHouse)
//! - [`reader`] - Channel feed loading and roll-up
//! - [`source`] - JSONL raw event source
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Raw events    │  (JSONL source, application code)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ ThresholdWriter │  _tmp file, commit on count/age threshold
//! └────────┬────────┘
//!          │ closed spool files
//!          ▼
//! ┌─────────────────────────┐
//! │ SpoolFlushOrchestrator  │  every processor in parallel, delete on success
//! └──┬───────────────────┬──┘
//!    ▼                   ▼
//! ┌──────────┐   ┌────────────────────┐
//! │ Archive  │   │ FeedEventProcessor │  router fan-out → InsertionBuffer
//! └──────────┘   └─────────┬──────────┘
//!                          ▼
//!                ┌────────────────────┐
//!                │   FeedEventStore   │  batch insert, notification, retention
//!                └────────────────────┘
//! ```
//!
//! A spool file is deleted only after every processor configured for its
//! event succeeded; failed files are retried on the next flush, and files
//! left behind by a crashed process are picked up by the recovery sweep.

pub mod config;
mod error;
pub mod notify;
pub mod processor;
pub mod reader;
pub mod scheduler;
pub mod source;
pub mod spool;
pub mod store;
pub mod subscription;

pub use config::CollectorConfig;
pub use error::{Error, Result};
pub use notify::{FeedUpdateNotifier, LogNotifier};
pub use processor::{
    ArchiveProcessor, BufferConfig, FeedEventProcessor, InsertionBuffer, ProcessorKind,
    ProcessorSet, SpoolProcessor,
};
pub use reader::FeedReader;
pub use scheduler::{TaskHandle, TaskScheduler};
pub use source::{JsonlConfig, JsonlSource, SourceStats};
pub use spool::{
    CommitThresholds, DiskSpoolWriter, RecoveryReport, SpoolDirectoryManager,
    SpoolFlushOrchestrator, SyncPolicy, ThresholdWriter,
};
pub use store::{ClickHouseConfig, ClickHouseFeedEventStore, FeedEventStore, MemoryFeedEventStore};
pub use subscription::{
    MemorySubscriptionStore, RocksSubscriptionStore, RouterConfig, SubscriptionRouter,
    SubscriptionStore,
};
