//! ClickHouse-backed feed event store.
//!
//! # Table
//!
//! ```sql
//! CREATE TABLE feed_events (
//!     id String,
//!     channel String,
//!     subscription_id UInt64,
//!     feed String,
//!     event_type LowCardinality(String),
//!     created_date DateTime,
//!     data String
//! ) ENGINE = MergeTree
//! ORDER BY (channel, created_date);
//! ```
//!
//! Ids are UUIDs generated client side, so a batch insert returns them
//! without a read-back. Calls block on a small runtime owned by the store,
//! since the callers are plain worker threads.

use super::FeedEventStore;
use crate::{Error, Result};
use clickhouse::{Client, Row};
use feedspool_core::{EventMetadata, FeedEvent, FeedEventData};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};
use uuid::Uuid;

/// Connection and retention settings.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// ClickHouse server URL (e.g., "http://localhost:8123")
    pub url: String,

    pub database: String,

    pub table: String,

    /// Events older than this are removed by retention.
    pub retention: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "feedspool".to_string(),
            table: "feed_events".to_string(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Row structure matching the feed_events table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct FeedEventRow {
    pub id: String,
    pub channel: String,
    pub subscription_id: u64,
    pub feed: String,
    pub event_type: String,
    pub created_date: u32, // DateTime is stored as Unix timestamp
    pub data: String,
}

impl FeedEventRow {
    fn from_event(id: String, event: &FeedEvent) -> Result<Self> {
        Ok(Self {
            id,
            channel: event.channel.clone(),
            subscription_id: event.subscription_id,
            feed: event.metadata.feed.clone(),
            event_type: event.event_type().to_string(),
            created_date: event.created_date().timestamp().clamp(0, u32::MAX as i64) as u32,
            data: serde_json::to_string(&event.event)?,
        })
    }

    fn into_event(self) -> Result<FeedEvent> {
        let data: FeedEventData = serde_json::from_str(&self.data)?;
        Ok(FeedEvent {
            id: Some(self.id),
            event: data,
            channel: self.channel,
            subscription_id: self.subscription_id,
            metadata: EventMetadata::new(self.feed),
        })
    }
}

/// Feed event store persisted in ClickHouse.
pub struct ClickHouseFeedEventStore {
    client: Client,
    config: ClickHouseConfig,
    runtime: Runtime,
}

impl ClickHouseFeedEventStore {
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("clickhouse-store")
            .enable_all()
            .build()?;

        info!(
            "ClickHouse feed event store initialized: url={}, database={}, table={}",
            config.url, config.database, config.table
        );

        Ok(Self {
            client,
            config,
            runtime,
        })
    }

    /// Create the table if it does not exist.
    pub fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id String, channel String, subscription_id UInt64, feed String, \
                event_type LowCardinality(String), created_date DateTime, data String\
            ) ENGINE = MergeTree ORDER BY (channel, created_date)",
            self.config.table
        );
        self.runtime.block_on(self.client.query(&ddl).execute())?;
        Ok(())
    }

    /// Check if ClickHouse is reachable.
    pub fn health_check(&self) -> Result<bool> {
        let result: u8 = self
            .runtime
            .block_on(self.client.query("SELECT 1").fetch_one())?;
        Ok(result == 1)
    }

    async fn insert_rows(&self, rows: &[FeedEventRow]) -> Result<()> {
        let mut inserter = self.client.insert::<FeedEventRow>(&self.config.table)?;
        for row in rows {
            inserter.write(row).await?;
        }
        inserter.end().await?;
        Ok(())
    }
}

impl FeedEventStore for ClickHouseFeedEventStore {
    fn insert(&self, events: &[FeedEvent]) -> Result<Vec<String>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let rows = events
            .iter()
            .map(|event| FeedEventRow::from_event(Uuid::new_v4().to_string(), event))
            .collect::<Result<Vec<_>>>()?;

        self.runtime.block_on(self.insert_rows(&rows))?;
        debug!("Inserted {} feed events into {}", rows.len(), self.config.table);

        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    fn load(&self, channel: &str, ids: &[String], count: usize) -> Result<Vec<FeedEvent>> {
        let id_filter = if ids.is_empty() { "" } else { " AND has(?, id)" };
        let sql = format!(
            "SELECT ?fields FROM {} WHERE channel = ?{} ORDER BY created_date DESC LIMIT ?",
            self.config.table, id_filter
        );

        let mut query = self.client.query(&sql).bind(channel);
        if !ids.is_empty() {
            query = query.bind(ids);
        }
        let query = query.bind(count as u64);

        let rows = self.runtime.block_on(query.fetch_all::<FeedEventRow>())?;
        rows.into_iter().map(FeedEventRow::into_event).collect()
    }

    fn clean_old_feed_events(&self) -> Result<usize> {
        let seconds = self.config.retention.as_secs();
        let predicate = "created_date < now() - toIntervalSecond(?)";

        let count_sql = format!("SELECT count() FROM {} WHERE {}", self.config.table, predicate);
        let delete_sql = format!("ALTER TABLE {} DELETE WHERE {}", self.config.table, predicate);

        let removed = self.runtime.block_on(async {
            let expired: u64 = self
                .client
                .query(&count_sql)
                .bind(seconds)
                .fetch_one()
                .await?;
            if expired > 0 {
                self.client.query(&delete_sql).bind(seconds).execute().await?;
            }
            Ok::<_, Error>(expired)
        })?;

        if removed > 0 {
            info!("Scheduled removal of {} expired feed events", removed);
        }
        Ok(removed as usize)
    }
}
