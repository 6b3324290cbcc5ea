//! Collector configuration loaded from defaults and environment variables.

use crate::processor::ProcessorKind;
use crate::spool::SyncPolicy;
use crate::{Error, Result};
use feedspool_core::RollUpEngine;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for spooling, flushing and feed event ingestion.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Root directory of the local spool.
    pub spool_dir: PathBuf,

    /// Root directory the archive processor copies flushed files into.
    pub archive_dir: PathBuf,

    /// Whether closed spool files are handed to processors.
    pub flush_enabled: bool,

    /// Interval of the per-writer flush trigger.
    pub flush_interval: Duration,

    /// Uncommitted writes that force a commit (file rotation).
    pub max_uncommitted_write_count: usize,

    /// Maximum age of uncommitted writes before a commit.
    pub max_uncommitted_time: Duration,

    /// Durability of individual writes.
    pub sync_policy: SyncPolicy,

    /// Gzip closed spool files.
    pub compress: bool,

    /// Worker threads running spool processors.
    pub processor_threads: usize,

    /// Grace period for pools and workers on shutdown.
    pub executor_shutdown_timeout: Duration,

    /// Interval between local file checks during shutdown.
    pub shutdown_poll_interval: Duration,

    /// Maximum local file checks during shutdown.
    pub shutdown_poll_attempts: u32,

    /// Minimum age of a spool directory before recovery touches it.
    pub cutoff: Duration,

    /// Processors used for events without an explicit entry.
    pub processors: Vec<ProcessorKind>,

    /// Per event name processor sets.
    pub per_event_processors: HashMap<String, Vec<ProcessorKind>>,

    /// Capacity of the feed event insertion buffer.
    pub buffer_capacity: usize,

    /// Maximum feed events per store insert.
    pub batch_size: usize,

    /// Wait after a drain cycle found nothing to insert.
    pub drain_backoff: Duration,

    /// Interval of the feed event retention sweep.
    pub retention_interval: Duration,

    /// Age after which stored feed events are purged.
    pub retention_period: Duration,

    /// Event types compacted by the roll-up.
    pub roll_up_types: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("./spool"),
            archive_dir: PathBuf::from("./archive"),
            flush_enabled: true,
            flush_interval: Duration::from_secs(60),
            max_uncommitted_write_count: 10_000,
            max_uncommitted_time: Duration::from_secs(60),
            sync_policy: SyncPolicy::Flush,
            compress: false,
            processor_threads: num_cpus::get(),
            executor_shutdown_timeout: Duration::from_secs(30),
            shutdown_poll_interval: Duration::from_secs(5),
            shutdown_poll_attempts: 10,
            cutoff: Duration::from_secs(2 * 60 * 60),
            processors: vec![ProcessorKind::Archive, ProcessorKind::FeedEvents],
            per_event_processors: HashMap::new(),
            buffer_capacity: 1000,
            batch_size: 1000,
            drain_backoff: Duration::from_secs(5),
            retention_interval: Duration::from_secs(15 * 60),
            retention_period: Duration::from_secs(7 * 24 * 60 * 60),
            roll_up_types: feedspool_core::rollup::DEFAULT_ROLL_UP_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl CollectorConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// - `FEEDSPOOL_SPOOL_DIR`, `FEEDSPOOL_ARCHIVE_DIR`
    /// - `FEEDSPOOL_FLUSH_ENABLED` (`true`/`false`)
    /// - `FEEDSPOOL_FLUSH_INTERVAL_SECS`, `FEEDSPOOL_MAX_UNCOMMITTED_SECS`
    /// - `FEEDSPOOL_MAX_UNCOMMITTED_COUNT`
    /// - `FEEDSPOOL_SYNC` (`none`, `flush`, `sync`)
    /// - `FEEDSPOOL_COMPRESS`
    /// - `FEEDSPOOL_PROCESSOR_THREADS`
    /// - `FEEDSPOOL_PROCESSORS`: comma-separated processor names
    /// - `FEEDSPOOL_EVENT_PROCESSORS`: `Event=a,b;Other=c`
    /// - `FEEDSPOOL_BUFFER_CAPACITY`, `FEEDSPOOL_BATCH_SIZE`
    /// - `FEEDSPOOL_RETENTION_INTERVAL_SECS`, `FEEDSPOOL_RETENTION_PERIOD_SECS`
    /// - `FEEDSPOOL_ROLLUP_TYPES`: comma-separated event types
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env("FEEDSPOOL_SPOOL_DIR") {
            config.spool_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FEEDSPOOL_ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FEEDSPOOL_FLUSH_ENABLED") {
            config.flush_enabled = parse("FEEDSPOOL_FLUSH_ENABLED", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_FLUSH_INTERVAL_SECS") {
            config.flush_interval = secs("FEEDSPOOL_FLUSH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_MAX_UNCOMMITTED_COUNT") {
            config.max_uncommitted_write_count = parse("FEEDSPOOL_MAX_UNCOMMITTED_COUNT", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_MAX_UNCOMMITTED_SECS") {
            config.max_uncommitted_time = secs("FEEDSPOOL_MAX_UNCOMMITTED_SECS", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_SYNC") {
            config.sync_policy = v.parse()?;
        }
        if let Some(v) = env("FEEDSPOOL_COMPRESS") {
            config.compress = parse("FEEDSPOOL_COMPRESS", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_PROCESSOR_THREADS") {
            config.processor_threads = parse("FEEDSPOOL_PROCESSOR_THREADS", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_PROCESSORS") {
            config.processors = parse_processor_list(&v)?;
        }
        if let Some(v) = env("FEEDSPOOL_EVENT_PROCESSORS") {
            config.per_event_processors = parse_per_event_processors(&v)?;
        }
        if let Some(v) = env("FEEDSPOOL_BUFFER_CAPACITY") {
            config.buffer_capacity = parse("FEEDSPOOL_BUFFER_CAPACITY", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_BATCH_SIZE") {
            config.batch_size = parse("FEEDSPOOL_BATCH_SIZE", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_RETENTION_INTERVAL_SECS") {
            config.retention_interval = secs("FEEDSPOOL_RETENTION_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_RETENTION_PERIOD_SECS") {
            config.retention_period = secs("FEEDSPOOL_RETENTION_PERIOD_SECS", &v)?;
        }
        if let Some(v) = env("FEEDSPOOL_ROLLUP_TYPES") {
            config.roll_up_types = split_list(&v).map(str::to_string).collect();
        }

        config.validate()?;

        tracing::info!(
            spool_dir = %config.spool_dir.display(),
            archive_dir = %config.archive_dir.display(),
            flush_enabled = config.flush_enabled,
            processors = ?config.processors,
            processor_threads = config.processor_threads,
            buffer_capacity = config.buffer_capacity,
            "collector configuration loaded"
        );

        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.processor_threads == 0 {
            return Err(Error::Config("processor_threads must be at least 1".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(Error::Config("buffer_capacity must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.max_uncommitted_write_count == 0 {
            return Err(Error::Config(
                "max_uncommitted_write_count must be at least 1".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be positive".into()));
        }
        if self.retention_interval.is_zero() {
            return Err(Error::Config("retention_interval must be positive".into()));
        }
        Ok(())
    }

    /// Roll-up engine for the configured event types.
    pub fn roll_up_engine(&self) -> RollUpEngine {
        RollUpEngine::new(self.roll_up_types.iter().cloned())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: '{value}'")))
}

fn secs(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_secs)
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_processor_list(value: &str) -> Result<Vec<ProcessorKind>> {
    split_list(value).map(str::parse).collect()
}

fn parse_per_event_processors(value: &str) -> Result<HashMap<String, Vec<ProcessorKind>>> {
    let mut map = HashMap::new();
    for entry in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (event, kinds) = entry.split_once('=').ok_or_else(|| {
            Error::Config(format!("expected Event=processor[,processor] but got '{entry}'"))
        })?;
        map.insert(event.trim().to_string(), parse_processor_list(kinds)?);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "FEEDSPOOL_SPOOL_DIR",
        "FEEDSPOOL_ARCHIVE_DIR",
        "FEEDSPOOL_FLUSH_ENABLED",
        "FEEDSPOOL_FLUSH_INTERVAL_SECS",
        "FEEDSPOOL_MAX_UNCOMMITTED_COUNT",
        "FEEDSPOOL_MAX_UNCOMMITTED_SECS",
        "FEEDSPOOL_SYNC",
        "FEEDSPOOL_COMPRESS",
        "FEEDSPOOL_PROCESSOR_THREADS",
        "FEEDSPOOL_PROCESSORS",
        "FEEDSPOOL_EVENT_PROCESSORS",
        "FEEDSPOOL_BUFFER_CAPACITY",
        "FEEDSPOOL_BATCH_SIZE",
        "FEEDSPOOL_RETENTION_INTERVAL_SECS",
        "FEEDSPOOL_RETENTION_PERIOD_SECS",
        "FEEDSPOOL_ROLLUP_TYPES",
    ];

    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap();

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        // SAFETY: Serialized by mutex; only test code touches these vars.
        unsafe {
            for k in ENV_KEYS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        // SAFETY: Restoring original env state.
        unsafe {
            for (k, v) in &saved {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn config_defaults() {
        with_env_vars(&[], || {
            let config = CollectorConfig::from_env().unwrap();
            assert_eq!(config.spool_dir, PathBuf::from("./spool"));
            assert!(config.flush_enabled);
            assert_eq!(config.cutoff, Duration::from_secs(7200));
            assert_eq!(config.buffer_capacity, 1000);
            assert_eq!(config.batch_size, 1000);
            assert_eq!(config.drain_backoff, Duration::from_secs(5));
            assert_eq!(config.shutdown_poll_attempts, 10);
            assert_eq!(
                config.processors,
                vec![ProcessorKind::Archive, ProcessorKind::FeedEvents]
            );
        });
    }

    #[test]
    fn config_custom_values() {
        with_env_vars(
            &[
                ("FEEDSPOOL_SPOOL_DIR", "/var/spool/feed"),
                ("FEEDSPOOL_FLUSH_ENABLED", "false"),
                ("FEEDSPOOL_FLUSH_INTERVAL_SECS", "10"),
                ("FEEDSPOOL_SYNC", "sync"),
                ("FEEDSPOOL_PROCESSOR_THREADS", "3"),
                ("FEEDSPOOL_PROCESSORS", "feed_events"),
                ("FEEDSPOOL_ROLLUP_TYPES", "like, share"),
            ],
            || {
                let config = CollectorConfig::from_env().unwrap();
                assert_eq!(config.spool_dir, PathBuf::from("/var/spool/feed"));
                assert!(!config.flush_enabled);
                assert_eq!(config.flush_interval, Duration::from_secs(10));
                assert_eq!(config.sync_policy, SyncPolicy::Sync);
                assert_eq!(config.processor_threads, 3);
                assert_eq!(config.processors, vec![ProcessorKind::FeedEvents]);
                assert_eq!(config.roll_up_types, vec!["like", "share"]);
            },
        );
    }

    #[test]
    fn config_per_event_processors() {
        with_env_vars(
            &[(
                "FEEDSPOOL_EVENT_PROCESSORS",
                "FeedEvent=feed_events,archive; Click=archive",
            )],
            || {
                let config = CollectorConfig::from_env().unwrap();
                assert_eq!(
                    config.per_event_processors["FeedEvent"],
                    vec![ProcessorKind::FeedEvents, ProcessorKind::Archive]
                );
                assert_eq!(
                    config.per_event_processors["Click"],
                    vec![ProcessorKind::Archive]
                );
                assert!(!config.per_event_processors.contains_key("Other"));
            },
        );
    }

    #[test]
    fn config_rejects_invalid_numbers() {
        with_env_vars(&[("FEEDSPOOL_BUFFER_CAPACITY", "lots")], || {
            let err = CollectorConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("FEEDSPOOL_BUFFER_CAPACITY"));
        });
    }

    #[test]
    fn config_rejects_zero_threads() {
        with_env_vars(&[("FEEDSPOOL_PROCESSOR_THREADS", "0")], || {
            assert!(CollectorConfig::from_env().is_err());
        });
    }

    #[test]
    fn config_rejects_zero_retention_interval() {
        with_env_vars(&[("FEEDSPOOL_RETENTION_INTERVAL_SECS", "0")], || {
            let err = CollectorConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("retention_interval"));
        });
    }

    #[test]
    fn config_roll_up_engine_uses_configured_types() {
        with_env_vars(&[("FEEDSPOOL_ROLLUP_TYPES", "share")], || {
            let engine = CollectorConfig::from_env().unwrap().roll_up_engine();
            assert!(engine.is_rolled_up_type("share"));
            assert!(!engine.is_rolled_up_type("like"));
        });
    }

    #[test]
    fn config_rejects_unknown_processor() {
        with_env_vars(&[("FEEDSPOOL_PROCESSORS", "hdfs")], || {
            assert!(CollectorConfig::from_env().is_err());
        });
    }
}
