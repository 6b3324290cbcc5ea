//! Feedspool collector daemon.
//!
//! Reads raw events (JSONL, one `{"name": ..., "payload": ...}` per line),
//! spools them to local disk per event name, and flushes closed spool files
//! to the configured processors.
//!
//! # Usage
//!
//! ```bash
//! # Events from stdin, in-memory stores
//! feedspool-ingest < events.jsonl
//!
//! # Persistent subscriptions and ClickHouse feed events
//! feedspool-ingest \
//!     --input /data/events \
//!     --subscriptions-path /data/subscriptions \
//!     --clickhouse-url http://clickhouse:8123
//! ```
//!
//! Every `FEEDSPOOL_*` environment variable of [`CollectorConfig::from_env`]
//! applies; flags override them.
//!
//! # Graceful Shutdown
//!
//! On SIGINT/SIGTERM, or when the input ends:
//! 1. Closes every spool writer (final commit and flush)
//! 2. Sweeps abandoned spool files
//! 3. Waits for local files to drain
//! 4. Closes processors (the insertion buffer flushes its remainder)
//! 5. Stops the processor pool and the scheduler

use anyhow::{Context, Result, bail};
use clap::Parser;
use feedspool_core::metrics::{start_metrics_server, try_init_metrics};
use feedspool_core::{EventMetadata, SerializationType, Subscription};
use feedspool_ingest::{
    ArchiveProcessor, ClickHouseConfig, ClickHouseFeedEventStore, CollectorConfig,
    FeedEventProcessor, FeedEventStore, JsonlConfig, JsonlSource, LogNotifier,
    MemoryFeedEventStore, MemorySubscriptionStore, ProcessorKind, ProcessorSet,
    RocksSubscriptionStore, RouterConfig, SourceStats, SpoolFlushOrchestrator, SpoolProcessor,
    SubscriptionRouter, SubscriptionStore, TaskScheduler,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Feedspool collector daemon.
#[derive(Parser, Debug)]
#[command(name = "feedspool-ingest")]
#[command(about = "Spool raw events and fan feed events out to subscribers")]
#[command(version)]
struct Args {
    /// JSONL input file or directory ("-" for stdin)
    #[arg(long, short, default_value = "-")]
    input: PathBuf,

    /// Local spool root
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Archive root for flushed spool files
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Processors for events without an override (comma-separated)
    #[arg(long, value_delimiter = ',')]
    processors: Option<Vec<ProcessorKind>>,

    /// Processor worker threads
    #[arg(long)]
    processor_threads: Option<usize>,

    /// Start with flushing disabled
    #[arg(long)]
    no_flush: bool,

    /// Gzip closed spool files
    #[arg(long)]
    compress: bool,

    /// RocksDB path for subscriptions (in-memory when absent)
    #[arg(long)]
    subscriptions_path: Option<PathBuf>,

    /// Subscriptions to add at startup, as TOPIC=CHANNEL[@FEED]
    #[arg(long = "subscribe", value_name = "TOPIC=CHANNEL[@FEED]")]
    subscriptions: Vec<String>,

    /// ClickHouse URL for feed events (in-memory when absent)
    #[arg(long)]
    clickhouse_url: Option<String>,

    /// ClickHouse database name
    #[arg(long, default_value = "feedspool")]
    clickhouse_db: String,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9091")]
    metrics_port: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("feedspool_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    tracing::info!("Feedspool collector starting...");

    // Keeps the metrics server alive until exit.
    let _metrics_runtime = if args.metrics_port > 0 {
        start_metrics(args.metrics_port)?
    } else {
        None
    };

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<&'static str>(2);

    let signal_tx = stop_tx.clone();
    let signal_running = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        signal_running.store(false, Ordering::SeqCst);
        let _ = signal_tx.try_send("signal");
    })
    .context("Failed to set Ctrl+C handler")?;

    let scheduler = Arc::new(
        TaskScheduler::new(2).context("Failed to start task scheduler")?,
    );
    let router = Arc::new(init_router(&args)?);
    let processors = init_processors(&args, &config, &router, &scheduler)?;

    let orchestrator = Arc::new(
        SpoolFlushOrchestrator::new(config.clone(), processors)
            .context("Failed to create spool orchestrator")?,
    );

    match orchestrator.process_abandoned_files() {
        Ok(report) if report.files > 0 => tracing::info!(
            "Recovered {} abandoned files from {} directories ({} failed)",
            report.files,
            report.directories,
            report.failures
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!("Startup recovery sweep failed: {}", e),
    }

    let source = JsonlSource::new(JsonlConfig {
        input: args.input.clone(),
        ..JsonlConfig::default()
    });
    let source_orchestrator = Arc::clone(&orchestrator);
    let source_running = Arc::clone(&running);
    let source_thread = std::thread::Builder::new()
        .name("feedspool-source".to_string())
        .spawn(move || {
            let stats = source.process(|event| {
                if !source_running.load(Ordering::SeqCst) {
                    return Ok(false);
                }
                let writer = source_orchestrator.create_writer(&event.name, SerializationType::Json)?;
                writer.write(&event)?;
                Ok(true)
            });
            let _ = stop_tx.try_send("input");
            stats
        })
        .context("Failed to spawn source thread")?;

    let reason = stop_rx.recv().unwrap_or("input");
    tracing::info!("Shutting down ({})...", reason);
    running.store(false, Ordering::SeqCst);

    orchestrator.shutdown();
    scheduler.shutdown(config.executor_shutdown_timeout);

    // A reader blocked on stdin is left behind; everything it wrote is flushed.
    let stats = if source_thread.is_finished() {
        match source_thread.join() {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                tracing::warn!("Event source failed: {}", e);
                SourceStats::default()
            }
            Err(_) => {
                tracing::warn!("Event source thread panicked");
                SourceStats::default()
            }
        }
    } else {
        SourceStats::default()
    };

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events read:          {}", stats.total_events);
    tracing::info!("Events spooled:       {}", stats.valid_events.saturating_sub(stats.handler_errors));
    tracing::info!("Invalid lines:        {}", stats.parse_errors);
    tracing::info!("Local files left:     {}", orchestrator.local_file_count());

    Ok(())
}

/// Environment configuration with flag overrides.
fn build_config(args: &Args) -> Result<CollectorConfig> {
    let mut config = CollectorConfig::from_env().context("Invalid FEEDSPOOL_* configuration")?;

    if let Some(dir) = &args.spool_dir {
        config.spool_dir = dir.clone();
    }
    if let Some(dir) = &args.archive_dir {
        config.archive_dir = dir.clone();
    }
    if let Some(processors) = &args.processors {
        config.processors = processors.clone();
    }
    if let Some(threads) = args.processor_threads {
        config.processor_threads = threads;
    }
    if args.no_flush {
        config.flush_enabled = false;
    }
    if args.compress {
        config.compress = true;
    }

    config.validate()?;

    tracing::info!("Configuration:");
    tracing::info!("  Spool: {}", config.spool_dir.display());
    tracing::info!("  Archive: {}", config.archive_dir.display());
    tracing::info!("  Processors: {:?}", config.processors);
    tracing::info!("  Flush: {}", if config.flush_enabled { "enabled" } else { "disabled" });
    tracing::info!(
        "  ClickHouse: {}",
        args.clickhouse_url.as_deref().unwrap_or("disabled (in-memory)")
    );

    Ok(config)
}

fn start_metrics(port: u16) -> Result<Option<tokio::runtime::Runtime>> {
    let Some(handle) = try_init_metrics() else {
        tracing::warn!("Metrics recorder already installed, not serving metrics");
        return Ok(None);
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("feedspool-metrics")
        .enable_all()
        .build()
        .context("Failed to build metrics runtime")?;
    runtime.block_on(start_metrics_server(port, handle))?;

    Ok(Some(runtime))
}

fn init_router(args: &Args) -> Result<SubscriptionRouter> {
    let store: Arc<dyn SubscriptionStore> = match &args.subscriptions_path {
        Some(path) => {
            tracing::info!("Opening subscription store at {}", path.display());
            Arc::new(
                RocksSubscriptionStore::open(path)
                    .with_context(|| format!("Failed to open subscription store at {:?}", path))?,
            )
        }
        None => Arc::new(MemorySubscriptionStore::new()),
    };

    let router = SubscriptionRouter::new(store, RouterConfig::default());
    for entry in &args.subscriptions {
        let subscription = parse_subscription(entry)?;
        let id = router.add_subscription(subscription)?;
        tracing::info!("Added subscription {} ({})", id, entry);
    }
    Ok(router)
}

/// Parse `TOPIC=CHANNEL[@FEED]`; the feed defaults to the channel.
fn parse_subscription(entry: &str) -> Result<Subscription> {
    let Some((topic, target)) = entry.split_once('=') else {
        bail!("Invalid subscription '{}', expected TOPIC=CHANNEL[@FEED]", entry);
    };
    let (channel, feed) = target.split_once('@').unwrap_or((target, target));
    if topic.is_empty() || channel.is_empty() || feed.is_empty() {
        bail!("Invalid subscription '{}', expected TOPIC=CHANNEL[@FEED]", entry);
    }
    Ok(Subscription::new(topic, EventMetadata::new(feed), channel))
}

/// Build only the processors the configuration refers to.
fn init_processors(
    args: &Args,
    config: &CollectorConfig,
    router: &Arc<SubscriptionRouter>,
    scheduler: &Arc<TaskScheduler>,
) -> Result<ProcessorSet> {
    let needed: HashSet<ProcessorKind> = config
        .processors
        .iter()
        .chain(config.per_event_processors.values().flatten())
        .copied()
        .collect();

    let mut available: HashMap<ProcessorKind, Arc<dyn SpoolProcessor>> = HashMap::new();

    if needed.contains(&ProcessorKind::Archive) {
        let archive = ArchiveProcessor::new(&config.archive_dir, config.compress)
            .with_context(|| format!("Failed to create archive at {:?}", config.archive_dir))?;
        available.insert(ProcessorKind::Archive, Arc::new(archive));
    }

    if needed.contains(&ProcessorKind::FeedEvents) {
        let store: Arc<dyn FeedEventStore> = match &args.clickhouse_url {
            Some(url) => {
                let store = ClickHouseFeedEventStore::new(ClickHouseConfig {
                    url: url.clone(),
                    database: args.clickhouse_db.clone(),
                    retention: config.retention_period,
                    ..ClickHouseConfig::default()
                })
                .context("Failed to create ClickHouse feed event store")?;
                store
                    .ensure_table()
                    .context("Failed to create ClickHouse feed event table")?;
                Arc::new(store)
            }
            None => Arc::new(MemoryFeedEventStore::new(config.retention_period)),
        };

        let processor = FeedEventProcessor::new(
            Arc::clone(router),
            store,
            Arc::new(LogNotifier),
            Arc::clone(scheduler),
            config,
        )
        .context("Failed to create feed event processor")?;
        available.insert(ProcessorKind::FeedEvents, Arc::new(processor));
    }

    Ok(ProcessorSet::from_kinds(
        &config.processors,
        &config.per_event_processors,
        &available,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription() {
        let sub = parse_subscription("user:1=alice@home").unwrap();
        assert_eq!(sub.topic, "user:1");
        assert_eq!(sub.channel, "alice");
        assert_eq!(sub.metadata.feed, "home");

        let sub = parse_subscription("user:2=bob").unwrap();
        assert_eq!(sub.metadata.feed, "bob");

        assert!(parse_subscription("no-target").is_err());
        assert!(parse_subscription("=alice").is_err());
    }

    #[test]
    fn test_args_parse_processor_list() {
        let args = Args::parse_from(["feedspool-ingest", "--processors", "archive,feed-events"]);
        assert_eq!(
            args.processors,
            Some(vec![ProcessorKind::Archive, ProcessorKind::FeedEvents])
        );
        assert_eq!(args.input, PathBuf::from("-"));
    }
}
