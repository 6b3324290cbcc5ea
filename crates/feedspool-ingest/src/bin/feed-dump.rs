//! Print a channel's rolled-up feed.
//!
//! Loads the newest feed events of a channel from ClickHouse, applies the
//! roll-up and prints the resulting feed as JSON.
//!
//! # Usage
//!
//! ```bash
//! feed-dump --clickhouse-url http://localhost:8123 --channel alice
//!
//! # Only public events, rolling up likes and follows
//! feed-dump --channel alice --filter visibility=public --roll-up like,follow
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use feedspool_core::RollUpEngine;
use feedspool_ingest::{ClickHouseConfig, ClickHouseFeedEventStore, CollectorConfig, FeedReader};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Print a channel's rolled-up feed.
#[derive(Parser, Debug)]
#[command(name = "feed-dump")]
#[command(about = "Load a channel's feed events and print the rolled-up feed")]
#[command(version)]
struct Args {
    /// ClickHouse URL
    #[arg(long, default_value = "http://localhost:8123")]
    clickhouse_url: String,

    /// ClickHouse database name
    #[arg(long, default_value = "feedspool")]
    clickhouse_db: String,

    /// Channel to load
    #[arg(long, short)]
    channel: String,

    /// Restrict to these feed event ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,

    /// Maximum events loaded before roll-up
    #[arg(long, default_value = "100")]
    count: usize,

    /// Keep events matching any KEY=VALUE (repeatable)
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    filters: Vec<String>,

    /// Event types to roll up (comma-separated, defaults to FEEDSPOOL_ROLLUP_TYPES)
    #[arg(long, value_delimiter = ',')]
    roll_up: Option<Vec<String>>,

    /// Roll-up window in hours
    #[arg(long, default_value = "24")]
    window_hours: i64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let filter = parse_filters(&args.filters)?;

    let store = ClickHouseFeedEventStore::new(ClickHouseConfig {
        url: args.clickhouse_url.clone(),
        database: args.clickhouse_db.clone(),
        ..ClickHouseConfig::default()
    })
    .context("Failed to create ClickHouse feed event store")?;

    let window = roll_up_window(args.window_hours)?;
    let engine = match &args.roll_up {
        Some(types) => RollUpEngine::new(types.iter().cloned()),
        None => CollectorConfig::from_env()
            .context("Invalid FEEDSPOOL_* configuration")?
            .roll_up_engine(),
    }
    .with_window(window);

    let reader = FeedReader::new(Arc::new(store), engine);
    let feed = reader
        .load_feed(
            &args.channel,
            &args.ids,
            args.count,
            (!filter.is_empty()).then_some(&filter),
        )
        .with_context(|| format!("Failed to load feed of channel '{}'", args.channel))?;

    println!("{}", serde_json::to_string_pretty(&feed)?);
    Ok(())
}

fn roll_up_window(hours: i64) -> Result<chrono::Duration> {
    if hours <= 0 {
        bail!("Roll-up window must be positive, got {} hours", hours);
    }
    chrono::Duration::try_hours(hours)
        .with_context(|| format!("Roll-up window of {} hours is out of range", hours))
}

/// Parse `KEY=VALUE` pairs. Values that are valid JSON (numbers, booleans)
/// are kept typed; anything else is a string.
fn parse_filters(filters: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for filter in filters {
        let Some((key, value)) = filter.split_once('=') else {
            bail!("Invalid filter '{}', expected KEY=VALUE", filter);
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}
