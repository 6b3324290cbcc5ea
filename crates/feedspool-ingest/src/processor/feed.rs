//! Feed event processor: fans the feed events of a spool file out to the
//! channels subscribed to their topics.

use super::SpoolProcessor;
use super::buffer::{BufferConfig, InsertionBuffer};
use crate::config::CollectorConfig;
use crate::notify::FeedUpdateNotifier;
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::store::FeedEventStore;
use crate::subscription::SubscriptionRouter;
use crate::Result;
use feedspool_core::codec::open_spool_file;
use feedspool_core::{FeedEvent, FeedEventData, SerializationType, metrics};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routes feed events to subscriptions and buffers the results for insertion.
pub struct FeedEventProcessor {
    router: Arc<SubscriptionRouter>,
    store: Arc<dyn FeedEventStore>,
    buffer: InsertionBuffer,
    retention: Mutex<Option<TaskHandle>>,
}

impl FeedEventProcessor {
    /// Create the processor, start its insertion buffer and schedule the
    /// retention sweep.
    pub fn new(
        router: Arc<SubscriptionRouter>,
        store: Arc<dyn FeedEventStore>,
        notifier: Arc<dyn FeedUpdateNotifier>,
        scheduler: Arc<TaskScheduler>,
        config: &CollectorConfig,
    ) -> Result<Self> {
        let buffer = InsertionBuffer::new(
            BufferConfig::from(config),
            store.clone(),
            notifier,
            scheduler.clone(),
        );
        buffer.start()?;

        let retention_store = store.clone();
        let retention = scheduler.schedule_recurring(
            "feed-event-retention",
            config.retention_interval,
            move || {
                let removed = retention_store.clean_old_feed_events()?;
                if removed > 0 {
                    info!("Retention removed {} feed events", removed);
                    metrics::increment("retention_events_removed_total", removed as u64);
                }
                Ok(())
            },
        )?;

        Ok(Self {
            router,
            store,
            buffer,
            retention: Mutex::new(Some(retention)),
        })
    }

    pub fn events_in_buffer(&self) -> usize {
        self.buffer.events_in_buffer()
    }

    /// Decode a spool file and route every feed event in it.
    ///
    /// Nothing is enqueued unless the whole file was read; a file that fails
    /// is retried as a whole, so partial enqueues would duplicate events.
    fn route_file(&self, file: &Path) -> Result<Vec<FeedEvent>> {
        let mut routed = Vec::new();
        let mut decode_errors = 0u64;

        for raw in open_spool_file(file)? {
            let raw = match raw {
                Ok(raw) => raw,
                Err(feedspool_core::Error::Json(e)) => {
                    decode_errors += 1;
                    debug!("Skipping undecodable event in {}: {}", file.display(), e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !raw.is_feed_event() {
                continue;
            }

            let data = match FeedEventData::from_value(raw.payload) {
                Ok(data) => data,
                Err(e) => {
                    decode_errors += 1;
                    warn!("Invalid feed event in {}: {}", file.display(), e);
                    continue;
                }
            };

            let subscriptions = self.router.resolve(&data.topics, data.is_suppress())?;
            routed.extend(
                subscriptions
                    .iter()
                    .map(|subscription| FeedEvent::for_subscription(data.clone(), subscription)),
            );
        }

        if decode_errors > 0 {
            metrics::increment("router_decode_errors_total", decode_errors);
        }
        Ok(routed)
    }
}

impl SpoolProcessor for FeedEventProcessor {
    fn name(&self) -> &'static str {
        "feed_events"
    }

    fn process_event_file(
        &self,
        event_name: &str,
        _serialization: SerializationType,
        file: &Path,
        _output_path: &str,
    ) -> Result<()> {
        let routed = self.route_file(file)?;
        let count = routed.len();

        for event in routed {
            self.buffer.enqueue(event)?;
        }

        metrics::increment("router_feed_events_total", count as u64);
        debug!(
            "Routed {} feed events from {} file {}",
            count,
            event_name,
            file.display()
        );
        Ok(())
    }

    fn close(&self) {
        self.buffer.shutdown();
        if let Some(retention) = self.retention.lock().take() {
            retention.cancel();
        }
        self.store.clean_up();
        self.router.clean_up();
    }
}
