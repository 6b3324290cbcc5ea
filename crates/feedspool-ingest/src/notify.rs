//! Downstream notification of newly persisted feed events.

use crate::Result;
use tracing::info;

/// Told about every batch of feed events the insertion buffer persisted.
pub trait FeedUpdateNotifier: Send + Sync {
    fn feed_events_inserted(&self, ids: &[String]) -> Result<()>;
}

/// Notifier that only logs the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl FeedUpdateNotifier for LogNotifier {
    fn feed_events_inserted(&self, ids: &[String]) -> Result<()> {
        info!(count = ids.len(), first = ids.first().map(String::as_str), "Feed events inserted");
        Ok(())
    }
}
