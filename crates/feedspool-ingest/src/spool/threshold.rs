//! Commit thresholds and the periodic flush trigger.

use super::writer::{DiskSpoolWriter, FlushSummary};
use crate::{Error, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use feedspool_core::RawEvent;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// When uncommitted data is rotated into a closed file.
#[derive(Debug, Clone, Copy)]
pub struct CommitThresholds {
    pub max_uncommitted_write_count: usize,
    pub max_uncommitted_time: Duration,
}

impl Default for CommitThresholds {
    fn default() -> Self {
        Self {
            max_uncommitted_write_count: 10_000,
            max_uncommitted_time: Duration::from_secs(60),
        }
    }
}

struct FlushTrigger {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// A [`DiskSpoolWriter`] that commits once a threshold is crossed.
pub struct ThresholdWriter {
    inner: DiskSpoolWriter,
    thresholds: CommitThresholds,
    trigger: Mutex<Option<FlushTrigger>>,
}

impl ThresholdWriter {
    pub fn new(inner: DiskSpoolWriter, thresholds: CommitThresholds) -> Self {
        Self {
            inner,
            thresholds,
            trigger: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &DiskSpoolWriter {
        &self.inner
    }

    pub fn event_name(&self) -> &str {
        self.inner.directory().event_name()
    }

    /// Write one event, committing if a threshold is reached.
    pub fn write(&self, event: &RawEvent) -> Result<()> {
        self.inner.write(event)?;
        if self.should_commit() {
            self.inner.commit()?;
        }
        Ok(())
    }

    fn should_commit(&self) -> bool {
        self.inner.uncommitted_count() >= self.thresholds.max_uncommitted_write_count
            || self.is_overdue()
    }

    fn is_overdue(&self) -> bool {
        self.inner
            .uncommitted_age()
            .is_some_and(|age| age >= self.thresholds.max_uncommitted_time)
    }

    pub fn commit(&self) -> Result<()> {
        self.inner.commit().map(|_| ())
    }

    pub fn flush(&self) -> Result<FlushSummary> {
        self.inner.flush()
    }

    /// One trigger tick: commit overdue data, then flush.
    pub fn tick(&self) -> Result<FlushSummary> {
        if self.is_overdue() {
            self.inner.commit()?;
        }
        self.inner.flush()
    }

    /// Start the background thread that calls [`tick`](Self::tick) every `interval`.
    pub fn start_flush_trigger(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let mut trigger = self.trigger.lock();
        if trigger.is_some() {
            return Ok(());
        }

        let (stop, stop_rx) = bounded::<()>(1);
        let writer: Weak<Self> = Arc::downgrade(self);
        let event_name = self.event_name().to_string();

        let handle = thread::Builder::new()
            .name(format!("spool-flush-{event_name}"))
            .spawn(move || {
                debug!("Flush trigger for {} started", event_name);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let Some(writer) = writer.upgrade() else {
                        break;
                    };
                    if let Err(e) = writer.tick() {
                        warn!("Flush trigger for {} failed: {}", event_name, e);
                    }
                }
                debug!("Flush trigger for {} stopped", event_name);
            })
            .map_err(|e| Error::Spool(format!("failed to spawn flush trigger: {e}")))?;

        *trigger = Some(FlushTrigger { stop, handle });
        Ok(())
    }

    /// Stop the trigger, then commit and flush a final time.
    pub fn close(&self) -> Result<FlushSummary> {
        if let Some(trigger) = self.trigger.lock().take() {
            let _ = trigger.stop.send(());
            // The trigger thread may be the one dropping the last reference.
            if trigger.handle.thread().id() != thread::current().id()
                && trigger.handle.join().is_err()
            {
                warn!("Flush trigger for {} panicked", self.event_name());
            }
        }
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::directory::SpoolDirectoryManager;
    use crate::spool::writer::{FlushHandler, FlushOutcome, SyncPolicy};
    use feedspool_core::SerializationType;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl FlushHandler for CountingHandler {
        fn handle(&self, _file: &Path) -> FlushOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FlushOutcome::Success
        }
    }

    fn threshold_writer(
        tmp: &TempDir,
        thresholds: CommitThresholds,
        handler: Arc<CountingHandler>,
    ) -> Arc<ThresholdWriter> {
        let directory =
            SpoolDirectoryManager::new(tmp.path(), "Click", SerializationType::Json, "1-1")
                .unwrap();
        let inner = DiskSpoolWriter::new(directory, SyncPolicy::None, false, handler).unwrap();
        Arc::new(ThresholdWriter::new(inner, thresholds))
    }

    fn event() -> RawEvent {
        RawEvent::new("Click", json!({}))
    }

    #[test]
    fn test_commits_at_count_threshold() {
        let tmp = TempDir::new().unwrap();
        let writer = threshold_writer(
            &tmp,
            CommitThresholds {
                max_uncommitted_write_count: 3,
                max_uncommitted_time: Duration::from_secs(3600),
            },
            Arc::default(),
        );

        writer.write(&event()).unwrap();
        writer.write(&event()).unwrap();
        assert_eq!(writer.inner().closed_files().unwrap().len(), 0);

        writer.write(&event()).unwrap();
        assert_eq!(writer.inner().closed_files().unwrap().len(), 1);
        assert_eq!(writer.inner().uncommitted_count(), 0);
    }

    #[test]
    fn test_tick_commits_overdue_data() {
        let tmp = TempDir::new().unwrap();
        let handler = Arc::new(CountingHandler::default());
        let writer = threshold_writer(
            &tmp,
            CommitThresholds {
                max_uncommitted_write_count: 1000,
                max_uncommitted_time: Duration::ZERO,
            },
            handler.clone(),
        );

        // A zero time threshold commits on every write already.
        writer.write(&event()).unwrap();
        let summary = writer.tick().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_trigger_runs_and_stops() {
        let tmp = TempDir::new().unwrap();
        let handler = Arc::new(CountingHandler::default());
        let writer = threshold_writer(
            &tmp,
            CommitThresholds {
                max_uncommitted_write_count: 1,
                max_uncommitted_time: Duration::from_secs(3600),
            },
            handler.clone(),
        );

        writer.start_flush_trigger(Duration::from_millis(10)).unwrap();
        writer.write(&event()).unwrap();

        for _ in 0..200 {
            if handler.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        writer.close().unwrap();
        assert!(writer.inner().is_closed());
    }
}
