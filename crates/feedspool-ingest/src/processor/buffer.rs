//! Bounded buffer between feed event routing and the feed event store.
//!
//! Producers (processor pool threads) block while the buffer is full; that is
//! the pipeline's backpressure. One dedicated thread drains the buffer in
//! batches, persists each batch with a single store call and schedules a
//! downstream notification for the generated ids.
//!
//! # Shutdown
//!
//! 1. Stop accepting events (producers still blocked give up and drop theirs)
//! 2. Stop the drain thread, waiting up to the grace period
//! 3. Drain whatever is left synchronously, once

use crate::config::CollectorConfig;
use crate::notify::FeedUpdateNotifier;
use crate::scheduler::TaskScheduler;
use crate::spool::pool::panic_message;
use crate::store::FeedEventStore;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use feedspool_core::{FeedEvent, metrics};
use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a blocked producer waits before re-checking for shutdown.
const ENQUEUE_POLL: Duration = Duration::from_millis(100);

/// Sizing and timing of an [`InsertionBuffer`].
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum events held before producers block.
    pub capacity: usize,
    /// Maximum events per store call.
    pub batch_size: usize,
    /// Pause after a drain cycle that found nothing.
    pub drain_backoff: Duration,
    /// How long shutdown waits for the drain thread.
    pub shutdown_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            batch_size: 1000,
            drain_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CollectorConfig> for BufferConfig {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            capacity: config.buffer_capacity,
            batch_size: config.batch_size,
            drain_backoff: config.drain_backoff,
            shutdown_timeout: config.executor_shutdown_timeout,
        }
    }
}

/// The draining side, shared with the drain thread.
struct Drainer {
    receiver: Receiver<FeedEvent>,
    store: Arc<dyn FeedEventStore>,
    notifier: Arc<dyn FeedUpdateNotifier>,
    scheduler: Arc<TaskScheduler>,
    batch_size: usize,
}

impl Drainer {
    /// Drain batches until the buffer is empty. Returns events taken.
    fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let batch: Vec<FeedEvent> = self.receiver.try_iter().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            self.insert_batch(batch);
        }
        metrics::set_gauge("buffer_events", self.receiver.len() as f64);
        total
    }

    fn insert_batch(&self, batch: Vec<FeedEvent>) {
        let count = batch.len();
        let result = match catch_unwind(AssertUnwindSafe(|| self.store.insert(&batch))) {
            Ok(result) => result,
            Err(panic) => Err(Error::Store(format!(
                "insert panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match result {
            Ok(ids) => {
                info!("Inserted {} feed events", count);
                metrics::increment("buffer_events_inserted_total", count as u64);
                if !ids.is_empty() {
                    self.notify(ids);
                }
            }
            Err(e) => {
                // The batch is not requeued.
                warn!("Failed to insert {} feed events: {}", count, e);
                metrics::increment("buffer_insert_failures_total", count as u64);
            }
        }
    }

    fn notify(&self, ids: Vec<String>) {
        let notifier = self.notifier.clone();
        let scheduled = self
            .scheduler
            .schedule_once("feed-update", Duration::ZERO, move || {
                notifier.feed_events_inserted(&ids)
            });
        if let Err(e) = scheduled {
            warn!("Unable to schedule feed update notification: {}", e);
        }
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Bounded buffer of routed feed events with a single drain thread.
pub struct InsertionBuffer {
    sender: Sender<FeedEvent>,
    drainer: Arc<Drainer>,
    config: BufferConfig,
    closed: AtomicBool,
    // Producers hold it for reading while sending; shutdown takes it for
    // writing once, so no send can land after the final drain.
    gate: RwLock<()>,
    worker: Mutex<Option<Worker>>,
}

impl InsertionBuffer {
    /// Create the buffer without starting the drain thread.
    pub fn new(
        config: BufferConfig,
        store: Arc<dyn FeedEventStore>,
        notifier: Arc<dyn FeedUpdateNotifier>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        let (sender, receiver) = bounded(config.capacity.max(1));
        let drainer = Arc::new(Drainer {
            receiver,
            store,
            notifier,
            scheduler,
            batch_size: config.batch_size.max(1),
        });

        Self {
            sender,
            drainer,
            config,
            closed: AtomicBool::new(false),
            gate: RwLock::new(()),
            worker: Mutex::new(None),
        }
    }

    /// Start the drain thread.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::BufferClosed);
        }

        let (stop, stop_rx) = bounded::<()>(1);
        let drainer = self.drainer.clone();
        let backoff = self.config.drain_backoff;

        let handle = thread::Builder::new()
            .name("feed-event-inserter".to_string())
            .spawn(move || {
                info!("Feed event inserter started");
                loop {
                    let drained = drainer.drain();
                    let wait = if drained == 0 { backoff } else { Duration::ZERO };
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Feed event inserter stopped");
            })
            .map_err(|e| Error::Spool(format!("failed to spawn feed event inserter: {e}")))?;

        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Add an event, blocking while the buffer is full.
    ///
    /// Fails with [`Error::BufferClosed`] once shutdown has begun; the event
    /// is dropped in that case.
    pub fn enqueue(&self, event: FeedEvent) -> Result<()> {
        let mut event = event;
        loop {
            let _gate = self.gate.read();
            if self.is_closed() {
                warn!(
                    channel = %event.channel,
                    "Insertion buffer closed, dropping feed event"
                );
                metrics::increment("buffer_events_dropped_total", 1);
                return Err(Error::BufferClosed);
            }

            match self.sender.send_timeout(event, ENQUEUE_POLL) {
                Ok(()) => {
                    metrics::set_gauge("buffer_events", self.sender.len() as f64);
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(returned)) => event = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::BufferClosed),
            }
        }
    }

    /// Events waiting to be persisted.
    pub fn events_in_buffer(&self) -> usize {
        self.sender.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drain everything currently buffered on the calling thread.
    pub fn drain_now(&self) -> usize {
        self.drainer.drain()
    }

    /// Stop accepting events, stop the drain thread and flush the remainder.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down insertion buffer");
        drop(self.gate.write());

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.stop.send(());
            let deadline = Instant::now() + self.config.shutdown_timeout;
            while !worker.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }

            if worker.handle.is_finished() {
                if worker.handle.join().is_err() {
                    warn!("Feed event inserter panicked");
                }
            } else {
                warn!(
                    "Feed event inserter did not stop within {:?}, detaching it",
                    self.config.shutdown_timeout
                );
            }
        }

        let remaining = self.events_in_buffer();
        if remaining > 0 {
            info!("Flushing {} remaining feed events", remaining);
            let flushed = self.drainer.drain();
            debug!("Flushed {} feed events at shutdown", flushed);
        }
    }
}
