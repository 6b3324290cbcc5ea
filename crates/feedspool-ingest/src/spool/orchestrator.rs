//! Flush orchestration for all spooled event streams.
//!
//! Each writer created here hands its closed files to an [`EventFlushHandler`]
//! which runs the event's processors in parallel on the shared
//! [`ProcessorPool`]. A file is deleted only if every processor succeeds.
//!
//! # Stream lifecycle
//!
//! ```text
//! OPEN ──threshold──▶ ROTATING ──flush tick──▶ PROCESSING ─┬─ all ok ──▶ deleted
//!                                                          └─ failure ─▶ STALE (retried next tick)
//! ```
//!
//! Files left behind by a previous process are picked up by
//! [`process_abandoned_files`](SpoolFlushOrchestrator::process_abandoned_files),
//! which runs at startup and shutdown.

use super::directory::{
    SpoolDirectoryManager, cleanup_old_spool_directories, find_files_in_spool_directory,
    find_old_spool_directories,
};
use super::pool::{ProcessorPool, ProcessorTask};
use super::threshold::{CommitThresholds, ThresholdWriter};
use super::writer::{DiskSpoolWriter, FlushHandler, FlushOutcome};
use crate::config::CollectorConfig;
use crate::processor::{ProcessorSet, SpoolProcessor};
use crate::{Error, Result};
use chrono::Utc;
use feedspool_core::{SerializationType, metrics};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one abandoned-file sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale directories removed after their files were processed.
    pub directories: usize,
    /// Files processed (and deleted) by the sweep.
    pub files: usize,
    /// Files where at least one processor failed.
    pub failures: usize,
}

/// Coordinates writers, processors and recovery for the spool root.
pub struct SpoolFlushOrchestrator {
    config: CollectorConfig,
    instance: String,
    processors: ProcessorSet,
    pool: Arc<ProcessorPool>,
    flush_enabled: Arc<AtomicBool>,
    cutoff: Mutex<Duration>,
    writers: Mutex<HashMap<String, Arc<ThresholdWriter>>>,
    recovery_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl SpoolFlushOrchestrator {
    pub fn new(config: CollectorConfig, processors: ProcessorSet) -> Result<Self> {
        fs::create_dir_all(&config.spool_dir)?;
        let pool = Arc::new(ProcessorPool::new(config.processor_threads)?);
        let instance = format!("{}-{}", std::process::id(), Utc::now().timestamp_millis());

        info!(
            "Spool orchestrator at {} (instance {}, flush {})",
            config.spool_dir.display(),
            instance,
            if config.flush_enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            flush_enabled: Arc::new(AtomicBool::new(config.flush_enabled)),
            cutoff: Mutex::new(config.cutoff),
            config,
            instance,
            processors,
            pool,
            writers: Mutex::new(HashMap::new()),
            recovery_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Token that distinguishes this process's spool directories.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Writer for an event stream, created with its flush trigger on first use.
    pub fn create_writer(
        &self,
        event_name: &str,
        serialization: SerializationType,
    ) -> Result<Arc<ThresholdWriter>> {
        let mut writers = self.writers.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Spool(format!(
                "cannot create writer for '{event_name}': orchestrator is shut down"
            )));
        }
        if let Some(writer) = writers.get(event_name) {
            return Ok(writer.clone());
        }

        let directory = SpoolDirectoryManager::new(
            &self.config.spool_dir,
            event_name,
            serialization,
            &self.instance,
        )?;

        let handler = Arc::new(EventFlushHandler {
            directory: directory.clone(),
            processors: self.processors.for_event(event_name).to_vec(),
            pool: self.pool.clone(),
            flush_enabled: self.flush_enabled.clone(),
            sequence: AtomicU64::new(0),
        });

        let inner = DiskSpoolWriter::new(
            directory,
            self.config.sync_policy,
            self.config.compress,
            handler,
        )?;
        let writer = Arc::new(ThresholdWriter::new(
            inner,
            CommitThresholds {
                max_uncommitted_write_count: self.config.max_uncommitted_write_count,
                max_uncommitted_time: self.config.max_uncommitted_time,
            },
        ));
        writer.start_flush_trigger(self.config.flush_interval)?;

        writers.insert(event_name.to_string(), writer.clone());
        Ok(writer)
    }

    pub fn enable_flush(&self) {
        info!("Spool flushing enabled");
        self.flush_enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable_flush(&self) {
        info!("Spool flushing disabled");
        self.flush_enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_flush_enabled(&self) -> bool {
        self.flush_enabled.load(Ordering::SeqCst)
    }

    /// Closed spool files on disk, across every stream and instance.
    pub fn local_file_count(&self) -> usize {
        let count = find_files_in_spool_directory(&self.config.spool_dir).len();
        metrics::set_gauge("spool_local_files", count as f64);
        count
    }

    pub fn cutoff(&self) -> Duration {
        *self.cutoff.lock()
    }

    pub fn set_cutoff(&self, cutoff: Duration) {
        info!("Abandoned-file cutoff set to {:?}", cutoff);
        *self.cutoff.lock() = cutoff;
    }

    /// Process and delete files in spool directories older than the cutoff.
    ///
    /// Files are deleted whatever the processors report; a failure here can
    /// only lead to duplicates downstream, never to a retry loop. Directories
    /// that do not follow the spool naming scheme are skipped.
    pub fn process_abandoned_files(&self) -> Result<RecoveryReport> {
        let _guard = self.recovery_lock.lock();
        let cutoff = self.cutoff();

        let live: Vec<PathBuf> = self
            .writers
            .lock()
            .values()
            .map(|w| w.inner().directory().spool_directory().to_path_buf())
            .collect();

        let directories: Vec<PathBuf> =
            find_old_spool_directories(&self.config.spool_dir, cutoff)?
                .into_iter()
                .filter(|dir| !live.contains(dir))
                .collect();

        let mut report = RecoveryReport::default();
        let mut sequences: HashMap<String, u64> = HashMap::new();

        for directory in &directories {
            let manager = match SpoolDirectoryManager::from_directory(directory) {
                Ok(manager) => manager,
                Err(e) => {
                    warn!("Skipping directory during recovery: {}", e);
                    continue;
                }
            };
            let processors = self.processors.for_event(manager.event_name());

            for file in find_files_in_spool_directory(directory) {
                let sequence = sequences
                    .entry(manager.event_name().to_string())
                    .or_insert(0);
                *sequence += 1;
                let output_path = manager.archive_path(*sequence);

                info!("Processing abandoned file {}", file.display());
                if !run_processors(&self.pool, processors, &manager, &file, &output_path) {
                    error!(
                        "Processing abandoned file {} failed; deleting it anyway, downstream may see duplicates",
                        file.display()
                    );
                    report.failures += 1;
                }

                if let Err(e) = fs::remove_file(&file) {
                    warn!("Unable to delete abandoned file {}: {}", file.display(), e);
                }
                report.files += 1;
            }
        }

        report.directories = cleanup_old_spool_directories(&directories);
        metrics::increment("spool_abandoned_files_total", report.files as u64);

        if report.files > 0 || report.directories > 0 {
            info!(
                "Recovery sweep: {} files ({} failed), {} directories removed",
                report.files, report.failures, report.directories
            );
        }
        Ok(report)
    }

    /// Drain and stop everything this orchestrator started.
    ///
    /// Writers are closed (final commit and flush), a recovery sweep runs,
    /// the local file count is polled until it reaches zero or the attempts
    /// run out, processors are closed once each, and finally the pool is
    /// stopped within the configured grace period.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down spool orchestrator");

        let writers: Vec<_> = self.writers.lock().drain().map(|(_, w)| w).collect();
        for writer in writers {
            if let Err(e) = writer.close() {
                warn!("Error closing writer for {}: {}", writer.event_name(), e);
            }
        }

        if let Err(e) = self.process_abandoned_files() {
            warn!("Recovery sweep during shutdown failed: {}", e);
        }

        for attempt in 1..=self.config.shutdown_poll_attempts {
            let remaining = self.local_file_count();
            if remaining == 0 {
                break;
            }
            debug!(
                "Waiting for {} local files to flush (attempt {}/{})",
                remaining, attempt, self.config.shutdown_poll_attempts
            );
            thread::sleep(self.config.shutdown_poll_interval);
        }

        let remaining = self.local_file_count();
        if remaining > 0 {
            warn!("{} spool files left on disk at shutdown", remaining);
        }

        for processor in self.processors.distinct() {
            debug!("Closing processor {}", processor.name());
            processor.close();
        }

        self.pool.shutdown(self.config.executor_shutdown_timeout);
        info!("Spool orchestrator stopped");
    }
}

/// Flush handler of one event stream.
struct EventFlushHandler {
    directory: SpoolDirectoryManager,
    processors: Vec<Arc<dyn SpoolProcessor>>,
    pool: Arc<ProcessorPool>,
    flush_enabled: Arc<AtomicBool>,
    sequence: AtomicU64,
}

impl FlushHandler for EventFlushHandler {
    fn handle(&self, file: &Path) -> FlushOutcome {
        if !self.flush_enabled.load(Ordering::SeqCst) {
            return FlushOutcome::Skipped;
        }

        // Advances on every attempt so a retry never reuses an output path.
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let output_path = self.directory.archive_path(sequence);

        if run_processors(&self.pool, &self.processors, &self.directory, file, &output_path) {
            metrics::increment("spool_flush_success_total", 1);
            FlushOutcome::Success
        } else {
            metrics::increment("spool_flush_failure_total", 1);
            FlushOutcome::Failure
        }
    }
}

/// Run every processor on `file` in parallel; `true` if all succeeded.
fn run_processors(
    pool: &ProcessorPool,
    processors: &[Arc<dyn SpoolProcessor>],
    directory: &SpoolDirectoryManager,
    file: &Path,
    output_path: &str,
) -> bool {
    let tasks = processors
        .iter()
        .map(|processor| {
            let processor = processor.clone();
            let event_name = directory.event_name().to_string();
            let serialization = directory.serialization();
            let file = file.to_path_buf();
            let output_path = output_path.to_string();

            ProcessorTask::new(processor.name(), move || {
                processor.process_event_file(&event_name, serialization, &file, &output_path)
            })
        })
        .collect();

    let mut all_ok = true;
    for (processor, result) in processors.iter().zip(pool.run_all(tasks)) {
        if let Err(e) = result {
            warn!(
                processor = processor.name(),
                file = %file.display(),
                "Processor failed: {}", e
            );
            ::metrics::counter!("spool_processor_failures_total", "processor" => processor.name())
                .increment(1);
            all_ok = false;
        }
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::spool::directory::TMP_DIR_NAME;
    use feedspool_core::RawEvent;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingProcessor {
        seen: Mutex<Vec<(String, String)>>,
        closes: AtomicUsize,
    }

    impl RecordingProcessor {
        fn output_paths(&self) -> Vec<String> {
            self.seen.lock().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    impl SpoolProcessor for RecordingProcessor {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn process_event_file(
            &self,
            event_name: &str,
            _: SerializationType,
            file: &Path,
            output_path: &str,
        ) -> Result<()> {
            assert!(file.exists());
            self.seen
                .lock()
                .push((event_name.to_string(), output_path.to_string()));
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingProcessor;

    impl SpoolProcessor for FailingProcessor {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn process_event_file(&self, _: &str, _: SerializationType, _: &Path, _: &str) -> Result<()> {
            Err(Error::Store("unavailable".to_string()))
        }
    }

    struct PanickingProcessor;

    impl SpoolProcessor for PanickingProcessor {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn process_event_file(&self, _: &str, _: SerializationType, _: &Path, _: &str) -> Result<()> {
            panic!("bad processor");
        }
    }

    fn test_config(tmp: &TempDir) -> CollectorConfig {
        CollectorConfig {
            spool_dir: tmp.path().join("spool"),
            flush_interval: Duration::from_secs(3600),
            max_uncommitted_write_count: 1000,
            max_uncommitted_time: Duration::from_secs(3600),
            processor_threads: 2,
            shutdown_poll_interval: Duration::from_millis(10),
            shutdown_poll_attempts: 2,
            executor_shutdown_timeout: Duration::from_secs(1),
            ..CollectorConfig::default()
        }
    }

    fn write_and_commit(orchestrator: &SpoolFlushOrchestrator, event_name: &str) -> Arc<ThresholdWriter> {
        let writer = orchestrator
            .create_writer(event_name, SerializationType::Json)
            .unwrap();
        writer
            .write(&RawEvent::new(event_name, json!({ "n": 1 })))
            .unwrap();
        writer.commit().unwrap();
        writer
    }

    fn age(path: &Path, secs: u64) {
        let dir = fs::File::open(path).unwrap();
        dir.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_success_deletes_file() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingProcessor::default());
        let orchestrator =
            SpoolFlushOrchestrator::new(test_config(&tmp), ProcessorSet::new(vec![recorder.clone()]))
                .unwrap();

        let writer = write_and_commit(&orchestrator, "Click");
        assert_eq!(orchestrator.local_file_count(), 1);

        let summary = writer.flush().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(orchestrator.local_file_count(), 0);

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Click");
        assert!(seen[0].1.starts_with("Click/"));
        assert!(seen[0].1.ends_with("-000000000.json.spool"));
    }

    #[test]
    fn test_failure_keeps_file_and_advances_sequence() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingProcessor::default());
        let orchestrator = SpoolFlushOrchestrator::new(
            test_config(&tmp),
            ProcessorSet::new(vec![recorder.clone(), Arc::new(FailingProcessor)]),
        )
        .unwrap();

        let writer = write_and_commit(&orchestrator, "Click");
        assert_eq!(writer.flush().unwrap().failed, 1);
        assert_eq!(writer.flush().unwrap().failed, 1);
        assert_eq!(orchestrator.local_file_count(), 1);

        let paths = recorder.output_paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("-000000000.json.spool"));
        assert!(paths[1].ends_with("-000000001.json.spool"));
    }

    #[test]
    fn test_panicking_processor_is_isolated() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingProcessor::default());
        let orchestrator = SpoolFlushOrchestrator::new(
            test_config(&tmp),
            ProcessorSet::new(vec![Arc::new(PanickingProcessor), recorder.clone()]),
        )
        .unwrap();

        let writer = write_and_commit(&orchestrator, "Click");
        assert_eq!(writer.flush().unwrap().failed, 1);
        assert_eq!(recorder.output_paths().len(), 1);
        assert_eq!(orchestrator.local_file_count(), 1);
    }

    #[test]
    fn test_disabled_flush_skips_without_consuming_sequence() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingProcessor::default());
        let orchestrator =
            SpoolFlushOrchestrator::new(test_config(&tmp), ProcessorSet::new(vec![recorder.clone()]))
                .unwrap();

        orchestrator.disable_flush();
        assert!(!orchestrator.is_flush_enabled());

        let writer = write_and_commit(&orchestrator, "Click");
        assert_eq!(writer.flush().unwrap().skipped, 1);
        assert!(recorder.output_paths().is_empty());
        assert_eq!(orchestrator.local_file_count(), 1);

        orchestrator.enable_flush();
        assert_eq!(writer.flush().unwrap().succeeded, 1);
        assert!(recorder.output_paths()[0].ends_with("-000000000.json.spool"));
    }

    #[test]
    fn test_per_event_processors() {
        let tmp = TempDir::new().unwrap();
        let default = Arc::new(RecordingProcessor::default());
        let special = Arc::new(RecordingProcessor::default());
        let processors = ProcessorSet::new(vec![default.clone()])
            .with_event("Special", vec![special.clone()]);
        let orchestrator = SpoolFlushOrchestrator::new(test_config(&tmp), processors).unwrap();

        write_and_commit(&orchestrator, "Click").flush().unwrap();
        write_and_commit(&orchestrator, "Special").flush().unwrap();

        assert_eq!(default.seen.lock()[0].0, "Click");
        assert_eq!(special.seen.lock()[0].0, "Special");
        assert_eq!(default.output_paths().len(), 1);
        assert_eq!(special.output_paths().len(), 1);
    }

    #[test]
    fn test_create_writer_reuses_stream() {
        let tmp = TempDir::new().unwrap();
        let orchestrator =
            SpoolFlushOrchestrator::new(test_config(&tmp), ProcessorSet::default()).unwrap();

        let a = orchestrator.create_writer("Click", SerializationType::Json).unwrap();
        let b = orchestrator.create_writer("Click", SerializationType::Json).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(orchestrator.create_writer("bad.name", SerializationType::Json).is_err());

        orchestrator.shutdown();
        assert!(matches!(
            orchestrator.create_writer("Click", SerializationType::Json),
            Err(Error::Spool(_))
        ));
    }

    #[test]
    fn test_recovery_sweep() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let spool = config.spool_dir.clone();

        let stale = spool.join("Click.json.42-1000");
        fs::create_dir_all(stale.join(TMP_DIR_NAME)).unwrap();
        fs::write(stale.join("000000000-a.spool"), b"").unwrap();
        fs::write(stale.join("000000001-b.spool"), b"").unwrap();
        fs::write(stale.join(TMP_DIR_NAME).join("open.spool"), b"").unwrap();
        age(&stale, 3 * 3600);

        let garbage = spool.join("garbage");
        fs::create_dir_all(&garbage).unwrap();
        fs::write(garbage.join("file"), b"").unwrap();
        age(&garbage, 3 * 3600);

        let recorder = Arc::new(RecordingProcessor::default());
        let orchestrator = SpoolFlushOrchestrator::new(
            config,
            ProcessorSet::new(vec![recorder.clone(), Arc::new(FailingProcessor)]),
        )
        .unwrap();

        let report = orchestrator.process_abandoned_files().unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.failures, 2);
        // The _tmp file keeps the directory alive.
        assert_eq!(report.directories, 0);
        assert!(!stale.join("000000000-a.spool").exists());
        assert!(!stale.join("000000001-b.spool").exists());
        assert!(garbage.join("file").exists());

        let paths = recorder.output_paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("42-1000-000000001.json.spool"));
        assert!(paths[1].ends_with("42-1000-000000002.json.spool"));

        // A second sweep finds nothing left to process.
        age(&stale, 3 * 3600);
        let report = orchestrator.process_abandoned_files().unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert!(stale.exists());

        // Once _tmp is empty the directory goes.
        fs::remove_file(stale.join(TMP_DIR_NAME).join("open.spool")).unwrap();
        age(&stale, 3 * 3600);
        let report = orchestrator.process_abandoned_files().unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(report.directories, 1);
        assert!(!stale.exists());

        // Sweeping the cleaned spool root is a no-op.
        let report = orchestrator.process_abandoned_files().unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(recorder.output_paths().len(), 2);
    }

    #[test]
    fn test_recovery_respects_cutoff() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let stale = config.spool_dir.join("Click.json.42-1000");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("000000000-a.spool"), b"").unwrap();
        age(&stale, 60);

        let orchestrator = SpoolFlushOrchestrator::new(config, ProcessorSet::default()).unwrap();
        assert_eq!(orchestrator.cutoff(), Duration::from_secs(7200));
        assert_eq!(orchestrator.process_abandoned_files().unwrap().files, 0);

        orchestrator.set_cutoff(Duration::from_secs(30));
        assert_eq!(orchestrator.process_abandoned_files().unwrap().files, 1);
    }

    #[test]
    fn test_shutdown_flushes_and_closes_each_processor_once() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingProcessor::default());
        let processors = ProcessorSet::new(vec![recorder.clone()])
            .with_event("Special", vec![recorder.clone()]);
        let orchestrator = SpoolFlushOrchestrator::new(test_config(&tmp), processors).unwrap();

        let writer = orchestrator
            .create_writer("Click", SerializationType::Json)
            .unwrap();
        writer.write(&RawEvent::new("Click", json!({}))).unwrap();

        orchestrator.shutdown();
        assert_eq!(recorder.output_paths().len(), 1);
        assert_eq!(orchestrator.local_file_count(), 0);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);

        // A second shutdown is a no-op.
        orchestrator.shutdown();
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }
}
