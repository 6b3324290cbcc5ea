//! Local append-only spool writer.
//!
//! Events are appended to a file under the stream's `_tmp` directory. A
//! commit closes that file and moves it into the spool directory, where it
//! waits until a [`FlushHandler`] accepts it.
//!
//! # File Format
//!
//! ```text
//! [u32 little-endian length][JSON RawEvent]
//! [u32 little-endian length][JSON RawEvent]
//! ...
//! ```
//!
//! Closed files are named `<seq:09>-<unique>.spool`, with a `.gz` suffix when
//! compression is enabled, so directory order is commit order.

use super::directory::SpoolDirectoryManager;
use crate::{Error, Result};
use feedspool_core::{RawEvent, metrics, write_frame};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Durability applied after every write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Leave data in the userspace buffer until commit.
    None,
    /// Flush the userspace buffer to the OS.
    #[default]
    Flush,
    /// Flush and `fdatasync` the file.
    Sync,
}

impl SyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPolicy::None => "none",
            SyncPolicy::Flush => "flush",
            SyncPolicy::Sync => "sync",
        }
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SyncPolicy::None),
            "flush" => Ok(SyncPolicy::Flush),
            "sync" => Ok(SyncPolicy::Sync),
            other => Err(Error::Config(format!("unknown sync policy '{other}'"))),
        }
    }
}

/// Result of handing a closed file to a [`FlushHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The file was fully processed and is deleted by the writer.
    Success,
    /// Processing failed; the file stays for a later attempt.
    Failure,
    /// Flushing is paused; the file was not looked at.
    Skipped,
}

/// Receives closed spool files during a flush.
pub trait FlushHandler: Send + Sync {
    fn handle(&self, file: &Path) -> FlushOutcome;
}

/// Counts of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Processed files that could not be deleted.
    pub undeleted: usize,
}

/// The file currently receiving writes.
struct OpenFile {
    writer: BufWriter<File>,
    path: PathBuf,
    event_count: usize,
    opened_at: Instant,
}

/// Append-only writer for one event stream.
///
/// Thread-safe: writes and commits share one lock, flushes are serialized by
/// a second one so a slow flush never blocks writers.
pub struct DiskSpoolWriter {
    directory: SpoolDirectoryManager,
    sync_policy: SyncPolicy,
    compress: bool,
    handler: Arc<dyn FlushHandler>,
    current: Mutex<Option<OpenFile>>,
    flush_lock: Mutex<()>,
    file_sequence: AtomicU64,
    closed: AtomicBool,
}

impl DiskSpoolWriter {
    /// Create the writer and its directories.
    pub fn new(
        directory: SpoolDirectoryManager,
        sync_policy: SyncPolicy,
        compress: bool,
        handler: Arc<dyn FlushHandler>,
    ) -> Result<Self> {
        directory.create_directories()?;
        let next_sequence = find_next_file_sequence(directory.spool_directory())?;

        info!(
            "Spool writer for {} at {} (sync: {}, compress: {}, next file: {})",
            directory.event_name(),
            directory.spool_directory().display(),
            sync_policy,
            compress,
            next_sequence
        );

        Ok(Self {
            directory,
            sync_policy,
            compress,
            handler,
            current: Mutex::new(None),
            flush_lock: Mutex::new(()),
            file_sequence: AtomicU64::new(next_sequence),
            closed: AtomicBool::new(false),
        })
    }

    pub fn directory(&self) -> &SpoolDirectoryManager {
        &self.directory
    }

    /// Append one event to the open file, opening a new one if needed.
    pub fn write(&self, event: &RawEvent) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Spool(format!(
                "writer for {} is closed",
                self.directory.event_name()
            )));
        }

        let mut current = self.current.lock();
        if current.is_none() {
            *current = Some(self.open_file()?);
        }
        let file = current
            .as_mut()
            .ok_or_else(|| Error::Spool("no open spool file".to_string()))?;

        write_frame(&mut file.writer, event)?;
        match self.sync_policy {
            SyncPolicy::None => {}
            SyncPolicy::Flush => file.writer.flush()?,
            SyncPolicy::Sync => {
                file.writer.flush()?;
                file.writer.get_ref().sync_data()?;
            }
        }
        file.event_count += 1;

        metrics::increment("spool_events_written_total", 1);
        Ok(())
    }

    fn open_file(&self) -> Result<OpenFile> {
        let tmp_dir = self.directory.tmp_directory();
        fs::create_dir_all(&tmp_dir)?;

        let path = tmp_dir.join(format!("{}.spool", Uuid::new_v4().simple()));
        debug!("Opening spool file {}", path.display());

        let file = File::create(&path)?;
        Ok(OpenFile {
            writer: BufWriter::with_capacity(64 * 1024, file),
            path,
            event_count: 0,
            opened_at: Instant::now(),
        })
    }

    /// Events written since the last commit.
    pub fn uncommitted_count(&self) -> usize {
        self.current.lock().as_ref().map_or(0, |f| f.event_count)
    }

    /// Age of the oldest uncommitted write.
    pub fn uncommitted_age(&self) -> Option<Duration> {
        self.current.lock().as_ref().map(|f| f.opened_at.elapsed())
    }

    /// Close the open file and move it into the spool directory.
    ///
    /// Returns the closed file, or `None` when nothing was written.
    pub fn commit(&self) -> Result<Option<PathBuf>> {
        let mut current = self.current.lock();
        let Some(file) = current.take() else {
            return Ok(None);
        };

        let OpenFile {
            mut writer,
            path,
            event_count,
            ..
        } = file;

        writer.flush()?;
        if self.sync_policy == SyncPolicy::Sync {
            writer.get_ref().sync_all()?;
        }
        drop(writer);

        let sequence = self.file_sequence.fetch_add(1, Ordering::SeqCst);
        let name = format!("{:09}-{}.spool", sequence, Uuid::new_v4().simple());
        let spool_dir = self.directory.spool_directory();

        let closed = if self.compress {
            // Compress inside _tmp so a flush never lists a partial file.
            let gz_name = format!("{name}.gz");
            let staged = self.directory.tmp_directory().join(&gz_name);
            if let Err(e) = compress_file(&path, &staged) {
                let _ = fs::remove_file(&staged);
                return Err(e);
            }
            let gz_path = spool_dir.join(gz_name);
            fs::rename(&staged, &gz_path)?;
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove uncompressed spool file: {}", e);
            }
            gz_path
        } else {
            let closed_path = spool_dir.join(name);
            fs::rename(&path, &closed_path)?;
            closed_path
        };

        info!(
            "Committed {} events of {} to {}",
            event_count,
            self.directory.event_name(),
            closed.display()
        );
        metrics::increment("spool_files_committed_total", 1);

        Ok(Some(closed))
    }

    /// Closed files waiting to be flushed, oldest first.
    pub fn closed_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.directory.spool_directory())? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Hand every closed file to the flush handler.
    ///
    /// A file is deleted only when the handler reports success.
    pub fn flush(&self) -> Result<FlushSummary> {
        let _guard = self.flush_lock.lock();
        let mut summary = FlushSummary::default();

        for file in self.closed_files()? {
            match self.handler.handle(&file) {
                FlushOutcome::Success => {
                    if let Err(e) = fs::remove_file(&file) {
                        warn!("Unable to delete flushed file {}: {}", file.display(), e);
                        metrics::increment("spool_delete_failures_total", 1);
                        summary.undeleted += 1;
                    }
                    summary.succeeded += 1;
                }
                FlushOutcome::Failure => {
                    warn!("Flush of {} failed, keeping it for retry", file.display());
                    summary.failed += 1;
                }
                FlushOutcome::Skipped => summary.skipped += 1,
            }
        }

        if summary != FlushSummary::default() {
            debug!(
                "Flushed {}: {} ok, {} failed, {} skipped",
                self.directory.event_name(),
                summary.succeeded,
                summary.failed,
                summary.skipped
            );
        }
        Ok(summary)
    }

    /// Commit, flush once more and reject further writes.
    pub fn close(&self) -> Result<FlushSummary> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(FlushSummary::default());
        }
        self.commit()?;
        self.flush()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for DiskSpoolWriter {
    fn drop(&mut self) {
        // Keep uncommitted data on disk; the recovery sweep picks it up.
        if let Err(e) = self.commit() {
            warn!("Error committing spool file on drop: {}", e);
        }
    }
}

/// Next file sequence after any closed files already in `directory`.
fn find_next_file_sequence(directory: &Path) -> Result<u64> {
    let mut max_seen = None;

    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some((prefix, _)) = name.split_once('-')
            && let Ok(sequence) = prefix.parse::<u64>()
        {
            max_seen = Some(max_seen.map_or(sequence, |m: u64| m.max(sequence)));
        }
    }

    Ok(max_seen.map_or(0, |m| m + 1))
}

/// Compress a file with gzip, returning the compressed size.
pub(crate) fn compress_file(src: &Path, dst: &Path) -> Result<u64> {
    let input = File::open(src)?;
    let mut reader = BufReader::new(input);

    let output = File::create(dst)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());

    let mut buffer = [0u8; 64 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        encoder.write_all(&buffer[..bytes_read])?;
    }

    encoder.finish()?.flush()?;
    Ok(fs::metadata(dst)?.len())
}
