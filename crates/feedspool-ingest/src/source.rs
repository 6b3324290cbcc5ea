//! JSONL raw event source.
//!
//! Reads one JSON [`RawEvent`] (`{"name": ..., "payload": {...}}`) per line
//! from a file, a directory of `.jsonl`/`.ndjson` files, or stdin (`-`), and
//! hands each event to a handler, which usually writes it to a spool writer.

use crate::{Error, Result};
use feedspool_core::RawEvent;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration for [`JsonlSource`].
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Input file or directory; `-` reads stdin.
    pub input: PathBuf,

    /// Log and skip malformed lines instead of failing.
    pub continue_on_error: bool,

    /// Progress reporting interval (events).
    pub progress_interval: usize,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("-"),
            continue_on_error: true,
            progress_interval: 100_000,
        }
    }
}

/// Statistics from a source run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub files_processed: usize,
    pub total_events: usize,
    pub valid_events: usize,
    pub parse_errors: usize,
    pub handler_errors: usize,
}

/// JSONL raw event source.
pub struct JsonlSource {
    config: JsonlConfig,
}

impl JsonlSource {
    pub fn new(config: JsonlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    fn reads_stdin(&self) -> bool {
        self.config.input.as_os_str() == "-"
    }

    /// Files to read, in a deterministic order.
    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let input = &self.config.input;

        if input.is_file() {
            return Ok(vec![input.clone()]);
        }
        if !input.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Input path does not exist: {}", input.display()),
            )));
        }

        let mut files: Vec<PathBuf> = fs::read_dir(input)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext == "jsonl" || ext == "ndjson")
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Feed every event to `handler` until the input ends or the handler
    /// returns `Ok(false)`.
    pub fn process<F>(&self, mut handler: F) -> Result<SourceStats>
    where
        F: FnMut(RawEvent) -> Result<bool>,
    {
        let mut stats = SourceStats::default();

        if self.reads_stdin() {
            info!("Reading raw events from stdin");
            self.process_reader(io::stdin().lock(), Path::new("<stdin>"), &mut handler, &mut stats)?;
            stats.files_processed = 1;
            return Ok(stats);
        }

        let files = self.collect_files()?;
        info!("Found {} JSONL files to process", files.len());

        for (idx, path) in files.iter().enumerate() {
            info!("[{}/{}] Processing: {}", idx + 1, files.len(), path.display());
            let reader = BufReader::new(File::open(path)?);

            match self.process_reader(reader, path, &mut handler, &mut stats) {
                Ok(true) => stats.files_processed += 1,
                Ok(false) => {
                    stats.files_processed += 1;
                    break;
                }
                Err(e) => {
                    warn!("Error processing {}: {}", path.display(), e);
                    if !self.config.continue_on_error {
                        return Err(e);
                    }
                }
            }
        }

        Ok(stats)
    }

    fn process_reader<R, F>(
        &self,
        reader: R,
        origin: &Path,
        handler: &mut F,
        stats: &mut SourceStats,
    ) -> Result<bool>
    where
        R: BufRead,
        F: FnMut(RawEvent) -> Result<bool>,
    {
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            stats.total_events += 1;

            let event: RawEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    stats.parse_errors += 1;
                    if !self.config.continue_on_error {
                        return Err(e.into());
                    }
                    warn!("{}:{}: invalid raw event: {}", origin.display(), line_num + 1, e);
                    continue;
                }
            };
            stats.valid_events += 1;

            match handler(event) {
                Ok(true) => {}
                Ok(false) => {
                    info!("Handler signaled stop");
                    return Ok(false);
                }
                Err(e) => {
                    stats.handler_errors += 1;
                    if !self.config.continue_on_error {
                        return Err(e);
                    }
                    warn!("Handler error: {}", e);
                }
            }

            if stats.total_events.is_multiple_of(self.config.progress_interval.max(1)) {
                info!(
                    "Progress: {} events, {} valid, {} invalid",
                    stats.total_events, stats.valid_events, stats.parse_errors
                );
            }
        }

        Ok(true)
    }
}
