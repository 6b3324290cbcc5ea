//! Archive processor: copies closed spool files into a long-term directory
//! tree at the flush's output path.

use super::SpoolProcessor;
use crate::spool::writer::compress_file;
use crate::{Error, Result};
use feedspool_core::SerializationType;
use feedspool_core::codec::is_compressed;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Copies spool files under `root`, optionally gzip-compressing them.
pub struct ArchiveProcessor {
    root: PathBuf,
    compress: bool,
}

impl ArchiveProcessor {
    pub fn new(root: impl Into<PathBuf>, compress: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(
            "Archiving spool files to {} (compress: {})",
            root.display(),
            compress
        );
        Ok(Self { root, compress })
    }

    /// Final location of a file archived at `output_path`.
    pub fn destination(&self, file: &Path, output_path: &str) -> PathBuf {
        let mut destination = self.root.join(output_path);
        if self.compress || is_compressed(file) {
            let mut name = destination.into_os_string();
            name.push(".gz");
            destination = PathBuf::from(name);
        }
        destination
    }
}

impl SpoolProcessor for ArchiveProcessor {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn process_event_file(
        &self,
        event_name: &str,
        _serialization: SerializationType,
        file: &Path,
        output_path: &str,
    ) -> Result<()> {
        let destination = self.destination(file, output_path);
        let parent = destination.parent().ok_or_else(|| Error::Processor {
            processor: "archive",
            reason: format!("no parent directory for {}", destination.display()),
        })?;
        fs::create_dir_all(parent)?;

        // Write next to the destination and rename, so readers never see a
        // partial archive file.
        let mut partial = destination.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        if self.compress && !is_compressed(file) {
            compress_file(file, &partial)?;
        } else {
            fs::copy(file, &partial)?;
        }
        fs::rename(&partial, &destination)?;

        debug!(
            "Archived {} file {} to {}",
            event_name,
            file.display(),
            destination.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedspool_core::{RawEvent, open_spool_file, write_frame};
    use serde_json::json;
    use tempfile::TempDir;

    fn spool_file(dir: &Path) -> PathBuf {
        let path = dir.join("000000000-a.spool");
        let mut file = fs::File::create(&path).unwrap();
        write_frame(&mut file, &RawEvent::new("Click", json!({ "x": 1 }))).unwrap();
        path
    }

    #[test]
    fn test_copies_to_output_path() {
        let tmp = TempDir::new().unwrap();
        let source = spool_file(tmp.path());
        let archive = ArchiveProcessor::new(tmp.path().join("archive"), false).unwrap();

        archive
            .process_event_file(
                "Click",
                SerializationType::Json,
                &source,
                "Click/2024/01/02/03/1-1-000000000.json.spool",
            )
            .unwrap();

        let archived = tmp
            .path()
            .join("archive/Click/2024/01/02/03/1-1-000000000.json.spool");
        assert_eq!(fs::read(&archived).unwrap(), fs::read(&source).unwrap());
        assert!(source.exists());
    }

    #[test]
    fn test_compresses_when_configured() {
        let tmp = TempDir::new().unwrap();
        let source = spool_file(tmp.path());
        let archive = ArchiveProcessor::new(tmp.path().join("archive"), true).unwrap();

        archive
            .process_event_file("Click", SerializationType::Json, &source, "Click/out.json.spool")
            .unwrap();

        let archived = tmp.path().join("archive/Click/out.json.spool.gz");
        let events: Vec<_> = open_spool_file(&archived).unwrap().flatten().collect();
        assert_eq!(events.len(), 1);
        assert!(!tmp.path().join("archive/Click/out.json.spool.gz.partial").exists());
    }
}
