//! Local spool directory layout.
//!
//! ```text
//! <spool_dir>/
//!   <event>.<serialization>.<instance>/     one directory per writer
//!     _tmp/                                 file being written (never flushed)
//!     000000003-<uuid>.spool                closed files awaiting flush
//! ```
//!
//! Directories of a previous process keep their instance token, so after a
//! restart they are only reachable through the abandoned-file sweep.

use crate::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use feedspool_core::SerializationType;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Name of the subdirectory holding files that are still being written.
pub const TMP_DIR_NAME: &str = "_tmp";

/// Filesystem layout for one event stream.
#[derive(Debug, Clone)]
pub struct SpoolDirectoryManager {
    event_name: String,
    serialization: SerializationType,
    instance: String,
    directory: PathBuf,
}

impl SpoolDirectoryManager {
    /// Layout for a new writer of `event_name` under `spool_root`.
    pub fn new(
        spool_root: &Path,
        event_name: &str,
        serialization: SerializationType,
        instance: &str,
    ) -> Result<Self> {
        validate_event_name(event_name)?;
        let directory =
            spool_root.join(format!("{}.{}.{}", event_name, serialization.as_str(), instance));

        Ok(Self {
            event_name: event_name.to_string(),
            serialization,
            instance: instance.to_string(),
            directory,
        })
    }

    /// Reconstruct the layout of an existing spool directory from its name.
    pub fn from_directory(directory: &Path) -> Result<Self> {
        let invalid = || Error::InvalidLocalDirectory(directory.to_path_buf());

        let name = directory
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(invalid)?;

        let mut parts = name.splitn(3, '.');
        let (Some(event_name), Some(serialization), Some(instance)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if instance.is_empty() || validate_event_name(event_name).is_err() {
            return Err(invalid());
        }
        let serialization: SerializationType = serialization.parse().map_err(|_| invalid())?;

        Ok(Self {
            event_name: event_name.to_string(),
            serialization,
            instance: instance.to_string(),
            directory: directory.to_path_buf(),
        })
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn serialization(&self) -> SerializationType {
        self.serialization
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Directory holding closed spool files.
    pub fn spool_directory(&self) -> &Path {
        &self.directory
    }

    /// Directory holding the file currently being written.
    pub fn tmp_directory(&self) -> PathBuf {
        self.directory.join(TMP_DIR_NAME)
    }

    /// Create the spool and temp directories.
    pub fn create_directories(&self) -> Result<()> {
        fs::create_dir_all(self.tmp_directory())?;
        Ok(())
    }

    /// Archival output path of the given flush, relative to a processor root.
    pub fn archive_path(&self, flush_sequence: u64) -> String {
        self.archive_path_at(flush_sequence, Utc::now())
    }

    /// Archival output path of the given flush at a fixed time.
    ///
    /// Format: `<event>/<yyyy>/<mm>/<dd>/<hh>/<instance>-<seq:09>.<ext>`
    pub fn archive_path_at(&self, flush_sequence: u64, at: DateTime<Utc>) -> String {
        format!(
            "{}/{:04}/{:02}/{:02}/{:02}/{}-{:09}.{}",
            self.event_name,
            at.year(),
            at.month(),
            at.day(),
            at.hour(),
            self.instance,
            flush_sequence,
            self.serialization.extension()
        )
    }
}

/// Reject event names that would break the directory naming scheme.
pub fn validate_event_name(event_name: &str) -> Result<()> {
    let valid = !event_name.is_empty()
        && !event_name.starts_with('_')
        && !event_name.contains(['.', '/', '\\']);

    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid event name '{event_name}'")))
    }
}

/// Spool directories last modified more than `cutoff` ago.
///
/// Temp directories are never candidates. A missing root yields nothing.
pub fn find_old_spool_directories(spool_root: &Path, cutoff: Duration) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(spool_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let threshold = SystemTime::now()
        .checked_sub(cutoff)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut old = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() || entry.file_name() == TMP_DIR_NAME {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        if modified < threshold {
            old.push(path);
        }
    }

    old.sort();
    debug!(
        "Found {} spool directories older than {:?} under {}",
        old.len(),
        cutoff,
        spool_root.display()
    );
    Ok(old)
}

/// Closed files below `directory`, skipping every temp directory.
///
/// Files are returned in path order, which is write order within a directory.
pub fn find_files_in_spool_directory(directory: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_files(directory, &mut files);
    files.sort();
    files
}

fn collect_files(directory: &Path, files: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!("Unable to list {}: {}", directory.display(), e);
            }
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if entry.file_name() != TMP_DIR_NAME {
                collect_files(&path, files);
            }
        } else if path.is_file() {
            files.push(path);
        }
    }
}

/// Delete directories that are empty (ignoring an empty temp directory).
///
/// Directories that still hold files, or that are already gone, are left
/// alone. Returns the number of directories removed.
pub fn cleanup_old_spool_directories(directories: &[PathBuf]) -> usize {
    let mut removed = 0;

    for directory in directories {
        let tmp = directory.join(TMP_DIR_NAME);
        if tmp.is_dir() && is_empty_dir(&tmp) {
            if let Err(e) = fs::remove_dir(&tmp) {
                warn!("Unable to remove {}: {}", tmp.display(), e);
                continue;
            }
        }

        if !directory.is_dir() {
            continue;
        }

        if !is_empty_dir(directory) {
            debug!("Keeping non-empty spool directory {}", directory.display());
            continue;
        }

        match fs::remove_dir(directory) {
            Ok(()) => {
                info!("Removed empty spool directory {}", directory.display());
                removed += 1;
            }
            Err(e) => warn!("Unable to remove {}: {}", directory.display(), e),
        }
    }

    removed
}

fn is_empty_dir(directory: &Path) -> bool {
    fs::read_dir(directory)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn age_directory(path: &Path, age: Duration) {
        let file = fs::File::open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_layout() {
        let manager = SpoolDirectoryManager::new(
            Path::new("/spool"),
            "FeedEvent",
            SerializationType::Json,
            "123-456",
        )
        .unwrap();

        assert_eq!(
            manager.spool_directory(),
            Path::new("/spool/FeedEvent.json.123-456")
        );
        assert_eq!(
            manager.tmp_directory(),
            PathBuf::from("/spool/FeedEvent.json.123-456/_tmp")
        );
    }

    #[test]
    fn test_archive_path_is_deterministic() {
        let manager = SpoolDirectoryManager::new(
            Path::new("/spool"),
            "FeedEvent",
            SerializationType::Json,
            "123-456",
        )
        .unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();

        assert_eq!(
            manager.archive_path_at(3, at),
            "FeedEvent/2024/05/06/07/123-456-000000003.json.spool"
        );
        assert_ne!(manager.archive_path_at(3, at), manager.archive_path_at(4, at));
    }

    #[test]
    fn test_from_directory_round_trip() {
        let manager = SpoolDirectoryManager::from_directory(Path::new(
            "/spool/Click.json.99-1700000000000",
        ))
        .unwrap();

        assert_eq!(manager.event_name(), "Click");
        assert_eq!(manager.serialization(), SerializationType::Json);
        assert_eq!(manager.instance(), "99-1700000000000");
    }

    #[test]
    fn test_from_directory_rejects_invalid_names() {
        for name in ["garbage", "Click.json", "Click.smile.1", "_tmp.json.1", "Click.json."] {
            let result = SpoolDirectoryManager::from_directory(&Path::new("/spool").join(name));
            assert!(
                matches!(result, Err(Error::InvalidLocalDirectory(_))),
                "{name} should be invalid"
            );
        }
    }

    #[test]
    fn test_invalid_event_names() {
        assert!(validate_event_name("FeedEvent").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name("a.b").is_err());
        assert!(validate_event_name("_tmp").is_err());
        assert!(validate_event_name("a/b").is_err());
    }

    #[test]
    fn test_find_old_spool_directories() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("Old.json.1");
        let fresh = tmp.path().join("Fresh.json.2");
        let stray_tmp = tmp.path().join(TMP_DIR_NAME);
        fs::create_dir_all(&old).unwrap();
        fs::create_dir_all(&fresh).unwrap();
        fs::create_dir_all(&stray_tmp).unwrap();
        fs::write(tmp.path().join("file.txt"), b"x").unwrap();

        age_directory(&old, Duration::from_secs(3 * 3600));
        age_directory(&stray_tmp, Duration::from_secs(3 * 3600));

        let found = find_old_spool_directories(tmp.path(), Duration::from_secs(7200)).unwrap();
        assert_eq!(found, vec![old]);
    }

    #[test]
    fn test_find_old_spool_directories_missing_root() {
        let tmp = TempDir::new().unwrap();
        let found =
            find_old_spool_directories(&tmp.path().join("missing"), Duration::ZERO).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_find_files_skips_tmp() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("Click.json.1");
        fs::create_dir_all(dir.join(TMP_DIR_NAME)).unwrap();
        fs::write(dir.join("000000001-a.spool"), b"x").unwrap();
        fs::write(dir.join("000000000-b.spool"), b"x").unwrap();
        fs::write(dir.join(TMP_DIR_NAME).join("open.spool"), b"x").unwrap();

        let files = find_files_in_spool_directory(tmp.path());
        assert_eq!(
            files,
            vec![dir.join("000000000-b.spool"), dir.join("000000001-a.spool")]
        );
    }

    #[test]
    fn test_cleanup_removes_only_empty_directories() {
        let tmp = TempDir::new().unwrap();
        let empty = tmp.path().join("Empty.json.1");
        let busy = tmp.path().join("Busy.json.1");
        fs::create_dir_all(empty.join(TMP_DIR_NAME)).unwrap();
        fs::create_dir_all(&busy).unwrap();
        fs::write(busy.join("000000000-a.spool"), b"x").unwrap();

        let dirs = vec![empty.clone(), busy.clone()];
        assert_eq!(cleanup_old_spool_directories(&dirs), 1);
        assert!(!empty.exists());
        assert!(busy.exists());

        // Second pass is a no-op.
        assert_eq!(cleanup_old_spool_directories(&dirs), 0);
    }
}
