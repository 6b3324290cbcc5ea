//! Spool processors: the consumers a closed spool file is handed to.
//!
//! Processors are a fixed capability chosen by name at startup
//! ([`ProcessorKind`]); the orchestrator runs every processor configured for
//! an event in parallel and deletes the file only if all of them succeed.

pub mod archive;
pub mod buffer;
pub mod feed;

pub use archive::ArchiveProcessor;
pub use buffer::{BufferConfig, InsertionBuffer};
pub use feed::FeedEventProcessor;

use crate::{Error, Result};
use feedspool_core::SerializationType;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// A consumer of closed spool files.
pub trait SpoolProcessor: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Process one closed spool file.
    ///
    /// `output_path` is the flush's archival path, relative to whatever
    /// root the processor writes under. Returning `Ok` means the processor
    /// no longer needs the file.
    fn process_event_file(
        &self,
        event_name: &str,
        serialization: SerializationType,
        file: &Path,
        output_path: &str,
    ) -> Result<()>;

    /// Release resources. Called once at shutdown.
    fn close(&self) {}
}

/// Processors available by configuration name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    /// Copy the file into the archive root.
    Archive,
    /// Route feed events to subscribers and persist them.
    FeedEvents,
}

impl ProcessorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::Archive => "archive",
            ProcessorKind::FeedEvents => "feed_events",
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "archive" => Ok(ProcessorKind::Archive),
            "feed_events" | "feed-events" => Ok(ProcessorKind::FeedEvents),
            other => Err(Error::Config(format!("unknown processor '{other}'"))),
        }
    }
}

/// The processors of each event stream.
#[derive(Clone, Default)]
pub struct ProcessorSet {
    default: Vec<Arc<dyn SpoolProcessor>>,
    per_event: HashMap<String, Vec<Arc<dyn SpoolProcessor>>>,
}

impl ProcessorSet {
    /// Processors used for every event without an override.
    pub fn new(default: Vec<Arc<dyn SpoolProcessor>>) -> Self {
        Self {
            default,
            per_event: HashMap::new(),
        }
    }

    /// Override the processors of one event.
    pub fn with_event(
        mut self,
        event_name: impl Into<String>,
        processors: Vec<Arc<dyn SpoolProcessor>>,
    ) -> Self {
        self.per_event.insert(event_name.into(), processors);
        self
    }

    /// Resolve configured processor names against the available instances.
    pub fn from_kinds(
        default: &[ProcessorKind],
        per_event: &HashMap<String, Vec<ProcessorKind>>,
        available: &HashMap<ProcessorKind, Arc<dyn SpoolProcessor>>,
    ) -> Result<Self> {
        let resolve = |kinds: &[ProcessorKind]| -> Result<Vec<Arc<dyn SpoolProcessor>>> {
            kinds
                .iter()
                .map(|kind| {
                    available
                        .get(kind)
                        .cloned()
                        .ok_or_else(|| Error::Config(format!("processor '{kind}' is not available")))
                })
                .collect()
        };

        let mut set = Self::new(resolve(default)?);
        for (event_name, kinds) in per_event {
            set.per_event.insert(event_name.clone(), resolve(kinds)?);
        }
        Ok(set)
    }

    pub fn for_event(&self, event_name: &str) -> &[Arc<dyn SpoolProcessor>] {
        self.per_event
            .get(event_name)
            .map(Vec::as_slice)
            .unwrap_or(&self.default)
    }

    /// Every processor instance exactly once.
    pub fn distinct(&self) -> Vec<Arc<dyn SpoolProcessor>> {
        let mut distinct: Vec<Arc<dyn SpoolProcessor>> = Vec::new();
        for processor in self.default.iter().chain(self.per_event.values().flatten()) {
            if !distinct.iter().any(|p| Arc::ptr_eq(p, processor)) {
                distinct.push(processor.clone());
            }
        }
        distinct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl SpoolProcessor for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn process_event_file(
            &self,
            _: &str,
            _: SerializationType,
            _: &Path,
            _: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("archive".parse::<ProcessorKind>().unwrap(), ProcessorKind::Archive);
        assert_eq!(
            " Feed_Events ".parse::<ProcessorKind>().unwrap(),
            ProcessorKind::FeedEvents
        );
        assert!("hdfs".parse::<ProcessorKind>().is_err());
        assert_eq!(ProcessorKind::FeedEvents.to_string(), "feed_events");
    }

    #[test]
    fn test_per_event_override() {
        let archive: Arc<dyn SpoolProcessor> = Arc::new(Named("archive"));
        let feed: Arc<dyn SpoolProcessor> = Arc::new(Named("feed"));

        let set = ProcessorSet::new(vec![archive.clone(), feed.clone()])
            .with_event("Click", vec![archive.clone()]);

        assert_eq!(set.for_event("FeedEvent").len(), 2);
        assert_eq!(set.for_event("Click").len(), 1);
        assert_eq!(set.distinct().len(), 2);
    }

    #[test]
    fn test_from_kinds_requires_available_processor() {
        let mut available: HashMap<ProcessorKind, Arc<dyn SpoolProcessor>> = HashMap::new();
        available.insert(ProcessorKind::Archive, Arc::new(Named("archive")));

        let ok = ProcessorSet::from_kinds(&[ProcessorKind::Archive], &HashMap::new(), &available);
        assert!(ok.is_ok());

        let missing = ProcessorSet::from_kinds(
            &[ProcessorKind::Archive, ProcessorKind::FeedEvents],
            &HashMap::new(),
            &available,
        );
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
