//! Local spooling: directory layout, writers, parallel processing and the
//! flush orchestrator.

pub mod directory;
pub mod orchestrator;
pub mod pool;
pub mod threshold;
pub mod writer;

pub use directory::SpoolDirectoryManager;
pub use orchestrator::{RecoveryReport, SpoolFlushOrchestrator};
pub use pool::{ProcessorPool, ProcessorTask};
pub use threshold::{CommitThresholds, ThresholdWriter};
pub use writer::{DiskSpoolWriter, FlushHandler, FlushOutcome, FlushSummary, SyncPolicy};
