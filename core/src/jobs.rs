//! Scheduler, indexer and file-monitor collaborators.
//!
//! Bootstrap only starts these; their timing and indexing internals belong to
//! the collaborators themselves.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by scheduler and indexer collaborators.
///
/// Bootstrap propagates these as they are, without wrapping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The scheduler refused or failed to schedule a job.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// The search indexer failed to start.
    #[error("Search indexer error: {0}")]
    Indexer(String),
}

/// The full-text search indexer.
pub trait SearchIndexer: Send + Sync {
    /// Start the indexer.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Indexer`] if the index cannot be opened.
    fn init(&self) -> Result<(), JobError>;
}

/// A recurring background job (post summaries, mail integration).
pub trait ScheduledJob: Send + Sync {
    /// Job name used in logs
    fn name(&self) -> &str;

    /// Hand the job to the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Scheduler`] if the job cannot be scheduled.
    fn start_job(&self) -> Result<(), JobError>;
}

/// What to do when a watched file changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeListener {
    /// Reload SQL query definitions
    Queries,
    /// Reload settings
    Settings,
}

/// Polls files and notifies listeners when they change.
pub trait FileMonitor: Send + Sync {
    /// Watch `path`, checking every `delay`.
    fn watch(&self, path: PathBuf, listener: ChangeListener, delay: Duration);
}
