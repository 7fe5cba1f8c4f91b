//! Recording scheduler, indexer and file-monitor collaborators, plus an
//! in-memory properties loader.

use agora_core::jobs::{ChangeListener, FileMonitor, JobError, ScheduledJob, SearchIndexer};
use agora_core::settings::{ConfigError, Properties, PropertiesLoader, parse_properties};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Shared, ordered log of start calls.
///
/// Hand the same log to several collaborators to assert the order bootstrap
/// started them in.
#[derive(Debug, Clone, Default)]
pub struct StartLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl StartLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry`.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    /// Everything recorded so far, in order
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Scheduled job that records its name when started.
#[derive(Debug)]
pub struct RecordingJob {
    name: String,
    log: StartLog,
    failure: Option<JobError>,
}

impl RecordingJob {
    /// Create a job that records `name` into `log`.
    #[must_use]
    pub fn new(name: impl Into<String>, log: StartLog) -> Self {
        Self {
            name: name.into(),
            log,
            failure: None,
        }
    }

    /// Make `start_job` fail with `error` after recording.
    #[must_use]
    pub fn failing(mut self, error: JobError) -> Self {
        self.failure = Some(error);
        self
    }
}

impl ScheduledJob for RecordingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_job(&self) -> Result<(), JobError> {
        self.log.record(self.name.clone());
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Search indexer that records `search_indexer` when started.
#[derive(Debug)]
pub struct RecordingIndexer {
    log: StartLog,
    failure: Option<JobError>,
}

impl RecordingIndexer {
    /// Create an indexer recording into `log`.
    #[must_use]
    pub const fn new(log: StartLog) -> Self {
        Self { log, failure: None }
    }

    /// Make `init` fail with `error` after recording.
    #[must_use]
    pub fn failing(mut self, error: JobError) -> Self {
        self.failure = Some(error);
        self
    }
}

impl SearchIndexer for RecordingIndexer {
    fn init(&self) -> Result<(), JobError> {
        self.log.record("search_indexer");
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// One `watch` registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    /// Watched file
    pub path: PathBuf,
    /// Listener notified on change
    pub listener: ChangeListener,
    /// Polling delay
    pub delay: Duration,
}

/// File monitor that only records what it was asked to watch.
#[derive(Debug, Default)]
pub struct RecordingFileMonitor {
    watches: Mutex<Vec<Watch>>,
}

impl RecordingFileMonitor {
    /// Create a monitor with no watches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every registration so far, in order
    #[must_use]
    pub fn watches(&self) -> Vec<Watch> {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Watched paths, in order
    #[must_use]
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watches().into_iter().map(|w| w.path).collect()
    }
}

impl FileMonitor for RecordingFileMonitor {
    fn watch(&self, path: PathBuf, listener: ChangeListener, delay: Duration) {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Watch {
                path,
                listener,
                delay,
            });
    }
}

/// Properties loader backed by a map of path to file text.
///
/// Loading a path that was never added fails with
/// [`ConfigError::Io`] carrying [`std::io::ErrorKind::NotFound`], the same
/// shape the file-backed loader reports.
///
/// # Example
///
/// ```
/// use agora_core::settings::PropertiesLoader;
/// use agora_testing::InMemoryPropertiesLoader;
/// use std::path::Path;
///
/// let loader = InMemoryPropertiesLoader::new()
///     .with_file("/forum/config/SystemGlobals.properties", "dao.driver = agora.dao.Pg");
///
/// let props = loader.load(Path::new("/forum/config/SystemGlobals.properties")).unwrap();
/// assert_eq!(props["dao.driver"], "agora.dao.Pg");
/// assert!(loader.load(Path::new("/forum/missing.properties")).is_err());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPropertiesLoader {
    files: HashMap<PathBuf, String>,
    loads: Mutex<Vec<PathBuf>>,
}

impl InMemoryPropertiesLoader {
    /// Create a loader with no files.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `text` for `path`.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        self.files.insert(path.into(), text.into());
        self
    }

    /// Paths passed to `load`, in order, including failed ones
    #[must_use]
    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PropertiesLoader for InMemoryPropertiesLoader {
    fn load(&self, path: &Path) -> Result<Properties, ConfigError> {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_path_buf());

        self.files
            .get(path)
            .map(|text| parse_properties(text))
            .ok_or_else(|| ConfigError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}
