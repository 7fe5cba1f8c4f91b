//! Subsystem bootstrap.
//!
//! Reads class names from [`Settings`], resolves them through the
//! [`PluginRegistry`] and installs the resulting instances into [`Subsystems`].
//! One operation per subsystem:
//!
//! 1. **Persistence driver** (`dao.driver`): fatal on failure
//! 2. **Cache engine** (`cache.engine.implementation`) and its cacheables
//!    (`cacheable.objects`)
//! 3. **Login authenticator** (`login.authenticator`)
//! 4. **Search indexer**, **summary job**, **mail integration job**: delegated
//!    to collaborators, their errors pass through unwrapped
//!
//! Every plugin failure is reported in one envelope naming the subsystem, the
//! configured class name and the cause, so operators can grep a single log
//! pattern regardless of which plugin misbehaved:
//!
//! ```text
//! failed to start persistence driver (com.example.MySQLDriver): Class com.example.MySQLDriver is not assignable to PersistenceDriver
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let bootstrapper = Bootstrapper::new(settings, Arc::new(registry), subsystems.clone())
//!     .with_collaborators(
//!         Collaborators::new()
//!             .with_search_indexer(indexer)
//!             .with_summary_job(summary_job),
//!     );
//!
//! bootstrapper.start_all()?;
//! ```

use crate::metrics::BootstrapMetrics;
use crate::subsystems::Subsystems;
use agora_core::capability::{
    CacheEngine, CacheError, Cacheable, LoginAuthenticator, PersistenceDriver,
};
use agora_core::jobs::{JobError, ScheduledJob, SearchIndexer};
use agora_core::plugin::{PluginError, PluginRegistry};
use agora_core::settings::{Settings, keys};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Placeholder class name used when the configuration key is unset.
const UNSET: &str = "<unset>";

/// A subsystem started from a configured class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// The data-access driver
    PersistenceDriver,
    /// The cache engine and its cacheables
    CacheEngine,
    /// The login authenticator
    LoginAuthenticator,
}

impl Subsystem {
    /// Name used in error messages and metric labels
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PersistenceDriver => "persistence driver",
            Self::CacheEngine => "cache engine",
            Self::LoginAuthenticator => "login authenticator",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a subsystem could not start.
#[derive(Error, Debug)]
pub enum StartupCause {
    /// The class-name key is not configured.
    #[error("configuration key {0} is not set")]
    MissingKey(&'static str),

    /// The class name could not be resolved or instantiated.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// The cache engine's `init` failed.
    #[error("cache engine init failed: {0}")]
    CacheInit(#[from] CacheError),
}

/// A fatal subsystem start-up failure.
#[derive(Error, Debug)]
#[error("failed to start {subsystem} ({class_name}): {source}")]
pub struct BootstrapError {
    /// The subsystem that was starting
    pub subsystem: Subsystem,
    /// The configured class name
    pub class_name: String,
    /// The underlying failure
    pub source: StartupCause,
}

/// The cache bootstrap failed; no cache engine was installed.
#[derive(Error, Debug)]
#[error("failed to start cache engine ({class_name}): {source}")]
pub struct CacheEngineStartupError {
    /// The engine or cacheable class name that failed
    pub class_name: String,
    /// The underlying failure
    pub source: StartupCause,
}

/// Any failure of [`Bootstrapper::start_all`].
#[derive(Error, Debug)]
pub enum StartupError {
    /// Persistence driver or login authenticator failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// Cache bootstrap failed.
    #[error(transparent)]
    CacheEngine(#[from] CacheEngineStartupError),

    /// A scheduler or indexer collaborator failed.
    #[error(transparent)]
    Job(#[from] JobError),
}

/// External collaborators started after the plugins.
///
/// Each one is optional; an absent collaborator is skipped.
#[derive(Clone, Default)]
pub struct Collaborators {
    search_indexer: Option<Arc<dyn SearchIndexer>>,
    summary_job: Option<Arc<dyn ScheduledJob>>,
    mail_integration_job: Option<Arc<dyn ScheduledJob>>,
}

impl Collaborators {
    /// No collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the search indexer.
    #[must_use]
    pub fn with_search_indexer(mut self, indexer: Arc<dyn SearchIndexer>) -> Self {
        self.search_indexer = Some(indexer);
        self
    }

    /// Set the post summary job.
    #[must_use]
    pub fn with_summary_job(mut self, job: Arc<dyn ScheduledJob>) -> Self {
        self.summary_job = Some(job);
        self
    }

    /// Set the mail integration job.
    #[must_use]
    pub fn with_mail_integration_job(mut self, job: Arc<dyn ScheduledJob>) -> Self {
        self.mail_integration_job = Some(job);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("search_indexer", &self.search_indexer.is_some())
            .field("summary_job", &self.summary_job.as_ref().map(|j| j.name()))
            .field(
                "mail_integration_job",
                &self.mail_integration_job.as_ref().map(|j| j.name()),
            )
            .finish()
    }
}

/// Starts every subsystem from configuration.
///
/// There is no guard against starting a subsystem twice; each call resolves a
/// fresh instance and replaces the active one.
#[derive(Debug)]
pub struct Bootstrapper {
    settings: Arc<Settings>,
    plugins: Arc<PluginRegistry>,
    subsystems: Arc<Subsystems>,
    collaborators: Collaborators,
}

impl Bootstrapper {
    /// Create a bootstrapper with no collaborators.
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        plugins: Arc<PluginRegistry>,
        subsystems: Arc<Subsystems>,
    ) -> Self {
        Self {
            settings,
            plugins,
            subsystems,
            collaborators: Collaborators::default(),
        }
    }

    /// Set the scheduler and indexer collaborators.
    #[must_use]
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// The registry instances are installed into
    #[must_use]
    pub const fn subsystems(&self) -> &Arc<Subsystems> {
        &self.subsystems
    }

    /// Resolve and install the persistence driver named by `dao.driver`.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the key is unset or the class cannot be
    /// resolved as a persistence driver. Start-up cannot proceed without one.
    pub fn start_persistence_driver(&self) -> Result<Arc<dyn PersistenceDriver>, BootstrapError> {
        let subsystem = Subsystem::PersistenceDriver;
        let class_name = self.class_name(subsystem, keys::DAO_DRIVER)?;

        let driver = self
            .plugins
            .resolve::<dyn PersistenceDriver>(&class_name)
            .map_err(|e| bootstrap_failure(subsystem, &class_name, e.into()))?;

        tracing::info!(class_name = %class_name, driver = driver.name(), "Loaded persistence driver");
        self.subsystems.install_persistence_driver(Arc::clone(&driver));

        Ok(driver)
    }

    /// Resolve, initialise and install the cache engine, then hand it to every
    /// configured cacheable.
    ///
    /// An empty or absent `cacheable.objects` list is logged and otherwise
    /// ignored. Returns how many cacheables received the engine.
    ///
    /// The engine is installed as soon as its `init` succeeds. If a cacheable
    /// then fails, the remaining ones are abandoned and the engine stays
    /// installed, so [`stop_cache_engine`](Self::stop_cache_engine) still
    /// reaches it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheEngineStartupError`] if the engine or any cacheable cannot
    /// be resolved, or if the engine's `init` fails.
    pub fn start_cache_engine(&self) -> Result<usize, CacheEngineStartupError> {
        let class_name = self
            .settings
            .require(keys::CACHE_IMPLEMENTATION)
            .map_err(|_| {
                cache_failure(UNSET, StartupCause::MissingKey(keys::CACHE_IMPLEMENTATION))
            })?;
        let class_name = class_name.trim();

        let engine = self
            .plugins
            .resolve::<dyn CacheEngine>(class_name)
            .map_err(|e| cache_failure(class_name, e.into()))?;

        tracing::info!(class_name, "Using cache engine");
        engine
            .init()
            .map_err(|e| cache_failure(class_name, e.into()))?;

        if self.subsystems.install_cache_engine(Arc::clone(&engine)).is_some() {
            tracing::warn!("Replaced an already active cache engine without stopping it");
        }

        self.register_cacheables(&engine)
    }

    fn register_cacheables(
        &self,
        engine: &Arc<dyn CacheEngine>,
    ) -> Result<usize, CacheEngineStartupError> {
        let configured = self.settings.get(keys::CACHEABLE_OBJECTS).unwrap_or_default();
        let class_names: Vec<&str> = configured
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();

        if class_names.is_empty() {
            tracing::warn!(
                key = keys::CACHEABLE_OBJECTS,
                "No cacheable objects configured, the cache engine starts with nothing registered"
            );
            return Ok(0);
        }

        for class_name in &class_names {
            let cacheable = self
                .plugins
                .resolve::<dyn Cacheable>(class_name)
                .map_err(|e| cache_failure(class_name, e.into()))?;

            tracing::debug!(class_name, "Registering cacheable");
            cacheable.set_cache_engine(Arc::clone(engine));
        }

        tracing::info!(count = class_names.len(), "Registered cacheable objects");
        Ok(class_names.len())
    }

    /// Stop the active cache engine, if any. Never fails.
    pub fn stop_cache_engine(&self) {
        match self.subsystems.take_cache_engine() {
            Some(engine) => {
                engine.stop();
                tracing::info!("Cache engine stopped");
            }
            None => tracing::debug!("No active cache engine to stop"),
        }
    }

    /// Resolve and install the login authenticator named by `login.authenticator`.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the key is unset or the class cannot be
    /// resolved as a login authenticator.
    pub fn start_login_authenticator(
        &self,
    ) -> Result<Arc<dyn LoginAuthenticator>, BootstrapError> {
        let subsystem = Subsystem::LoginAuthenticator;
        let class_name = self.class_name(subsystem, keys::LOGIN_AUTHENTICATOR)?;

        let authenticator = self
            .plugins
            .resolve::<dyn LoginAuthenticator>(&class_name)
            .map_err(|e| bootstrap_failure(subsystem, &class_name, e.into()))?;

        tracing::info!(class_name = %class_name, "Loaded login authenticator");
        self.subsystems
            .install_login_authenticator(Arc::clone(&authenticator));

        Ok(authenticator)
    }

    /// Start the search indexer collaborator.
    ///
    /// # Errors
    ///
    /// Returns the indexer's own [`JobError`].
    pub fn start_search_indexer(&self) -> Result<(), JobError> {
        match &self.collaborators.search_indexer {
            Some(indexer) => {
                indexer.init()?;
                tracing::info!("Search indexer started");
                Ok(())
            }
            None => {
                tracing::debug!("No search indexer configured, skipping");
                Ok(())
            }
        }
    }

    /// Schedule the post summary job.
    ///
    /// # Errors
    ///
    /// Returns the scheduler's own [`JobError`].
    pub fn start_summary_job(&self) -> Result<(), JobError> {
        start_job(self.collaborators.summary_job.as_deref(), "summary")
    }

    /// Schedule the mail integration job.
    ///
    /// # Errors
    ///
    /// Returns the scheduler's own [`JobError`].
    pub fn start_mail_integration_job(&self) -> Result<(), JobError> {
        start_job(
            self.collaborators.mail_integration_job.as_deref(),
            "mail integration",
        )
    }

    /// Start everything in order: persistence driver, cache engine, login
    /// authenticator, search indexer, summary job, mail integration job.
    ///
    /// Stops at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`StartupError`].
    pub fn start_all(&self) -> Result<(), StartupError> {
        self.start_persistence_driver()?;
        self.start_cache_engine()?;
        self.start_login_authenticator()?;
        self.start_search_indexer()?;
        self.start_summary_job()?;
        self.start_mail_integration_job()?;

        tracing::info!("All subsystems started");
        Ok(())
    }

    fn class_name(&self, subsystem: Subsystem, key: &'static str) -> Result<String, BootstrapError> {
        self.settings
            .require(key)
            .map(|name| name.trim().to_string())
            .map_err(|_| bootstrap_failure(subsystem, UNSET, StartupCause::MissingKey(key)))
    }
}

fn start_job(job: Option<&dyn ScheduledJob>, kind: &str) -> Result<(), JobError> {
    match job {
        Some(job) => {
            job.start_job()?;
            tracing::info!(job = job.name(), "Scheduled {kind} job");
            Ok(())
        }
        None => {
            tracing::debug!("No {kind} job configured, skipping");
            Ok(())
        }
    }
}

fn bootstrap_failure(subsystem: Subsystem, class_name: &str, source: StartupCause) -> BootstrapError {
    let error = BootstrapError {
        subsystem,
        class_name: class_name.to_string(),
        source,
    };
    tracing::error!(subsystem = %subsystem, class_name, error = %error, "Subsystem failed to start");
    BootstrapMetrics::record_failure(subsystem.as_str());
    error
}

fn cache_failure(class_name: &str, source: StartupCause) -> CacheEngineStartupError {
    let error = CacheEngineStartupError {
        class_name: class_name.to_string(),
        source,
    };
    tracing::error!(class_name, error = %error, "Cache engine failed to start");
    BootstrapMetrics::record_failure(Subsystem::CacheEngine.as_str());
    error
}
