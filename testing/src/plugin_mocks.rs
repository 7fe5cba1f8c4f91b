//! Mock plugins for every capability the bootstrap sequence resolves.
//!
//! [`MockPlugins`] owns one shared instance per capability and registers
//! factories that hand out clones of those instances, so a test can resolve a
//! plugin through the registry and still inspect the very object bootstrap
//! received.

use crate::collaborator_mocks::StartLog;
use agora_core::capability::{
    AuthenticatedUser, CacheEngine, CacheError, Cacheable, LoginAuthenticator, PersistenceDriver,
};
use agora_core::plugin::PluginRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Class name of the working [`MockCacheEngine`]
pub const CACHE_ENGINE: &str = "agora.testing.MockCacheEngine";

/// Class name of a [`MockCacheEngine`] whose `init` fails
pub const FAILING_CACHE_ENGINE: &str = "agora.testing.FailingCacheEngine";

/// Class name of the first [`RecordingCacheable`]
pub const FIRST_CACHEABLE: &str = "agora.testing.ForumRepository";

/// Class name of the second [`RecordingCacheable`]
pub const SECOND_CACHEABLE: &str = "agora.testing.SessionRepository";

/// Class name of [`MockPersistenceDriver`]
pub const PERSISTENCE_DRIVER: &str = "agora.testing.MockPersistenceDriver";

/// Class name of [`MockLoginAuthenticator`]
pub const LOGIN_AUTHENTICATOR: &str = "agora.testing.MockLoginAuthenticator";

/// Cache engine that counts `init` and `stop` calls.
#[derive(Debug, Default)]
pub struct MockCacheEngine {
    inits: AtomicUsize,
    stops: AtomicUsize,
    failure: Option<CacheError>,
    log: Option<StartLog>,
}

impl MockCacheEngine {
    /// Create an engine that starts successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine whose `init` returns `error`.
    #[must_use]
    pub fn failing(error: CacheError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Record `init` into `log` as `cache_engine`.
    #[must_use]
    pub fn with_log(mut self, log: StartLog) -> Self {
        self.log = Some(log);
        self
    }

    /// `init` calls so far
    #[must_use]
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    /// `stop` calls so far
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl CacheEngine for MockCacheEngine {
    fn init(&self) -> Result<(), CacheError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.record("cache_engine");
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cacheable that remembers the engine it was given.
#[derive(Default)]
pub struct RecordingCacheable {
    engine: Mutex<Option<Arc<dyn CacheEngine>>>,
}

impl RecordingCacheable {
    /// Create a cacheable with no engine yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `set_cache_engine` has been called
    #[must_use]
    pub fn has_engine(&self) -> bool {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The engine handed over, if any
    #[must_use]
    pub fn engine(&self) -> Option<Arc<dyn CacheEngine>> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Cacheable for RecordingCacheable {
    fn set_cache_engine(&self, engine: Arc<dyn CacheEngine>) {
        *self.engine.lock().unwrap_or_else(PoisonError::into_inner) = Some(engine);
    }
}

impl std::fmt::Debug for RecordingCacheable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingCacheable")
            .field("has_engine", &self.has_engine())
            .finish()
    }
}

/// Persistence driver with a fixed name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPersistenceDriver {
    name: String,
}

impl MockPersistenceDriver {
    /// Create a driver reporting `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for MockPersistenceDriver {
    fn default() -> Self {
        Self::new("mock")
    }
}

impl PersistenceDriver for MockPersistenceDriver {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Authenticator that accepts a single username/password pair.
#[derive(Debug, Clone)]
pub struct MockLoginAuthenticator {
    username: String,
    password: String,
    user_id: i64,
}

impl MockLoginAuthenticator {
    /// Accept `username`/`password` as user `user_id`.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>, user_id: i64) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            user_id,
        }
    }
}

impl Default for MockLoginAuthenticator {
    fn default() -> Self {
        Self::new("admin", "admin", 2)
    }
}

impl LoginAuthenticator for MockLoginAuthenticator {
    fn validate_login(&self, username: &str, password: &str) -> Option<AuthenticatedUser> {
        (username == self.username && password == self.password).then(|| AuthenticatedUser {
            user_id: self.user_id,
            username: self.username.clone(),
        })
    }
}

/// Shared instances behind the mock class names.
///
/// # Example
///
/// ```
/// use agora_core::capability::CacheEngine;
/// use agora_core::plugin::PluginRegistry;
/// use agora_testing::plugin_mocks;
///
/// let mut registry = PluginRegistry::new();
/// let mocks = plugin_mocks::register_mock_plugins(&mut registry);
///
/// let engine = registry.resolve::<dyn CacheEngine>(plugin_mocks::CACHE_ENGINE).unwrap();
/// engine.init().unwrap();
/// assert_eq!(mocks.cache_engine.init_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MockPlugins {
    /// Behind [`CACHE_ENGINE`]
    pub cache_engine: Arc<MockCacheEngine>,
    /// Behind [`FAILING_CACHE_ENGINE`]
    pub failing_cache_engine: Arc<MockCacheEngine>,
    /// Behind [`FIRST_CACHEABLE`]
    pub first_cacheable: Arc<RecordingCacheable>,
    /// Behind [`SECOND_CACHEABLE`]
    pub second_cacheable: Arc<RecordingCacheable>,
    /// Behind [`PERSISTENCE_DRIVER`]
    pub persistence_driver: Arc<MockPersistenceDriver>,
    /// Behind [`LOGIN_AUTHENTICATOR`]
    pub login_authenticator: Arc<MockLoginAuthenticator>,
    log: Option<StartLog>,
}

impl MockPlugins {
    /// Fresh instances.
    #[must_use]
    pub fn new() -> Self {
        Self::with_log(None)
    }

    /// Fresh instances recording into `log`: the working cache engine on
    /// `init`, the persistence driver and login authenticator when resolved.
    #[must_use]
    pub fn with_log(log: Option<StartLog>) -> Self {
        let mut cache_engine = MockCacheEngine::new();
        if let Some(log) = &log {
            cache_engine = cache_engine.with_log(log.clone());
        }

        Self {
            cache_engine: Arc::new(cache_engine),
            failing_cache_engine: Arc::new(MockCacheEngine::failing(CacheError::Unavailable(
                "backing store offline".to_string(),
            ))),
            first_cacheable: Arc::new(RecordingCacheable::new()),
            second_cacheable: Arc::new(RecordingCacheable::new()),
            persistence_driver: Arc::new(MockPersistenceDriver::default()),
            login_authenticator: Arc::new(MockLoginAuthenticator::default()),
            log,
        }
    }

    /// Register every mock under its class name.
    pub fn register(&self, registry: &mut PluginRegistry) {
        let engine = Arc::clone(&self.cache_engine);
        registry.register::<dyn CacheEngine>(CACHE_ENGINE, move || {
            let engine: Arc<dyn CacheEngine> = engine.clone();
            Ok(engine)
        });

        let failing = Arc::clone(&self.failing_cache_engine);
        registry.register::<dyn CacheEngine>(FAILING_CACHE_ENGINE, move || {
            let engine: Arc<dyn CacheEngine> = failing.clone();
            Ok(engine)
        });

        for (class_name, cacheable) in [
            (FIRST_CACHEABLE, &self.first_cacheable),
            (SECOND_CACHEABLE, &self.second_cacheable),
        ] {
            let cacheable = Arc::clone(cacheable);
            registry.register::<dyn Cacheable>(class_name, move || {
                let cacheable: Arc<dyn Cacheable> = cacheable.clone();
                Ok(cacheable)
            });
        }

        let driver = Arc::clone(&self.persistence_driver);
        let log = self.log.clone();
        registry.register::<dyn PersistenceDriver>(PERSISTENCE_DRIVER, move || {
            if let Some(log) = &log {
                log.record("persistence_driver");
            }
            let driver: Arc<dyn PersistenceDriver> = driver.clone();
            Ok(driver)
        });

        let authenticator = Arc::clone(&self.login_authenticator);
        let log = self.log.clone();
        registry.register::<dyn LoginAuthenticator>(LOGIN_AUTHENTICATOR, move || {
            if let Some(log) = &log {
                log.record("login_authenticator");
            }
            let authenticator: Arc<dyn LoginAuthenticator> = authenticator.clone();
            Ok(authenticator)
        });
    }

    /// Both cacheables, in class-name order
    #[must_use]
    pub fn cacheables(&self) -> [&Arc<RecordingCacheable>; 2] {
        [&self.first_cacheable, &self.second_cacheable]
    }
}

impl Default for MockPlugins {
    fn default() -> Self {
        Self::new()
    }
}

/// Register fresh mocks into `registry` and return them for inspection.
pub fn register_mock_plugins(registry: &mut PluginRegistry) -> MockPlugins {
    let mocks = MockPlugins::new();
    mocks.register(registry);
    mocks
}
