//! The active subsystem instances for this process.
//!
//! Built once at start-up and passed by reference to whatever needs the cache
//! engine, the persistence driver or the login authenticator. Bootstrap fills
//! it; tests may swap instances in and out.

use agora_core::capability::{CacheEngine, LoginAuthenticator, PersistenceDriver};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Registry of the active cache engine, persistence driver and login
/// authenticator.
///
/// Each slot holds zero or one instance. After a successful
/// [`start_persistence_driver`](crate::bootstrap::Bootstrapper::start_persistence_driver)
/// the driver slot is always filled.
#[derive(Default)]
pub struct Subsystems {
    cache_engine: RwLock<Option<Arc<dyn CacheEngine>>>,
    persistence_driver: RwLock<Option<Arc<dyn PersistenceDriver>>>,
    login_authenticator: RwLock<Option<Arc<dyn LoginAuthenticator>>>,
}

fn read<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn replace<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>, value: Option<Arc<T>>) -> Option<Arc<T>> {
    let mut guard = slot.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, value)
}

impl Subsystems {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The active cache engine
    #[must_use]
    pub fn cache_engine(&self) -> Option<Arc<dyn CacheEngine>> {
        read(&self.cache_engine)
    }

    /// The active persistence driver
    #[must_use]
    pub fn persistence_driver(&self) -> Option<Arc<dyn PersistenceDriver>> {
        read(&self.persistence_driver)
    }

    /// The active login authenticator
    #[must_use]
    pub fn login_authenticator(&self) -> Option<Arc<dyn LoginAuthenticator>> {
        read(&self.login_authenticator)
    }

    /// Install `engine`, returning the engine it replaces.
    pub fn install_cache_engine(&self, engine: Arc<dyn CacheEngine>) -> Option<Arc<dyn CacheEngine>> {
        replace(&self.cache_engine, Some(engine))
    }

    /// Remove the active cache engine.
    pub fn take_cache_engine(&self) -> Option<Arc<dyn CacheEngine>> {
        replace(&self.cache_engine, None)
    }

    /// Install `driver`, returning the driver it replaces.
    pub fn install_persistence_driver(
        &self,
        driver: Arc<dyn PersistenceDriver>,
    ) -> Option<Arc<dyn PersistenceDriver>> {
        replace(&self.persistence_driver, Some(driver))
    }

    /// Install `authenticator`, returning the one it replaces.
    pub fn install_login_authenticator(
        &self,
        authenticator: Arc<dyn LoginAuthenticator>,
    ) -> Option<Arc<dyn LoginAuthenticator>> {
        replace(&self.login_authenticator, Some(authenticator))
    }
}

impl fmt::Debug for Subsystems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let driver = self.persistence_driver();
        f.debug_struct("Subsystems")
            .field("cache_engine", &self.cache_engine().is_some())
            .field("persistence_driver", &driver.as_ref().map(|d| d.name()))
            .field("login_authenticator", &self.login_authenticator().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use agora_testing::{MockCacheEngine, MockPersistenceDriver};

    #[test]
    fn test_starts_empty() {
        let subsystems = Subsystems::new();

        assert!(subsystems.cache_engine().is_none());
        assert!(subsystems.persistence_driver().is_none());
        assert!(subsystems.login_authenticator().is_none());
    }

    #[test]
    fn test_install_returns_previous_for_restore() {
        let subsystems = Subsystems::new();
        subsystems.install_persistence_driver(Arc::new(MockPersistenceDriver::new("production")));

        let previous = subsystems
            .install_persistence_driver(Arc::new(MockPersistenceDriver::new("double")))
            .unwrap();
        assert_eq!(subsystems.persistence_driver().unwrap().name(), "double");

        subsystems.install_persistence_driver(previous);
        assert_eq!(subsystems.persistence_driver().unwrap().name(), "production");
    }

    #[test]
    fn test_take_cache_engine_empties_slot() {
        let subsystems = Subsystems::new();
        subsystems.install_cache_engine(Arc::new(MockCacheEngine::new()));

        assert!(subsystems.take_cache_engine().is_some());
        assert!(subsystems.cache_engine().is_none());
        assert!(subsystems.take_cache_engine().is_none());
    }
}
