//! Plugin registry: resolves configured class names to capability instances.
//!
//! Configuration names implementations by string (`cache.engine.implementation =
//! agora.cache.DefaultCacheEngine`). The registry maps every such name to one
//! factory per capability the implementation provides, all known at compile
//! time.
//!
//! # Resolution
//!
//! [`PluginRegistry::resolve`] fails with:
//!
//! - [`PluginError::Unresolved`] when nothing is registered under the name
//! - [`PluginError::TypeMismatch`] when the name exists but does not provide
//!   the requested capability
//! - [`PluginError::Instantiation`] when the factory itself fails
//!
//! On success the caller receives an `Arc<dyn Capability>`, never an untyped
//! handle.
//!
//! # Example
//!
//! ```
//! use agora_core::capability::{CacheEngine, CacheError, Cacheable};
//! use agora_core::plugin::{PluginError, PluginRegistry};
//! use std::sync::Arc;
//!
//! struct NullCache;
//!
//! impl CacheEngine for NullCache {
//!     fn init(&self) -> Result<(), CacheError> {
//!         Ok(())
//!     }
//!     fn stop(&self) {}
//! }
//!
//! let mut registry = PluginRegistry::new();
//! registry.register::<dyn CacheEngine>("agora.cache.NullCache", || Ok(Arc::new(NullCache)));
//!
//! let engine = registry.resolve::<dyn CacheEngine>("agora.cache.NullCache");
//! assert!(engine.is_ok());
//!
//! let wrong = registry.resolve::<dyn Cacheable>("agora.cache.NullCache");
//! assert!(matches!(wrong, Err(PluginError::TypeMismatch { .. })));
//! ```

use crate::capability::Capability;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type plugin factories may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Factory stored per (class name, capability) pair.
type Factory<C> = Box<dyn Fn() -> Result<Arc<C>, BoxError> + Send + Sync>;

/// Errors that can occur while resolving a plugin.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// No implementation is registered under the configured name.
    #[error("Class {class_name} not found")]
    Unresolved {
        /// The configured class name
        class_name: String,
    },

    /// The implementation exists but does not provide the capability.
    #[error("Class {class_name} is not assignable to {capability}")]
    TypeMismatch {
        /// The configured class name
        class_name: String,
        /// Name of the requested capability
        capability: &'static str,
    },

    /// The factory failed to build an instance.
    #[error("Could not instantiate {class_name}: {reason}")]
    Instantiation {
        /// The configured class name
        class_name: String,
        /// Error reported by the factory
        reason: String,
    },
}

impl PluginError {
    /// The class name the failure refers to.
    #[must_use]
    pub fn class_name(&self) -> &str {
        match self {
            Self::Unresolved { class_name }
            | Self::TypeMismatch { class_name, .. }
            | Self::Instantiation { class_name, .. } => class_name,
        }
    }
}

/// All factories registered under one class name.
#[derive(Default)]
struct PluginEntry {
    factories: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    capabilities: Vec<&'static str>,
}

/// Registry mapping class names to capability factories.
///
/// Built once at start-up and shared read-only afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    entries: HashMap<String, PluginEntry>,
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for capability `C` under `class_name`.
    ///
    /// One class name can provide several capabilities by registering once per
    /// capability. Registering the same pair twice replaces the earlier factory.
    pub fn register<C>(
        &mut self,
        class_name: &str,
        factory: impl Fn() -> Result<Arc<C>, BoxError> + Send + Sync + 'static,
    ) -> &mut Self
    where
        C: Capability + ?Sized,
    {
        let boxed: Factory<C> = Box::new(factory);
        let entry = self.entries.entry(class_name.trim().to_string()).or_default();

        if entry.factories.insert(TypeId::of::<C>(), Box::new(boxed)).is_none() {
            entry.capabilities.push(C::NAME);
        }

        self
    }

    /// Whether anything is registered under `class_name`.
    #[must_use]
    pub fn contains(&self, class_name: &str) -> bool {
        self.entries.contains_key(class_name.trim())
    }

    /// All registered class names, sorted.
    #[must_use]
    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Capabilities provided by `class_name`, in registration order.
    #[must_use]
    pub fn capabilities_of(&self, class_name: &str) -> &[&'static str] {
        self.entries
            .get(class_name.trim())
            .map(|entry| entry.capabilities.as_slice())
            .unwrap_or(&[])
    }

    /// Build an instance of `class_name` typed as capability `C`.
    ///
    /// Surrounding whitespace in `class_name` is ignored, so values split out
    /// of comma-separated configuration can be passed as they are.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Unresolved`]: no implementation registered under the name
    /// - [`PluginError::TypeMismatch`]: the implementation does not provide `C`
    /// - [`PluginError::Instantiation`]: the factory returned an error
    pub fn resolve<C>(&self, class_name: &str) -> Result<Arc<C>, PluginError>
    where
        C: Capability + ?Sized,
    {
        let class_name = class_name.trim();

        let entry = self
            .entries
            .get(class_name)
            .ok_or_else(|| PluginError::Unresolved {
                class_name: class_name.to_string(),
            })?;

        let factory = entry
            .factories
            .get(&TypeId::of::<C>())
            .and_then(|factory| factory.downcast_ref::<Factory<C>>())
            .ok_or_else(|| PluginError::TypeMismatch {
                class_name: class_name.to_string(),
                capability: C::NAME,
            })?;

        tracing::debug!(class_name, capability = C::NAME, "Instantiating plugin");

        factory().map_err(|e| PluginError::Instantiation {
            class_name: class_name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for name in self.class_names() {
            map.entry(&name, &self.capabilities_of(name));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::capability::{CacheEngine, CacheError, Cacheable, PersistenceDriver};
    use proptest::prelude::*;

    struct NullCache;

    impl CacheEngine for NullCache {
        fn init(&self) -> Result<(), CacheError> {
            Ok(())
        }

        fn stop(&self) {}
    }

    struct NamedDriver(&'static str);

    impl PersistenceDriver for NamedDriver {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register::<dyn CacheEngine>("agora.cache.NullCache", || Ok(Arc::new(NullCache)))
            .register::<dyn PersistenceDriver>("agora.dao.MySqlDriver", || {
                Ok(Arc::new(NamedDriver("mysql")))
            })
            .register::<dyn PersistenceDriver>("agora.dao.BrokenDriver", || {
                Err("missing database url".into())
            });
        registry
    }

    #[test]
    fn test_resolve_returns_typed_instance() {
        let driver = registry()
            .resolve::<dyn PersistenceDriver>("agora.dao.MySqlDriver")
            .unwrap();
        assert_eq!(driver.name(), "mysql");
    }

    #[test]
    fn test_resolve_trims_class_name() {
        let engine = registry().resolve::<dyn CacheEngine>("  agora.cache.NullCache \n");
        assert!(engine.is_ok());
    }

    #[test]
    fn test_unknown_class_is_unresolved() {
        let err = registry()
            .resolve::<dyn CacheEngine>("agora.cache.Missing")
            .err()
            .unwrap();
        assert_eq!(
            err,
            PluginError::Unresolved {
                class_name: "agora.cache.Missing".to_string()
            }
        );
    }

    #[test]
    fn test_wrong_capability_is_type_mismatch() {
        let err = registry()
            .resolve::<dyn PersistenceDriver>("agora.cache.NullCache")
            .err()
            .unwrap();

        assert_eq!(
            err,
            PluginError::TypeMismatch {
                class_name: "agora.cache.NullCache".to_string(),
                capability: "PersistenceDriver",
            }
        );
        let message = err.to_string();
        assert!(message.contains("agora.cache.NullCache"));
        assert!(message.contains("PersistenceDriver"));
    }

    #[test]
    fn test_factory_failure_is_instantiation_error() {
        let err = registry()
            .resolve::<dyn PersistenceDriver>("agora.dao.BrokenDriver")
            .err()
            .unwrap();

        assert_eq!(err.class_name(), "agora.dao.BrokenDriver");
        assert!(matches!(err, PluginError::Instantiation { ref reason, .. } if reason == "missing database url"));
    }

    #[test]
    fn test_one_class_can_provide_several_capabilities() {
        struct Both;
        impl CacheEngine for Both {
            fn init(&self) -> Result<(), CacheError> {
                Ok(())
            }
            fn stop(&self) {}
        }
        impl Cacheable for Both {
            fn set_cache_engine(&self, _engine: Arc<dyn CacheEngine>) {}
        }

        let mut registry = PluginRegistry::new();
        registry
            .register::<dyn CacheEngine>("agora.Both", || Ok(Arc::new(Both)))
            .register::<dyn Cacheable>("agora.Both", || Ok(Arc::new(Both)));

        assert!(registry.resolve::<dyn CacheEngine>("agora.Both").is_ok());
        assert!(registry.resolve::<dyn Cacheable>("agora.Both").is_ok());
        assert_eq!(registry.capabilities_of("agora.Both"), &["CacheEngine", "Cacheable"]);
    }

    #[test]
    fn test_class_names_are_sorted() {
        assert_eq!(
            registry().class_names(),
            vec![
                "agora.cache.NullCache",
                "agora.dao.BrokenDriver",
                "agora.dao.MySqlDriver"
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_unregistered_names_never_resolve(name in "[a-zA-Z][a-zA-Z0-9_.]{0,40}") {
            let registry = registry();
            prop_assume!(!registry.contains(&name));

            let result = registry.resolve::<dyn CacheEngine>(&name);
            prop_assert!(
                matches!(result, Err(PluginError::Unresolved { .. })),
                "expected Unresolved"
            );
        }

        #[test]
        fn prop_registered_names_without_capability_mismatch(
            name in prop::sample::select(vec!["agora.dao.MySqlDriver", "agora.dao.BrokenDriver"])
        ) {
            let result = registry().resolve::<dyn CacheEngine>(name);
            prop_assert!(
                matches!(result, Err(PluginError::TypeMismatch { capability: "CacheEngine", .. })),
                "expected TypeMismatch"
            );
        }
    }
}
