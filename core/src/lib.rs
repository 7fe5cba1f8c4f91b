//! # Agora Core
//!
//! Core traits and types for the Agora forum bootstrap layer.
//!
//! This crate provides the abstractions the start-up sequence and the
//! per-request execution context are built on.
//!
//! ## Core Concepts
//!
//! - **Capability**: A trait a pluggable subsystem implements (cache engine,
//!   persistence driver, login authenticator, ...)
//! - **Plugin Registry**: Maps configured class names to factories producing
//!   capability-typed instances
//! - **Connection Provider**: Hands out and takes back database connections
//! - **Settings**: String-keyed configuration loaded from `.properties` files
//! - **Environment**: Injected dependencies such as the clock
//!
//! ## Example
//!
//! ```ignore
//! use agora_core::capability::CacheEngine;
//! use agora_core::plugin::PluginRegistry;
//! use agora_core::settings::{keys, Settings};
//!
//! let mut registry = PluginRegistry::new();
//! registry.register::<dyn CacheEngine>("agora.cache.Default", || Ok(Arc::new(DefaultCache::new())));
//!
//! let settings = Settings::new();
//! settings.set(keys::CACHE_IMPLEMENTATION, "agora.cache.Default");
//!
//! let class_name = settings.get(keys::CACHE_IMPLEMENTATION).unwrap_or_default();
//! let engine = registry.resolve::<dyn CacheEngine>(&class_name)?;
//! engine.init()?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Capability traits implemented by pluggable subsystems
pub mod capability;

/// Database connection capability and the swappable provider slot
pub mod connection;

/// Scheduler, indexer and file-monitor collaborators
pub mod jobs;

/// Plugin registry resolving class names to capability instances
pub mod plugin;

/// Settings store, typed keys and `.properties` loading
pub mod settings;

/// Environment module - Dependency injection traits
///
/// All time-dependent behaviour reads the clock through the [`Clock`](environment::Clock)
/// trait so tests can pin it.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    /// let now = clock.now();
    ///
    /// // Test - fixed time for deterministic tests
    /// let clock = FixedClock::new(time);
    /// assert_eq!(clock.now(), time);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by the operating system
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
