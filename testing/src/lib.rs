//! # Agora Testing
//!
//! Testing utilities and helpers for the Agora forum bootstrap layer.
//!
//! This crate provides:
//! - A tracking connection provider that counts acquire/commit/rollback/release
//! - Mock plugins for every capability the bootstrap sequence resolves
//! - Recording scheduler, indexer and file-monitor collaborators
//! - An in-memory properties loader
//! - A fixed clock and a tracing subscriber for tests
//!
//! ## Example
//!
//! ```ignore
//! use agora_testing::{ProviderSwap, TrackingConnectionProvider};
//!
//! #[test]
//! fn commit_path_releases_connection() {
//!     let tracking = Arc::new(TrackingConnectionProvider::new());
//!     let _swap = ProviderSwap::install(&slot, tracking.clone());
//!
//!     {
//!         let scope = ExecutionContext::open(env.clone()).unwrap();
//!         scope.connection().unwrap();
//!     }
//!
//!     assert_eq!(tracking.commit_count(), 1);
//!     assert_eq!(tracking.release_count(), 1);
//! }
//! ```

use agora_core::environment::Clock;
use chrono::{DateTime, Utc};

/// Tracking connection provider and provider swap guard
pub mod connection_mocks;

/// Mock capability plugins
pub mod plugin_mocks;

/// Recording collaborators and in-memory properties loader
pub mod collaborator_mocks;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use agora_testing::mocks::FixedClock;
    /// use agora_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honours `RUST_LOG`, defaulting to `debug`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use collaborator_mocks::{
    InMemoryPropertiesLoader, RecordingFileMonitor, RecordingIndexer, RecordingJob, StartLog, Watch,
};
pub use connection_mocks::{Call, ProviderSwap, TrackingConnection, TrackingConnectionProvider};
pub use mocks::{FixedClock, test_clock};
pub use plugin_mocks::{
    MockCacheEngine, MockLoginAuthenticator, MockPersistenceDriver, MockPlugins, RecordingCacheable,
    register_mock_plugins,
};
