//! # Agora Runtime
//!
//! Start-up and per-request execution for the Agora forum.
//!
//! This crate wires the capabilities from `agora-core` together:
//!
//! ## Core Components
//!
//! - **Subsystems**: The active cache engine, persistence driver and login authenticator
//! - **Bootstrapper**: Resolves configured class names and starts every subsystem in order
//! - **Settings loader**: Reads settings, module mappings and URL patterns, registers file watches
//! - **Execution context**: One per request; owns at most one connection and
//!   commits or rolls back when the scope ends
//!
//! ## Example
//!
//! ```ignore
//! use agora_runtime::bootstrap::Bootstrapper;
//! use agora_runtime::execution::{ExecutionContext, ExecutionEnvironment};
//!
//! let settings = Arc::new(settings_loader::start_settings(app_path, &FilePropertiesLoader)?);
//! let subsystems = Arc::new(Subsystems::new());
//! Bootstrapper::new(settings.clone(), Arc::new(registry), subsystems.clone()).start_all()?;
//!
//! let env = ExecutionEnvironment::from_settings(provider, &settings)?;
//!
//! // For every request
//! let scope = ExecutionContext::open(env.clone())?;
//! let connection = scope.connection()?;
//! // ... work ...
//! // scope dropped: commit (or rollback) and release
//! ```

/// Subsystem bootstrap from configured class names
pub mod bootstrap;

/// Per-request execution context and its close protocol
pub mod execution;

/// Prometheus metrics for observability
pub mod metrics;

/// Settings, module mapping and URL pattern loading
pub mod settings_loader;

/// Registry of active subsystem instances
pub mod subsystems;

pub use bootstrap::{
    BootstrapError, Bootstrapper, CacheEngineStartupError, Collaborators, StartupCause,
    StartupError, Subsystem,
};
pub use execution::{
    CloseOutcome, ContextError, ContextScope, ExecutionContext, ExecutionEnvironment, Lifecycle,
    TransactionOutcome,
};
pub use subsystems::Subsystems;
