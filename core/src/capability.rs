//! Capability traits for pluggable subsystems.
//!
//! Each subsystem the bootstrap sequence installs is described by a trait.
//! Implementations are registered in a [`PluginRegistry`](crate::plugin::PluginRegistry)
//! under a class name and resolved from configuration at start-up.
//!
//! # Capabilities
//!
//! - [`CacheEngine`]: The process-wide cache, initialised once and stopped at shutdown
//! - [`Cacheable`]: Components that keep their data in the cache engine
//! - [`PersistenceDriver`]: The single active data-access driver
//! - [`LoginAuthenticator`]: Validates user credentials
//! - [`ForumContext`]: Per-request view of the web layer, only stored by the
//!   execution context and never implemented here
//!
//! A trait becomes resolvable once it implements [`Capability`], which gives it
//! a stable name for error messages.

use std::sync::Arc;
use thiserror::Error;

/// Marker for trait objects that the plugin registry can hand out.
///
/// Implemented for `dyn Trait`, never for concrete types:
///
/// ```ignore
/// impl Capability for dyn CacheEngine {
///     const NAME: &'static str = "CacheEngine";
/// }
/// ```
pub trait Capability: Send + Sync + 'static {
    /// Human readable capability name used in error messages
    const NAME: &'static str;
}

/// Errors a cache engine can report while starting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The engine could not reach or create its backing store.
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    /// The engine was configured with values it cannot use.
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

/// The process-wide cache engine.
pub trait CacheEngine: Send + Sync {
    /// Prepare the engine for use.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the engine cannot start.
    fn init(&self) -> Result<(), CacheError>;

    /// Stop the engine and drop cached data.
    ///
    /// Must not fail; engines log their own shutdown problems.
    fn stop(&self);
}

impl Capability for dyn CacheEngine {
    const NAME: &'static str = "CacheEngine";
}

/// A component whose state lives in the cache engine.
pub trait Cacheable: Send + Sync {
    /// Hand the active cache engine to the component.
    fn set_cache_engine(&self, engine: Arc<dyn CacheEngine>);
}

impl Capability for dyn Cacheable {
    const NAME: &'static str = "Cacheable";
}

/// The data-access driver all persistence goes through.
pub trait PersistenceDriver: Send + Sync {
    /// Driver name, e.g. `postgres`
    fn name(&self) -> &str;
}

impl Capability for dyn PersistenceDriver {
    const NAME: &'static str = "PersistenceDriver";
}

/// A user accepted by a [`LoginAuthenticator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Forum user id
    pub user_id: i64,
    /// Login name as stored by the forum
    pub username: String,
}

/// Validates login credentials.
pub trait LoginAuthenticator: Send + Sync {
    /// Check a username/password pair.
    ///
    /// Returns `None` when the credentials are rejected.
    fn validate_login(&self, username: &str, password: &str) -> Option<AuthenticatedUser>;
}

impl Capability for dyn LoginAuthenticator {
    const NAME: &'static str = "LoginAuthenticator";
}

/// The web layer's view of the current request.
///
/// The execution context only keeps a weak reference to it.
pub trait ForumContext: Send + Sync {
    /// Rewrite a URL so it carries session information if needed
    fn encode_url(&self, url: &str) -> String;

    /// Whether the request comes from a crawler
    fn is_bot(&self) -> bool;

    /// Request URI, if the context wraps an HTTP request
    fn request_uri(&self) -> Option<String>;
}
