//! Database connection capability and the swappable provider slot.
//!
//! A [`ConnectionProvider`] hands out [`Connection`]s and takes them back. The
//! execution context acquires at most one connection per unit of work and
//! releases it exactly once when the unit of work ends.
//!
//! # Implementations
//!
//! - `PgConnectionProvider` (in `agora-postgres`): pooled production provider
//! - `TrackingConnectionProvider` (in `agora-testing`): deterministic test double
//!
//! Exactly one provider is active per process. It lives in a
//! [`ConnectionProviderSlot`] so tests can install a double and put the previous
//! provider back afterwards.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors that can occur while acquiring or using a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Every connection is in use and none became free in time.
    #[error("Connection pool exhausted")]
    Exhausted,

    /// The database could not be reached.
    #[error("Database unreachable: {0}")]
    Unreachable(String),

    /// The connection was already closed.
    #[error("Connection already closed")]
    Closed,

    /// A transaction control statement failed.
    #[error("Statement failed: {0}")]
    Statement(String),
}

/// A single database connection.
///
/// Methods take `&self`; implementations guard their own state so a connection
/// can be shared as `Arc<dyn Connection>` between the execution context and the
/// code doing the work.
pub trait Connection: Send + Sync {
    /// Commit the current transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the commit fails or the connection is closed.
    fn commit(&self) -> Result<(), ConnectionError>;

    /// Roll back the current transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the rollback fails or the connection is closed.
    fn rollback(&self) -> Result<(), ConnectionError>;

    /// Close the connection. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the underlying close fails.
    fn close(&self) -> Result<(), ConnectionError>;

    /// Whether [`close`](Connection::close) already ran.
    fn is_closed(&self) -> bool;
}

/// Source of database connections.
///
/// `acquire` may block while the provider waits for a free connection.
pub trait ConnectionProvider: Send + Sync {
    /// Get a connection.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Exhausted`]: no connection became available
    /// - [`ConnectionError::Unreachable`]: the database cannot be reached
    fn acquire(&self) -> Result<Arc<dyn Connection>, ConnectionError>;

    /// Give a connection back.
    ///
    /// Must accept connections that are already closed; the call still counts
    /// as the release of that connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the provider could not recycle the connection.
    /// The connection is considered released either way.
    fn release(&self, connection: Arc<dyn Connection>) -> Result<(), ConnectionError>;

    /// Close every connection the provider still holds. Best effort.
    fn shutdown_all(&self);
}

/// Holder of the active [`ConnectionProvider`].
///
/// The slot itself implements [`ConnectionProvider`] by delegating to the
/// provider installed at call time.
///
/// # Example
///
/// ```ignore
/// let slot = ConnectionProviderSlot::new(Arc::new(PgConnectionProvider::connect(settings)?));
///
/// // In a test
/// let previous = slot.install(Arc::new(TrackingConnectionProvider::new()));
/// // ... exercise code ...
/// slot.install(previous);
/// ```
pub struct ConnectionProviderSlot {
    active: RwLock<Arc<dyn ConnectionProvider>>,
}

impl ConnectionProviderSlot {
    /// Create a slot holding `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            active: RwLock::new(provider),
        }
    }

    /// The provider currently installed.
    #[must_use]
    pub fn current(&self) -> Arc<dyn ConnectionProvider> {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install `provider` and return the one it replaces.
    pub fn install(&self, provider: Arc<dyn ConnectionProvider>) -> Arc<dyn ConnectionProvider> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("Replacing active connection provider");
        std::mem::replace(&mut *active, provider)
    }
}

impl ConnectionProvider for ConnectionProviderSlot {
    fn acquire(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.current().acquire()
    }

    fn release(&self, connection: Arc<dyn Connection>) -> Result<(), ConnectionError> {
        self.current().release(connection)
    }

    fn shutdown_all(&self) {
        self.current().shutdown_all();
    }
}

impl fmt::Debug for ConnectionProviderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProviderSlot").finish_non_exhaustive()
    }
}
