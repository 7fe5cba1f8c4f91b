//! Pooled `PostgreSQL` connection provider.
//!
//! [`PgConnectionProvider`] hands out [`PgSessionConnection`]s checked out of
//! a `sqlx` pool. With transactions enabled every connection starts inside a
//! `BEGIN`, and the execution context decides whether it ends in `COMMIT` or
//! `ROLLBACK` before giving it back.

use agora_core::connection::{Connection, ConnectionError, ConnectionProvider};
use agora_core::settings::{ConfigError, Settings, keys};
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};

/// Pool size used when `database.connection.pool.max` is unset.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Acquire timeout used when `database.connection.acquire.timeout` is unset.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while setting up the provider.
#[derive(Error, Debug)]
pub enum PgError {
    /// The pool settings are missing or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The runtime driving the pool could not be started.
    #[error("Failed to start database runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The database rejected the connection or the URL is invalid.
    #[error("Failed to connect: {0}")]
    Connect(#[from] sqlx::Error),
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgProviderSettings {
    /// Database URL, e.g. `postgres://forum@localhost/forum`
    pub url: String,
    /// Upper bound on pooled connections
    pub max_connections: u32,
    /// How long `acquire` waits for a free connection
    pub acquire_timeout: Duration,
    /// Whether connections start inside a transaction
    pub use_transactions: bool,
}

impl PgProviderSettings {
    /// Read pool settings from `settings`.
    ///
    /// Only `database.connection.url` is required. `database.use.transactions`
    /// defaults to `true`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`]: the URL is unset
    /// - [`ConfigError::Invalid`]: a numeric key is not a positive integer, or
    ///   the transaction flag is not a boolean
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let url = settings.require(keys::DATABASE_CONNECTION_URL)?;
        let max_connections =
            positive(settings, keys::DATABASE_POOL_MAX)?.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let acquire_timeout = positive(settings, keys::DATABASE_ACQUIRE_TIMEOUT)?
            .map_or(DEFAULT_ACQUIRE_TIMEOUT, Duration::from_secs);
        let use_transactions = match settings.get(keys::DATABASE_USE_TRANSACTIONS) {
            Some(_) => settings.get_bool(keys::DATABASE_USE_TRANSACTIONS)?,
            None => true,
        };

        Ok(Self {
            url,
            max_connections,
            acquire_timeout,
            use_transactions,
        })
    }
}

/// Value of `key` if it is set, rejecting zero, negative and oversized values.
fn positive<T: TryFrom<i64>>(settings: &Settings, key: &str) -> Result<Option<T>, ConfigError> {
    let Some(raw) = settings.get(key) else {
        return Ok(None);
    };

    let value = settings.get_int(key)?;
    if value <= 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            expected: "a positive integer",
        });
    }

    T::try_from(value).map(Some).map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: raw,
        expected: "a smaller positive integer",
    })
}

/// Map a pool checkout failure onto the connection capability's errors.
pub(crate) fn acquire_error(error: sqlx::Error) -> ConnectionError {
    match error {
        sqlx::Error::PoolTimedOut => ConnectionError::Exhausted,
        other => ConnectionError::Unreachable(other.to_string()),
    }
}

/// [`ConnectionProvider`] over a `sqlx` `PgPool`.
pub struct PgConnectionProvider {
    pool: PgPool,
    use_transactions: bool,
    runtime: Runtime,
}

impl PgConnectionProvider {
    /// Start a runtime, open the pool and verify the database is reachable.
    ///
    /// # Errors
    ///
    /// - [`PgError::Runtime`]: the runtime could not be started
    /// - [`PgError::Connect`]: the first connection failed
    pub fn connect(settings: PgProviderSettings) -> Result<Self, PgError> {
        let runtime = build_runtime()?;
        let pool = runtime.block_on(pool_options(&settings).connect(&settings.url))?;

        tracing::info!(
            max_connections = settings.max_connections,
            use_transactions = settings.use_transactions,
            "Connected to PostgreSQL"
        );

        Ok(Self {
            pool,
            use_transactions: settings.use_transactions,
            runtime,
        })
    }

    /// Like [`connect`](Self::connect), but defers opening connections to the
    /// first `acquire`.
    ///
    /// # Errors
    ///
    /// - [`PgError::Runtime`]: the runtime could not be started
    /// - [`PgError::Connect`]: the URL could not be parsed
    pub fn connect_lazy(settings: PgProviderSettings) -> Result<Self, PgError> {
        let runtime = build_runtime()?;
        let pool = {
            let _runtime = runtime.enter();
            pool_options(&settings).connect_lazy(&settings.url)?
        };

        Ok(Self {
            pool,
            use_transactions: settings.use_transactions,
            runtime,
        })
    }

    /// Read [`PgProviderSettings`] from `settings` and [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`PgError::Config`] for bad settings, otherwise as `connect`.
    pub fn from_settings(settings: &Settings) -> Result<Self, PgError> {
        Self::connect(PgProviderSettings::from_settings(settings)?)
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether connections start inside a transaction.
    #[must_use]
    pub const fn use_transactions(&self) -> bool {
        self.use_transactions
    }

    /// Check out a connection, typed as the concrete session.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Exhausted`]: no connection freed up in time
    /// - [`ConnectionError::Unreachable`]: the pool is closed or the database is down
    /// - [`ConnectionError::Statement`]: `BEGIN` failed
    pub fn acquire_session(&self) -> Result<Arc<PgSessionConnection>, ConnectionError> {
        let live = self
            .runtime
            .block_on(self.pool.acquire())
            .map_err(acquire_error)?;
        let session = PgSessionConnection::new(self.runtime.handle().clone(), live);

        if self.use_transactions {
            session.begin()?;
        }

        tracing::trace!(
            size = self.pool.size(),
            idle = self.pool.num_idle(),
            "Acquired connection"
        );
        Ok(Arc::new(session))
    }
}

fn build_runtime() -> Result<Runtime, PgError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agora-postgres")
        .build()
        .map_err(PgError::Runtime)
}

fn pool_options(settings: &PgProviderSettings) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
}

impl ConnectionProvider for PgConnectionProvider {
    fn acquire(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        let session: Arc<dyn Connection> = self.acquire_session()?;
        Ok(session)
    }

    fn release(&self, connection: Arc<dyn Connection>) -> Result<(), ConnectionError> {
        if connection.is_closed() {
            tracing::trace!("Released connection was already closed");
            return Ok(());
        }
        connection.close()
    }

    fn shutdown_all(&self) {
        tracing::info!(size = self.pool.size(), "Closing connection pool");
        self.runtime.block_on(self.pool.close());
    }
}

impl fmt::Debug for PgConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnectionProvider")
            .field("size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .field("use_transactions", &self.use_transactions)
            .finish_non_exhaustive()
    }
}

/// One pooled connection checked out for a unit of work.
///
/// Closing hands the connection back to the pool. A connection whose
/// transaction never ended is closed for real instead, so the pool does not
/// recycle an open transaction.
pub struct PgSessionConnection {
    handle: Handle,
    live: Mutex<Option<PoolConnection<Postgres>>>,
    in_transaction: AtomicBool,
}

impl PgSessionConnection {
    fn new(handle: Handle, live: PoolConnection<Postgres>) -> Self {
        Self {
            handle,
            live: Mutex::new(Some(live)),
            in_transaction: AtomicBool::new(false),
        }
    }

    /// Run `sql` on this connection and return the number of affected rows.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Closed`]: the connection was closed
    /// - [`ConnectionError::Statement`]: the database rejected the statement
    pub fn execute(&self, sql: &str) -> Result<u64, ConnectionError> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = live.as_mut().ok_or(ConnectionError::Closed)?;

        self.handle
            .block_on(sqlx::query(sql).execute(&mut **conn))
            .map(|result| result.rows_affected())
            .map_err(|e| ConnectionError::Statement(e.to_string()))
    }

    /// Whether a transaction is open on this connection.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<(), ConnectionError> {
        self.execute("BEGIN")?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn end_transaction(&self, statement: &str) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if !self.in_transaction() {
            tracing::trace!(statement, "No open transaction");
            return Ok(());
        }

        // A failed COMMIT or ROLLBACK leaves the flag set so close discards the connection
        self.execute(statement)?;
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Connection for PgSessionConnection {
    fn commit(&self) -> Result<(), ConnectionError> {
        self.end_transaction("COMMIT")
    }

    fn rollback(&self) -> Result<(), ConnectionError> {
        self.end_transaction("ROLLBACK")
    }

    fn close(&self) -> Result<(), ConnectionError> {
        let Some(live) = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        if self.in_transaction.swap(false, Ordering::SeqCst) {
            tracing::warn!("Discarding connection with an open transaction");
            return self
                .handle
                .block_on(live.close())
                .map_err(|e| ConnectionError::Statement(e.to_string()));
        }

        // Returning to the pool spawns onto the runtime
        self.handle.block_on(async move { drop(live) });
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for PgSessionConnection {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        tracing::warn!("Connection dropped without being released");
        if let Err(error) = self.close() {
            tracing::error!(%error, "Failed to close dropped connection");
        }
    }
}

impl fmt::Debug for PgSessionConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSessionConnection")
            .field("closed", &self.is_closed())
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        Settings::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_defaults_apply_when_only_url_is_set() {
        let pg = PgProviderSettings::from_settings(&settings(&[(
            keys::DATABASE_CONNECTION_URL,
            "postgres://forum@localhost/forum",
        )]))
        .unwrap();

        assert_eq!(
            pg,
            PgProviderSettings {
                url: "postgres://forum@localhost/forum".to_string(),
                max_connections: DEFAULT_MAX_CONNECTIONS,
                acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
                use_transactions: true,
            }
        );
    }

    #[test]
    fn test_explicit_pool_settings() {
        let pg = PgProviderSettings::from_settings(&settings(&[
            (keys::DATABASE_CONNECTION_URL, "postgres://localhost/forum"),
            (keys::DATABASE_POOL_MAX, "25"),
            (keys::DATABASE_ACQUIRE_TIMEOUT, "30"),
            (keys::DATABASE_USE_TRANSACTIONS, "false"),
        ]))
        .unwrap();

        assert_eq!(pg.max_connections, 25);
        assert_eq!(pg.acquire_timeout, Duration::from_secs(30));
        assert!(!pg.use_transactions);
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let err = PgProviderSettings::from_settings(&settings(&[])).err().unwrap();
        assert!(matches!(err, ConfigError::Missing { ref key } if key == keys::DATABASE_CONNECTION_URL));
    }

    #[test]
    fn test_non_positive_pool_size_is_rejected() {
        for value in ["0", "-3", "99999999999", "many"] {
            let result = PgProviderSettings::from_settings(&settings(&[
                (keys::DATABASE_CONNECTION_URL, "postgres://localhost/forum"),
                (keys::DATABASE_POOL_MAX, value),
            ]));
            assert!(
                matches!(result, Err(ConfigError::Invalid { .. })),
                "pool max {value} should be rejected"
            );
        }
    }

    #[test]
    fn test_pool_timeout_maps_to_exhausted() {
        assert_eq!(acquire_error(sqlx::Error::PoolTimedOut), ConnectionError::Exhausted);
        assert!(matches!(
            acquire_error(sqlx::Error::PoolClosed),
            ConnectionError::Unreachable(_)
        ));
    }

    #[test]
    fn test_closed_pool_reports_unreachable() {
        let provider = PgConnectionProvider::connect_lazy(PgProviderSettings {
            url: "postgres://forum@localhost:1/forum".to_string(),
            max_connections: 1,
            acquire_timeout: Duration::from_millis(100),
            use_transactions: true,
        })
        .unwrap();

        provider.shutdown_all();

        assert!(provider.pool().is_closed());
        assert!(matches!(
            provider.acquire().err().unwrap(),
            ConnectionError::Unreachable(_)
        ));
    }

    #[test]
    fn test_invalid_url_fails_to_build() {
        let result = PgConnectionProvider::connect_lazy(PgProviderSettings {
            url: "not a database url".to_string(),
            max_connections: 1,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            use_transactions: true,
        });

        assert!(matches!(result, Err(PgError::Connect(_))));
    }
}
