//! `PostgreSQL` connection provider and persistence driver for Agora.
//!
//! This crate provides the production [`ConnectionProvider`](agora_core::connection::ConnectionProvider)
//! backed by a `sqlx` connection pool, plus the `PostgresDriver` persistence
//! driver plugin. It supports:
//!
//! - Connection pooling with a bounded wait for a free connection
//! - Transaction-per-request (`BEGIN` on acquire, `COMMIT`/`ROLLBACK` at close)
//! - Plugin registration under [`driver::CLASS_NAME`]
//!
//! The provider keeps the blocking contract of the connection capability: it
//! owns a `tokio` runtime and blocks on it, so it must not be called from
//! inside another async runtime.
//!
//! # Example
//!
//! ```ignore
//! use agora_core::connection::ConnectionProviderSlot;
//! use agora_postgres::PgConnectionProvider;
//!
//! let provider = PgConnectionProvider::from_settings(&settings)?;
//! let slot = ConnectionProviderSlot::new(Arc::new(provider));
//! ```

/// Persistence driver plugin
pub mod driver;

/// Pooled connection provider
pub mod provider;

pub use driver::{PostgresDriver, register_plugins};
pub use provider::{PgConnectionProvider, PgError, PgProviderSettings, PgSessionConnection};
