//! Per-unit-of-work execution context.
//!
//! A context is opened at the start of a unit of work (one request), lazily
//! acquires at most one database connection, carries request-scoped state, and
//! on scope exit commits or rolls back and releases the connection exactly
//! once.
//!
//! # Lifecycle
//!
//! ```text
//! open() ──▶ Open ──connection()──▶ Connected
//!             │                        │
//!             └──────── close ─────────┴──▶ Closed
//! ```
//!
//! [`ExecutionContext::open`] returns a [`ContextScope`]. Dropping the scope
//! (normal return, `?` propagation, panic unwinding) runs the close protocol:
//!
//! 1. No connection was acquired: nothing is released.
//! 2. A connection was acquired and transactions are enabled: roll back if
//!    [`enable_rollback`](ExecutionContext::enable_rollback) was called,
//!    commit otherwise.
//! 3. Transactions are disabled: neither commit nor roll back.
//! 4. Release the connection to the provider, even if step 2 failed.
//!
//! Commit, rollback and release failures are logged and counted, never
//! propagated.
//!
//! The open context is also reachable through a thread-local slot via
//! [`ExecutionContext::current`]. The slot is cleared when the scope closes, so
//! a later unit of work on the same thread never sees stale state.
//!
//! # Example
//!
//! ```rust,ignore
//! fn handle(env: &ExecutionEnvironment) -> Result<(), AppError> {
//!     let scope = ExecutionContext::open(env.clone())?;
//!
//!     let connection = scope.connection()?;
//!     if let Err(e) = save_post(&connection) {
//!         scope.enable_rollback()?;
//!         return Err(e.into());
//!     }
//!
//!     Ok(())
//! } // scope dropped: commit or rollback, then release
//! ```

use crate::metrics::ExecutionMetrics;
use agora_core::capability::ForumContext;
use agora_core::connection::{Connection, ConnectionError, ConnectionProvider};
use agora_core::environment::{Clock, SystemClock};
use agora_core::settings::{ConfigError, Settings, keys};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Weak};
use thiserror::Error;

thread_local! {
    static CURRENT: RefCell<Option<Rc<ContextInner>>> = const { RefCell::new(None) };
}

/// Where an execution context is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Open, no connection acquired yet
    Open,
    /// Open, holding a connection
    Connected,
    /// Closed; every mutation fails
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Connected => "connected",
            Self::Closed => "closed",
        })
    }
}

/// Errors from execution context operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// A context is already open on this thread; contexts do not nest.
    #[error("An execution context is already open on this thread")]
    AlreadyOpen,

    /// No context is open on this thread.
    #[error("No execution context is open on this thread")]
    NotOpen,

    /// The operation is not allowed in the current lifecycle state.
    #[error("Cannot {operation} on a {lifecycle} execution context")]
    IllegalState {
        /// The rejected operation
        operation: &'static str,
        /// State the context was in
        lifecycle: Lifecycle,
    },

    /// The connection provider failed to hand out a connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// What happened to the transaction when a context closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Committed
    Committed,
    /// Rolled back
    RolledBack,
    /// Transactions are disabled; neither commit nor rollback ran
    Skipped,
    /// Commit or rollback failed or panicked (logged)
    Failed,
}

/// Result of closing a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// No connection was ever acquired
    Idle,
    /// The connection was released
    Released {
        /// What happened to the transaction before release
        transaction: TransactionOutcome,
    },
}

/// Shared inputs for every execution context: the connection provider, the
/// clock and the transaction mode.
#[derive(Clone)]
pub struct ExecutionEnvironment {
    provider: Arc<dyn ConnectionProvider>,
    clock: Arc<dyn Clock>,
    use_transactions: bool,
}

impl ExecutionEnvironment {
    /// Create an environment using the system clock.
    #[must_use]
    pub fn new(provider: Arc<dyn ConnectionProvider>, use_transactions: bool) -> Self {
        Self {
            provider,
            clock: Arc::new(SystemClock),
            use_transactions,
        }
    }

    /// Create an environment reading `database.use.transactions` from
    /// `settings`. An unset key enables transactions.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the key is neither `true` nor `false`.
    pub fn from_settings(
        provider: Arc<dyn ConnectionProvider>,
        settings: &Settings,
    ) -> Result<Self, ConfigError> {
        let use_transactions = match settings.get_bool(keys::DATABASE_USE_TRANSACTIONS) {
            Ok(value) => value,
            Err(ConfigError::Missing { .. }) => true,
            Err(e) => return Err(e),
        };
        Ok(Self::new(provider, use_transactions))
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether contexts commit or roll back before releasing
    #[must_use]
    pub const fn use_transactions(&self) -> bool {
        self.use_transactions
    }

    /// The connection provider
    #[must_use]
    pub const fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }
}

impl fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("use_transactions", &self.use_transactions)
            .finish_non_exhaustive()
    }
}

struct State {
    lifecycle: Lifecycle,
    connection: Option<Arc<dyn Connection>>,
    rollback: bool,
    redirect: Option<String>,
    custom_content: bool,
    forum_context: Option<Weak<dyn ForumContext>>,
}

struct ContextInner {
    env: ExecutionEnvironment,
    opened_at: DateTime<Utc>,
    state: RefCell<State>,
}

/// Handle to the execution context of the current unit of work.
///
/// Cheap to clone; every clone refers to the same context. Handles are bound
/// to the thread that opened the context.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Rc<ContextInner>,
}

impl ExecutionContext {
    /// Open a context for the current thread.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AlreadyOpen`] if this thread already has an open
    /// context.
    pub fn open(env: ExecutionEnvironment) -> Result<ContextScope, ContextError> {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                tracing::warn!("Refusing to open a nested execution context");
                return Err(ContextError::AlreadyOpen);
            }

            let opened_at = env.clock.now();
            let inner = Rc::new(ContextInner {
                env,
                opened_at,
                state: RefCell::new(State {
                    lifecycle: Lifecycle::Open,
                    connection: None,
                    rollback: false,
                    redirect: None,
                    custom_content: false,
                    forum_context: None,
                }),
            });
            *slot = Some(Rc::clone(&inner));

            ExecutionMetrics::record_open();
            tracing::debug!(%opened_at, "Execution context opened");

            Ok(ContextScope {
                context: Self { inner },
                closed: false,
            })
        })
    }

    /// The context open on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotOpen`] if there is none.
    pub fn current() -> Result<Self, ContextError> {
        CURRENT.with(|slot| {
            slot.borrow()
                .as_ref()
                .map(|inner| Self {
                    inner: Rc::clone(inner),
                })
                .ok_or(ContextError::NotOpen)
        })
    }

    /// Whether this thread has an open context.
    #[must_use]
    pub fn is_open() -> bool {
        CURRENT.with(|slot| slot.borrow().is_some())
    }

    /// The context's connection, acquiring one on first use.
    ///
    /// Later calls return the same connection. A failed acquire leaves the
    /// context unchanged, so the caller may try again.
    ///
    /// # Errors
    ///
    /// - [`ContextError::IllegalState`]: the context is closed
    /// - [`ContextError::Connection`]: the provider could not hand out a connection
    pub fn connection(&self) -> Result<Arc<dyn Connection>, ContextError> {
        let mut state = self.inner.state.borrow_mut();

        match state.lifecycle {
            Lifecycle::Closed => Err(ContextError::IllegalState {
                operation: "get a connection",
                lifecycle: Lifecycle::Closed,
            }),
            Lifecycle::Connected => state.connection.clone().ok_or(ContextError::IllegalState {
                operation: "get a connection",
                lifecycle: Lifecycle::Connected,
            }),
            Lifecycle::Open => {
                let connection = self.inner.env.provider.acquire()?;
                state.connection = Some(Arc::clone(&connection));
                state.lifecycle = Lifecycle::Connected;
                tracing::trace!("Execution context acquired a connection");
                Ok(connection)
            }
        }
    }

    /// Mark the unit of work as failed so close rolls back instead of
    /// committing. Cannot be undone.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] if the context is closed.
    pub fn enable_rollback(&self) -> Result<(), ContextError> {
        self.mutate("enable rollback", |state| {
            state.rollback = true;
            tracing::debug!("Rollback enabled for execution context");
        })
    }

    /// Whether close will roll back
    #[must_use]
    pub fn is_rollback_enabled(&self) -> bool {
        self.inner.state.borrow().rollback
    }

    /// Record where the response should redirect to.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] if the context is closed.
    pub fn set_redirect(&self, target: impl Into<String>) -> Result<(), ContextError> {
        let target = target.into();
        self.mutate("set a redirect", |state| state.redirect = Some(target))
    }

    /// The redirect target, if one was set
    #[must_use]
    pub fn redirect_target(&self) -> Option<String> {
        self.inner.state.borrow().redirect.clone()
    }

    /// Record whether the response body is produced by custom code instead of
    /// a template.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] if the context is closed.
    pub fn set_custom_content(&self, custom: bool) -> Result<(), ContextError> {
        self.mutate("set custom content", |state| state.custom_content = custom)
    }

    /// Whether the response uses custom content
    #[must_use]
    pub fn is_custom_content(&self) -> bool {
        self.inner.state.borrow().custom_content
    }

    /// Attach the web layer's request context. Only a weak reference is kept.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] if the context is closed.
    pub fn set_forum_context(&self, context: &Arc<dyn ForumContext>) -> Result<(), ContextError> {
        let weak = Arc::downgrade(context);
        self.mutate("set the forum context", |state| {
            state.forum_context = Some(weak);
        })
    }

    /// The attached request context, if it is still alive
    #[must_use]
    pub fn forum_context(&self) -> Option<Arc<dyn ForumContext>> {
        self.inner
            .state
            .borrow()
            .forum_context
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.borrow().lifecycle
    }

    /// When the context was opened
    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    fn mutate(&self, operation: &'static str, f: impl FnOnce(&mut State)) -> Result<(), ContextError> {
        let mut state = self.inner.state.borrow_mut();
        if state.lifecycle == Lifecycle::Closed {
            return Err(ContextError::IllegalState {
                operation,
                lifecycle: Lifecycle::Closed,
            });
        }
        f(&mut state);
        Ok(())
    }

    fn close(&self) -> CloseOutcome {
        let (connection, rollback) = {
            let mut state = self.inner.state.borrow_mut();
            if state.lifecycle == Lifecycle::Closed {
                return CloseOutcome::Idle;
            }
            state.lifecycle = Lifecycle::Closed;
            state.forum_context = None;
            (state.connection.take(), state.rollback)
        };

        self.detach_from_thread();

        if std::thread::panicking() {
            tracing::warn!(rollback, "Closing execution context while panicking");
        }

        let outcome = match connection {
            None => CloseOutcome::Idle,
            Some(connection) => {
                let transaction = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.finish_transaction(connection.as_ref(), rollback)
                }))
                .unwrap_or_else(|_| {
                    let step = if rollback { "rollback" } else { "commit" };
                    ExecutionMetrics::record_close_failure(step);
                    tracing::error!(step, "Connection panicked while ending the transaction");
                    TransactionOutcome::Failed
                });

                if let Err(error) = self.inner.env.provider.release(connection) {
                    ExecutionMetrics::record_close_failure("release");
                    tracing::error!(%error, "Failed to release connection");
                }

                CloseOutcome::Released { transaction }
            }
        };

        let elapsed = (self.inner.env.clock.now() - self.inner.opened_at)
            .to_std()
            .unwrap_or_default();
        ExecutionMetrics::record_duration(elapsed);
        tracing::debug!(?outcome, ?elapsed, "Execution context closed");

        outcome
    }

    fn finish_transaction(&self, connection: &dyn Connection, rollback: bool) -> TransactionOutcome {
        if !self.inner.env.use_transactions {
            return TransactionOutcome::Skipped;
        }

        if rollback {
            match connection.rollback() {
                Ok(()) => {
                    ExecutionMetrics::record_rollback();
                    TransactionOutcome::RolledBack
                }
                Err(error) => {
                    ExecutionMetrics::record_close_failure("rollback");
                    tracing::error!(%error, "Failed to roll back transaction");
                    TransactionOutcome::Failed
                }
            }
        } else {
            match connection.commit() {
                Ok(()) => {
                    ExecutionMetrics::record_commit();
                    TransactionOutcome::Committed
                }
                Err(error) => {
                    ExecutionMetrics::record_close_failure("commit");
                    tracing::error!(%error, "Failed to commit transaction");
                    TransactionOutcome::Failed
                }
            }
        }
    }

    fn detach_from_thread(&self) {
        // The slot is gone if the thread is already tearing down its locals.
        let _ = CURRENT.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot
                .as_ref()
                .is_some_and(|current| Rc::ptr_eq(current, &self.inner))
            {
                *slot = None;
            }
        });
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("ExecutionContext")
            .field("lifecycle", &state.lifecycle)
            .field("rollback", &state.rollback)
            .field("redirect", &state.redirect)
            .field("custom_content", &state.custom_content)
            .field("opened_at", &self.inner.opened_at)
            .finish_non_exhaustive()
    }
}

/// Guard owning an open [`ExecutionContext`].
///
/// Dereferences to the context. Closing happens exactly once: through
/// [`close`](Self::close) or when the guard is dropped.
#[must_use = "dropping the scope closes the execution context immediately"]
pub struct ContextScope {
    context: ExecutionContext,
    closed: bool,
}

impl ContextScope {
    /// A handle to the context, usable after the scope ends to observe state.
    #[must_use]
    pub fn handle(&self) -> ExecutionContext {
        self.context.clone()
    }

    /// Close now and report what happened.
    pub fn close(mut self) -> CloseOutcome {
        self.closed = true;
        self.context.close()
    }
}

impl Deref for ContextScope {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.context.close();
        }
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("context", &self.context)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use agora_testing::{Call, TrackingConnectionProvider, test_clock};

    fn env(provider: &Arc<TrackingConnectionProvider>) -> ExecutionEnvironment {
        ExecutionEnvironment::new(provider.clone(), true).with_clock(Arc::new(test_clock()))
    }

    #[test]
    fn test_open_registers_thread_local() {
        let provider = Arc::new(TrackingConnectionProvider::new());

        assert!(!ExecutionContext::is_open());
        let scope = ExecutionContext::open(env(&provider)).unwrap();
        assert!(ExecutionContext::is_open());
        assert_eq!(scope.opened_at(), test_clock().now());

        drop(scope);
        assert!(!ExecutionContext::is_open());
        assert_eq!(ExecutionContext::current().err(), Some(ContextError::NotOpen));
    }

    #[test]
    fn test_explicit_close_reports_outcome_once() {
        let provider = Arc::new(TrackingConnectionProvider::new());
        let scope = ExecutionContext::open(env(&provider)).unwrap();
        scope.connection().unwrap();

        let outcome = scope.close();

        assert_eq!(
            outcome,
            CloseOutcome::Released {
                transaction: TransactionOutcome::Committed
            }
        );
        assert_eq!(provider.release_count(), 1);
        assert_eq!(
            provider.calls(),
            vec![Call::Acquire, Call::Commit, Call::Close, Call::Release]
        );
    }

    #[test]
    fn test_failed_acquire_leaves_context_open() {
        let provider = Arc::new(
            TrackingConnectionProvider::new().failing_acquire(ConnectionError::Exhausted),
        );
        let scope = ExecutionContext::open(env(&provider)).unwrap();

        assert_eq!(
            scope.connection().err(),
            Some(ContextError::Connection(ConnectionError::Exhausted))
        );
        assert_eq!(scope.lifecycle(), Lifecycle::Open);
        assert_eq!(scope.close(), CloseOutcome::Idle);
        assert_eq!(provider.release_count(), 0);
    }

    #[test]
    fn test_forum_context_is_weak() {
        struct Request;
        impl ForumContext for Request {
            fn encode_url(&self, url: &str) -> String {
                url.to_string()
            }
            fn is_bot(&self) -> bool {
                false
            }
            fn request_uri(&self) -> Option<String> {
                Some("/forums/list.page".to_string())
            }
        }

        let provider = Arc::new(TrackingConnectionProvider::new());
        let scope = ExecutionContext::open(env(&provider)).unwrap();
        let request: Arc<dyn ForumContext> = Arc::new(Request);

        scope.set_forum_context(&request).unwrap();
        assert_eq!(
            scope.forum_context().unwrap().request_uri().as_deref(),
            Some("/forums/list.page")
        );

        drop(request);
        assert!(scope.forum_context().is_none());
    }

    #[test]
    fn test_lifecycle_display() {
        let err = ContextError::IllegalState {
            operation: "enable rollback",
            lifecycle: Lifecycle::Closed,
        };
        assert_eq!(err.to_string(), "Cannot enable rollback on a closed execution context");
    }
}
