//! Tracking connection provider for execution-context tests.
//!
//! Every acquire, commit, rollback, close and release is counted and appended
//! to an ordered call log, so tests can assert both how often and in which
//! order the close protocol touched the connection.

use agora_core::connection::{
    Connection, ConnectionError, ConnectionProvider, ConnectionProviderSlot,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// One recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    /// `ConnectionProvider::acquire`
    Acquire,
    /// `Connection::commit`
    Commit,
    /// `Connection::rollback`
    Rollback,
    /// `Connection::close`
    Close,
    /// `ConnectionProvider::release`
    Release,
    /// `ConnectionProvider::shutdown_all`
    Shutdown,
}

type CallLog = Arc<Mutex<Vec<Call>>>;

fn record(log: &CallLog, call: Call) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(call);
}

/// Which operations should fail.
#[derive(Debug, Clone, Default)]
struct FailurePlan {
    acquire: Option<ConnectionError>,
    commit: bool,
    rollback: bool,
    release: bool,
}

/// Connection handed out by [`TrackingConnectionProvider`].
#[derive(Debug)]
pub struct TrackingConnection {
    id: usize,
    log: CallLog,
    closed: AtomicBool,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_commit: bool,
    fail_rollback: bool,
}

impl TrackingConnection {
    /// Sequence number of this connection, starting at 1
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// How many times `commit` was called
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// How many times `rollback` was called
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

impl Connection for TrackingConnection {
    fn commit(&self) -> Result<(), ConnectionError> {
        record(&self.log, Call::Commit);
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit {
            return Err(ConnectionError::Statement("commit refused".to_string()));
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), ConnectionError> {
        record(&self.log, Call::Rollback);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.fail_rollback {
            return Err(ConnectionError::Statement("rollback refused".to_string()));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), ConnectionError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            record(&self.log, Call::Close);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Deterministic [`ConnectionProvider`] that records everything.
///
/// Each `acquire` hands out a fresh [`TrackingConnection`]; `release` closes it
/// (unless already closed) and counts the release either way.
///
/// # Example
///
/// ```
/// use agora_core::connection::{Connection, ConnectionError, ConnectionProvider};
/// use agora_testing::{Call, TrackingConnectionProvider};
///
/// let provider = TrackingConnectionProvider::new();
/// let connection = provider.acquire().unwrap();
/// connection.commit().unwrap();
/// provider.release(connection).unwrap();
///
/// assert_eq!(provider.calls(), vec![Call::Acquire, Call::Commit, Call::Close, Call::Release]);
///
/// let exhausted = TrackingConnectionProvider::new().failing_acquire(ConnectionError::Exhausted);
/// assert!(exhausted.acquire().is_err());
/// ```
#[derive(Debug, Default)]
pub struct TrackingConnectionProvider {
    log: CallLog,
    acquired: AtomicUsize,
    released: AtomicUsize,
    shutdowns: AtomicUsize,
    connections: Mutex<Vec<Arc<TrackingConnection>>>,
    failures: FailurePlan,
}

impl TrackingConnectionProvider {
    /// Create a provider where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `acquire` fail with `error`.
    #[must_use]
    pub fn failing_acquire(mut self, error: ConnectionError) -> Self {
        self.failures.acquire = Some(error);
        self
    }

    /// Make `commit` fail on every connection handed out.
    #[must_use]
    pub const fn failing_commit(mut self) -> Self {
        self.failures.commit = true;
        self
    }

    /// Make `rollback` fail on every connection handed out.
    #[must_use]
    pub const fn failing_rollback(mut self) -> Self {
        self.failures.rollback = true;
        self
    }

    /// Make `release` report an error (it is still counted).
    #[must_use]
    pub const fn failing_release(mut self) -> Self {
        self.failures.release = true;
        self
    }

    /// Successful and failed `acquire` calls
    #[must_use]
    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// `release` calls
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// `shutdown_all` calls
    #[must_use]
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// `commit` calls across all connections
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.connections().iter().map(|c| c.commit_count()).sum()
    }

    /// `rollback` calls across all connections
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.connections().iter().map(|c| c.rollback_count()).sum()
    }

    /// Connections handed out so far, oldest first
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<TrackingConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every recorded call, in order
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ConnectionProvider for TrackingConnectionProvider {
    fn acquire(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        record(&self.log, Call::Acquire);
        let id = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(error) = &self.failures.acquire {
            return Err(error.clone());
        }

        let connection = Arc::new(TrackingConnection {
            id,
            log: Arc::clone(&self.log),
            closed: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            fail_commit: self.failures.commit,
            fail_rollback: self.failures.rollback,
        });

        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&connection));

        Ok(connection)
    }

    fn release(&self, connection: Arc<dyn Connection>) -> Result<(), ConnectionError> {
        if !connection.is_closed() {
            connection.close()?;
        }
        record(&self.log, Call::Release);
        self.released.fetch_add(1, Ordering::SeqCst);

        if self.failures.release {
            return Err(ConnectionError::Unreachable("release refused".to_string()));
        }
        Ok(())
    }

    fn shutdown_all(&self) {
        record(&self.log, Call::Shutdown);
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Installs a provider into a [`ConnectionProviderSlot`] and puts the previous
/// one back when dropped.
///
/// # Example
///
/// ```
/// use agora_core::connection::{ConnectionProvider, ConnectionProviderSlot};
/// use agora_testing::{ProviderSwap, TrackingConnectionProvider};
/// use std::sync::Arc;
///
/// let production = Arc::new(TrackingConnectionProvider::new());
/// let slot = ConnectionProviderSlot::new(production.clone());
///
/// {
///     let double = Arc::new(TrackingConnectionProvider::new());
///     let _swap = ProviderSwap::install(&slot, double.clone());
///     slot.acquire().unwrap();
///     assert_eq!(double.acquire_count(), 1);
/// }
///
/// slot.acquire().unwrap();
/// assert_eq!(production.acquire_count(), 1);
/// ```
pub struct ProviderSwap<'a> {
    slot: &'a ConnectionProviderSlot,
    previous: Option<Arc<dyn ConnectionProvider>>,
}

impl<'a> ProviderSwap<'a> {
    /// Install `provider`, remembering the one it replaces.
    #[must_use]
    pub fn install(slot: &'a ConnectionProviderSlot, provider: Arc<dyn ConnectionProvider>) -> Self {
        let previous = slot.install(provider);
        Self {
            slot,
            previous: Some(previous),
        }
    }
}

impl Drop for ProviderSwap<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.slot.install(previous);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_release_of_closed_connection_still_counts() {
        let provider = TrackingConnectionProvider::new();
        let connection = provider.acquire().unwrap();
        connection.close().unwrap();

        provider.release(connection).unwrap();

        assert_eq!(provider.release_count(), 1);
        assert_eq!(provider.calls(), vec![Call::Acquire, Call::Close, Call::Release]);
    }

    #[test]
    fn test_connections_are_numbered_in_acquire_order() {
        let provider = TrackingConnectionProvider::new();
        provider.acquire().unwrap();
        provider.acquire().unwrap();

        let ids: Vec<usize> = provider.connections().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_failures_are_reported_but_counted() {
        let provider = TrackingConnectionProvider::new()
            .failing_commit()
            .failing_rollback()
            .failing_release();
        let connection = provider.acquire().unwrap();

        assert!(connection.commit().is_err());
        assert!(connection.rollback().is_err());
        assert!(provider.release(connection).is_err());

        assert_eq!(provider.commit_count(), 1);
        assert_eq!(provider.rollback_count(), 1);
        assert_eq!(provider.release_count(), 1);
    }

    #[test]
    fn test_failing_acquire_hands_out_nothing() {
        let provider =
            TrackingConnectionProvider::new().failing_acquire(ConnectionError::Unreachable("down".into()));

        assert_eq!(
            provider.acquire().err(),
            Some(ConnectionError::Unreachable("down".into()))
        );
        assert_eq!(provider.acquire_count(), 1);
        assert!(provider.connections().is_empty());
    }
}
