//! Integration tests for the execution context close protocol.
//!
//! Every test runs against a `TrackingConnectionProvider`, which records each
//! acquire, commit, rollback, close and release in order.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use agora_core::capability::ForumContext;
use agora_core::connection::{
    Connection, ConnectionError, ConnectionProvider, ConnectionProviderSlot,
};
use agora_core::settings::{ConfigError, Settings, keys};
use agora_runtime::execution::{
    CloseOutcome, ContextError, ExecutionContext, ExecutionEnvironment, Lifecycle,
    TransactionOutcome,
};
use agora_testing::{Call, ProviderSwap, TrackingConnectionProvider, init_test_tracing, test_clock};
use proptest::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn tracked() -> (Arc<TrackingConnectionProvider>, ExecutionEnvironment) {
    tracked_with(TrackingConnectionProvider::new(), true)
}

fn tracked_with(
    provider: TrackingConnectionProvider,
    use_transactions: bool,
) -> (Arc<TrackingConnectionProvider>, ExecutionEnvironment) {
    init_test_tracing();
    let provider = Arc::new(provider);
    let env = ExecutionEnvironment::new(provider.clone(), use_transactions)
        .with_clock(Arc::new(test_clock()));
    (provider, env)
}

#[derive(Debug, PartialEq, Eq)]
struct Boom;

struct Request;

impl ForumContext for Request {
    fn encode_url(&self, url: &str) -> String {
        url.to_string()
    }

    fn is_bot(&self) -> bool {
        false
    }

    fn request_uri(&self) -> Option<String> {
        None
    }
}

/// Connection whose `commit` and `rollback` panic.
#[derive(Default)]
struct PanickingConnection {
    closed: AtomicBool,
}

impl Connection for PanickingConnection {
    fn commit(&self) -> Result<(), ConnectionError> {
        panic!("driver bug in commit");
    }

    fn rollback(&self) -> Result<(), ConnectionError> {
        panic!("driver bug in rollback");
    }

    fn close(&self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct PanickingProvider {
    releases: AtomicUsize,
}

impl ConnectionProvider for PanickingProvider {
    fn acquire(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        Ok(Arc::new(PanickingConnection::default()))
    }

    fn release(&self, connection: Arc<dyn Connection>) -> Result<(), ConnectionError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        connection.close()
    }

    fn shutdown_all(&self) {}
}

impl From<ContextError> for Boom {
    fn from(_: ContextError) -> Self {
        Self
    }
}

#[test]
fn test_commit_path_commits_then_releases() {
    let (provider, env) = tracked();

    {
        let scope = ExecutionContext::open(env).unwrap();
        scope.connection().unwrap();
    }

    assert_eq!(provider.commit_count(), 1);
    assert_eq!(provider.rollback_count(), 0);
    assert_eq!(provider.release_count(), 1);
    assert_eq!(
        provider.calls(),
        vec![Call::Acquire, Call::Commit, Call::Close, Call::Release]
    );
}

#[test]
fn test_rollback_path_on_error_return() {
    fn failing_work(env: ExecutionEnvironment) -> Result<(), Boom> {
        let scope = ExecutionContext::open(env)?;
        scope.connection()?;
        scope.enable_rollback()?;
        Err(Boom)
    }

    let (provider, env) = tracked();

    assert_eq!(failing_work(env), Err(Boom));

    assert_eq!(provider.rollback_count(), 1);
    assert_eq!(provider.commit_count(), 0);
    assert_eq!(provider.release_count(), 1);
    assert_eq!(
        provider.calls(),
        vec![Call::Acquire, Call::Rollback, Call::Close, Call::Release]
    );
}

#[test]
fn test_rollback_path_on_panic() {
    let (provider, env) = tracked();

    let result = catch_unwind(AssertUnwindSafe(|| {
        let scope = ExecutionContext::open(env).unwrap();
        scope.connection().unwrap();
        scope.enable_rollback().unwrap();
        if scope.is_rollback_enabled() {
            panic!("boom");
        }
    }));

    let payload = result.err().unwrap();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    assert_eq!(provider.rollback_count(), 1);
    assert_eq!(provider.release_count(), 1);
    assert!(!ExecutionContext::is_open());
}

#[test]
fn test_scope_without_connection_touches_nothing() {
    let (provider, env) = tracked();

    let scope = ExecutionContext::open(env).unwrap();
    scope.set_redirect("/forums/list.page").unwrap();
    scope.enable_rollback().unwrap();

    assert_eq!(scope.close(), CloseOutcome::Idle);
    assert_eq!(provider.acquire_count(), 0);
    assert_eq!(provider.release_count(), 0);
    assert!(provider.calls().is_empty());
}

#[test]
fn test_mutations_after_close_are_illegal() {
    let (_provider, env) = tracked();

    let scope = ExecutionContext::open(env).unwrap();
    let handle = scope.handle();
    drop(scope);

    assert_eq!(handle.lifecycle(), Lifecycle::Closed);

    let illegal = |result: Result<(), ContextError>| {
        matches!(
            result,
            Err(ContextError::IllegalState {
                lifecycle: Lifecycle::Closed,
                ..
            })
        )
    };

    assert!(illegal(handle.enable_rollback()));
    assert!(illegal(handle.set_redirect("/x")));
    assert!(illegal(handle.set_custom_content(true)));
    assert!(illegal(handle.connection().map(|_| ())));

    let request: Arc<dyn ForumContext> = Arc::new(Request);
    assert!(illegal(handle.set_forum_context(&request)));
}

#[test]
fn test_state_is_visible_through_current() {
    let (_provider, env) = tracked();
    let scope = ExecutionContext::open(env).unwrap();

    {
        let current = ExecutionContext::current().unwrap();
        current.set_redirect("/posts/list/3.page").unwrap();
        current.set_custom_content(true).unwrap();
    }

    assert_eq!(scope.redirect_target().as_deref(), Some("/posts/list/3.page"));
    assert!(scope.is_custom_content());
    assert!(!scope.is_rollback_enabled());
}

#[test]
fn test_nested_open_is_rejected() {
    let (_provider, env) = tracked();

    let outer = ExecutionContext::open(env.clone()).unwrap();
    assert_eq!(
        ExecutionContext::open(env.clone()).err(),
        Some(ContextError::AlreadyOpen)
    );
    assert_eq!(outer.lifecycle(), Lifecycle::Open);

    drop(outer);
    let again = ExecutionContext::open(env).unwrap();
    assert_eq!(again.lifecycle(), Lifecycle::Open);
}

#[test]
fn test_thread_local_cleared_between_units_of_work() {
    let (_provider, env) = tracked();

    let first = ExecutionContext::open(env.clone()).unwrap();
    first.set_redirect("/stale").unwrap();
    first.close();

    assert_eq!(
        ExecutionContext::current().err(),
        Some(ContextError::NotOpen)
    );

    let second = ExecutionContext::open(env).unwrap();
    assert_eq!(second.redirect_target(), None);
}

#[test]
fn test_contexts_are_per_thread() {
    let (_provider, env) = tracked();
    let _scope = ExecutionContext::open(env).unwrap();

    let other_thread_sees_context = std::thread::spawn(ExecutionContext::is_open)
        .join()
        .unwrap();

    assert!(!other_thread_sees_context);
    assert!(ExecutionContext::is_open());
}

#[test]
fn test_commit_failure_still_releases() {
    let (provider, env) = tracked_with(TrackingConnectionProvider::new().failing_commit(), true);

    let scope = ExecutionContext::open(env).unwrap();
    scope.connection().unwrap();

    assert_eq!(
        scope.close(),
        CloseOutcome::Released {
            transaction: TransactionOutcome::Failed
        }
    );
    assert_eq!(provider.commit_count(), 1);
    assert_eq!(provider.release_count(), 1);
}

#[test]
fn test_rollback_failure_still_releases() {
    let (provider, env) = tracked_with(TrackingConnectionProvider::new().failing_rollback(), true);

    let scope = ExecutionContext::open(env).unwrap();
    scope.connection().unwrap();
    scope.enable_rollback().unwrap();

    assert_eq!(
        scope.close(),
        CloseOutcome::Released {
            transaction: TransactionOutcome::Failed
        }
    );
    assert_eq!(provider.rollback_count(), 1);
    assert_eq!(provider.release_count(), 1);
}

#[test]
fn test_release_failure_is_not_propagated() {
    let (provider, env) = tracked_with(TrackingConnectionProvider::new().failing_release(), true);

    let scope = ExecutionContext::open(env).unwrap();
    scope.connection().unwrap();

    assert_eq!(
        scope.close(),
        CloseOutcome::Released {
            transaction: TransactionOutcome::Committed
        }
    );
    assert_eq!(provider.release_count(), 1);
    assert!(!ExecutionContext::is_open());
}

#[test]
fn test_panicking_commit_still_releases() {
    init_test_tracing();
    let provider = Arc::new(PanickingProvider::default());
    let env = ExecutionEnvironment::new(provider.clone(), true);

    let scope = ExecutionContext::open(env).unwrap();
    let connection = scope.connection().unwrap();

    assert_eq!(
        scope.close(),
        CloseOutcome::Released {
            transaction: TransactionOutcome::Failed
        }
    );
    assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
    assert!(connection.is_closed());
    assert!(!ExecutionContext::is_open());
}

#[test]
fn test_panicking_rollback_still_releases() {
    init_test_tracing();
    let provider = Arc::new(PanickingProvider::default());
    let env = ExecutionEnvironment::new(provider.clone(), true);

    let scope = ExecutionContext::open(env).unwrap();
    scope.connection().unwrap();
    scope.enable_rollback().unwrap();
    drop(scope);

    assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
    assert!(!ExecutionContext::is_open());
}

#[test]
fn test_disabled_transactions_skip_commit_and_rollback() {
    let (provider, env) = tracked_with(TrackingConnectionProvider::new(), false);

    let scope = ExecutionContext::open(env).unwrap();
    scope.connection().unwrap();
    scope.enable_rollback().unwrap();

    assert_eq!(
        scope.close(),
        CloseOutcome::Released {
            transaction: TransactionOutcome::Skipped
        }
    );
    assert_eq!(provider.commit_count(), 0);
    assert_eq!(provider.rollback_count(), 0);
    assert_eq!(provider.release_count(), 1);
}

#[test]
fn test_acquire_failure_propagates_unwrapped() {
    let (provider, env) = tracked_with(
        TrackingConnectionProvider::new().failing_acquire(ConnectionError::Unreachable(
            "connection refused".to_string(),
        )),
        true,
    );

    let scope = ExecutionContext::open(env).unwrap();
    let err = scope.connection().err().unwrap();

    assert_eq!(
        err,
        ContextError::Connection(ConnectionError::Unreachable("connection refused".to_string()))
    );
    assert_eq!(scope.lifecycle(), Lifecycle::Open);
    drop(scope);
    assert_eq!(provider.release_count(), 0);
}

#[test]
fn test_tracking_double_swaps_into_provider_slot() {
    init_test_tracing();
    let production = Arc::new(TrackingConnectionProvider::new());
    let slot = Arc::new(ConnectionProviderSlot::new(production.clone()));
    let env = ExecutionEnvironment::new(slot.clone(), true);

    {
        let double = Arc::new(TrackingConnectionProvider::new());
        let _swap = ProviderSwap::install(&slot, double.clone());

        let scope = ExecutionContext::open(env.clone()).unwrap();
        scope.connection().unwrap();
        drop(scope);

        assert_eq!(double.commit_count(), 1);
        assert_eq!(double.release_count(), 1);
    }

    let scope = ExecutionContext::open(env.clone()).unwrap();
    scope.connection().unwrap();
    drop(scope);

    assert_eq!(production.acquire_count(), 1);
    assert_eq!(production.release_count(), 1);
    env.provider().shutdown_all();
    assert_eq!(production.shutdown_count(), 1);
}

#[test]
fn test_environment_from_settings() {
    let provider: Arc<dyn ConnectionProvider> = Arc::new(TrackingConnectionProvider::new());

    let unset = ExecutionEnvironment::from_settings(provider.clone(), &Settings::new()).unwrap();
    assert!(unset.use_transactions());

    let disabled = ExecutionEnvironment::from_settings(
        provider.clone(),
        &Settings::from_pairs([(keys::DATABASE_USE_TRANSACTIONS, "FALSE")]),
    )
    .unwrap();
    assert!(!disabled.use_transactions());

    let invalid = ExecutionEnvironment::from_settings(
        provider,
        &Settings::from_pairs([(keys::DATABASE_USE_TRANSACTIONS, "sometimes")]),
    );
    assert!(matches!(invalid, Err(ConfigError::Invalid { .. })));
}

proptest! {
    #[test]
    fn prop_repeated_connection_calls_acquire_and_release_once(calls in 1usize..25, rollback in any::<bool>()) {
        let (provider, env) = tracked();

        {
            let scope = ExecutionContext::open(env).unwrap();
            let first = scope.connection().unwrap();
            for _ in 1..calls {
                let again = scope.connection().unwrap();
                prop_assert!(Arc::ptr_eq(&first, &again));
            }
            if rollback {
                scope.enable_rollback().unwrap();
            }
        }

        prop_assert_eq!(provider.acquire_count(), 1);
        prop_assert_eq!(provider.release_count(), 1);
        prop_assert_eq!(provider.commit_count(), usize::from(!rollback));
        prop_assert_eq!(provider.rollback_count(), usize::from(rollback));
    }

    #[test]
    fn prop_scopes_without_connection_never_touch_provider(
        redirects in prop::collection::vec("/[a-z]{1,12}\\.page", 0..5),
        rollback in any::<bool>(),
    ) {
        let (provider, env) = tracked();

        {
            let scope = ExecutionContext::open(env).unwrap();
            for redirect in &redirects {
                scope.set_redirect(redirect.clone()).unwrap();
            }
            if rollback {
                scope.enable_rollback().unwrap();
            }
        }

        prop_assert_eq!(provider.acquire_count(), 0);
        prop_assert_eq!(provider.release_count(), 0);
    }
}
