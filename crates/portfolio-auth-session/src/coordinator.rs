//! Session coordinator: the only writer to the session store.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::FutureExt;
use portfolio_auth_core::{
    AuthError, AuthResponse, IdentityProvider, Operation, OperationResult, ProfileMetadata,
    ProviderError, SessionState, SessionStore, SessionView,
};

use crate::{config::CoordinatorConfig, notifications::Listener};

/// Session coordinator driving every transition of the session store.
///
/// Startup, user-initiated operations and provider notifications all end in
/// a single commit. Failures of any kind are normalized into the state's
/// `error` field and the returned [`OperationResult`]; nothing here returns
/// an `Err` to the caller.
pub struct SessionCoordinator<P>
where
    P: IdentityProvider,
{
    provider: P,
    store: Arc<SessionStore>,
    config: CoordinatorConfig,
    // Count of provider notifications applied so far.
    generation: Arc<AtomicU64>,
    initialized: AtomicBool,
    listener: Mutex<Option<Listener>>,
}

impl<P> SessionCoordinator<P>
where
    P: IdentityProvider,
{
    /// Create a coordinator; the store starts out loading with nobody
    /// signed in.
    #[must_use]
    pub fn new(provider: P, config: CoordinatorConfig) -> Self {
        let store = Arc::new(SessionStore::with_capacity(config.state_channel_capacity));
        store.commit(SessionState::initializing());

        Self {
            provider,
            store,
            config,
            generation: Arc::new(AtomicU64::new(0)),
            initialized: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Create and initialize a coordinator.
    pub async fn start(provider: P, config: CoordinatorConfig) -> Self {
        let coordinator = Self::new(provider, config);
        coordinator.initialize().await;
        coordinator
    }

    /// Fetch the current session, then apply provider notifications.
    ///
    /// Runs once; later calls are ignored. The listener is started whatever
    /// the fetch outcome. If this future is dropped before it finishes, the
    /// subscription is released and a later call starts over.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            tracing::warn!("session coordinator already initialized");
            return;
        }

        let mut attempt = InitAttempt {
            initialized: &self.initialized,
            finished: false,
        };

        // Changes pushed during the fetch are buffered until the listener
        // starts, so they are applied after the initial state.
        let subscription = self.provider.on_auth_state_change();

        let pending = PendingOperation::new(&self.store, None, &self.generation, 0, false);
        match guarded(self.provider.get_current_session()).await {
            Ok(session) => {
                tracing::debug!(signed_in = session.is_some(), "initial session loaded");
                pending.settle(|_| SessionState::from_session(session));
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to get initial session");
                let message = AuthError::Initialization.to_string();
                pending.settle(|_| SessionState::signed_out().with_error(message));
            }
        }

        let listener = Listener::spawn(
            Arc::clone(&self.store),
            subscription,
            Arc::clone(&self.generation),
        );
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener);
        if let Some(previous) = previous {
            previous.abort();
        }
        attempt.finished = true;
    }

    /// Register a new account.
    ///
    /// Success means the provider accepted the request; the signed-in state
    /// arrives later through the notification path.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<ProfileMetadata>,
    ) -> OperationResult {
        let pending = self.begin(Operation::SignUp);
        let result = guarded(self.provider.sign_up(email, password, metadata)).await;
        Self::settle_auth(Operation::SignUp, pending, result)
    }

    /// Sign in with email and password.
    ///
    /// As with [`sign_up`](Self::sign_up), the identity itself is committed
    /// when the provider's notification is applied.
    pub async fn sign_in(&self, email: &str, password: &str) -> OperationResult {
        let pending = self.begin(Operation::SignIn);
        let result = guarded(self.provider.sign_in_with_password(email, password)).await;
        Self::settle_auth(Operation::SignIn, pending, result)
    }

    /// Sign out. The signed-out state arrives through the notification path.
    pub async fn sign_out(&self) -> OperationResult {
        let pending = self.begin(Operation::SignOut);
        match guarded(self.provider.sign_out()).await {
            Ok(()) => {
                pending.settle(|s| s.clone().with_loading(false));
                OperationResult::ok()
            }
            Err(e) => Self::fail(Operation::SignOut, pending, &e),
        }
    }

    /// Re-fetch the current session and commit it directly.
    pub async fn refresh_session(&self) -> OperationResult {
        let pending = self.begin(Operation::Refresh);
        match guarded(self.provider.get_current_session()).await {
            Ok(session) => {
                pending.settle(|_| SessionState::from_session(session));
                OperationResult::ok()
            }
            Err(e) => Self::fail(Operation::Refresh, pending, &e),
        }
    }

    /// Clear the current error. No-op, without notification, if there is none.
    pub fn clear_error(&self) {
        self.store
            .update(|s| s.error().is_some().then(|| s.clone().without_error()));
    }

    /// Latest committed state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.store.read()
    }

    /// Read-only handle on the store for UI consumers.
    #[must_use]
    pub fn view(&self) -> SessionView {
        self.store.view()
    }

    /// The identity provider this coordinator drives.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Stop applying provider notifications and release the subscription.
    ///
    /// Idempotent; also happens, without waiting, when the coordinator is
    /// dropped.
    pub async fn shutdown(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.stop().await;
            tracing::debug!("session coordinator shut down");
        }
    }

    fn begin(&self, operation: Operation) -> PendingOperation<'_> {
        tracing::debug!(%operation, "operation started");
        let mut started_at = 0;
        self.store.update(|s| {
            started_at = self.generation.load(Ordering::SeqCst);
            Some(s.clone().with_loading(true).without_error())
        });
        PendingOperation::new(
            &self.store,
            Some(operation),
            &self.generation,
            started_at,
            self.config.reject_stale_results,
        )
    }

    fn settle_auth(
        operation: Operation,
        pending: PendingOperation<'_>,
        result: Result<AuthResponse, ProviderError>,
    ) -> OperationResult {
        match result {
            Ok(AuthResponse {
                identity: Some(identity),
                session,
            }) => {
                tracing::debug!(
                    %operation,
                    email = %identity.email,
                    has_session = session.is_some(),
                    "operation accepted"
                );
                pending.settle(|s| s.clone().with_loading(false));
                OperationResult::ok()
            }
            Ok(AuthResponse { identity: None, .. }) => {
                let err = AuthError::NoPrincipal { operation };
                tracing::warn!(%operation, "provider returned no user");
                Self::settle_error(pending, &err)
            }
            Err(e) => Self::fail(operation, pending, &e),
        }
    }

    fn fail(
        operation: Operation,
        pending: PendingOperation<'_>,
        err: &ProviderError,
    ) -> OperationResult {
        match err {
            ProviderError::Rejected { .. } => {
                tracing::warn!(%operation, error = %err, "provider rejected operation");
            }
            ProviderError::Unexpected(_) => {
                tracing::error!(%operation, error = %err, "operation failed unexpectedly");
            }
        }
        Self::settle_error(pending, &AuthError::from_provider(operation, err))
    }

    fn settle_error(pending: PendingOperation<'_>, err: &AuthError) -> OperationResult {
        let message = err.to_string();
        pending.settle(|s| s.clone().with_loading(false).with_error(message.clone()));
        OperationResult::failed(message)
    }
}

impl<P> Drop for SessionCoordinator<P>
where
    P: IdentityProvider,
{
    fn drop(&mut self) {
        let listener = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

/// An outstanding initialization or user-initiated operation.
///
/// Settling commits its terminating state. If it is dropped unsettled
/// (cancelled future, panic), `loading` is still reset.
struct PendingOperation<'a> {
    store: &'a SessionStore,
    operation: Option<Operation>,
    generation: &'a AtomicU64,
    started_at: u64,
    reject_stale: bool,
    settled: bool,
}

impl<'a> PendingOperation<'a> {
    fn new(
        store: &'a SessionStore,
        operation: Option<Operation>,
        generation: &'a AtomicU64,
        started_at: u64,
        reject_stale: bool,
    ) -> Self {
        Self {
            store,
            operation,
            generation,
            started_at,
            reject_stale,
            settled: false,
        }
    }

    /// Must be called inside a store commit, where the listener bumps
    /// `generation` too.
    fn is_stale(&self) -> bool {
        self.reject_stale && self.generation.load(Ordering::SeqCst) != self.started_at
    }

    fn settle<F>(mut self, next: F)
    where
        F: FnOnce(&SessionState) -> SessionState,
    {
        self.settled = true;
        let committed = self
            .store
            .update(|s| (!self.is_stale()).then(|| next(s)));
        match (committed, self.operation) {
            (None, _) => tracing::debug!(
                operation = ?self.operation,
                "notification applied meanwhile, skipping stale commit"
            ),
            (Some(_), Some(operation)) => tracing::debug!(%operation, "operation finished"),
            (Some(_), None) => {}
        }
    }
}

impl Drop for PendingOperation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::debug!(operation = ?self.operation, "operation abandoned, resetting loading");
        self.store
            .update(|s| s.is_loading().then(|| s.clone().with_loading(false)));
    }
}

/// Clears the once-flag of an `initialize` call dropped before finishing.
struct InitAttempt<'a> {
    initialized: &'a AtomicBool,
    finished: bool,
}

impl Drop for InitAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("initialization abandoned, next call starts over");
            self.initialized.store(false, Ordering::SeqCst);
        }
    }
}

/// Run a provider call, turning a panic into an unexpected failure.
async fn guarded<T, F>(call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ProviderError::Unexpected(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "provider panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(boxed.as_ref()), "owned boom");

        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "provider panicked");
    }

    #[test]
    fn test_abandoned_operation_resets_loading() {
        let store = SessionStore::new();
        let generation = AtomicU64::new(0);
        store.commit(SessionState::signed_out().with_loading(true));

        let pending = PendingOperation::new(&store, Some(Operation::SignIn), &generation, 0, false);
        drop(pending);

        assert!(!store.read().is_loading());
    }

    #[test]
    fn test_stale_settle_is_skipped_when_fenced() {
        let store = SessionStore::new();
        let generation = AtomicU64::new(0);
        store.commit(SessionState::signed_out().with_loading(true));

        let pending = PendingOperation::new(&store, Some(Operation::SignIn), &generation, 0, true);
        generation.fetch_add(1, Ordering::SeqCst);
        store.commit(SessionState::signed_out());
        let before = store.revision();

        pending.settle(|s| s.clone().with_error("sign in failed"));

        assert_eq!(store.revision(), before);
        assert!(store.read().error().is_none());
    }

    #[tokio::test]
    async fn test_guarded_contains_panic() {
        let result: Result<(), ProviderError> = guarded(async { panic!("provider blew up") }).await;
        assert!(matches!(
            result,
            Err(ProviderError::Unexpected(message)) if message == "provider blew up"
        ));
    }
}
