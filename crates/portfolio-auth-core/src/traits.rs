//! The identity-provider capability consumed by the coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::ProviderError,
    model::{AuthChange, Identity, ProfileMetadata, Session},
};

/// Result of a sign-up or sign-in call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthResponse {
    /// The principal, when the provider returned one.
    pub identity: Option<Identity>,
    /// The new session; absent e.g. while email confirmation is pending.
    pub session: Option<Session>,
}

impl AuthResponse {
    /// Response for a fully signed-in principal.
    #[must_use]
    pub fn signed_in(session: Session) -> Self {
        Self {
            identity: Some(session.identity.clone()),
            session: Some(session),
        }
    }
}

/// Trait for identity-provider clients.
///
/// Implementations own transport, token storage and verification. Every
/// method is a suspension point for the coordinator; none of them is expected
/// to touch session state directly.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Register a new principal.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<ProfileMetadata>,
    ) -> Result<AuthResponse, ProviderError>;

    /// Authenticate with email and password.
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ProviderError>;

    /// End the current session.
    async fn sign_out(&self) -> Result<(), ProviderError>;

    /// Fetch the current session, `None` when signed out.
    async fn get_current_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Register for provider-pushed auth changes.
    fn on_auth_state_change(&self) -> AuthSubscription;
}

#[async_trait]
impl<T> IdentityProvider for Arc<T>
where
    T: IdentityProvider + ?Sized,
{
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<ProfileMetadata>,
    ) -> Result<AuthResponse, ProviderError> {
        (**self).sign_up(email, password, metadata).await
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ProviderError> {
        (**self).sign_in_with_password(email, password).await
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        (**self).sign_out().await
    }

    async fn get_current_session(&self) -> Result<Option<Session>, ProviderError> {
        (**self).get_current_session().await
    }

    fn on_auth_state_change(&self) -> AuthSubscription {
        (**self).on_auth_state_change()
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Handle on a provider notification stream.
///
/// Changes arrive as discrete messages on a channel. Releasing the handle
/// (explicitly or by dropping it) runs the provider's release action exactly
/// once; later calls are no-ops.
pub struct AuthSubscription {
    changes: mpsc::UnboundedReceiver<AuthChange>,
    release: Option<ReleaseFn>,
    released: bool,
}

impl AuthSubscription {
    /// Create a subscription with a release action.
    #[must_use]
    pub fn new(
        changes: mpsc::UnboundedReceiver<AuthChange>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            changes,
            release: Some(Box::new(release)),
            released: false,
        }
    }

    /// Create a subscription whose release only closes the channel.
    #[must_use]
    pub const fn detached(changes: mpsc::UnboundedReceiver<AuthChange>) -> Self {
        Self {
            changes,
            release: None,
            released: false,
        }
    }

    /// Receive the next change.
    ///
    /// Returns `None` once released or when the provider hangs up.
    pub async fn recv(&mut self) -> Option<AuthChange> {
        if self.released {
            return None;
        }
        self.changes.recv().await
    }

    /// Take an already-delivered change without waiting.
    pub fn try_recv(&mut self) -> Option<AuthChange> {
        if self.released {
            return None;
        }
        self.changes.try_recv().ok()
    }

    /// Release the subscription. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.changes.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Whether [`release`](Self::release) has run.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for AuthSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AuthSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSubscription")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::model::AuthChangeEvent;

    #[tokio::test]
    async fn test_release_runs_once() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut sub = AuthSubscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.release();
        sub.release();
        drop(sub);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        drop(AuthSubscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recv_stops_after_release() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = AuthSubscription::detached(rx);

        tx.send(AuthChange::new(AuthChangeEvent::SignedOut, None)).unwrap();
        let change = sub.recv().await.unwrap();
        assert_eq!(change.event, AuthChangeEvent::SignedOut);

        sub.release();
        assert!(sub.is_released());
        assert!(tx.send(AuthChange::new(AuthChangeEvent::SignedOut, None)).is_err());
        assert!(sub.recv().await.is_none());
    }
}
