//! Provider notification handling.
//!
//! Provider-pushed changes are the authoritative path for identity
//! transitions: a successful sign-in, sign-up or sign-out only becomes
//! visible in the store once its notification is applied here.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use portfolio_auth_core::{AuthChange, AuthChangeEvent, AuthSubscription, SessionState, SessionStore};
use tokio::{sync::oneshot, task::JoinHandle};

/// Commit the state implied by one provider notification.
///
/// Always settles `loading` and clears any error. Sign-out and expiry clear
/// identity and session whatever payload they carry. Returns the new revision.
pub fn apply_change(store: &SessionStore, change: AuthChange) -> u64 {
    store.commit(next_state(change))
}

fn next_state(change: AuthChange) -> SessionState {
    let AuthChange { event, session } = change;
    let session = match event {
        AuthChangeEvent::SignedOut | AuthChangeEvent::SessionExpired => None,
        _ => session,
    };

    tracing::info!(
        %event,
        email = session.as_ref().map(|s| s.identity.email.as_str()),
        "auth state changed"
    );

    SessionState::from_session(session)
}

/// Running receive-loop over a provider subscription.
pub(crate) struct Listener {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Spawn the loop. Each applied change bumps `generation` within its
    /// commit.
    pub(crate) fn spawn(
        store: Arc<SessionStore>,
        mut subscription: AuthSubscription,
        generation: Arc<AtomicU64>,
    ) -> Self {
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    next = subscription.recv() => match next {
                        Some(change) => {
                            let next = next_state(change);
                            // Bumped inside the commit that applies the change.
                            store.update(|_| {
                                generation.fetch_add(1, Ordering::SeqCst);
                                Some(next)
                            });
                        }
                        None => {
                            tracing::debug!("auth change stream closed by provider");
                            break;
                        }
                    },
                }
            }
            subscription.release();
        });

        Self { stop, handle }
    }

    /// Stop the loop and wait until the subscription is released.
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                tracing::error!("auth change listener failed: {e}");
            }
        }
    }

    /// Stop without waiting; the subscription is released when the task is
    /// dropped by the runtime.
    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use portfolio_auth_core::{Identity, ProfileMetadata, Session};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;

    fn session(email: &str) -> Session {
        Session {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "bearer".into(),
            expires_at: i64::MAX,
            identity: Identity {
                id: Uuid::new_v4(),
                email: email.into(),
                metadata: ProfileMetadata::default(),
                created_at: 0,
            },
        }
    }

    #[test]
    fn test_signed_in_commits_session_and_clears_error() {
        let store = SessionStore::new();
        store.commit(SessionState::signed_out().with_error("Invalid credentials"));

        let s = session("a@b.com");
        apply_change(
            &store,
            AuthChange::new(AuthChangeEvent::SignedIn, Some(s.clone())),
        );

        assert_eq!(store.read(), SessionState::signed_in(s));
    }

    #[test]
    fn test_signed_out_clears_identity() {
        let store = SessionStore::new();
        store.commit(SessionState::signed_in(session("a@b.com")).with_loading(true));

        apply_change(&store, AuthChange::new(AuthChangeEvent::SignedOut, None));

        assert_eq!(store.read(), SessionState::signed_out());
    }

    #[test]
    fn test_expired_ignores_stale_payload() {
        let store = SessionStore::new();
        let s = session("a@b.com");
        store.commit(SessionState::signed_in(s.clone()));

        apply_change(&store, AuthChange::new(AuthChangeEvent::SessionExpired, Some(s)));

        assert!(store.read().identity().is_none());
    }

    #[test]
    fn test_token_refresh_replaces_session() {
        let store = SessionStore::new();
        let mut s = session("a@b.com");
        store.commit(SessionState::signed_in(s.clone()));

        s.access_token = "rotated".into();
        apply_change(
            &store,
            AuthChange::new(AuthChangeEvent::TokenRefreshed, Some(s)),
        );

        assert_eq!(store.read().session().map(|s| s.access_token.as_str()), Some("rotated"));
    }

    #[tokio::test]
    async fn test_listener_applies_and_releases() {
        let store = Arc::new(SessionStore::new());
        let view = store.view();
        let generation = Arc::new(AtomicU64::new(0));
        let released = Arc::new(AtomicU64::new(0));

        let (tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&released);
        let subscription = AuthSubscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let listener = Listener::spawn(Arc::clone(&store), subscription, Arc::clone(&generation));

        let s = session("a@b.com");
        tx.send(AuthChange::new(AuthChangeEvent::SignedIn, Some(s.clone())))
            .unwrap();
        let snap = view.wait_for(SessionState::is_signed_in).await.unwrap();
        assert_eq!(snap.state, SessionState::signed_in(s));
        assert_eq!(generation.load(Ordering::SeqCst), 1);

        listener.stop().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(tx.send(AuthChange::new(AuthChangeEvent::SignedOut, None)).is_err());
    }

    #[tokio::test]
    async fn test_listener_ends_when_provider_hangs_up() {
        let store = Arc::new(SessionStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener::spawn(
            store,
            AuthSubscription::detached(rx),
            Arc::new(AtomicU64::new(0)),
        );
        drop(tx);
        listener.stop().await;
    }
}
