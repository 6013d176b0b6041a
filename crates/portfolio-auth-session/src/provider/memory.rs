//! In-memory identity provider.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use portfolio_auth_core::{
    AuthChange, AuthChangeEvent, AuthResponse, AuthSubscription, Identity, IdentityProvider,
    ProfileMetadata, ProviderError, Session,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default session lifetime in seconds.
pub const DEFAULT_SESSION_TTL: i64 = 3600;

const INVALID_CREDENTIALS: &str = "Invalid login credentials";
const ALREADY_REGISTERED: &str = "User already registered";
const EMAIL_NOT_CONFIRMED: &str = "Email not confirmed";

struct UserRecord {
    // Plain text: this provider is for development and tests only.
    password: String,
    identity: Identity,
    confirmed: bool,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    current: Option<Session>,
}

type Listeners = Mutex<Vec<(u64, mpsc::UnboundedSender<AuthChange>)>>;

/// In-memory identity provider.
///
/// Behaves like a hosted provider from the client's point of view: it keeps
/// a user table and one current session, and pushes changes to subscribers.
/// Data is lost on restart.
pub struct MemoryIdentityProvider {
    inner: Mutex<Inner>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    offline: AtomicBool,
    require_confirmation: AtomicBool,
    session_ttl: i64,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn token() -> String {
    Uuid::new_v4().simple().to_string()
}

impl MemoryIdentityProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            require_confirmation: AtomicBool::new(false),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Set the lifetime of newly issued sessions.
    #[must_use]
    pub const fn with_session_ttl(mut self, seconds: i64) -> Self {
        self.session_ttl = seconds;
        self
    }

    /// Start out signed in with `session`; its user is registered too.
    #[must_use]
    pub fn with_session(self, session: Session, password: &str) -> Self {
        {
            let mut inner = lock(&self.inner);
            inner.users.insert(
                normalize_email(&session.identity.email),
                UserRecord {
                    password: password.to_string(),
                    identity: session.identity.clone(),
                    confirmed: true,
                },
            );
            inner.current = Some(session);
        }
        self
    }

    /// Register a confirmed user directly, without signing in.
    pub fn seed_user(
        &self,
        email: &str,
        password: &str,
        metadata: Option<ProfileMetadata>,
    ) -> Identity {
        let identity = Identity {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            metadata: metadata.unwrap_or_default(),
            created_at: now(),
        };
        lock(&self.inner).users.insert(
            identity.email.clone(),
            UserRecord {
                password: password.to_string(),
                identity: identity.clone(),
                confirmed: true,
            },
        );
        identity
    }

    /// Make every call fail as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Require email confirmation before new accounts can sign in.
    pub fn set_email_confirmation(&self, required: bool) {
        self.require_confirmation.store(required, Ordering::SeqCst);
    }

    /// Mark a pending account as confirmed. Returns whether it exists.
    pub fn confirm_email(&self, email: &str) -> bool {
        match lock(&self.inner).users.get_mut(&normalize_email(email)) {
            Some(record) => {
                record.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// The session the provider currently considers active.
    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        lock(&self.inner).current.clone()
    }

    /// Rotate the current session's tokens and push `TOKEN_REFRESHED`.
    pub fn refresh_tokens(&self) -> Option<Session> {
        let refreshed = {
            let mut inner = lock(&self.inner);
            let session = inner.current.as_mut()?;
            session.access_token = token();
            session.refresh_token = token();
            session.expires_at = now() + self.session_ttl;
            session.clone()
        };
        self.emit(AuthChangeEvent::TokenRefreshed, Some(refreshed.clone()));
        Some(refreshed)
    }

    /// Expire the current session and push `SESSION_EXPIRED`.
    pub fn expire_session(&self) {
        if lock(&self.inner).current.take().is_some() {
            self.emit(AuthChangeEvent::SessionExpired, None);
        }
    }

    /// Revoke the current session from elsewhere (another tab, the server)
    /// and push `SIGNED_OUT`.
    pub fn revoke_session(&self) {
        if lock(&self.inner).current.take().is_some() {
            self.emit(AuthChangeEvent::SignedOut, None);
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn check_online(&self) -> Result<(), ProviderError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Unexpected("network unreachable".to_string()));
        }
        Ok(())
    }

    fn issue(&self, identity: Identity) -> Session {
        Session {
            access_token: token(),
            refresh_token: token(),
            token_type: "bearer".to_string(),
            expires_at: now() + self.session_ttl,
            identity,
        }
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        let change = AuthChange::new(event, session);
        lock(&self.listeners).retain(|(_, tx)| tx.send(change.clone()).is_ok());
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<ProfileMetadata>,
    ) -> Result<AuthResponse, ProviderError> {
        self.check_online()?;
        let key = normalize_email(email);
        let confirmed = !self.require_confirmation.load(Ordering::SeqCst);

        let identity = Identity {
            id: Uuid::new_v4(),
            email: key.clone(),
            metadata: metadata.unwrap_or_default(),
            created_at: now(),
        };

        let session = {
            let mut inner = lock(&self.inner);
            if inner.users.contains_key(&key) {
                return Err(ProviderError::rejected(ALREADY_REGISTERED));
            }
            inner.users.insert(
                key,
                UserRecord {
                    password: password.to_string(),
                    identity: identity.clone(),
                    confirmed,
                },
            );
            if !confirmed {
                return Ok(AuthResponse {
                    identity: Some(identity),
                    session: None,
                });
            }
            let session = self.issue(identity);
            inner.current = Some(session.clone());
            session
        };

        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(AuthResponse::signed_in(session))
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ProviderError> {
        self.check_online()?;

        let session = {
            let mut inner = lock(&self.inner);
            let record = inner
                .users
                .get(&normalize_email(email))
                .filter(|record| record.password == password)
                .ok_or_else(|| ProviderError::rejected(INVALID_CREDENTIALS))?;
            if !record.confirmed {
                return Err(ProviderError::rejected(EMAIL_NOT_CONFIRMED));
            }
            let session = self.issue(record.identity.clone());
            inner.current = Some(session.clone());
            session
        };

        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(AuthResponse::signed_in(session))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.check_online()?;
        lock(&self.inner).current = None;
        self.emit(AuthChangeEvent::SignedOut, None);
        Ok(())
    }

    async fn get_current_session(&self) -> Result<Option<Session>, ProviderError> {
        self.check_online()?;
        let mut inner = lock(&self.inner);
        if inner
            .current
            .as_ref()
            .is_some_and(|session| session.is_expired_at(now()))
        {
            inner.current = None;
        }
        Ok(inner.current.clone())
    }

    fn on_auth_state_change(&self) -> AuthSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, tx));

        let listeners = Arc::downgrade(&self.listeners);
        AuthSubscription::new(rx, move || {
            if let Some(listeners) = listeners.upgrade() {
                lock(&listeners).retain(|(listener, _)| *listener != id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sign_up_signs_in_and_notifies() {
        let provider = MemoryIdentityProvider::new();
        let mut sub = provider.on_auth_state_change();

        let response = provider
            .sign_up("Ada@Example.com", "secret1", Some(ProfileMetadata::with_full_name("Ada")))
            .await
            .unwrap();

        let identity = response.identity.unwrap();
        assert_eq!(identity.email, "ada@example.com");
        assert_eq!(identity.metadata.full_name.as_deref(), Some("Ada"));
        assert!(response.session.is_some());

        let change = sub.recv().await.unwrap();
        assert_eq!(change.event, AuthChangeEvent::SignedIn);
        assert_eq!(change.session, provider.current_session());
    }

    #[tokio::test]
    async fn test_duplicate_sign_up_rejected() {
        let provider = MemoryIdentityProvider::new();
        provider.seed_user("a@b.com", "secret1", None);

        let err = provider.sign_up("a@b.com", "other", None).await.unwrap_err();
        assert_eq!(err, ProviderError::rejected(ALREADY_REGISTERED));
    }

    #[tokio::test]
    async fn test_confirmation_required() {
        let provider = MemoryIdentityProvider::new();
        provider.set_email_confirmation(true);

        let response = provider.sign_up("a@b.com", "secret1", None).await.unwrap();
        assert!(response.identity.is_some());
        assert!(response.session.is_none());
        assert!(provider.current_session().is_none());

        let err = provider.sign_in_with_password("a@b.com", "secret1").await.unwrap_err();
        assert_eq!(err, ProviderError::rejected(EMAIL_NOT_CONFIRMED));

        assert!(provider.confirm_email("a@b.com"));
        tokio_test::assert_ok!(provider.sign_in_with_password("a@b.com", "secret1").await);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected_silently() {
        let provider = MemoryIdentityProvider::new();
        provider.seed_user("a@b.com", "secret1", None);
        let mut sub = provider.on_auth_state_change();

        let err = provider.sign_in_with_password("a@b.com", "short").await;
        tokio_test::assert_err!(&err);
        assert_eq!(err.unwrap_err().to_string(), INVALID_CREDENTIALS);

        assert!(sub.try_recv().is_none());
        assert!(provider.current_session().is_none());
    }

    #[tokio::test]
    async fn test_offline_calls_fail_unexpectedly() {
        let provider = MemoryIdentityProvider::new();
        provider.set_offline(true);
        assert!(matches!(
            provider.get_current_session().await,
            Err(ProviderError::Unexpected(_))
        ));
        assert!(matches!(
            provider.sign_out().await,
            Err(ProviderError::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_session_not_returned() {
        let provider = MemoryIdentityProvider::new().with_session_ttl(-1);
        provider.seed_user("a@b.com", "secret1", None);
        provider.sign_in_with_password("a@b.com", "secret1").await.unwrap();

        assert!(provider.get_current_session().await.unwrap().is_none());
        assert!(provider.current_session().is_none());
    }

    #[tokio::test]
    async fn test_refresh_and_revoke_notify() {
        let provider = MemoryIdentityProvider::new();
        provider.seed_user("a@b.com", "secret1", None);
        provider.sign_in_with_password("a@b.com", "secret1").await.unwrap();
        let before = provider.current_session().unwrap();

        let mut sub = provider.on_auth_state_change();
        let refreshed = provider.refresh_tokens().unwrap();
        assert_ne!(refreshed.access_token, before.access_token);
        assert_eq!(refreshed.identity, before.identity);
        assert_eq!(sub.recv().await.unwrap().event, AuthChangeEvent::TokenRefreshed);

        provider.revoke_session();
        let change = sub.recv().await.unwrap();
        assert_eq!(change.event, AuthChangeEvent::SignedOut);
        assert!(change.session.is_none());

        // Nothing left to expire.
        provider.expire_session();
        assert!(provider.refresh_tokens().is_none());
    }

    #[tokio::test]
    async fn test_release_unregisters_listener() {
        let provider = MemoryIdentityProvider::new();
        let first = provider.on_auth_state_change();
        let mut second = provider.on_auth_state_change();
        assert_eq!(provider.subscriber_count(), 2);

        drop(first);
        second.release();
        second.release();
        assert_eq!(provider.subscriber_count(), 0);
    }
}
