//! Identity, session and session-state types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity-provider user identifier.
pub type UserId = Uuid;

/// Opaque profile metadata supplied at sign-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// Display name collected by the sign-up form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,

    /// Any other provider-side profile fields.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ProfileMetadata {
    /// Metadata carrying only a display name.
    #[must_use]
    pub fn with_full_name(full_name: impl Into<String>) -> Self {
        Self {
            full_name: Some(full_name.into()),
            extra: HashMap::new(),
        }
    }

    /// Get an extra field by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Set an extra field.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }
}

/// The authenticated principal, as cached by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique user identifier.
    pub id: UserId,
    /// Sign-in email.
    pub email: String,
    /// Profile metadata supplied at sign-up.
    #[serde(default)]
    pub metadata: ProfileMetadata,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// Credential bundle bound to exactly one [`Identity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token presented to the backend.
    pub access_token: String,
    /// Token used by the provider to mint a new access token.
    pub refresh_token: String,
    /// Usually `"bearer"`.
    pub token_type: String,
    /// Expiry horizon (Unix epoch seconds).
    pub expires_at: i64,
    /// The principal this session belongs to.
    #[serde(rename = "user")]
    pub identity: Identity,
}

impl Session {
    /// Whether the session has expired at `now` (Unix epoch seconds).
    #[must_use]
    pub const fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Seconds left before expiry at `now`, zero once expired.
    #[must_use]
    pub const fn expires_in(&self, now: i64) -> i64 {
        let left = self.expires_at - now;
        if left > 0 { left } else { 0 }
    }
}

/// The Store's content: who is signed in, and whether anything is outstanding.
///
/// Fields are private so that the identity can only ever be derived from the
/// session it came with; a state never holds one without the other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    session: Option<Session>,
    loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SessionState {
    /// Startup state: nobody known yet, fetch outstanding.
    #[must_use]
    pub const fn initializing() -> Self {
        Self {
            session: None,
            loading: true,
            error: None,
        }
    }

    /// Settled, signed-out state.
    #[must_use]
    pub const fn signed_out() -> Self {
        Self {
            session: None,
            loading: false,
            error: None,
        }
    }

    /// Settled, signed-in state for `session`.
    #[must_use]
    pub const fn signed_in(session: Session) -> Self {
        Self {
            session: Some(session),
            loading: false,
            error: None,
        }
    }

    /// Settled state for an optional session.
    #[must_use]
    pub fn from_session(session: Option<Session>) -> Self {
        session.map_or_else(Self::signed_out, Self::signed_in)
    }

    /// The signed-in principal, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.session.as_ref().map(|s| &s.identity)
    }

    /// The active session, if any.
    #[must_use]
    pub const fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Whether an initialization or user-initiated operation is outstanding.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    /// The current user-visible error message.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether someone is signed in.
    #[must_use]
    pub const fn is_signed_in(&self) -> bool {
        self.session.is_some()
    }

    /// Same state with `loading` replaced.
    #[must_use]
    pub fn with_loading(mut self, loading: bool) -> Self {
        self.loading = loading;
        self
    }

    /// Same state with `error` set.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Same state with `error` cleared.
    #[must_use]
    pub fn without_error(mut self) -> Self {
        self.error = None;
        self
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::initializing()
    }
}

/// Provider-pushed authentication events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    /// Session restored when the subscription is registered.
    InitialSession,
    /// A sign-in or sign-up completed.
    SignedIn,
    /// Signed out, locally or from elsewhere.
    SignedOut,
    /// Tokens were silently rotated.
    TokenRefreshed,
    /// Profile data changed.
    UserUpdated,
    /// The session passed its expiry horizon.
    SessionExpired,
}

impl AuthChangeEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
            Self::SessionExpired => "SESSION_EXPIRED",
        }
    }
}

impl std::fmt::Display for AuthChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChange {
    /// What happened.
    pub event: AuthChangeEvent,
    /// The session after the event, absent when signed out or expired.
    #[serde(default)]
    pub session: Option<Session>,
}

impl AuthChange {
    /// Create a notification.
    #[must_use]
    pub const fn new(event: AuthChangeEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }
}

/// Outcome of a user-initiated operation, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Whether the provider accepted the request.
    pub success: bool,
    /// User-visible reason when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    /// Successful outcome.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed outcome with a message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }

    /// Whether the request succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.success
    }
}
