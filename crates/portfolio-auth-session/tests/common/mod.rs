//! Shared fixtures for coordinator tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use portfolio_auth_core::{
    AuthChange, AuthResponse, AuthSubscription, Identity, IdentityProvider, ProfileMetadata,
    ProviderError, Session,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// A session valid for the next hour.
pub fn session(email: &str) -> Session {
    Session {
        access_token: format!("access-{email}"),
        refresh_token: format!("refresh-{email}"),
        token_type: "bearer".into(),
        expires_at: i64::from(u32::MAX),
        identity: Identity {
            id: Uuid::new_v4(),
            email: email.into(),
            metadata: ProfileMetadata::with_full_name("Test User"),
            created_at: 0,
        },
    }
}

/// How a scripted call resolves.
pub enum Reply<T> {
    Ready(Result<T, ProviderError>),
    Gated(oneshot::Receiver<Result<T, ProviderError>>),
    Panic,
    Never,
}

impl<T> Reply<T> {
    /// A reply released later through the returned sender.
    pub fn gated() -> (oneshot::Sender<Result<T, ProviderError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self::Gated(rx))
    }

    async fn resolve(self) -> Result<T, ProviderError> {
        match self {
            Self::Ready(result) => result,
            Self::Gated(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ProviderError::Unexpected("gate dropped".into()))),
            Self::Panic => panic!("scripted provider panic"),
            Self::Never => futures::future::pending().await,
        }
    }
}

/// Provider whose replies are queued by the test.
///
/// `get_current_session` answers `Ok(None)` when nothing is queued.
#[derive(Default)]
pub struct ScriptedProvider {
    sign_up: Mutex<VecDeque<Reply<AuthResponse>>>,
    sign_in: Mutex<VecDeque<Reply<AuthResponse>>>,
    sign_out: Mutex<VecDeque<Reply<()>>>,
    current: Mutex<VecDeque<Reply<Option<Session>>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AuthChange>>>,
}

fn pop<T>(queue: &Mutex<VecDeque<Reply<T>>>) -> Option<Reply<T>> {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}

fn push<T>(queue: &Mutex<VecDeque<Reply<T>>>, reply: Reply<T>) {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_back(reply);
}

impl ScriptedProvider {
    pub fn on_sign_up(&self, reply: Reply<AuthResponse>) {
        push(&self.sign_up, reply);
    }

    pub fn on_sign_in(&self, reply: Reply<AuthResponse>) {
        push(&self.sign_in, reply);
    }

    pub fn on_sign_out(&self, reply: Reply<()>) {
        push(&self.sign_out, reply);
    }

    pub fn on_current_session(&self, reply: Reply<Option<Session>>) {
        push(&self.current, reply);
    }

    /// Push a notification to every live subscriber.
    pub fn notify(&self, change: AuthChange) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

fn unscripted<T>() -> Reply<T> {
    Reply::Ready(Err(ProviderError::Unexpected("no scripted reply".into())))
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _metadata: Option<ProfileMetadata>,
    ) -> Result<AuthResponse, ProviderError> {
        pop(&self.sign_up).unwrap_or_else(unscripted).resolve().await
    }

    async fn sign_in_with_password(
        &self,
        _email: &str,
        _password: &str,
    ) -> Result<AuthResponse, ProviderError> {
        pop(&self.sign_in).unwrap_or_else(unscripted).resolve().await
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        pop(&self.sign_out).unwrap_or_else(unscripted).resolve().await
    }

    async fn get_current_session(&self) -> Result<Option<Session>, ProviderError> {
        pop(&self.current)
            .unwrap_or(Reply::Ready(Ok(None)))
            .resolve()
            .await
    }

    fn on_auth_state_change(&self) -> AuthSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        AuthSubscription::detached(rx)
    }
}
