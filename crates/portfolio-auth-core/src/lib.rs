//! Core abstractions for client-side authentication session state.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionState` - The `{identity, session, loading, error}` tuple
//! - `SessionStore` / `SessionView` - Single-writer observable store
//! - `IdentityProvider` - The external identity-provider capability
//! - `AuthError` / `ProviderError` - Error taxonomy

pub mod error;
pub mod model;
pub mod store;
pub mod traits;

pub use error::{AuthError, Operation, ProviderError};
pub use model::{
    AuthChange, AuthChangeEvent, Identity, OperationResult, ProfileMetadata, Session,
    SessionState, UserId,
};
pub use store::{SessionStore, SessionView, StateSnapshot, Subscription};
pub use traits::{AuthResponse, AuthSubscription, IdentityProvider};
