//! Session coordination for portfolio authentication.
//!
//! Provides:
//! - `SessionCoordinator` - Sole writer of session state
//! - Provider notification handling
//! - Identity-provider implementations (in-memory)

pub mod config;
pub mod coordinator;
pub mod notifications;
pub mod provider;

pub use config::CoordinatorConfig;
pub use coordinator::SessionCoordinator;
pub use notifications::apply_change;
