//! Error taxonomy for provider calls and coordinator operations.

use thiserror::Error;

/// Error reported by an identity-provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider rejected the request, optionally saying why.
    #[error("{}", message.as_deref().unwrap_or("request rejected"))]
    Rejected { message: Option<String> },
    /// Network fault, malformed response, or any other uncategorized failure.
    #[error("unexpected provider failure: {0}")]
    Unexpected(String),
}

impl ProviderError {
    /// Rejection carrying a provider message.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: Some(message.into()),
        }
    }

    /// The provider's own message, when it gave a non-empty one.
    #[must_use]
    pub fn provider_message(&self) -> Option<&str> {
        match self {
            Self::Rejected { message } => message.as_deref().filter(|m| !m.trim().is_empty()),
            Self::Unexpected(_) => None,
        }
    }
}

/// Which user-initiated operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SignUp,
    SignIn,
    SignOut,
    Refresh,
}

impl Operation {
    /// Lowercase label used in messages and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SignUp => "sign up",
            Self::SignIn => "sign in",
            Self::SignOut => "sign out",
            Self::Refresh => "refresh",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Normalized coordinator failure.
///
/// `Display` is the user-visible message written to the session state and
/// returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Startup session fetch failed.
    #[error("initialization failed")]
    Initialization,
    /// The provider rejected an operation.
    #[error("{}", rejection_message(*operation, message.as_deref()))]
    Rejected {
        operation: Operation,
        message: Option<String>,
    },
    /// The provider reported success but returned no principal.
    #[error("{operation} failed - no user returned")]
    NoPrincipal { operation: Operation },
    /// Anything not categorized above.
    #[error("an unexpected error occurred")]
    Unexpected,
}

fn rejection_message(operation: Operation, message: Option<&str>) -> String {
    match (operation, message) {
        (Operation::Refresh, _) => "refresh failed".to_string(),
        (_, Some(message)) => message.to_string(),
        (op, None) => format!("{op} failed"),
    }
}

impl AuthError {
    /// Normalize a provider error raised by `operation`.
    #[must_use]
    pub fn from_provider(operation: Operation, err: &ProviderError) -> Self {
        match err {
            // Refresh reports a single message whatever the cause.
            _ if operation == Operation::Refresh => Self::Rejected {
                operation,
                message: None,
            },
            ProviderError::Rejected { .. } => Self::Rejected {
                operation,
                message: err.provider_message().map(str::to_string),
            },
            ProviderError::Unexpected(_) => Self::Unexpected,
        }
    }
}
