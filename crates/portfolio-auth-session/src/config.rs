//! Coordinator configuration.

use serde::{Deserialize, Serialize};

use portfolio_auth_core::store::DEFAULT_CHANNEL_CAPACITY;

/// Environment variable enabling stale-result rejection.
pub const ENV_REJECT_STALE_RESULTS: &str = "PORTFOLIO_AUTH_REJECT_STALE_RESULTS";
/// Environment variable sizing the store's live snapshot channel.
pub const ENV_STATE_CHANNEL_CAPACITY: &str = "PORTFOLIO_AUTH_STATE_CHANNEL_CAPACITY";

/// Session coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Skip an operation's terminating commit when a provider notification
    /// was applied while it was in flight. Off means last write wins.
    pub reject_stale_results: bool,
    /// Buffer size of the store's live snapshot channel.
    pub state_channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            reject_stale_results: false,
            state_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by `PORTFOLIO_AUTH_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Unparsable values are logged and ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_REJECT_STALE_RESULTS) {
            match parse_flag(&raw) {
                Some(flag) => config.reject_stale_results = flag,
                None => tracing::warn!(
                    var = ENV_REJECT_STALE_RESULTS,
                    value = %raw,
                    "ignoring invalid boolean"
                ),
            }
        }

        if let Some(raw) = lookup(ENV_STATE_CHANNEL_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.state_channel_capacity = capacity,
                _ => tracing::warn!(
                    var = ENV_STATE_CHANNEL_CAPACITY,
                    value = %raw,
                    "ignoring invalid capacity"
                ),
            }
        }

        config
    }

    /// Enable or disable stale-result rejection.
    #[must_use]
    pub const fn with_reject_stale_results(mut self, enabled: bool) -> Self {
        self.reject_stale_results = enabled;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
