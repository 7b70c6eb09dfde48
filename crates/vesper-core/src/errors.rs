use std::time::Duration;

use crate::session::RateLimitInfo;

/// Typed error hierarchy for outbound HTTP calls.
/// Classifies errors as transient (retry per policy), terminal, or breaker-related.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    // Transient
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Auth
    #[error("unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("credential refresh failed: {message}")]
    RefreshFailed { status: Option<u16>, message: String },

    // Backoff
    #[error("rate limited")]
    RateLimited {
        retry_after: Option<Duration>,
        rate_limit: Option<RateLimitInfo>,
    },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    // Terminal
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),

    // Local
    #[error("circuit open for {bucket}, retry in {retry_in:?}")]
    CircuitOpen { bucket: String, retry_in: Duration },
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    /// Aborts, timeouts and connection failures. Never means "offline".
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }

    /// 403/404/422 and friends: retrying cannot help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Client { .. } | Self::Decode(_))
    }

    /// Outcomes that count as a consecutive failure for the endpoint's breaker.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_) | Self::Server { .. })
    }

    /// Credential-level failures that should sign the user out.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::RefreshFailed { .. })
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { .. } => Some(401),
            Self::RateLimited { .. } => Some(429),
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            Self::RefreshFailed { status, .. } => *status,
            _ => None,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Unauthorized { .. } => "unauthorized",
            Self::RefreshFailed { .. } => "refresh_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server",
            Self::Client { .. } => "client",
            Self::Decode(_) => "decode",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::Unauthorized { body },
            429 => Self::RateLimited {
                retry_after: None,
                rate_limit: None,
            },
            500..=599 => Self::Server { status, body },
            _ => Self::Client { status, body },
        }
    }
}
