//! Error types for Inferoute

use thiserror::Error;

/// Result type alias using Inferoute's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Inferoute error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Network errors (E100-E199)
    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    #[error("Backend '{backend}' call failed: {message}")]
    BackendCallFailed { backend: String, message: String },

    #[error("Backend '{backend}' timed out after {timeout_ms}ms")]
    BackendTimeout { backend: String, timeout_ms: u64 },

    #[error("Rate limited. Retry after {0} seconds.")]
    RateLimited(u64),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Caller errors (E700-E799)
    #[error("Request cancelled by caller")]
    Cancelled,

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Routing errors (E1100-E1199)
    #[error("All backends failed (tried {}): {last_error}", chain.join(" -> "))]
    AllBackendsFailed {
        chain: Vec<String>,
        last_error: String,
    },

    #[error("Backend '{0}' is not registered. Run `inferoute backends` to see all backends.")]
    BackendNotFound(String),

    #[error("Invalid capability profile: {0}")]
    InvalidProfile(String),

    // Feedback errors (E1200-E1299)
    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    // Snapshot errors (E1300-E1399)
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NetworkError(_) => "E100",
            Self::BackendCallFailed { .. } => "E101",
            Self::BackendTimeout { .. } => "E102",
            Self::RateLimited(_) => "E103",
            Self::DatabaseError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::Cancelled => "E700",
            Self::InvalidInput(_) => "E800",
            Self::AllBackendsFailed { .. } => "E1100",
            Self::BackendNotFound(_) => "E1101",
            Self::InvalidProfile(_) => "E1102",
            Self::InvalidFeedback(_) => "E1200",
            Self::InvalidSnapshot(_) => "E1300",
            Self::Serialization(_) => "E1301",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NetworkError(_) => Some("Check internet connection".to_string()),
            Self::RateLimited(secs) => Some(format!("Wait {} seconds before retrying", secs)),
            Self::AllBackendsFailed { .. } => Some("inferoute stats".to_string()),
            Self::BackendNotFound(_) => Some("inferoute backends".to_string()),
            Self::ConfigError(_) => Some("inferoute config list".to_string()),
            _ => None,
        }
    }

    /// Whether this error is a per-backend failure the fallback chain absorbs
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::BackendCallFailed { .. }
                | Self::BackendTimeout { .. }
                | Self::RateLimited(_)
                | Self::BackendNotFound(_)
        )
    }
}
