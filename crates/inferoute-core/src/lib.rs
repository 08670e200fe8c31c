//! Inferoute Core Library
//!
//! This crate provides the core functionality for Inferoute, including:
//! - Request analysis (complexity, task category, token estimate)
//! - Backend selection and fallback chains
//! - Semantic response caching
//! - Per-backend performance learning and per-user preferences
//! - Backend call interface (OpenRouter, local echo)
//! - Snapshot persistence (SQLite)
//! - Configuration

pub mod backend;
pub mod config;
pub mod error;
pub mod routing;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{Backend, BackendReply, BackendRequest};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::routing::{FeedbackOutcome, InferenceRouter, RouteContext, RoutedResponse};
}
