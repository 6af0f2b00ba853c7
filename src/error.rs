//! Error kinds surfaced by the analysis core.

use std::time::Duration;

use thiserror::Error;

use crate::tiers::TierAttempt;

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The engine binary is missing or not executable.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine exited while requests were in flight.
    #[error("engine exited unexpectedly: {0}")]
    Crash(String),

    #[error("{method} timed out after {}ms", elapsed.as_millis())]
    Timeout { method: String, elapsed: Duration },

    #[error("cache unavailable: {0}")]
    Cache(String),

    #[error("nothing found for {0}")]
    NotFound(String),

    /// Missing or unreadable build configuration (compile_commands.json).
    #[error("project configuration: {0}")]
    ProjectConfig(String),

    #[error("semantic engine unavailable: {0}")]
    ServiceUnavailable(String),

    /// The engine answered with a JSON-RPC error object.
    #[error("engine error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no analysis tier could answer {operation}")]
    Exhausted {
        operation: &'static str,
        attempts: Vec<TierAttempt>,
    },
}

impl AnalysisError {
    /// Stable snake_case name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Spawn { .. } => "spawn_error",
            AnalysisError::Crash(_) => "crash_error",
            AnalysisError::Timeout { .. } => "timeout",
            AnalysisError::Cache(_) => "cache_error",
            AnalysisError::NotFound(_) => "not_found",
            AnalysisError::ProjectConfig(_) => "project_config_error",
            AnalysisError::ServiceUnavailable(_) => "service_unavailable",
            AnalysisError::Rpc { .. } => "engine_error",
            AnalysisError::Protocol(_) => "protocol_error",
            AnalysisError::InvalidRequest(_) => "invalid_request",
            AnalysisError::Io(_) => "io_error",
            AnalysisError::Exhausted { .. } => "exhausted",
        }
    }

    pub fn timeout(method: impl Into<String>, elapsed: Duration) -> Self {
        AnalysisError::Timeout {
            method: method.into(),
            elapsed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AnalysisError::Timeout { .. })
    }
}
