pub mod ai;
pub mod cache;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod languages;
pub mod location;
pub mod mcp;
pub mod protocol;
pub mod router;
pub mod service;
pub mod supervisor;
pub mod tiers;
pub mod warmup;
pub mod watcher;
pub mod workspace;

pub use error::{AnalysisError, Result};
pub use service::ServiceContext;

/// Process exit status of the `clangaroo` binary.
///
/// `2` matches what clap uses for bad flags, so every usage problem shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The query produced an answer.
    Success = 0,
    /// Every tier ran and none found anything.
    NotFound = 1,
    /// Bad arguments, no project root, or an invalid configuration.
    Usage = 2,
    /// The query itself failed.
    Failed = 3,
    /// clangd could not be spawned or is down for the session.
    EngineUnavailable = 4,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn for_error(err: &AnalysisError) -> Self {
        match err {
            AnalysisError::Spawn { .. }
            | AnalysisError::Crash(_)
            | AnalysisError::ServiceUnavailable(_) => ExitCode::EngineUnavailable,
            AnalysisError::InvalidRequest(_) | AnalysisError::ProjectConfig(_) => ExitCode::Usage,
            AnalysisError::NotFound(_) => ExitCode::NotFound,
            _ => ExitCode::Failed,
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn errors_map_to_distinct_exit_codes() {
        let spawn = AnalysisError::Spawn {
            program: "clangd".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(ExitCode::for_error(&spawn), ExitCode::EngineUnavailable);
        assert_eq!(
            ExitCode::for_error(&AnalysisError::ServiceUnavailable("degraded".into())),
            ExitCode::EngineUnavailable
        );
        assert_eq!(
            ExitCode::for_error(&AnalysisError::ProjectConfig("no compile_commands.json".into())),
            ExitCode::Usage
        );
        assert_eq!(
            ExitCode::for_error(&AnalysisError::NotFound("x".into())),
            ExitCode::NotFound
        );
        assert_eq!(
            ExitCode::for_error(&AnalysisError::timeout("textDocument/hover", Duration::from_secs(1))),
            ExitCode::Failed
        );
        assert_eq!(ExitCode::EngineUnavailable.code(), 4);
    }
}
