use std::path::PathBuf;

/// Errors surfaced by the gateway before or while running the external command.
///
/// A process that ran and exited non-zero (or was killed at its deadline) is
/// NOT an error: it comes back as an [`ExecutionOutcome`](crate::runner::ExecutionOutcome)
/// so the caller can tell task failure apart from infrastructure failure.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(
        "workdir '{requested}' rejected: no allowlist configured \
         (set policy.allowed_paths to permit working directories)"
    )]
    NoAllowlist { requested: String },

    #[error("workdir '{}' is not under any allowed path (allowed: {})", .resolved.display(), join_paths(.allowed))]
    OutsideAllowlist {
        resolved: PathBuf,
        allowed: Vec<PathBuf>,
    },

    #[error("permission mode '{mode}' is blocked by the security policy")]
    ModeBlocked { mode: String },

    #[error("concurrency limit reached ({max} running); retry after a running task finishes")]
    ConcurrencyLimit { max: usize },

    #[error("failed to start '{binary}': {source} (set runner.binary or CLAUDE_BIN to the claude executable)")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed while waiting for '{binary}': {source}")]
    Wait {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open log file '{}': {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot determine the current directory: {0}")]
    CurrentDir(#[source] std::io::Error),
}

impl GatewayError {
    /// True for rejections decided purely by the security policy.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::NoAllowlist { .. }
                | GatewayError::OutsideAllowlist { .. }
                | GatewayError::ModeBlocked { .. }
        )
    }

    /// True when the same request may succeed later without any change.
    /// The gateway never retries on its own.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::ConcurrencyLimit { .. })
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
