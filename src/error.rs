use thiserror::Error;

/// Errors with a defined recovery path at the wiki boundary.
///
/// Filesystem and database errors stay as `anyhow` context at the call
/// sites; these variants exist because callers branch on them: invalid
/// input becomes a client error, a git failure becomes task state, and a
/// terminal-task violation is an orchestration bug surfaced loudly.
#[derive(Debug, Error)]
pub enum WikiError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid commit message: {0}")]
    InvalidCommitMessage(String),

    /// A git subprocess exited non-zero. Carries the captured stderr.
    #[error("git operation failed: {0}")]
    GitOperation(String),

    /// A status transition was attempted on a task already in a terminal
    /// state (success, completed_with_errors, failed, cancelled).
    #[error("task {0} is already in a terminal state")]
    TerminalTask(String),
}
