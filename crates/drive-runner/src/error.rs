use thiserror::Error;

/// Failure classes that end a driver run. Every failure inside one
/// checkpoint's evaluation aborts the whole run; a re-invocation resumes from
/// the persisted summary logs.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The simulator became unreachable while the benchmark was running.
    #[error("simulator transport failure: {0}")]
    Transport(String),

    /// The simulator process or container could not be launched.
    #[error("simulator launch failed: {0}")]
    ProcessLaunch(String),

    /// The operator interrupted the run.
    #[error("evaluation cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ProcessLaunch,
    Cancelled,
    Unclassified,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::ProcessLaunch => write!(f, "process_launch"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Unclassified => write!(f, "unclassified"),
        }
    }
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::Transport(_) => ErrorKind::Transport,
            EvalError::ProcessLaunch(_) => ErrorKind::ProcessLaunch,
            EvalError::Cancelled => ErrorKind::Cancelled,
            EvalError::Unclassified(_) => ErrorKind::Unclassified,
        }
    }

    /// Message stored in the terminal `Error` run-log entry.
    pub fn run_log_message(&self) -> &'static str {
        match self {
            EvalError::Transport(_) => "TCP serious Error",
            EvalError::ProcessLaunch(_) => "Simulator launch failed",
            EvalError::Cancelled => "Killed By User",
            EvalError::Unclassified(_) => "Something Happened",
        }
    }
}

impl From<std::io::Error> for EvalError {
    fn from(err: std::io::Error) -> Self {
        EvalError::Unclassified(err.into())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::Unclassified(err.into())
    }
}
