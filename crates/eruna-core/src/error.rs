//! Error taxonomy shared by every Eruna crate.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, ErunaError>;

#[derive(Error, Debug)]
pub enum ErunaError {
    /// The alarm store could not be reached. Fatal to the current run.
    #[error("Alarm source unavailable: {0}")]
    SourceUnavailable(String),

    /// Group resolution or dispatch failed for one alarm. Fatal to its chunk.
    #[error("Write failed for alarm {alarm_id}: {reason}")]
    WriteFailed { alarm_id: i64, reason: String },

    /// Same parameters already completed and restart is not allowed.
    #[error("Job '{job}' already completed with parameters {params}")]
    DuplicateRunRejected { job: String, params: String },

    /// An execution with the same parameters is still open.
    #[error("Job '{job}' is already running (execution {execution_id})")]
    RunInProgress { job: String, execution_id: i64 },

    #[error("Processor rejected alarm {alarm_id}: {reason}")]
    Processor { alarm_id: i64, reason: String },

    #[error("Execution ledger error: {0}")]
    Ledger(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Invalid cron expression: {0}")]
    Cron(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ErunaError {
    /// Alarm that caused the failure, when the error names one.
    pub fn alarm_id(&self) -> Option<i64> {
        match self {
            ErunaError::WriteFailed { alarm_id, .. } | ErunaError::Processor { alarm_id, .. } => {
                Some(*alarm_id)
            }
            _ => None,
        }
    }
}
