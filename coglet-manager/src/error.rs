//! Error kinds surfaced across the manager, runner, and watcher.

use crate::runner::RunnerStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No capacity token available; nothing was allocated.
    #[error("no capacity")]
    NoCapacity,

    #[error("prediction not found")]
    PredictionNotFound,

    #[error("runner not found")]
    RunnerNotFound,

    /// Fleet is full and no runner is idle or defunct.
    #[error("no empty runner slot")]
    NoEmptySlot,

    #[error("invalid runner status: {0}")]
    InvalidRunnerStatus(RunnerStatus),

    /// Sentinel: setup failed between pre-allocation and predict. The
    /// watcher drives the webhook path; the caller must not expect a
    /// response channel.
    #[error("async prediction")]
    AsyncPrediction,

    #[error("runner has no command")]
    NoCommand,

    #[error("schema not available")]
    SchemaNotAvailable,

    #[error("prediction canceled")]
    Canceled,

    #[error("timed out waiting for runner")]
    RunnerSetupTimeout,

    #[error("procedure source url missing from request")]
    MissingProcedureSource,

    #[error("unsupported procedure source scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid project config: {0}")]
    Config(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("input rewrite failed: {0}")]
    InputRewrite(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
