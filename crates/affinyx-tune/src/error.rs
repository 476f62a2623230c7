//! Error types for hyperparameter search.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TuneError>;

#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Training error: {0}")]
    Train(#[from] affinyx_train::TrainError),

    #[error("Configuration error: {0}")]
    Config(#[from] affinyx_common::CommonError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
