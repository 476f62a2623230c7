//! Error types for model construction, inference, and checkpoints.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Unsupported architecture: {0}")]
    Unsupported(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("SMILES error: {0}")]
    Smiles(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Model download failed: {0}")]
    Download(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<safetensors::SafeTensorError> for ModelError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ModelError::Checkpoint(e.to_string())
    }
}

impl From<tokenizers::Error> for ModelError {
    fn from(e: tokenizers::Error) -> Self {
        ModelError::Tokenizer(e.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for ModelError {
    fn from(e: hf_hub::api::sync::ApiError) -> Self {
        ModelError::Download(e.to_string())
    }
}
