//! Error types for training, evaluation and distributed coordination.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Model error: {0}")]
    Model(#[from] affinyx_models::ModelError),

    #[error("Configuration error: {0}")]
    Config(#[from] affinyx_common::CommonError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Dataset error: {0}")]
    Data(String),

    #[error("Environment error: {0}")]
    Env(String),

    #[error("Process group error: {0}")]
    Group(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl TrainError {
    /// Tensor or device failures raised while running a batch. These end a
    /// run with the sentinel loss; every other error is returned.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            TrainError::Tensor(_) | TrainError::Model(affinyx_models::ModelError::Tensor(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affinyx_models::ModelError;

    #[test]
    fn test_only_tensor_failures_are_runtime_errors() {
        assert!(TrainError::Tensor(candle_core::Error::Msg("oom".into())).is_runtime());
        assert!(TrainError::Model(ModelError::Tensor(candle_core::Error::Msg("oom".into()))).is_runtime());
        assert!(!TrainError::Model(ModelError::InvalidGraph("ragged".into())).is_runtime());
        assert!(!TrainError::Data("empty".into()).is_runtime());
        assert!(!TrainError::Group("peer closed".into()).is_runtime());
    }
}
