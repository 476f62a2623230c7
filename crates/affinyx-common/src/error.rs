use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("Unknown {kind} option: {value}")]
    UnknownOption { kind: &'static str, value: String },

    #[error("Incompatible options: {0}")]
    Incompatible(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommonError>;
