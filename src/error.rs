//! Error types for LoRA training.
//!
//! Library code returns [`Result`]; the `train_lora` binary turns any error
//! into a diagnostic on stderr and exit status 1.

use std::path::PathBuf;
use thiserror::Error;

/// A specialized Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    /// A required external asset (base model files, accelerator) is missing.
    #[error("{message}")]
    Environment { message: String, hint: String },

    #[error("Training queue not found: {}", .0.display())]
    QueueNotFound(PathBuf),

    #[error("No valid examples found in training queue {}", .path.display())]
    NoValidRecords { path: PathBuf, skipped: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Chat template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Training failed: {0}")]
    Training(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl TrainError {
    pub fn environment(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
            hint: hint.into(),
        }
    }

    /// Install guidance for environment errors.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Environment { hint, .. } => Some(hint),
            _ => None,
        }
    }

    pub fn is_environment(&self) -> bool {
        matches!(self, Self::Environment { .. })
    }
}

impl From<tokenizers::Error> for TrainError {
    fn from(err: tokenizers::Error) -> Self {
        Self::Tokenizer(err.to_string())
    }
}
