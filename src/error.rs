//! Error types shared by every stage of a training run.

use thiserror::Error;

/// Main error type for BigGAN training and sampling.
#[derive(Error, Debug)]
pub enum GanError {
    /// Invalid or unsupported configuration. Raised before any resource is allocated.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing, unreadable or empty training data.
    #[error("Data error: {0}")]
    Data(String),

    /// A loss turned NaN or infinite.
    #[error("Numeric divergence in {network} loss at step {step}: {value}")]
    NumericDivergence {
        network: &'static str,
        step: usize,
        value: f32,
    },

    /// Writing a checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A checkpoint exists but could not be read back.
    #[error("Corrupt checkpoint: {0}")]
    CheckpointCorrupt(String),

    /// A phase that requires a trained model found nothing to restore.
    #[error("No checkpoint found in {0}")]
    NoCheckpoint(String),

    /// Image batch that cannot be turned into a picture.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type alias for BigGAN operations.
pub type Result<T> = std::result::Result<T, GanError>;

impl GanError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CheckpointCorrupt(msg.into())
    }

    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }
}
