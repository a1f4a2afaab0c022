use thiserror::Error;

/// Failure of a single generation request.
///
/// Shape mismatches between prompt embeddings and timing-log write failures are
/// recovered inside the runtime and never show up here.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Both the primary encoder and the long-prompt fallback failed.
    #[error("prompt encoding failed: {0:#}")]
    Encoding(anyhow::Error),

    #[error("sampling failed: {0:#}")]
    Sampling(anyhow::Error),

    /// Detector or inpainting failure. "No faces found" is not an error.
    #[error("face refinement failed: {0:#}")]
    Refinement(anyhow::Error),

    #[error("failed to encode image as PNG: {0}")]
    Serialization(#[from] image::ImageError),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl GenerationError {
    /// True when the caller sent parameters outside the accepted ranges.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}
