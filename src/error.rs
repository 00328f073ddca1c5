use std::time::Duration;
use thiserror::Error;

/// Malformed or undecodable input. The only failure this subsystem
/// surfaces to the caller; everything downstream degrades instead.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read image data: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// Failure of a single pipeline step. Callers inside the orchestrator
/// catch these, log them, and substitute a degraded value; they never
/// reach the HTTP surface.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("no service configured for this step")]
    Unconfigured,
    #[error("remote call failed: {0}")]
    Remote(#[source] anyhow::Error),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("service returned no usable data")]
    Empty,
}
