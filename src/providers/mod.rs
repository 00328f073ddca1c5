use anyhow::Result;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::StepError;

mod detector;
mod gemini;
mod vision;

pub use detector::HttpDetector;
pub use gemini::GeminiVision;
pub use vision::CloudOcr;

pub type ServiceFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Axis-aligned box in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// Grow the box by `padding` on every side and clip it to the frame.
    pub fn padded(&self, padding: u32, frame_w: u32, frame_h: u32) -> BoundingBox {
        let x = self.x.saturating_sub(padding);
        let y = self.y.saturating_sub(padding);
        let w = (self.x + self.w + padding).min(frame_w) - x;
        let h = (self.y + self.h + padding).min(frame_h) - y;
        BoundingBox { x, y, w, h }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Pretrained bounding-box detector. The model itself is a frozen
/// external artifact; this subsystem only consumes predictions.
pub trait ObjectDetector: Send + Sync {
    fn predict(
        &self,
        image_png: Vec<u8>,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> ServiceFuture<Vec<Detection>>;
}

/// Remote multimodal inference service. Returns raw model text; callers
/// parse it defensively.
pub trait VisionModel: Send + Sync {
    fn analyze_image(&self, image_jpeg: Vec<u8>, prompt: String) -> ServiceFuture<String>;
}

/// One OCR text block. By convention the first observation in a response
/// is the full-frame concatenated text, followed by individual tokens,
/// mirroring cloud text-detection APIs.
#[derive(Debug, Clone)]
pub struct TextObservation {
    pub text: String,
}

pub trait TextReader: Send + Sync {
    fn read_text(&self, image_jpeg: Vec<u8>) -> ServiceFuture<Vec<TextObservation>>;
}

/// Bound a remote call with the configured timeout, folding transport
/// errors and timeouts into a single step failure.
pub async fn bounded<T>(future: ServiceFuture<T>, timeout: Duration) -> Result<T, StepError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(StepError::Remote(err)),
        Err(_) => Err(StepError::Timeout(timeout)),
    }
}
