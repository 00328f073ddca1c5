use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use super::{BoundingBox, Detection, ObjectDetector, ServiceFuture};

/// Client for a sidecar inference service wrapping the frozen pill
/// detector. The service accepts a base64 image plus thresholds and
/// answers with center-format boxes and confidences.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    url: String,
    client: reqwest::Client,
}

impl HttpDetector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url_from_env() -> Option<String> {
        std::env::var("PILL_DETECTOR_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

impl ObjectDetector for HttpDetector {
    fn predict(
        &self,
        image_png: Vec<u8>,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> ServiceFuture<Vec<Detection>> {
        let client = self.client.clone();
        let url = self.url.clone();
        Box::pin(async move {
            let body = json!({
                "image_base64": BASE64.encode(&image_png),
                "confidence": confidence_threshold,
                "iou": iou_threshold,
            });
            let response = client.post(&url).json(&body).send().await?;
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(anyhow!("detector service error ({}): {}", status, text));
            }
            parse_predictions(&text)
        })
    }
}

fn parse_predictions(body: &str) -> Result<Vec<Detection>, anyhow::Error> {
    let payload: PredictResponse = serde_json::from_str(body)
        .map_err(|err| anyhow!("failed to parse detector response JSON: {}", err))?;
    Ok(payload
        .predictions
        .into_iter()
        .filter_map(|prediction| {
            let [cx, cy, w, h] = prediction.bbox;
            if w <= 0.0 || h <= 0.0 {
                return None;
            }
            Some(Detection {
                bbox: BoundingBox {
                    x: (cx - w / 2.0).max(0.0) as u32,
                    y: (cy - h / 2.0).max(0.0) as u32,
                    w: w as u32,
                    h: h as u32,
                },
                confidence: prediction.confidence,
            })
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    bbox: [f32; 4],
    confidence: f32,
}
