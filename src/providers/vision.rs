use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use super::{ServiceFuture, TextObservation, TextReader};

const BASE_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Text-recognition client over the Cloud Vision annotate API. The first
/// annotation in a response is the full-frame text, followed by the
/// individual words, which is exactly the shape the imprint reader wants.
#[derive(Debug, Clone)]
pub struct CloudOcr {
    key: String,
    client: reqwest::Client,
}

impl CloudOcr {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn key_from_env() -> Option<String> {
        std::env::var("VISION_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

impl TextReader for CloudOcr {
    fn read_text(&self, image_jpeg: Vec<u8>) -> ServiceFuture<Vec<TextObservation>> {
        let client = self.client.clone();
        let url = format!("{}?key={}", BASE_URL, self.key);
        Box::pin(async move {
            let body = json!({
                "requests": [{
                    "image": { "content": BASE64.encode(&image_jpeg) },
                    "features": [{ "type": "TEXT_DETECTION" }]
                }]
            });

            let response = client.post(&url).json(&body).send().await?;
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(anyhow!("Vision API error ({}): {}", status, text));
            }
            parse_annotations(&text)
        })
    }
}

fn parse_annotations(body: &str) -> Result<Vec<TextObservation>, anyhow::Error> {
    let payload: AnnotateResponse = serde_json::from_str(body)
        .map_err(|err| anyhow!("failed to parse Vision response JSON: {}", err))?;
    let first = payload
        .responses
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no response returned from Vision API"))?;
    if let Some(error) = first.error {
        return Err(anyhow!(
            "Vision API error: {}",
            error.message.unwrap_or_else(|| "unknown".to_string())
        ));
    }
    Ok(first
        .text_annotations
        .into_iter()
        .map(|annotation| TextObservation {
            text: annotation.description,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<SingleResponse>,
}

#[derive(Debug, Deserialize)]
struct SingleResponse {
    #[serde(rename = "textAnnotations", default)]
    text_annotations: Vec<TextAnnotation>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    description: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
}
