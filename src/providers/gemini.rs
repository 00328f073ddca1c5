use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use super::{ServiceFuture, VisionModel};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Remote multimodal client over the Gemini `generateContent` API.
#[derive(Debug, Clone)]
pub struct GeminiVision {
    key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiVision {
    pub fn new(key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Resolve an API key from the environment, preferring GEMINI_API_KEY.
    pub fn key_from_env() -> Option<String> {
        get_env("GEMINI_API_KEY").or_else(|| get_env("GOOGLE_API_KEY"))
    }
}

impl VisionModel for GeminiVision {
    fn analyze_image(&self, image_jpeg: Vec<u8>, prompt: String) -> ServiceFuture<String> {
        let client = self.client.clone();
        let key = self.key.clone();
        let url = format!("{}/{}:generateContent", BASE_URL, self.model);
        Box::pin(async move {
            let encoded = BASE64.encode(&image_jpeg);
            let body = json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        {
                            "inline_data": {
                                "mime_type": "image/jpeg",
                                "data": encoded
                            }
                        },
                        { "text": prompt }
                    ]
                }]
            });

            let response = client
                .post(&url)
                .header("x-goog-api-key", key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(anyhow!(
                    "Gemini API error ({}): {}",
                    status,
                    extract_gemini_error(&text).unwrap_or(text)
                ));
            }
            extract_text(&text)
        })
    }
}

fn extract_text(body: &str) -> Result<String, anyhow::Error> {
    let payload: GeminiResponse = serde_json::from_str(body)
        .map_err(|err| anyhow!("failed to parse Gemini response JSON: {}", err))?;
    let candidate = payload
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .ok_or_else(|| anyhow!("no candidate returned from Gemini"))?;

    let combined = candidate
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    if combined.trim().is_empty() {
        return Err(anyhow!("no text returned from Gemini"));
    }
    Ok(combined)
}

fn extract_gemini_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<GeminiError>,
    }

    #[derive(Deserialize)]
    struct GeminiError {
        message: Option<String>,
        status: Option<String>,
        code: Option<i32>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let mut parts = Vec::new();
    if let Some(message) = error.message
        && !message.trim().is_empty()
    {
        parts.push(message);
    }
    if let Some(status) = error.status
        && !status.trim().is_empty()
    {
        parts.push(format!("type: {}", status));
    }
    if let Some(code) = error.code {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}
