use serde::Deserialize;
use tracing::warn;

use crate::color::ColorLabel;
use crate::error::StepError;
use crate::providers::{BoundingBox, VisionModel, bounded};
use crate::settings::Settings;

const PROMPT_TEMPLATE: &str = include_str!("prompts/remote_regions.tera");

/// A pill region proposed by the multimodal model, with whatever visual
/// attributes it volunteered alongside the box.
#[derive(Debug, Clone)]
pub struct RemoteRegion {
    pub bbox: BoundingBox,
    pub print: Option<String>,
    pub color: Option<String>,
    pub shape: Option<String>,
}

/// Ask the multimodal model for pill regions over the whole frame. Model
/// chatter that cannot be parsed degrades to an empty proposal list.
pub async fn propose(
    image_jpeg: Vec<u8>,
    frame_w: u32,
    frame_h: u32,
    vision: &dyn VisionModel,
    settings: &Settings,
) -> Result<Vec<RemoteRegion>, StepError> {
    let prompt = render_prompt(settings).map_err(|err| StepError::Remote(err.into()))?;
    let reply = bounded(
        vision.analyze_image(image_jpeg, prompt),
        settings.remote.timeout(),
    )
    .await?;
    Ok(parse_regions(&reply, frame_w, frame_h))
}

fn render_prompt(settings: &Settings) -> tera::Result<String> {
    let colors: Vec<&str> = ColorLabel::ALL.iter().map(|label| label.as_str()).collect();
    let mut context = tera::Context::new();
    context.insert("colors", &colors.join(", "));
    context.insert("max_regions", &settings.detection.max_crops);
    tera::Tera::one_off(PROMPT_TEMPLATE, &context, false)
}

#[derive(Debug, Deserialize)]
struct RawRegion {
    #[serde(default)]
    box_2d: Vec<f64>,
    print: Option<String>,
    color: Option<String>,
    shape: Option<String>,
}

/// Parse the model reply into pixel-space regions. The model speaks a
/// 0-1000 normalized [ymin, xmin, ymax, xmax] convention.
fn parse_regions(reply: &str, frame_w: u32, frame_h: u32) -> Vec<RemoteRegion> {
    let Some(body) = extract_array(reply) else {
        warn!("no JSON array in model reply");
        return Vec::new();
    };
    let raw: Vec<RawRegion> = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "model reply is not valid region JSON");
            return Vec::new();
        }
    };
    raw.into_iter()
        .filter_map(|region| to_pixel_region(region, frame_w, frame_h))
        .collect()
}

/// Locate the outermost JSON array, tolerating markdown fences and prose
/// around it.
fn extract_array(reply: &str) -> Option<&str> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    (end > start).then(|| &reply[start..=end])
}

fn to_pixel_region(raw: RawRegion, frame_w: u32, frame_h: u32) -> Option<RemoteRegion> {
    if raw.box_2d.len() != 4 {
        return None;
    }
    let scale = |value: f64, limit: u32| -> u32 {
        ((value.clamp(0.0, 1000.0) / 1000.0) * limit as f64).round() as u32
    };
    let y0 = scale(raw.box_2d[0], frame_h);
    let x0 = scale(raw.box_2d[1], frame_w);
    let y1 = scale(raw.box_2d[2], frame_h).min(frame_h);
    let x1 = scale(raw.box_2d[3], frame_w).min(frame_w);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(RemoteRegion {
        bbox: BoundingBox {
            x: x0,
            y: y0,
            w: x1 - x0,
            h: y1 - y0,
        },
        print: raw.print.filter(|text| !text.trim().is_empty()),
        color: raw.color.filter(|text| !text.trim().is_empty()),
        shape: raw.shape.filter(|text| !text.trim().is_empty()),
    })
}
