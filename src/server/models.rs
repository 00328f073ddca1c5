use serde::Serialize;

use crate::color::ColorLabel;
use crate::detect::Provenance;
use crate::matcher::MatchCandidate;
use crate::pipeline::{Analysis, CropAnalysis, DegradedStep};
use crate::providers::BoundingBox;

#[derive(Debug, Serialize)]
pub(crate) struct AnalyzeResponse {
    pub(crate) success: bool,
    pub(crate) count: usize,
    pub(crate) results: Vec<AnalyzeResult>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnalyzeResult {
    pub(crate) detected_info: DetectedInfo,
    pub(crate) bbox: BoundingBox,
    pub(crate) provenance: Provenance,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) degraded_steps: Vec<DegradedStep>,
    pub(crate) candidates: Vec<MatchCandidate>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DetectedInfo {
    pub(crate) print: String,
    pub(crate) color: ColorLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) shape: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct LikeResponse {
    pub(crate) is_liked: bool,
}

impl From<Analysis> for AnalyzeResponse {
    fn from(analysis: Analysis) -> Self {
        let results: Vec<AnalyzeResult> =
            analysis.crops.into_iter().map(AnalyzeResult::from).collect();
        AnalyzeResponse { success: true, count: results.len(), results }
    }
}

impl From<CropAnalysis> for AnalyzeResult {
    fn from(crop: CropAnalysis) -> Self {
        AnalyzeResult {
            detected_info: DetectedInfo {
                print: crop.print,
                color: crop.color,
                shape: crop.shape,
            },
            bbox: crop.bbox,
            provenance: crop.provenance,
            degraded_steps: crop.degraded_steps,
            candidates: crop.candidates,
        }
    }
}
