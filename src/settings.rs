use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

/// Every heuristic knob in the pipeline lives here so that tests and
/// deployments can tune them without touching code.
#[derive(Debug, Clone)]
pub struct Settings {
    pub detection: DetectionSettings,
    pub imprint: ImprintSettings,
    pub matcher: MatcherSettings,
    pub remote: RemoteSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Contour area bounds as a fraction of the full frame.
    pub min_area_ratio: f64,
    pub max_area_ratio: f64,
    /// Bounding-box width/height bounds.
    pub min_aspect: f32,
    pub max_aspect: f32,
    /// Padding in pixels applied around each accepted box.
    pub padding: u32,
    /// Upper bound on crops handed to the per-crop stages.
    pub max_crops: usize,
    pub blur_sigma: f32,
    pub threshold_block_radius: u32,
    pub threshold_offset: i16,
    pub close_iterations: u8,
    pub detector_confidence: f32,
    pub detector_iou: f32,
    /// Boxes covering more than this fraction of the frame are discarded.
    pub max_frame_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct ImprintSettings {
    pub max_len: usize,
    /// Packaging boilerplate tokens that are never imprints.
    pub stoplist: Vec<String>,
    /// Known OCR misreads mapped to the canonical imprint code.
    pub corrections: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct MatcherSettings {
    pub similarity_threshold: f32,
    pub max_candidates: usize,
    /// Near-neighbor color widening used by the fuzzy and fallback tiers.
    pub color_substitutions: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub timeout_secs: u64,
    pub gemini_model: String,
}

impl RemoteSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            detection: DetectionSettings {
                min_area_ratio: 0.0005,
                max_area_ratio: 0.05,
                min_aspect: 0.3,
                max_aspect: 3.3,
                padding: 15,
                max_crops: 5,
                blur_sigma: 1.4,
                threshold_block_radius: 9,
                threshold_offset: 3,
                close_iterations: 2,
                detector_confidence: 0.25,
                detector_iou: 0.45,
                max_frame_ratio: 0.9,
            },
            imprint: ImprintSettings {
                max_len: 6,
                stoplist: ["TEL", "FAX", "TAB", "EXP", "KOREA", "MG", "CAP"]
                    .iter()
                    .map(|token| token.to_string())
                    .collect(),
                corrections: HashMap::new(),
            },
            matcher: MatcherSettings {
                similarity_threshold: 0.4,
                max_candidates: 5,
                color_substitutions: HashMap::new(),
            },
            remote: RemoteSettings {
                timeout_secs: 20,
                gemini_model: "gemini-2.5-flash".to_string(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    detection: Option<DetectionFile>,
    imprint: Option<ImprintFile>,
    matcher: Option<MatcherFile>,
    remote: Option<RemoteFile>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionFile {
    min_area_ratio: Option<f64>,
    max_area_ratio: Option<f64>,
    min_aspect: Option<f32>,
    max_aspect: Option<f32>,
    padding: Option<u32>,
    max_crops: Option<usize>,
    blur_sigma: Option<f32>,
    threshold_block_radius: Option<u32>,
    threshold_offset: Option<i16>,
    close_iterations: Option<u8>,
    detector_confidence: Option<f32>,
    detector_iou: Option<f32>,
    max_frame_ratio: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ImprintFile {
    max_len: Option<usize>,
    stoplist: Option<Vec<String>>,
    corrections: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct MatcherFile {
    similarity_threshold: Option<f32>,
    max_candidates: Option<usize>,
    color_substitutions: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteFile {
    timeout_secs: Option<u64>,
    gemini_model: Option<String>,
}

/// Load the embedded defaults, then apply `settings.local.toml` from the
/// working directory and finally an explicit extra file, in that order.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    apply_toml(&mut settings, DEFAULT_SETTINGS_TOML, "embedded settings.toml")?;

    let mut ordered_paths: Vec<PathBuf> = vec![PathBuf::from("settings.local.toml")];
    if let Some(path) = extra_path {
        ordered_paths.push(path.to_path_buf());
    }

    for path in ordered_paths {
        if !path.exists() {
            continue;
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        apply_toml(&mut settings, &content, &path.display().to_string())?;
    }

    Ok(settings)
}

fn apply_toml(settings: &mut Settings, content: &str, origin: &str) -> Result<()> {
    let parsed: SettingsFile = toml::from_str(content)
        .with_context(|| format!("failed to parse settings from {}", origin))?;
    apply_file(settings, parsed);
    Ok(())
}

fn apply_file(settings: &mut Settings, file: SettingsFile) {
    if let Some(detection) = file.detection {
        let out = &mut settings.detection;
        set(&mut out.min_area_ratio, detection.min_area_ratio);
        set(&mut out.max_area_ratio, detection.max_area_ratio);
        set(&mut out.min_aspect, detection.min_aspect);
        set(&mut out.max_aspect, detection.max_aspect);
        set(&mut out.padding, detection.padding);
        set(&mut out.max_crops, detection.max_crops);
        set(&mut out.blur_sigma, detection.blur_sigma);
        set(&mut out.threshold_block_radius, detection.threshold_block_radius);
        set(&mut out.threshold_offset, detection.threshold_offset);
        set(&mut out.close_iterations, detection.close_iterations);
        set(&mut out.detector_confidence, detection.detector_confidence);
        set(&mut out.detector_iou, detection.detector_iou);
        set(&mut out.max_frame_ratio, detection.max_frame_ratio);
    }
    if let Some(imprint) = file.imprint {
        let out = &mut settings.imprint;
        set(&mut out.max_len, imprint.max_len);
        set(&mut out.stoplist, imprint.stoplist);
        if let Some(corrections) = imprint.corrections {
            out.corrections.extend(corrections);
        }
    }
    if let Some(matcher) = file.matcher {
        let out = &mut settings.matcher;
        set(&mut out.similarity_threshold, matcher.similarity_threshold);
        set(&mut out.max_candidates, matcher.max_candidates);
        if let Some(substitutions) = matcher.color_substitutions {
            out.color_substitutions.extend(substitutions);
        }
    }
    if let Some(remote) = file.remote {
        let out = &mut settings.remote;
        set(&mut out.timeout_secs, remote.timeout_secs);
        set(&mut out.gemini_model, remote.gemini_model);
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let settings = load_settings(None).expect("load settings");
        assert_eq!(settings.detection.max_crops, 5);
        assert!((settings.matcher.similarity_threshold - 0.4).abs() < f32::EPSILON);
        assert!(settings.imprint.stoplist.contains(&"TAB".to_string()));
        assert_eq!(
            settings.imprint.corrections.get("H15").map(String::as_str),
            Some("HIS")
        );
        assert_eq!(
            settings
                .matcher
                .color_substitutions
                .get("gray")
                .map(String::as_str),
            Some("white")
        );
    }

    #[test]
    fn local_overrides_win() {
        let mut settings = Settings::default();
        apply_toml(
            &mut settings,
            "[detection]\nmax_crops = 3\n[matcher]\nsimilarity_threshold = 0.6\n",
            "test",
        )
        .expect("apply overrides");
        assert_eq!(settings.detection.max_crops, 3);
        assert!((settings.matcher.similarity_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(settings.detection.padding, 15);
    }
}
