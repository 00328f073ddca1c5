use futures_util::{StreamExt, stream};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::CatalogStore;
use crate::color::{self, ColorLabel};
use crate::detect::{self, Crop, Provenance, RemoteHint};
use crate::error::{DecodeError, StepError};
use crate::imprint::{self, ImprintText};
use crate::matcher::{self, MatchCandidate};
use crate::normalize;
use crate::providers::{BoundingBox, ObjectDetector, TextReader, VisionModel};
use crate::settings::Settings;

/// Per-crop stages that ran in degraded form. The analysis still comes
/// back; these name what it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradedStep {
    Imprint,
    Match,
}

#[derive(Debug, Clone, Serialize)]
pub struct CropAnalysis {
    pub bbox: BoundingBox,
    pub provenance: Provenance,
    pub print: String,
    pub print_confidence: f32,
    pub color: ColorLabel,
    pub shape: Option<String>,
    pub degraded_steps: Vec<DegradedStep>,
    pub candidates: Vec<MatchCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub crops: Vec<CropAnalysis>,
}

/// The analysis pipeline with its injected collaborators. Every remote
/// dependency is optional; a missing one degrades the steps that need it
/// instead of failing the request.
pub struct Pipeline {
    settings: Settings,
    catalog: Arc<dyn CatalogStore>,
    detector: Option<Arc<dyn ObjectDetector>>,
    vision: Option<Arc<dyn VisionModel>>,
    reader: Option<Arc<dyn TextReader>>,
}

impl Pipeline {
    pub fn new(settings: Settings, catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            settings,
            catalog,
            detector: None,
            vision: None,
            reader: None,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ObjectDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_reader(mut self, reader: Arc<dyn TextReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Analyze one uploaded photograph. Only an undecodable image is an
    /// error; everything after decoding degrades toward an empty result.
    pub async fn analyze(&self, bytes: &[u8]) -> Result<Analysis, DecodeError> {
        let frame = normalize::normalize(bytes)?.to_rgb8();
        let crops = detect::detect(
            &frame,
            self.detector.as_deref(),
            self.vision.as_deref(),
            &self.settings,
        )
        .await;
        if crops.is_empty() {
            info!("no pill regions found");
            return Ok(Analysis { crops: Vec::new() });
        }

        let analyzed: Vec<CropAnalysis> = stream::iter(crops)
            .map(|crop| self.analyze_crop(crop))
            .buffered(self.settings.detection.max_crops.max(1))
            .collect()
            .await;
        Ok(Analysis { crops: dedup_by_print(analyzed) })
    }

    async fn analyze_crop(&self, crop: Crop) -> CropAnalysis {
        let mut degraded = Vec::new();
        let hint = crop.hint.clone().unwrap_or_default();

        let imprint = match self.read_imprint(&crop).await {
            Ok(imprint) => imprint,
            Err(err) => {
                warn!(error = %err, "imprint step degraded");
                degraded.push(DegradedStep::Imprint);
                hint_imprint(&hint, &self.settings)
            }
        };

        let mut color = color::classify(&crop.image);
        if color == ColorLabel::Other
            && let Some(hinted) = hint.color.as_deref()
        {
            color = ColorLabel::parse(hinted);
        }

        let candidates = match matcher::rank(
            self.catalog.as_ref(),
            &imprint.text,
            color,
            &self.settings.matcher,
        ) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "catalog match step degraded");
                degraded.push(DegradedStep::Match);
                Vec::new()
            }
        };

        debug!(
            print = %imprint.text,
            color = color.as_str(),
            candidates = candidates.len(),
            "crop analyzed"
        );
        CropAnalysis {
            bbox: crop.bbox,
            provenance: crop.provenance,
            print: imprint.text,
            print_confidence: imprint.confidence,
            color,
            shape: hint.shape,
            degraded_steps: degraded,
            candidates,
        }
    }

    async fn read_imprint(&self, crop: &Crop) -> Result<ImprintText, StepError> {
        let Some(reader) = &self.reader else {
            return Err(StepError::Unconfigured);
        };
        let jpeg = crop.to_jpeg().map_err(StepError::Remote)?;
        imprint::read(
            jpeg,
            reader.as_ref(),
            &self.settings.imprint,
            self.settings.remote.timeout(),
        )
        .await
    }
}

/// Text coming back with a remote-proposed box stands in for OCR when
/// the imprint step cannot run. It is held to the same length bound as
/// OCR tokens; an overlong hint is no imprint at all.
fn hint_imprint(hint: &RemoteHint, settings: &Settings) -> ImprintText {
    let Some(print) = hint.print.as_deref() else {
        return ImprintText::empty();
    };
    let text = imprint::normalize_token(print);
    if text.is_empty() || text.len() > settings.imprint.max_len {
        return ImprintText::empty();
    }
    ImprintText {
        text: imprint::apply_corrections(&text, &settings.imprint),
        confidence: 0.5,
    }
}

/// Two crops reading the same non-empty imprint are the same pill seen
/// twice; the leftmost reading wins.
fn dedup_by_print(analyzed: Vec<CropAnalysis>) -> Vec<CropAnalysis> {
    let mut seen: Vec<String> = Vec::new();
    analyzed
        .into_iter()
        .filter(|analysis| {
            if analysis.print.is_empty() {
                return true;
            }
            if seen.contains(&analysis.print) {
                debug!(print = %analysis.print, "dropping duplicate imprint");
                return false;
            }
            seen.push(analysis.print.clone());
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogStore, InMemoryCatalog};
    use crate::matcher::MatchTier;
    use crate::providers::{ServiceFuture, TextObservation};
    use image::{Rgb, RgbImage};

    struct ScriptedReader {
        observations: Result<Vec<String>, ()>,
    }

    impl ScriptedReader {
        fn reading(tokens: &[&str]) -> Self {
            Self {
                observations: Ok(tokens.iter().map(|token| token.to_string()).collect()),
            }
        }

        fn failing() -> Self {
            Self { observations: Err(()) }
        }
    }

    impl TextReader for ScriptedReader {
        fn read_text(&self, _image_jpeg: Vec<u8>) -> ServiceFuture<Vec<TextObservation>> {
            let observations = self.observations.clone();
            Box::pin(async move {
                match observations {
                    Ok(tokens) => Ok(tokens
                        .into_iter()
                        .map(|text| TextObservation { text })
                        .collect()),
                    Err(()) => Err(anyhow::anyhow!("ocr backend unavailable")),
                }
            })
        }
    }

    fn frame_with_pills(offsets: &[u32]) -> Vec<u8> {
        let mut frame = RgbImage::from_pixel(600, 300, Rgb([250, 250, 250]));
        for &offset in offsets {
            for y in 100..160 {
                for x in offset..offset + 80 {
                    frame.put_pixel(x, y, Rgb([40, 40, 40]));
                }
            }
        }
        detect::encode_png(&frame).expect("encode test frame")
    }

    fn catalog_with(records: Vec<crate::catalog::CatalogRecord>) -> Arc<dyn CatalogStore> {
        Arc::new(InMemoryCatalog::from_records(records))
    }

    fn black_pill(id: &str, imprint: &str) -> crate::catalog::CatalogRecord {
        crate::catalog::record(id, &format!("Pill {id}"), "black", Some(imprint), 10)
    }

    #[tokio::test]
    async fn undecodable_upload_is_the_only_hard_error() {
        let pipeline = Pipeline::new(Settings::default(), catalog_with(Vec::new()));
        assert!(pipeline.analyze(b"definitely not an image").await.is_err());
    }

    #[tokio::test]
    async fn blank_photo_yields_an_empty_analysis() {
        let pipeline = Pipeline::new(Settings::default(), catalog_with(Vec::new()));
        let analysis = pipeline.analyze(&frame_with_pills(&[])).await.expect("analyze");
        assert!(analysis.crops.is_empty());
    }

    #[tokio::test]
    async fn pill_is_read_classified_and_matched() {
        let pipeline = Pipeline::new(
            Settings::default(),
            catalog_with(vec![black_pill("a-1", "AB12")]),
        )
        .with_reader(Arc::new(ScriptedReader::reading(&["AB12", "AB12"])));

        let analysis = pipeline.analyze(&frame_with_pills(&[150])).await.expect("analyze");
        assert_eq!(analysis.crops.len(), 1);

        let crop = &analysis.crops[0];
        assert_eq!(crop.provenance, Provenance::Classical);
        assert_eq!(crop.print, "AB12");
        assert_eq!(crop.color, ColorLabel::Black);
        assert!(crop.degraded_steps.is_empty());
        assert_eq!(crop.candidates.len(), 1);
        assert_eq!(crop.candidates[0].tier, MatchTier::ImprintAndColor);
        assert_eq!(crop.candidates[0].record.id, "a-1");
    }

    #[tokio::test]
    async fn failed_ocr_degrades_to_color_only_matching() {
        let pipeline = Pipeline::new(
            Settings::default(),
            catalog_with(vec![black_pill("a-1", "AB12")]),
        )
        .with_reader(Arc::new(ScriptedReader::failing()));

        let analysis = pipeline.analyze(&frame_with_pills(&[150])).await.expect("analyze");
        assert_eq!(analysis.crops.len(), 1);

        let crop = &analysis.crops[0];
        assert!(crop.print.is_empty());
        assert_eq!(crop.degraded_steps, vec![DegradedStep::Imprint]);
        assert_eq!(crop.candidates.len(), 1);
        assert_eq!(crop.candidates[0].tier, MatchTier::ColorFallback);
    }

    #[tokio::test]
    async fn missing_reader_also_degrades_instead_of_failing() {
        let pipeline = Pipeline::new(
            Settings::default(),
            catalog_with(vec![black_pill("a-1", "AB12")]),
        );

        let analysis = pipeline.analyze(&frame_with_pills(&[150])).await.expect("analyze");
        assert_eq!(analysis.crops.len(), 1);
        assert_eq!(analysis.crops[0].degraded_steps, vec![DegradedStep::Imprint]);
    }

    #[tokio::test]
    async fn duplicate_imprints_collapse_to_the_first_crop() {
        let pipeline = Pipeline::new(
            Settings::default(),
            catalog_with(vec![black_pill("a-1", "AB12")]),
        )
        .with_reader(Arc::new(ScriptedReader::reading(&["AB12", "AB12"])));

        let analysis = pipeline
            .analyze(&frame_with_pills(&[100, 400]))
            .await
            .expect("analyze");
        assert_eq!(analysis.crops.len(), 1);
        assert!(analysis.crops[0].bbox.x < 200);
    }

    struct ScriptedVision {
        reply: String,
    }

    impl crate::providers::VisionModel for ScriptedVision {
        fn analyze_image(&self, _image_jpeg: Vec<u8>, _prompt: String) -> ServiceFuture<String> {
            let reply = self.reply.clone();
            Box::pin(async move { Ok(reply) })
        }
    }

    #[tokio::test]
    async fn overlong_remote_hint_never_becomes_an_imprint() {
        // A remote region whose volunteered text exceeds the imprint
        // length bound must degrade to an empty imprint, not flow
        // through to the result.
        let vision = ScriptedVision {
            reply: "[{\"box_2d\": [250, 250, 750, 750], \"print\": \"PARACETAMOL500\", \"color\": \"white\"}]"
                .to_string(),
        };
        let pipeline = Pipeline::new(
            Settings::default(),
            catalog_with(vec![crate::catalog::record("w-1", "Blanco", "white", None, 3)]),
        )
        .with_vision(Arc::new(vision));

        let frame = RgbImage::from_pixel(400, 300, Rgb([250, 250, 250]));
        let frame_bytes = detect::encode_png(&frame).expect("encode blank frame");

        let analysis = pipeline.analyze(&frame_bytes).await.expect("analyze");
        assert_eq!(analysis.crops.len(), 1);

        let crop = &analysis.crops[0];
        assert_eq!(crop.provenance, Provenance::Remote);
        assert!(crop.print.is_empty());
        assert!(crop.degraded_steps.contains(&DegradedStep::Imprint));
    }

    #[test]
    fn overlong_hint_yields_an_empty_imprint() {
        let settings = Settings::default();
        let hint = RemoteHint {
            print: Some("PARACETAMOL500".to_string()),
            color: None,
            shape: None,
        };
        let imprint = hint_imprint(&hint, &settings);
        assert!(imprint.is_empty());
        assert_eq!(imprint.confidence, 0.0);
    }

    #[test]
    fn hinted_text_is_normalized_and_corrected() {
        let mut settings = Settings::default();
        settings
            .imprint
            .corrections
            .insert("H15".to_string(), "HIS".to_string());
        let hint = RemoteHint {
            print: Some(" h15 ".to_string()),
            color: None,
            shape: None,
        };
        let imprint = hint_imprint(&hint, &settings);
        assert_eq!(imprint.text, "HIS");
        assert!(imprint.confidence > 0.0);
    }
}
