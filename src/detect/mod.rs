use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use tracing::{debug, warn};

use crate::error::StepError;
use crate::providers::{BoundingBox, ObjectDetector, VisionModel, bounded};
use crate::settings::Settings;

mod classical;
mod remote;

pub use remote::RemoteRegion;

/// Which tier produced a crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Classical,
    Detector,
    Remote,
}

/// Visual attributes the remote tier volunteered with its boxes. Used as
/// a substitute when the per-crop stages cannot run.
#[derive(Debug, Clone, Default)]
pub struct RemoteHint {
    pub print: Option<String>,
    pub color: Option<String>,
    pub shape: Option<String>,
}

/// One candidate pill region cut from the source frame.
#[derive(Debug, Clone)]
pub struct Crop {
    pub image: RgbImage,
    pub bbox: BoundingBox,
    pub provenance: Provenance,
    pub hint: Option<RemoteHint>,
}

impl Crop {
    fn cut(
        frame: &RgbImage,
        bbox: BoundingBox,
        provenance: Provenance,
        hint: Option<RemoteHint>,
    ) -> Crop {
        let image = image::imageops::crop_imm(frame, bbox.x, bbox.y, bbox.w, bbox.h).to_image();
        Crop { image, bbox, provenance, hint }
    }

    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        encode(&self.image, ImageFormat::Jpeg)
    }
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    encode(image, ImageFormat::Jpeg)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    encode(image, ImageFormat::Png)
}

fn encode(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .with_context(|| format!("failed to encode crop as {:?}", format))?;
    Ok(buffer.into_inner())
}

/// Run the detection tiers in order of cost, stopping at the first one
/// that produces at least one crop. Tier failures are logged and treated
/// as zero crops, never surfaced as errors.
pub async fn detect(
    frame: &RgbImage,
    detector: Option<&dyn ObjectDetector>,
    vision: Option<&dyn VisionModel>,
    settings: &Settings,
) -> Vec<Crop> {
    let boxes = classical::segment(frame, &settings.detection);
    if !boxes.is_empty() {
        debug!(count = boxes.len(), "contour segmentation found regions");
        return boxes
            .into_iter()
            .map(|bbox| Crop::cut(frame, bbox, Provenance::Classical, None))
            .collect();
    }

    if let Some(detector) = detector {
        match detector_tier(frame, detector, settings).await {
            Ok(boxes) if !boxes.is_empty() => {
                debug!(count = boxes.len(), "detector found regions");
                return boxes
                    .into_iter()
                    .map(|bbox| Crop::cut(frame, bbox, Provenance::Detector, None))
                    .collect();
            }
            Ok(_) => debug!("detector found no regions"),
            Err(err) => warn!(error = %err, "detector tier failed"),
        }
    }

    if let Some(vision) = vision {
        match remote_tier(frame, vision, settings).await {
            Ok(regions) if !regions.is_empty() => {
                debug!(count = regions.len(), "remote model proposed regions");
                return regions
                    .into_iter()
                    .map(|region| {
                        let hint = RemoteHint {
                            print: region.print,
                            color: region.color,
                            shape: region.shape,
                        };
                        Crop::cut(frame, region.bbox, Provenance::Remote, Some(hint))
                    })
                    .collect();
            }
            Ok(_) => debug!("remote model proposed no regions"),
            Err(err) => warn!(error = %err, "remote tier failed"),
        }
    }

    Vec::new()
}

/// The detector sees a sharpened copy; crops are still cut from the
/// original frame.
async fn detector_tier(
    frame: &RgbImage,
    detector: &dyn ObjectDetector,
    settings: &Settings,
) -> Result<Vec<BoundingBox>, StepError> {
    let (frame_w, frame_h) = frame.dimensions();
    let sharpened = image::imageops::unsharpen(frame, 1.5, 3);
    let png = encode_png(&sharpened).map_err(StepError::Remote)?;

    let detection = &settings.detection;
    let detections = bounded(
        detector.predict(png, detection.detector_confidence, detection.detector_iou),
        settings.remote.timeout(),
    )
    .await?;

    let frame_area = frame_w as f64 * frame_h as f64;
    let mut boxes: Vec<BoundingBox> = detections
        .into_iter()
        .filter(|detected| detected.confidence >= detection.detector_confidence)
        .filter_map(|detected| clip(detected.bbox, frame_w, frame_h))
        .filter(|bbox| (bbox.area() as f64) <= frame_area * detection.max_frame_ratio)
        .map(|bbox| bbox.padded(detection.padding, frame_w, frame_h))
        .collect();
    boxes.sort_by_key(|bbox| (bbox.x, bbox.y));
    boxes.truncate(detection.max_crops);
    Ok(boxes)
}

async fn remote_tier(
    frame: &RgbImage,
    vision: &dyn VisionModel,
    settings: &Settings,
) -> Result<Vec<RemoteRegion>, StepError> {
    let (frame_w, frame_h) = frame.dimensions();
    let jpeg = encode_jpeg(frame).map_err(StepError::Remote)?;
    let mut regions =
        remote::propose(jpeg, frame_w, frame_h, vision, settings).await?;
    for region in &mut regions {
        region.bbox = region
            .bbox
            .padded(settings.detection.padding, frame_w, frame_h);
    }
    regions.sort_by_key(|region| (region.bbox.x, region.bbox.y));
    regions.truncate(settings.detection.max_crops);
    Ok(regions)
}

fn clip(bbox: BoundingBox, frame_w: u32, frame_h: u32) -> Option<BoundingBox> {
    if bbox.x >= frame_w || bbox.y >= frame_h {
        return None;
    }
    let w = bbox.w.min(frame_w - bbox.x);
    let h = bbox.h.min(frame_h - bbox.y);
    (w > 0 && h > 0).then_some(BoundingBox { x: bbox.x, y: bbox.y, w, h })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Detection, ServiceFuture};
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedDetector {
        calls: AtomicUsize,
        detections: Vec<Detection>,
    }

    impl ScriptedDetector {
        fn new(detections: Vec<Detection>) -> Self {
            Self { calls: AtomicUsize::new(0), detections }
        }
    }

    impl ObjectDetector for ScriptedDetector {
        fn predict(&self, _image_png: Vec<u8>, _conf: f32, _iou: f32) -> ServiceFuture<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let detections = self.detections.clone();
            Box::pin(async move { Ok(detections) })
        }
    }

    struct ScriptedVision {
        calls: AtomicUsize,
        reply: String,
    }

    impl ScriptedVision {
        fn new(reply: &str) -> Self {
            Self { calls: AtomicUsize::new(0), reply: reply.to_string() }
        }
    }

    impl VisionModel for ScriptedVision {
        fn analyze_image(&self, _image_jpeg: Vec<u8>, _prompt: String) -> ServiceFuture<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.reply.clone();
            Box::pin(async move { Ok(reply) })
        }
    }

    fn blank_frame(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([250, 250, 250]))
    }

    fn frame_with_pill() -> RgbImage {
        let mut frame = blank_frame(400, 300);
        for y in 100..160 {
            for x in 150..230 {
                frame.put_pixel(x, y, Rgb([40, 40, 40]));
            }
        }
        frame
    }

    #[tokio::test]
    async fn first_tier_hit_skips_the_rest() {
        let settings = Settings::default();
        let detector = ScriptedDetector::new(vec![Detection {
            bbox: BoundingBox { x: 0, y: 0, w: 50, h: 50 },
            confidence: 0.9,
        }]);
        let vision = ScriptedVision::new("[]");

        let crops = detect(&frame_with_pill(), Some(&detector), Some(&vision), &settings).await;
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].provenance, Provenance::Classical);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn detector_covers_for_empty_segmentation() {
        let settings = Settings::default();
        let detector = ScriptedDetector::new(vec![Detection {
            bbox: BoundingBox { x: 100, y: 80, w: 60, h: 40 },
            confidence: 0.8,
        }]);

        let crops = detect(&blank_frame(400, 300), Some(&detector), None, &settings).await;
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].provenance, Provenance::Detector);
        // Padding is applied before cutting.
        assert_eq!(crops[0].bbox, BoundingBox { x: 85, y: 65, w: 90, h: 70 });
        assert_eq!(crops[0].image.dimensions(), (90, 70));
    }

    #[tokio::test]
    async fn near_full_frame_detections_are_discarded() {
        let settings = Settings::default();
        let detector = ScriptedDetector::new(vec![Detection {
            bbox: BoundingBox { x: 0, y: 0, w: 395, h: 295 },
            confidence: 0.99,
        }]);

        let crops = detect(&blank_frame(400, 300), Some(&detector), None, &settings).await;
        assert!(crops.is_empty());
    }

    #[tokio::test]
    async fn remote_model_is_the_last_resort() {
        let settings = Settings::default();
        let detector = ScriptedDetector::new(Vec::new());
        let vision = ScriptedVision::new(
            "```json\n[{\"box_2d\": [250, 250, 750, 750], \"print\": \"B52\", \"color\": \"yellow\", \"shape\": \"oval\"}]\n```",
        );

        let crops = detect(&blank_frame(400, 300), Some(&detector), Some(&vision), &settings).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].provenance, Provenance::Remote);
        let hint = crops[0].hint.as_ref().expect("remote hint");
        assert_eq!(hint.print.as_deref(), Some("B52"));
        assert_eq!(hint.color.as_deref(), Some("yellow"));
    }

    #[tokio::test]
    async fn garbled_remote_reply_means_no_crops() {
        let settings = Settings::default();
        let vision = ScriptedVision::new("I see a tabletop but no medication.");

        let crops = detect(&blank_frame(400, 300), None, Some(&vision), &settings).await;
        assert!(crops.is_empty());
    }
}
