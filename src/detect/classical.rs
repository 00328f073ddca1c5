use image::{GrayImage, RgbImage};
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::filter::{box_filter, gaussian_blur_f32};
use imageproc::morphology::close;

use crate::providers::BoundingBox;
use crate::settings::DetectionSettings;

/// Contour-based segmentation: grayscale, blur, inverse adaptive
/// threshold, morphological close, then external contours filtered by
/// area and aspect ratio. Cheap, and good enough on clean backgrounds
/// to make the later tiers rare.
pub fn segment(image: &RgbImage, settings: &DetectionSettings) -> Vec<BoundingBox> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let frame_area = width as f64 * height as f64;

    let gray = image::imageops::grayscale(image);
    let blurred = gaussian_blur_f32(&gray, settings.blur_sigma);
    let mask = adaptive_threshold_inv(
        &blurred,
        settings.threshold_block_radius,
        settings.threshold_offset,
    );
    let mut closed = mask;
    for _ in 0..settings.close_iterations {
        closed = close(&closed, Norm::LInf, 1);
    }

    let mut boxes: Vec<BoundingBox> = find_contours::<i32>(&closed)
        .into_iter()
        .filter(|contour| contour.border_type == BorderType::Outer)
        .filter_map(|contour| accept_contour(&contour, frame_area, settings))
        .map(|bbox| bbox.padded(settings.padding, width, height))
        .collect();

    boxes.sort_by_key(|bbox| (bbox.x, bbox.y));
    boxes.truncate(settings.max_crops);
    boxes
}

/// Inverse binary adaptive threshold against the local mean: pixels
/// darker than their neighborhood (minus an offset) become foreground.
/// The offset keeps flat regions from flickering into the mask.
fn adaptive_threshold_inv(image: &GrayImage, block_radius: u32, offset: i16) -> GrayImage {
    let means = box_filter(image, block_radius, block_radius);
    let mut out = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let mean = means.get_pixel(x, y).0[0] as i16;
        let value = if (pixel.0[0] as i16) < mean - offset {
            255
        } else {
            0
        };
        out.put_pixel(x, y, image::Luma([value]));
    }
    out
}

fn accept_contour(
    contour: &Contour<i32>,
    frame_area: f64,
    settings: &DetectionSettings,
) -> Option<BoundingBox> {
    let area = polygon_area(&contour.points);
    if area < frame_area * settings.min_area_ratio || area > frame_area * settings.max_area_ratio {
        return None;
    }

    let bbox = bounding_box(&contour.points)?;
    if bbox.h == 0 {
        return None;
    }
    let aspect = bbox.w as f32 / bbox.h as f32;
    if aspect < settings.min_aspect || aspect > settings.max_aspect {
        return None;
    }
    Some(bbox)
}

/// Shoelace area of the (closed) contour polygon.
fn polygon_area(points: &[imageproc::point::Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut doubled = 0i64;
    for index in 0..points.len() {
        let current = points[index];
        let next = points[(index + 1) % points.len()];
        doubled += current.x as i64 * next.y as i64 - next.x as i64 * current.y as i64;
    }
    (doubled.abs() as f64) / 2.0
}

fn bounding_box(points: &[imageproc::point::Point<i32>]) -> Option<BoundingBox> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for point in points {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    Some(BoundingBox {
        x: min_x.max(0) as u32,
        y: min_y.max(0) as u32,
        w: (max_x - min_x + 1).max(1) as u32,
        h: (max_y - min_y + 1).max(1) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use image::Rgb;

    fn light_frame(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([250, 250, 250]))
    }

    fn paint_rect(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, value: u8) {
        for py in y..y + h {
            for px in x..x + w {
                image.put_pixel(px, py, Rgb([value, value, value]));
            }
        }
    }

    #[test]
    fn blank_frame_yields_no_regions() {
        let settings = Settings::default().detection;
        assert!(segment(&light_frame(320, 240), &settings).is_empty());
    }

    #[test]
    fn dark_region_is_found_padded_and_clipped() {
        let settings = Settings::default().detection;
        let mut image = light_frame(400, 300);
        paint_rect(&mut image, 150, 100, 80, 60, 40);

        let boxes = segment(&image, &settings);
        assert_eq!(boxes.len(), 1);

        let bbox = boxes[0];
        // Padding grows the box beyond the painted region.
        assert!(bbox.x < 150 && bbox.y < 100);
        assert!(bbox.x + bbox.w > 230 && bbox.y + bbox.h > 160);
        // And it never leaves the frame.
        assert!(bbox.x + bbox.w <= 400);
        assert!(bbox.y + bbox.h <= 300);
    }

    #[test]
    fn region_touching_the_border_stays_in_bounds() {
        let settings = Settings::default().detection;
        let mut image = light_frame(400, 300);
        paint_rect(&mut image, 0, 0, 70, 60, 40);

        let boxes = segment(&image, &settings);
        assert_eq!(boxes.len(), 1);
        assert_eq!((boxes[0].x, boxes[0].y), (0, 0));
        assert!(boxes[0].x + boxes[0].w <= 400);
        assert!(boxes[0].y + boxes[0].h <= 300);
    }

    #[test]
    fn needle_thin_noise_is_rejected_by_aspect() {
        let settings = Settings::default().detection;
        let mut image = light_frame(400, 300);
        paint_rect(&mut image, 50, 150, 200, 4, 40);

        assert!(segment(&image, &settings).is_empty());
    }

    #[test]
    fn full_frame_blobs_are_rejected_by_area() {
        let settings = Settings::default().detection;
        let mut image = light_frame(400, 300);
        paint_rect(&mut image, 50, 50, 300, 200, 40);

        assert!(segment(&image, &settings).is_empty());
    }

    #[test]
    fn regions_come_back_left_to_right_and_capped() {
        let mut settings = Settings::default().detection;
        settings.max_crops = 2;
        let mut image = light_frame(600, 200);
        paint_rect(&mut image, 450, 70, 60, 50, 40);
        paint_rect(&mut image, 60, 70, 60, 50, 40);
        paint_rect(&mut image, 260, 70, 60, 50, 40);

        let boxes = segment(&image, &settings);
        assert_eq!(boxes.len(), 2);
        assert!(boxes[0].x < boxes[1].x);
        assert!(boxes[0].x < 100);
    }
}
