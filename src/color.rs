use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Discrete, human-meaningful color bucket. Exactly one label is
/// assigned per crop; classification never fails, it degrades to
/// [`ColorLabel::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorLabel {
    White,
    Yellow,
    Orange,
    Pink,
    Red,
    Brown,
    LightGreen,
    Green,
    Teal,
    Blue,
    Navy,
    Purple,
    Gray,
    Black,
    Other,
}

impl ColorLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorLabel::White => "white",
            ColorLabel::Yellow => "yellow",
            ColorLabel::Orange => "orange",
            ColorLabel::Pink => "pink",
            ColorLabel::Red => "red",
            ColorLabel::Brown => "brown",
            ColorLabel::LightGreen => "light-green",
            ColorLabel::Green => "green",
            ColorLabel::Teal => "teal",
            ColorLabel::Blue => "blue",
            ColorLabel::Navy => "navy",
            ColorLabel::Purple => "purple",
            ColorLabel::Gray => "gray",
            ColorLabel::Black => "black",
            ColorLabel::Other => "other",
        }
    }

    pub fn parse(value: &str) -> ColorLabel {
        match value.trim().to_lowercase().as_str() {
            "white" => ColorLabel::White,
            "yellow" => ColorLabel::Yellow,
            "orange" => ColorLabel::Orange,
            "pink" => ColorLabel::Pink,
            "red" => ColorLabel::Red,
            "brown" => ColorLabel::Brown,
            "light-green" | "light green" => ColorLabel::LightGreen,
            "green" => ColorLabel::Green,
            "teal" => ColorLabel::Teal,
            "blue" => ColorLabel::Blue,
            "navy" => ColorLabel::Navy,
            "purple" => ColorLabel::Purple,
            "gray" | "grey" => ColorLabel::Gray,
            "black" => ColorLabel::Black,
            _ => ColorLabel::Other,
        }
    }

    pub const ALL: [ColorLabel; 15] = [
        ColorLabel::White,
        ColorLabel::Yellow,
        ColorLabel::Orange,
        ColorLabel::Pink,
        ColorLabel::Red,
        ColorLabel::Brown,
        ColorLabel::LightGreen,
        ColorLabel::Green,
        ColorLabel::Teal,
        ColorLabel::Blue,
        ColorLabel::Navy,
        ColorLabel::Purple,
        ColorLabel::Gray,
        ColorLabel::Black,
        ColorLabel::Other,
    ];
}

/// Classify the dominant color of a pill crop.
///
/// The central third of the crop is sampled to keep background and edge
/// shading out of the estimate, the lightness channel is equalized to
/// tame uneven illumination, and the sampled pixels are collapsed to a
/// single centroid before HSV bucketing.
pub fn classify(crop: &RgbImage) -> ColorLabel {
    let Some(centroid) = dominant_color(crop) else {
        return ColorLabel::Other;
    };
    let (h, s, v) = rgb_to_hsv(centroid);
    label_from_hsv(h, s, v)
}

/// Mean color of the equalized central third, sampled on a sparse grid.
/// With a single cluster, k-means collapses to the sample mean, so the
/// centroid is computed directly.
fn dominant_color(crop: &RgbImage) -> Option<[f32; 3]> {
    let (w, h) = crop.dimensions();
    if w == 0 || h == 0 {
        return None;
    }

    let (x0, x1) = center_band(w);
    let (y0, y1) = center_band(h);

    let gains = lightness_gains(crop, x0, y0, x1, y1);

    let step = (((x1 - x0).max(y1 - y0)) / 24).max(1) as usize;
    let mut sum = [0.0f64; 3];
    let mut count = 0u64;
    for y in (y0..y1).step_by(step) {
        for x in (x0..x1).step_by(step) {
            let pixel = crop.get_pixel(x, y).0;
            let gain = gains.gain_for(pixel);
            for channel in 0..3 {
                sum[channel] += (pixel[channel] as f64 * gain).min(255.0);
            }
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    Some([
        (sum[0] / count as f64) as f32,
        (sum[1] / count as f64) as f32,
        (sum[2] / count as f64) as f32,
    ])
}

fn center_band(extent: u32) -> (u32, u32) {
    if extent < 3 {
        (0, extent)
    } else {
        (extent / 3, extent * 2 / 3)
    }
}

/// Histogram-equalization gains for the lightness channel, computed over
/// the sampled region. Applied multiplicatively per pixel so chroma is
/// preserved while illumination is flattened.
struct LightnessGains {
    remap: [u8; 256],
}

impl LightnessGains {
    fn gain_for(&self, pixel: [u8; 3]) -> f64 {
        let lightness = luma(pixel);
        if lightness == 0 {
            return 1.0;
        }
        self.remap[lightness as usize] as f64 / lightness as f64
    }
}

fn lightness_gains(crop: &RgbImage, x0: u32, y0: u32, x1: u32, y1: u32) -> LightnessGains {
    let mut histogram = [0u32; 256];
    let mut total = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            histogram[luma(crop.get_pixel(x, y).0) as usize] += 1;
            total += 1;
        }
    }
    let mut remap = [0u8; 256];
    if total == 0 {
        for (index, slot) in remap.iter_mut().enumerate() {
            *slot = index as u8;
        }
        return LightnessGains { remap };
    }

    // Clip the histogram before building the CDF so a dominant flat
    // region cannot blow the contrast out (the "contrast-limited" part).
    let clip = (total / 64).max(1);
    let mut clipped = 0u32;
    for slot in histogram.iter_mut() {
        if *slot > clip {
            clipped += *slot - clip;
            *slot = clip;
        }
    }
    let redistribute = clipped / 256;
    for slot in histogram.iter_mut() {
        *slot += redistribute;
    }

    let mut cumulative = 0u64;
    let total = histogram.iter().map(|&count| count as u64).sum::<u64>().max(1);
    for (index, &count) in histogram.iter().enumerate() {
        cumulative += count as u64;
        remap[index] = ((cumulative * 255) / total) as u8;
    }
    LightnessGains { remap }
}

fn luma(pixel: [u8; 3]) -> u8 {
    let [r, g, b] = pixel;
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

/// RGB (0-255) to HSV with hue in degrees.
fn rgb_to_hsv(rgb: [f32; 3]) -> (f32, f32, f32) {
    let r = rgb[0] / 255.0;
    let g = rgb[1] / 255.0;
    let b = rgb[2] / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue, saturation, max)
}

/// Fixed threshold bands. Low saturation resolves by value; saturated
/// colors resolve by hue in circular order, with red wrapping the origin
/// and brown taken from the dark orange region.
fn label_from_hsv(h: f32, s: f32, v: f32) -> ColorLabel {
    if s < 0.14 {
        return if v > 0.62 {
            ColorLabel::White
        } else if v < 0.24 {
            ColorLabel::Black
        } else {
            ColorLabel::Gray
        };
    }

    if (20.0..70.0).contains(&h) && v < 0.45 {
        return ColorLabel::Brown;
    }

    match h {
        h if h < 18.0 || h >= 340.0 => ColorLabel::Red,
        h if h < 45.0 => ColorLabel::Orange,
        h if h < 70.0 => ColorLabel::Yellow,
        h if h < 95.0 => ColorLabel::LightGreen,
        h if h < 150.0 => ColorLabel::Green,
        h if h < 175.0 => ColorLabel::Teal,
        h if h < 225.0 => {
            if v < 0.35 {
                ColorLabel::Navy
            } else {
                ColorLabel::Blue
            }
        }
        h if h < 255.0 => ColorLabel::Navy,
        h if h < 290.0 => ColorLabel::Purple,
        _ => ColorLabel::Pink,
    }
}
