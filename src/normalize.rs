use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;

use crate::error::DecodeError;

/// Decode an uploaded photo and apply its EXIF orientation.
///
/// Malformed input is the one fatal error in the pipeline; a photo with
/// no (or unreadable) orientation metadata is decoded as-is.
pub fn normalize(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder
        .orientation()
        .unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    #[test]
    fn decodes_plain_png() {
        let mut bytes = Vec::new();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 6, image::Rgb([10, 20, 30])));
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode png");

        let decoded = normalize(&bytes).expect("normalize");
        assert_eq!((decoded.width(), decoded.height()), (4, 6));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let result = normalize(b"not an image at all");
        assert!(matches!(result, Err(DecodeError::Image(_))));
    }
}
