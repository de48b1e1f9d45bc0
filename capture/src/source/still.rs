use bytes::Bytes;
use frame_verdict_common::frame::Still;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use std::io::Cursor;

use super::SourceError;

/// Turn the most recent JPEG from a source into a still of the configured size.
///
/// When the image already has the target size (or no size is configured) the
/// JPEG bytes are forwarded untouched; otherwise the image is decoded, scaled
/// to exactly `target` and re-encoded at `quality`.
pub fn encode_still(
    jpeg: &Bytes,
    target: Option<(u32, u32)>,
    quality: u8,
) -> Result<Still, SourceError> {
    let (width, height) = ImageReader::new(Cursor::new(jpeg.as_ref()))
        .with_guessed_format()
        .map_err(|e| SourceError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| SourceError::Decode(e.to_string()))?;

    let Some((target_w, target_h)) = target else {
        return Ok(Still::jpeg(jpeg.clone(), width, height));
    };
    if (width, height) == (target_w, target_h) {
        return Ok(Still::jpeg(jpeg.clone(), width, height));
    }

    let img = ImageReader::new(Cursor::new(jpeg.as_ref()))
        .with_guessed_format()
        .map_err(|e| SourceError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| SourceError::Decode(e.to_string()))?;
    let resized = img.resize_exact(target_w, target_h, FilterType::Triangle).to_rgb8();
    let data = encode_jpeg(&resized, quality)?;
    Ok(Still::jpeg(data, target_w, target_h))
}

/// Whether `jpeg` carries a readable image header.
pub fn is_displayable(jpeg: &[u8]) -> bool {
    ImageReader::new(Cursor::new(jpeg))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .is_some()
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Bytes, SourceError> {
    let mut out = Vec::with_capacity((img.width() * img.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(img)
        .map_err(|e| SourceError::Encode(e.to_string()))?;
    Ok(Bytes::from(out))
}
