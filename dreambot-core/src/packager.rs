//! Turns generated images into attachments the chat platform will accept.
//!
//! PNG first. Anything over the ceiling is re-encoded as JPEG at quality
//! 100, 95, ..., 5 and finally 1; the first encoding that fits wins.

use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tracing::{debug, warn};

use crate::{images, Error, Result};

pub const DEFAULT_UPLOAD_CEILING: usize = 8_000_000;

const JPEG_QUALITY_STEP: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg { quality: u8 },
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg { .. } => "jpg",
        }
    }
}

/// An encoded image ready to attach to a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPacket {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, quality))?;
    Ok(bytes)
}

/// 100, 95, ..., 5, 1
fn jpeg_qualities() -> impl Iterator<Item = u8> {
    (1..=100 / JPEG_QUALITY_STEP)
        .rev()
        .map(|i| i * JPEG_QUALITY_STEP)
        .chain(std::iter::once(1))
}

fn with_extension(filename: &str, extension: &str) -> String {
    match Path::new(filename).file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !stem.is_empty() => format!("{stem}.{extension}"),
        _ => format!("image.{extension}"),
    }
}

/// Encodes `image` to at most `ceiling` bytes or fails with `TooLarge`.
pub fn package(image: &DynamicImage, filename: &str, ceiling: usize) -> Result<UploadPacket> {
    let png = encode_png(image)?;
    if png.len() <= ceiling {
        return Ok(UploadPacket {
            filename: with_extension(filename, "png"),
            bytes: png,
            format: ImageFormat::Png,
        });
    }
    debug!(
        "{} is {} bytes as PNG, over {}; falling back to JPEG",
        filename,
        png.len(),
        ceiling
    );

    let mut smallest = png.len();
    for quality in jpeg_qualities() {
        let jpeg = encode_jpeg(image, quality)?;
        if jpeg.len() <= ceiling {
            debug!("{} fits as JPEG at quality {}", filename, quality);
            return Ok(UploadPacket {
                filename: with_extension(filename, "jpg"),
                bytes: jpeg,
                format: ImageFormat::Jpeg { quality },
            });
        }
        smallest = smallest.min(jpeg.len());
    }

    Err(Error::TooLarge {
        size: smallest,
        ceiling,
        saved_to: None,
    })
}

/// Like [`package`], but an image that cannot fit is kept as a PNG in `keep_dir`
/// and the returned `TooLarge` says where.
pub fn package_or_keep(
    image: &DynamicImage,
    filename: &str,
    ceiling: usize,
    keep_dir: &Path,
) -> Result<UploadPacket> {
    match package(image, filename, ceiling) {
        Err(Error::TooLarge { size, ceiling, .. }) => {
            let path = images::save_png(image, keep_dir, &with_extension(filename, "png"))?;
            warn!(
                "{} does not fit in {} bytes even as JPEG; kept at {}",
                filename,
                ceiling,
                path.display()
            );
            Err(Error::TooLarge {
                size,
                ceiling,
                saved_to: Some(path),
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::{Rng, SeedableRng};

    fn noise(width: u32, height: u32) -> DynamicImage {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |_, _| {
            Rgb([rng.random(), rng.random(), rng.random()])
        }))
    }

    #[test]
    fn test_quality_ladder() {
        let ladder: Vec<u8> = jpeg_qualities().collect();
        assert_eq!(ladder.first(), Some(&100));
        assert_eq!(&ladder[ladder.len() - 3..], &[10, 5, 1]);
        assert_eq!(ladder.len(), 21);
    }

    #[test]
    fn test_small_image_stays_png() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([10, 20, 30])));
        let packet = package(&img, "x_42.png", DEFAULT_UPLOAD_CEILING).unwrap();
        assert_eq!(packet.format, ImageFormat::Png);
        assert_eq!(packet.filename, "x_42.png");
        assert!(image::load_from_memory(&packet.bytes).is_ok());
    }

    #[test]
    fn test_oversized_png_falls_back_to_jpeg() {
        let img = noise(256, 256);
        let png_len = encode_png(&img).unwrap().len();
        let ceiling = png_len / 4;

        let packet = package(&img, "noise.png", ceiling).unwrap();
        assert!(packet.bytes.len() <= ceiling);
        assert!(matches!(packet.format, ImageFormat::Jpeg { .. }));
        assert_eq!(packet.filename, "noise.jpg");
        assert_eq!(
            image::guess_format(&packet.bytes).unwrap(),
            image::ImageFormat::Jpeg
        );
    }

    #[test]
    fn test_unattainable_ceiling_is_too_large() {
        let img = noise(128, 128);
        match package(&img, "noise.png", 64) {
            Err(Error::TooLarge { size, ceiling, saved_to }) => {
                assert!(size > 64);
                assert_eq!(ceiling, 64);
                assert!(saved_to.is_none());
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_too_large_is_kept_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let img = noise(64, 64);
        match package_or_keep(&img, "keep me.png", 64, dir.path()) {
            Err(Error::TooLarge { saved_to: Some(path), .. }) => {
                assert!(path.starts_with(dir.path()));
                let kept = image::open(&path).unwrap();
                assert_eq!(kept.to_rgb8(), img.to_rgb8());
            }
            other => panic!("expected TooLarge with a saved path, got {other:?}"),
        }
    }
}
