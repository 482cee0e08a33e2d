//! Re-encoding and byte-cap optimisation of images.

use crate::utils::{IkupError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

/// Encodings the transcode cache produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFormat {
    Png,
    Jpeg,
}

impl CacheFormat {
    pub fn ext(&self) -> &'static str {
        match self {
            CacheFormat::Png => "png",
            CacheFormat::Jpeg => "jpeg",
        }
    }

    /// The format an unconstrained conversion of `path` defaults to.
    /// Everything that is not JPEG re-encodes as PNG.
    pub fn from_source(path: &Path) -> CacheFormat {
        let by_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match by_ext.as_deref() {
            Some("jpg") | Some("jpeg") => CacheFormat::Jpeg,
            Some("png") => CacheFormat::Png,
            _ => match image::ImageReader::open(path)
                .ok()
                .and_then(|r| r.with_guessed_format().ok())
                .and_then(|r| r.format())
            {
                Some(ImageFormat::Jpeg) => CacheFormat::Jpeg,
                _ => CacheFormat::Png,
            },
        }
    }

    /// True when the on-disk source already is in this format, making a
    /// plain file copy a valid "conversion".
    pub fn matches_source(&self, path: &Path) -> bool {
        CacheFormat::from_source(path) == *self
            && match self {
                // from_source defaults to PNG, so PNG needs a real probe.
                CacheFormat::Png => {
                    image::ImageReader::open(path)
                        .ok()
                        .and_then(|r| r.with_guessed_format().ok())
                        .and_then(|r| r.format())
                        == Some(ImageFormat::Png)
                }
                CacheFormat::Jpeg => true,
            }
    }
}

impl FromStr for CacheFormat {
    type Err = IkupError;

    fn from_str(s: &str) -> Result<CacheFormat> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(CacheFormat::Png),
            "jpeg" | "jpg" => Ok(CacheFormat::Jpeg),
            other => Err(IkupError::invalid_arg(format!(
                "invalid format '{}', expected png or jpeg",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CacheFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ext())
    }
}

/// JPEG has no alpha channel; composite transparent pixels onto black.
fn flatten_for_jpeg(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        rgb.put_pixel(
            x,
            y,
            image::Rgb([
                (pixel[0] as u32 * alpha / 255) as u8,
                (pixel[1] as u32 * alpha / 255) as u8,
                (pixel[2] as u32 * alpha / 255) as u8,
            ]),
        );
    }
    rgb
}

/// Encode `image` in `format`. Quality applies to JPEG; for PNG it is
/// advisory and ignored.
pub fn encode(image: &DynamicImage, format: CacheFormat, quality: Option<u8>) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        CacheFormat::Png => {
            image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
        }
        CacheFormat::Jpeg => {
            let rgb = flatten_for_jpeg(image);
            let mut cursor = Cursor::new(&mut buffer);
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut cursor,
                quality.unwrap_or(90).clamp(1, 100),
            );
            rgb.write_with_encoder(encoder)?;
        }
    }
    Ok(buffer)
}

/// Resize (never upscaling behaviour is the caller's concern) and encode.
pub fn resize_encode(
    image: &DynamicImage,
    width: u32,
    height: u32,
    format: CacheFormat,
    quality: Option<u8>,
) -> Result<Vec<u8>> {
    if (width, height) == image.dimensions() {
        return encode(image, format, quality);
    }
    let resized = image.resize_exact(width.max(1), height.max(1), FilterType::Lanczos3);
    encode(&resized, format, quality)
}

/// Result of a byte-cap optimisation.
#[derive(Debug)]
pub struct SizedEncoding {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Scale factor 1 was used (no resize happened).
    pub full_size: bool,
    /// Even the 1x1 image exceeds the cap; `data` is that 1x1 image.
    pub impossible: bool,
}

/// Find the largest scale factor `s` in (0, 1] whose re-encoding fits in
/// `max_bytes`, within `tolerance` (fractional). Binary search on `s`,
/// bounded to 8 trial encodes after the full-size attempt.
pub fn optimize_to_size(
    image: &DynamicImage,
    format: CacheFormat,
    quality: Option<u8>,
    max_bytes: u64,
    tolerance: f64,
) -> Result<SizedEncoding> {
    let (src_w, src_h) = image.dimensions();
    let full = encode(image, format, quality)?;
    if full.len() as u64 <= max_bytes {
        return Ok(SizedEncoding {
            data: full,
            width: src_w,
            height: src_h,
            full_size: true,
            impossible: false,
        });
    }

    let dims_for = |s: f64| {
        (
            ((src_w as f64 * s).round() as u32).clamp(1, src_w),
            ((src_h as f64 * s).round() as u32).clamp(1, src_h),
        )
    };
    let floor = (max_bytes as f64 * (1.0 - tolerance)) as u64;
    let mut lo = 0.0f64;
    let mut hi = 1.0f64;
    let mut best: Option<SizedEncoding> = None;

    for _ in 0..8 {
        let s = (lo + hi) / 2.0;
        let (w, h) = dims_for(s);
        let data = resize_encode(image, w, h, format, quality)?;
        let size = data.len() as u64;
        log::debug!("byte-cap trial: scale {:.4} -> {}x{} = {} bytes", s, w, h, size);
        if size > max_bytes {
            if (w, h) == (1, 1) {
                // Nothing smaller exists.
                return Ok(SizedEncoding {
                    data,
                    width: 1,
                    height: 1,
                    full_size: false,
                    impossible: true,
                });
            }
            hi = s;
        } else {
            let within_tolerance = size >= floor;
            let better = best
                .as_ref()
                .map(|b| size > b.data.len() as u64)
                .unwrap_or(true);
            if better {
                best = Some(SizedEncoding {
                    data,
                    width: w,
                    height: h,
                    full_size: false,
                    impossible: false,
                });
            }
            if within_tolerance {
                break;
            }
            lo = s;
        }
    }

    match best {
        Some(found) => Ok(found),
        None => {
            // Every trial overflowed; fall back to the smallest image.
            let data = resize_encode(image, 1, 1, format, quality)?;
            let impossible = data.len() as u64 > max_bytes;
            Ok(SizedEncoding {
                data,
                width: 1,
                height: 1,
                full_size: false,
                impossible,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn noisy_image(width: u32, height: u32) -> DynamicImage {
        // Pseudo-random pixels compress poorly, which the byte-cap search
        // needs to actually have to shrink something.
        let img = RgbaImage::from_fn(width, height, |x, y| {
            let v = x.wrapping_mul(2654435761).wrapping_add(y.wrapping_mul(40503));
            image::Rgba([(v & 0xFF) as u8, ((v >> 8) & 0xFF) as u8, ((v >> 16) & 0xFF) as u8, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_encode_formats() {
        let img = noisy_image(16, 16);
        let png = encode(&img, CacheFormat::Png, None).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let jpeg = encode(&img, CacheFormat::Jpeg, Some(80)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_optimize_no_resize_when_it_fits() {
        let img = noisy_image(16, 16);
        let out = optimize_to_size(&img, CacheFormat::Png, None, 1_000_000, 0.2).unwrap();
        assert!(out.full_size);
        assert_eq!((out.width, out.height), (16, 16));
    }

    #[test]
    fn test_optimize_respects_cap() {
        let img = noisy_image(128, 128);
        let full = encode(&img, CacheFormat::Png, None).unwrap();
        let cap = (full.len() / 4) as u64;
        let out = optimize_to_size(&img, CacheFormat::Png, None, cap, 0.2).unwrap();
        assert!(!out.impossible);
        assert!(out.data.len() as u64 <= cap);
        assert!(out.width < 128 && out.height < 128);
    }

    #[test]
    fn test_optimize_impossible_returns_1x1() {
        let img = noisy_image(64, 64);
        let out = optimize_to_size(&img, CacheFormat::Png, None, 20, 0.2).unwrap();
        assert!(out.impossible);
        assert_eq!((out.width, out.height), (1, 1));
    }

    #[test]
    fn test_jpeg_flattens_alpha() {
        let mut rgba = RgbaImage::new(4, 4);
        for pixel in rgba.pixels_mut() {
            *pixel = image::Rgba([255, 0, 0, 0]);
        }
        let img = DynamicImage::ImageRgba8(rgba);
        let jpeg = encode(&img, CacheFormat::Jpeg, Some(90)).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        // Fully transparent red flattens to black.
        assert!(decoded.get_pixel(0, 0)[0] < 32);
    }
}
