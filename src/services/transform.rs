//! src/services/transform.rs
//!
//! Image transforms applied at upload time (normalize-resize, written back
//! in place) and at serve time (encoded into a response buffer).

use crate::{
    models::transform::{ResizeMethod, TransformRequest},
    services::context::ServiceContext,
};
use image::{
    DynamicImage, ImageDecoder, ImageFormat, ImageReader,
    imageops::{self, FilterType},
};
use std::{
    io::{self, Cursor},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error};

/// Images at or below this width never receive a watermark.
const WATERMARK_MIN_WIDTH: u32 = 100;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to encode image `{}`: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write image `{}`: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Raster format for a file extension, if it is one the engine handles.
pub fn raster_format(path: &Path) -> Option<ImageFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        "tif" | "tiff" => Some(ImageFormat::Tiff),
        "bmp" => Some(ImageFormat::Bmp),
        _ => None,
    }
}

/// Fill in a zero target dimension from the source aspect ratio.
///
/// Falls back to the source dimension when the proportional result rounds
/// down to zero.
pub fn target_box(src_w: u32, src_h: u32, width: u32, height: u32) -> (u32, u32) {
    let (mut w, mut h) = (width, height);
    if w == 0 {
        if src_h > 0 {
            w = proportional(src_w, h, src_h);
        }
        if w == 0 {
            w = src_w;
        }
    } else if h == 0 {
        if src_w > 0 {
            h = proportional(src_h, w, src_w);
        }
        if h == 0 {
            h = src_h;
        }
    }
    (w, h)
}

/// Target box clipped to the source size. Images are never upscaled, and
/// the intermediate `resize_to_fill` builds can never exceed the source.
pub fn bounded_box(src_w: u32, src_h: u32, width: u32, height: u32) -> (u32, u32) {
    let (w, h) = target_box(src_w, src_h, width, height);
    (w.min(src_w), h.min(src_h))
}

fn proportional(value: u32, num: u32, den: u32) -> u32 {
    let scaled = u64::from(value) * u64::from(num) / u64::from(den);
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

#[derive(Debug)]
pub struct TransformEngine {
    ctx: Arc<ServiceContext>,
    watermark_opacity: f32,
}

impl TransformEngine {
    pub fn new(ctx: Arc<ServiceContext>, watermark_opacity: f32) -> Self {
        Self {
            ctx,
            watermark_opacity: watermark_opacity.clamp(0.0, 1.0),
        }
    }

    /// Apply `params` to the image at `path`.
    ///
    /// With `sink` the result is encoded into it in the file's own format;
    /// without, the file is overwritten in place. Returns `false` when nothing
    /// was produced: empty parameters, a non-raster extension, an undecodable
    /// file, or no step that changed the image. Callers fall back to the
    /// original bytes in that case.
    pub fn handle(
        &self,
        path: &Path,
        sink: Option<&mut Vec<u8>>,
        params: &TransformRequest,
    ) -> Result<bool, TransformError> {
        if params.is_empty() {
            return Ok(false);
        }
        let Some(format) = raster_format(path) else {
            return Ok(false);
        };
        let mut img = match decode_oriented(path) {
            Ok(img) => img,
            Err(err) => {
                debug!(path = %path.display(), %err, "not decodable as image, skipping transform");
                return Ok(false);
            }
        };

        let mut changed = false;

        if params.width > 0 || params.height > 0 {
            let (w, h) = bounded_box(img.width(), img.height(), params.width, params.height);
            if img.width() > w || img.height() > h {
                img = match params.method {
                    ResizeMethod::Fit => img.resize(w, h, FilterType::Lanczos3),
                    ResizeMethod::Fill => img.resize_to_fill(w, h, FilterType::Lanczos3),
                };
            }
            changed = true;
        }

        let sigma = params.blur_sigma();
        if sigma > 0.0 {
            img = img.blur(sigma);
            changed = true;
        }

        if params.grayscale {
            img = img.grayscale();
            changed = true;
        }

        if params.watermark && self.apply_watermark(&mut img) {
            changed = true;
        }

        if !changed {
            return Ok(false);
        }

        let encoded = encode(&img, format).map_err(|source| {
            error!(path = %path.display(), %source, "Fail to encode image");
            TransformError::Encode {
                path: path.to_path_buf(),
                source,
            }
        })?;

        match sink {
            Some(buf) => buf.extend_from_slice(&encoded),
            None => std::fs::write(path, &encoded).map_err(|source| {
                error!(path = %path.display(), %source, "Fail to save image");
                TransformError::Write {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
        }

        Ok(true)
    }

    /// Overlay the loaded watermark, scaled to a third of the image width,
    /// at the center. Returns whether anything was drawn.
    fn apply_watermark(&self, img: &mut DynamicImage) -> bool {
        let Some(mark) = self.ctx.watermark() else {
            return false;
        };
        if img.width() <= WATERMARK_MIN_WIDTH || mark.width() == 0 {
            return false;
        }

        let mark_w = img.width() / 3;
        let mark_h = ((u64::from(mark.height()) * u64::from(mark_w)) / u64::from(mark.width()))
            .max(1) as u32;
        let mut mark = mark
            .resize_exact(mark_w, mark_h, FilterType::Lanczos3)
            .to_rgba8();
        if self.watermark_opacity < 1.0 {
            for px in mark.pixels_mut() {
                px[3] = (f32::from(px[3]) * self.watermark_opacity).round() as u8;
            }
        }

        let mut base = img.to_rgba8();
        let x = (i64::from(base.width()) - i64::from(mark.width())) / 2;
        let y = (i64::from(base.height()) - i64::from(mark.height())) / 2;
        imageops::overlay(&mut base, &mark, x, y);
        *img = DynamicImage::ImageRgba8(base);
        true
    }
}

/// Decode the image at `path`, applying any EXIF orientation.
fn decode_oriented(path: &Path) -> image::ImageResult<DynamicImage> {
    let mut decoder = ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Encode `img` as `format`, converting to a color type the encoder accepts.
fn encode(img: &DynamicImage, format: ImageFormat) -> image::ImageResult<Vec<u8>> {
    let prepared = match format {
        ImageFormat::Jpeg => match img {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img.clone(),
            _ => DynamicImage::ImageRgb8(img.to_rgb8()),
        },
        ImageFormat::Png => img.clone(),
        _ if img.color().has_alpha() => DynamicImage::ImageRgba8(img.to_rgba8()),
        _ => DynamicImage::ImageRgb8(img.to_rgb8()),
    };

    let mut out = Cursor::new(Vec::new());
    prepared.write_to(&mut out, format)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use tempfile::TempDir;

    fn engine() -> TransformEngine {
        TransformEngine::new(Arc::new(ServiceContext::new()), 1.0)
    }

    fn write_png(dir: &TempDir, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.path().join(name);
        RgbImage::from_pixel(w, h, Rgb([200, 10, 10]))
            .save(&path)
            .unwrap();
        path
    }

    fn decoded_dims(bytes: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(bytes).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn target_box_infers_missing_dimension() {
        assert_eq!(target_box(400, 200, 100, 0), (100, 50));
        assert_eq!(target_box(400, 200, 0, 100), (200, 100));
        assert_eq!(target_box(400, 200, 80, 90), (80, 90));
    }

    #[test]
    fn target_box_falls_back_to_source_when_rounding_to_zero() {
        assert_eq!(target_box(1, 1000, 0, 1), (1, 1));
        assert_eq!(target_box(1000, 1, 1, 0), (1, 1));
    }

    #[test]
    fn bounded_box_never_exceeds_source() {
        assert_eq!(bounded_box(10, 10, u32::MAX, 1), (10, 1));
        assert_eq!(bounded_box(10, 10, 0, u32::MAX), (10, 10));
        assert_eq!(bounded_box(400, 200, 100, 0), (100, 50));
        assert_eq!(target_box(10, 1, 0, u32::MAX), (u32::MAX, u32::MAX));
    }

    #[test]
    fn oversized_fill_box_is_clipped_to_source() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "tiny.png", 10, 10);
        let params = TransformRequest {
            method: ResizeMethod::Fill,
            width: u32::MAX,
            height: 1,
            ..Default::default()
        };
        let mut buf = Vec::new();
        assert!(engine().handle(&path, Some(&mut buf), &params).unwrap());
        assert_eq!(decoded_dims(&buf), (10, 1));
    }

    #[test]
    fn huge_blur_completes_on_small_image() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "tiny.png", 10, 10);
        let params = TransformRequest {
            blur: 1e12,
            ..Default::default()
        };
        let mut buf = Vec::new();
        assert!(engine().handle(&path, Some(&mut buf), &params).unwrap());
        assert_eq!(decoded_dims(&buf), (10, 10));
    }

    #[test]
    fn empty_params_are_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "a.png", 20, 20);
        let mut buf = Vec::new();
        let changed = engine()
            .handle(&path, Some(&mut buf), &TransformRequest::default())
            .unwrap();
        assert!(!changed);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_extension_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();
        let mut buf = Vec::new();
        let changed = engine()
            .handle(&path, Some(&mut buf), &TransformRequest::fit(10, 10))
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn undecodable_image_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        let mut buf = Vec::new();
        let changed = engine()
            .handle(&path, Some(&mut buf), &TransformRequest::fit(10, 10))
            .unwrap();
        assert!(!changed);
        assert!(buf.is_empty());
    }

    #[test]
    fn fit_keeps_aspect_inside_box() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "wide.png", 400, 200);
        let mut buf = Vec::new();
        assert!(
            engine()
                .handle(&path, Some(&mut buf), &TransformRequest::fit(100, 100))
                .unwrap()
        );
        assert_eq!(decoded_dims(&buf), (100, 50));
    }

    #[test]
    fn fill_crops_to_exact_box() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "wide.png", 400, 200);
        let params = TransformRequest {
            method: ResizeMethod::Fill,
            width: 100,
            height: 100,
            ..Default::default()
        };
        let mut buf = Vec::new();
        assert!(engine().handle(&path, Some(&mut buf), &params).unwrap());
        assert_eq!(decoded_dims(&buf), (100, 100));
    }

    #[test]
    fn small_source_is_not_upscaled_but_still_encoded() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "small.png", 50, 40);
        let mut buf = Vec::new();
        assert!(
            engine()
                .handle(&path, Some(&mut buf), &TransformRequest::fit(500, 500))
                .unwrap()
        );
        assert_eq!(decoded_dims(&buf), (50, 40));
    }

    #[test]
    fn in_place_rewrites_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.jpg");
        RgbImage::from_pixel(300, 150, Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        assert!(
            engine()
                .handle(&path, None, &TransformRequest::fit(60, 60))
                .unwrap()
        );

        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (60, 30));
    }

    #[test]
    fn grayscale_jpeg_encodes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("color.jpg");
        RgbImage::from_pixel(32, 32, Rgb([250, 0, 0]))
            .save(&path)
            .unwrap();
        let params = TransformRequest {
            grayscale: true,
            ..Default::default()
        };
        let mut buf = Vec::new();
        assert!(engine().handle(&path, Some(&mut buf), &params).unwrap());
        let img = image::load_from_memory(&buf).unwrap();
        let px = img.to_rgb8().get_pixel(16, 16).0;
        assert!(px[0].abs_diff(px[1]) <= 2 && px[1].abs_diff(px[2]) <= 2);
    }

    #[test]
    fn watermark_requires_loaded_image_and_min_width() {
        let dir = TempDir::new().unwrap();
        let wide = write_png(&dir, "wide.png", 300, 300);
        let narrow = write_png(&dir, "narrow.png", 80, 80);
        let params = TransformRequest {
            watermark: true,
            ..Default::default()
        };

        let ctx = Arc::new(ServiceContext::new());
        let engine = TransformEngine::new(ctx.clone(), 1.0);

        let mut buf = Vec::new();
        assert!(
            !engine.handle(&wide, Some(&mut buf), &params).unwrap(),
            "no watermark loaded"
        );

        ctx.set_watermark(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            10,
            10,
            Rgba([0, 0, 255, 255]),
        )));

        assert!(
            !engine.handle(&narrow, Some(&mut buf), &params).unwrap(),
            "image too narrow"
        );

        assert!(engine.handle(&wide, Some(&mut buf), &params).unwrap());
        let out = image::load_from_memory(&buf).unwrap().to_rgb8();
        let center = out.get_pixel(150, 150).0;
        assert!(center[0] < 5 && center[2] > 250, "watermark at center: {center:?}");
        assert_eq!(out.get_pixel(5, 5).0, [200, 10, 10], "corner untouched");
    }

    #[test]
    fn watermark_opacity_blends() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "base.png", 300, 300);
        let ctx = Arc::new(ServiceContext::new());
        ctx.set_watermark(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            10,
            10,
            Rgba([0, 0, 255, 255]),
        )));
        let engine = TransformEngine::new(ctx, 0.5);
        let params = TransformRequest {
            watermark: true,
            ..Default::default()
        };

        let mut buf = Vec::new();
        assert!(engine.handle(&path, Some(&mut buf), &params).unwrap());
        let px = image::load_from_memory(&buf).unwrap().to_rgb8();
        let center = px.get_pixel(150, 150).0;
        assert!(center[0] > 50 && center[0] < 150, "red channel half blended: {center:?}");
        assert!(center[2] > 100 && center[2] < 200, "blue channel half blended: {center:?}");
    }
}
