//! Imaging engine: decodes a source object, applies transformation steps
//! and encodes the result.
//!
//! The [`Transformer`] trait is the seam between the request processor and
//! the imaging code; the engine itself is synchronous and CPU-bound, so the
//! processor runs it on the blocking thread pool.

use crate::object::FileObject;
use crate::response::Response;
use crate::transform::{OutputFormat, Rotation, TransformStep};
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// Largest output dimension the engine will produce.
pub const MAX_DIMENSION: u32 = 8192;

/// Errors from the imaging engine. All of them turn into a 400 for the
/// client; none abort the process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source body is empty")]
    EmptySource,

    #[error("failed to decode source image: {0}")]
    Decode(String),

    #[error("failed to encode output image: {0}")]
    Encode(String),

    #[error("requested dimensions {width}x{height} exceed the {MAX_DIMENSION} pixel limit")]
    DimensionsTooLarge { width: u32, height: u32 },
}

/// Turns `(source bytes, transformation steps)` into output bytes.
pub trait Transformer: Send + Sync + 'static {
    fn transform(
        &self,
        source: &Response,
        target: &FileObject,
        steps: &[TransformStep],
    ) -> Result<Response, EngineError>;
}

/// `image`-crate backed transformer.
pub struct ImageEngine {
    filter: FilterType,
}

impl ImageEngine {
    pub fn new() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl Default for ImageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for ImageEngine {
    fn transform(
        &self,
        source: &Response,
        target: &FileObject,
        steps: &[TransformStep],
    ) -> Result<Response, EngineError> {
        if source.body().is_empty() {
            return Err(EngineError::EmptySource);
        }

        let mut image = image::load_from_memory(source.body())
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        // Default to re-encoding in the source format; a Format step
        // overrides this.
        let mut output_format = image::guess_format(source.body())
            .ok()
            .and_then(output_format_for)
            .unwrap_or(OutputFormat::Jpeg);

        for step in steps {
            match *step {
                TransformStep::Resize { width, height } => {
                    check_dimensions(width, height)?;
                    image = image.resize_exact(width, height, self.filter);
                }
                TransformStep::Crop { width, height } => {
                    check_dimensions(width, height)?;
                    image = center_crop(image, width, height);
                }
                TransformStep::Grayscale => {
                    image = image.grayscale();
                }
                TransformStep::Rotate(rotation) => {
                    image = match rotation {
                        Rotation::Cw90 => image.rotate90(),
                        Rotation::Cw180 => image.rotate180(),
                        Rotation::Cw270 => image.rotate270(),
                    };
                }
                TransformStep::Format(format) => {
                    output_format = format;
                }
            }
        }

        let body = encode(image, output_format)?;
        debug!(
            bucket = %target.bucket,
            key = %target.key,
            steps = steps.len(),
            output_bytes = body.len(),
            format = output_format.as_str(),
            "transformation complete"
        );

        Ok(Response::new(200, Bytes::from(body))
            .with_content_type(output_format.content_type()))
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<(), EngineError> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(EngineError::DimensionsTooLarge { width, height });
    }
    Ok(())
}

/// Crops to at most `width` x `height`, centered; requests larger than the
/// image are clamped to its bounds.
fn center_crop(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    let crop_width = width.min(image.width());
    let crop_height = height.min(image.height());
    let x = (image.width() - crop_width) / 2;
    let y = (image.height() - crop_height) / 2;
    image.crop_imm(x, y, crop_width, crop_height)
}

fn encode(image: DynamicImage, format: OutputFormat) -> Result<Vec<u8>, EngineError> {
    // The JPEG encoder rejects alpha channels.
    let image = match format {
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image,
    };

    let image_format = match format {
        OutputFormat::Jpeg => ImageFormat::Jpeg,
        OutputFormat::Png => ImageFormat::Png,
        OutputFormat::Webp => ImageFormat::WebP,
    };

    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), image_format)
        .map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(out)
}

fn output_format_for(format: ImageFormat) -> Option<OutputFormat> {
    match format {
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::WebP => Some(OutputFormat::Webp),
        _ => None,
    }
}
