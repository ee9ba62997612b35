//! Utility functions: device parsing, candle error mapping and image batching.

use crate::core::validation::{validate_image_dimensions, validate_non_empty};
use crate::core::{Img2SeqError, ProcessingStage};
use candle_core::{DType, Device, Tensor};
use image::RgbImage;

/// ImageNet channel means used by torchvision-trained backbones.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations used by torchvision-trained backbones.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[cfg(not(feature = "cuda"))]
fn cuda_not_enabled() -> Img2SeqError {
    Img2SeqError::ConfigError {
        message: "CUDA support not enabled. Compile with --features cuda".to_string(),
    }
}

/// Parses a device string and creates a Candle [`Device`].
///
/// # Supported formats
///
/// - `"cpu"` → CPU device
/// - `"cuda"` or `"gpu"` → CUDA device 0
/// - `"cuda:N"` → CUDA device N (e.g., `"cuda:1"`)
///
/// # Errors
///
/// Returns an error if the device string is invalid, or CUDA is requested
/// but the `cuda` feature is not enabled, or CUDA device creation fails.
pub fn parse_device(device_str: &str) -> Result<Device, Img2SeqError> {
    let device_str = device_str.to_lowercase();
    match device_str.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0).map_err(|e| Img2SeqError::ConfigError {
                    message: format!("Failed to create CUDA device: {}", e),
                })
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(cuda_not_enabled())
            }
        }
        s if s.starts_with("cuda:") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = s
                    .strip_prefix("cuda:")
                    .unwrap_or_default()
                    .parse()
                    .map_err(|_| Img2SeqError::ConfigError {
                        message: format!("Invalid CUDA device ordinal in '{}'", s),
                    })?;
                Device::new_cuda(ordinal).map_err(|e| Img2SeqError::ConfigError {
                    message: format!("Failed to create CUDA device {}: {}", ordinal, e),
                })
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(cuda_not_enabled())
            }
        }
        _ => Err(Img2SeqError::ConfigError {
            message: format!(
                "Unknown device: '{}'. Use 'cpu', 'cuda', or 'cuda:N'",
                device_str
            ),
        }),
    }
}

/// Convert a Candle error to an [`Img2SeqError`] tagged with the stage it occurred in.
pub fn candle_to_processing(
    kind: ProcessingStage,
    context: impl Into<String>,
    err: candle_core::Error,
) -> Img2SeqError {
    Img2SeqError::processing(kind, context, err)
}

/// Resizes and normalizes images into an encoder input batch.
///
/// Every image is resized to `width` x `height`, scaled to `[0, 1]` and
/// normalized with the ImageNet mean and standard deviation. The result has
/// shape `(1, batch, 3, height, width)`: the leading axis is the single
/// "sequence position" the encoder squeezes away.
pub fn images_to_tensor(
    images: &[RgbImage],
    width: u32,
    height: u32,
    device: &Device,
    dtype: DType,
) -> Result<Tensor, Img2SeqError> {
    validate_non_empty(images, "images")?;
    validate_image_dimensions(height, width, "target size")?;

    let (h, w) = (height as usize, width as usize);
    let mut data = Vec::with_capacity(images.len() * 3 * h * w);

    for image in images {
        validate_image_dimensions(image.height(), image.width(), "input image")?;
        let resized = if image.width() == width && image.height() == height {
            image.clone()
        } else {
            image::imageops::resize(image, width, height, image::imageops::FilterType::Triangle)
        };

        // CHW format
        for c in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let val = resized.get_pixel(x, y)[c] as f32 / 255.0;
                    data.push((val - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
                }
            }
        }
    }

    Tensor::from_vec(data, (1, images.len(), 3, h, w), device)
        .map_err(|e| candle_to_processing(ProcessingStage::Preprocess, "create image tensor", e))?
        .to_dtype(dtype)
        .map_err(|e| candle_to_processing(ProcessingStage::Preprocess, "cast image tensor", e))
}

/// Loads an image from disk and converts it to RGB.
pub fn load_image(path: impl AsRef<std::path::Path>) -> Result<RgbImage, Img2SeqError> {
    Ok(image::open(path)?.to_rgb8())
}
