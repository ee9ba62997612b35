//! Validation helpers for configuration values and model inputs.

use crate::core::Img2SeqError;

/// Validates that a value is positive (> 0).
#[inline]
pub fn validate_positive<T: PartialOrd + std::fmt::Display + Default>(
    value: T,
    param_name: &str,
) -> Result<(), Img2SeqError> {
    if value <= T::default() {
        return Err(Img2SeqError::ConfigError {
            message: format!(
                "Parameter '{}' must be positive, got: {}",
                param_name, value
            ),
        });
    }
    Ok(())
}

/// Validates that a value is within a specified range (inclusive).
#[inline]
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    param_name: &str,
) -> Result<(), Img2SeqError> {
    if value < min || value > max {
        return Err(Img2SeqError::ConfigError {
            message: format!(
                "Parameter '{}' must be in range [{}, {}], got: {}",
                param_name, min, max, value
            ),
        });
    }
    Ok(())
}

/// Validates that `value` is an exact multiple of `divisor`.
#[inline]
pub fn validate_divisible(
    value: usize,
    divisor: usize,
    value_name: &str,
    divisor_name: &str,
) -> Result<(), Img2SeqError> {
    validate_positive(divisor, divisor_name)?;
    if value % divisor != 0 {
        return Err(Img2SeqError::ConfigError {
            message: format!(
                "Parameter '{}' ({}) must be divisible by '{}' ({})",
                value_name, value, divisor_name, divisor
            ),
        });
    }
    Ok(())
}

/// Validates that a collection is not empty.
#[inline]
pub fn validate_non_empty<T>(items: &[T], param_name: &str) -> Result<(), Img2SeqError> {
    if items.is_empty() {
        return Err(Img2SeqError::InvalidInput {
            message: format!("Parameter '{}' cannot be empty", param_name),
        });
    }
    Ok(())
}

/// Validates image dimensions.
pub fn validate_image_dimensions(
    height: u32,
    width: u32,
    context: &str,
) -> Result<(), Img2SeqError> {
    if height == 0 || width == 0 {
        return Err(Img2SeqError::InvalidInput {
            message: format!(
                "{}: image dimensions must be positive, got {}x{}",
                context, height, width
            ),
        });
    }

    const MAX_DIMENSION: u32 = 32768;
    if height > MAX_DIMENSION || width > MAX_DIMENSION {
        return Err(Img2SeqError::InvalidInput {
            message: format!(
                "{}: image dimensions exceed maximum of {}x{}, got {}x{}",
                context, MAX_DIMENSION, MAX_DIMENSION, height, width
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(1usize, "hidden_size").is_ok());
        assert!(validate_positive(0usize, "hidden_size").is_err());
        assert!(validate_positive(-0.5f32, "scale").is_err());
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(0.0f32, 0.0, 1.0, "dropout").is_ok());
        assert!(validate_range(1.0f32, 0.0, 1.0, "dropout").is_ok());
        let err = validate_range(1.5f32, 0.0, 1.0, "dropout").unwrap_err();
        assert!(err.to_string().contains("dropout"));
    }

    #[test]
    fn test_validate_divisible() {
        assert!(validate_divisible(128, 8, "hidden_size", "num_heads").is_ok());
        assert!(validate_divisible(130, 8, "hidden_size", "num_heads").is_err());
        assert!(validate_divisible(128, 0, "hidden_size", "num_heads").is_err());
    }

    #[test]
    fn test_validate_image_dimensions() {
        assert!(validate_image_dimensions(32, 32, "image").is_ok());
        assert!(validate_image_dimensions(0, 32, "image").is_err());
        assert!(validate_image_dimensions(40000, 32, "image").is_err());
    }

    #[test]
    fn test_validate_non_empty() {
        let empty: [u8; 0] = [];
        assert!(validate_non_empty(&empty, "images").is_err());
        assert!(validate_non_empty(&[1u8], "images").is_ok());
    }
}
