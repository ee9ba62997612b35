//! Error types for model assembly.
//!
//! This module defines the errors that can occur while building an
//! image-to-sequence model, running its forward pass, or loading saved
//! parameters. It also provides helper constructors that attach the stage
//! and context to an underlying error.

use thiserror::Error;

/// Stage of the model lifecycle in which a tensor-level error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Building backbone or decoder parameters.
    Construction,
    /// Running the vision encoder.
    Encode,
    /// Reshaping encoder output and seeding decoder state.
    Bridge,
    /// Running the sequence decoder.
    Decode,
    /// Greedy token generation.
    Generation,
    /// Loading or saving parameters.
    WeightLoading,
    /// Turning images into an input tensor.
    Preprocess,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::Construction => write!(f, "construction"),
            ProcessingStage::Encode => write!(f, "encode"),
            ProcessingStage::Bridge => write!(f, "bridge"),
            ProcessingStage::Decode => write!(f, "decode"),
            ProcessingStage::Generation => write!(f, "generation"),
            ProcessingStage::WeightLoading => write!(f, "weight loading"),
            ProcessingStage::Preprocess => write!(f, "preprocess"),
        }
    }
}

/// Errors raised by the image-to-sequence assembler.
#[derive(Error, Debug)]
pub enum Img2SeqError {
    /// The encoder model name matches no supported backbone.
    #[error("unsupported encoder model: {model}")]
    UnsupportedEncoder {
        /// The model name as given in the encoder configuration.
        model: String,
    },

    /// The decoder type tag is not one of the supported decoders.
    #[error("unsupported decoder type: {tag}")]
    UnsupportedDecoder {
        /// The tag as given in the decoder configuration.
        tag: String,
    },

    /// A configuration value is invalid.
    #[error("configuration: {message}")]
    ConfigError {
        /// A message describing the configuration error.
        message: String,
    },

    /// The caller passed an input the model cannot consume.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// A tensor operation failed.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage in which the error occurred.
        kind: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Expected parameters are absent from a state dict.
    #[error("missing parameters: {}", names.join(", "))]
    MissingParameters {
        /// Names of the missing parameters, sorted.
        names: Vec<String>,
    },

    /// A state dict contains keys that name no parameter of the model.
    #[error("unexpected parameters: {}", names.join(", "))]
    UnexpectedParameters {
        /// Names of the unexpected keys, sorted.
        names: Vec<String>,
    },

    /// A saved tensor does not have the shape of the parameter it targets.
    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Shape of the model parameter.
        expected: Vec<usize>,
        /// Shape of the saved tensor.
        actual: Vec<usize>,
    },

    /// Error while parsing a JSON configuration.
    #[error("json")]
    Json(#[from] serde_json::Error),

    /// Error while loading an image.
    #[error("image load")]
    ImageLoad(#[from] image::ImageError),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Img2SeqError {
    /// Creates an error for a failed tensor operation in the given stage.
    pub fn processing(
        kind: ProcessingStage,
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind,
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates an error for invalid input.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates an error for an invalid configuration value.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Creates a configuration error naming the offending field and value.
    pub fn config_error_with_context(field: &str, value: &str, reason: &str) -> Self {
        Self::ConfigError {
            message: format!(
                "Configuration error in field '{}' with value '{}': {}",
                field, value, reason
            ),
        }
    }

    /// Returns true when the error comes from a state dict that does not fit
    /// the model (missing, unexpected or mis-shaped parameters).
    pub fn is_parameter_mismatch(&self) -> bool {
        matches!(
            self,
            Self::MissingParameters { .. }
                | Self::UnexpectedParameters { .. }
                | Self::ShapeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_stage_and_context() {
        let err = Img2SeqError::processing(
            ProcessingStage::Bridge,
            "flatten spatial output",
            std::io::Error::other("boom"),
        );
        assert_eq!(err.to_string(), "bridge failed: flatten spatial output");
    }

    #[test]
    fn test_missing_parameters_lists_names() {
        let err = Img2SeqError::MissingParameters {
            names: vec!["a.weight".to_string(), "b.bias".to_string()],
        };
        assert_eq!(err.to_string(), "missing parameters: a.weight, b.bias");
        assert!(err.is_parameter_mismatch());
        assert!(!Img2SeqError::invalid_input("x").is_parameter_mismatch());
    }
}
