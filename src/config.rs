//! Encoder, decoder and model configuration records.
//!
//! Every field a caller may leave out has a serde default, so a partial JSON
//! object (for example `{"type": "recurrent"}`) deserializes into a complete
//! configuration. Values that can only be known at construction time
//! (`vocab_size`, `embedding_size`, `context_size`) are filled by
//! [`DecoderConfig::normalize`] and [`DecoderConfig::with_context_size`].

use crate::attention::AttentionMode;
use crate::core::Img2SeqError;
use crate::core::validation::{validate_divisible, validate_positive, validate_range};
use crate::decoders::{DecoderType, RnnMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_ENCODER_MODEL: &str = "resnet50";

fn default_model() -> String {
    DEFAULT_ENCODER_MODEL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_in_channels() -> usize {
    3
}

fn default_hidden_size() -> usize {
    128
}

fn default_num_layers() -> usize {
    1
}

fn default_num_heads() -> usize {
    8
}

fn default_max_positions() -> usize {
    512
}

/// Vision encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Backbone name, matched by substring (`resnet50`, `densenet121`, `vgg16_bn`, ...).
    #[serde(default = "default_model")]
    pub model: String,
    /// Output channels of an optional 1x1 convolution applied after the backbone.
    #[serde(default)]
    pub context_transform: Option<usize>,
    /// Keep the spatial feature map. When false the map is globally pooled.
    #[serde(default = "default_true")]
    pub spatial_context: bool,
    /// Train the backbone together with the decoder.
    #[serde(default)]
    pub finetune: bool,
    /// Safetensors file with torchvision-named backbone weights.
    #[serde(default)]
    pub pretrained: Option<PathBuf>,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENCODER_MODEL)
    }
}

impl EncoderConfig {
    /// Configuration for `model` with every other field at its default.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            context_transform: None,
            spatial_context: true,
            finetune: false,
            pretrained: None,
            in_channels: default_in_channels(),
        }
    }

    pub fn with_context_transform(mut self, channels: usize) -> Self {
        self.context_transform = Some(channels);
        self
    }

    pub fn with_spatial_context(mut self, spatial_context: bool) -> Self {
        self.spatial_context = spatial_context;
        self
    }

    pub fn with_finetune(mut self, finetune: bool) -> Self {
        self.finetune = finetune;
        self
    }

    pub fn with_pretrained(mut self, path: impl Into<PathBuf>) -> Self {
        self.pretrained = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), Img2SeqError> {
        validate_positive(self.in_channels, "encoder.in_channels")?;
        if let Some(channels) = self.context_transform {
            validate_positive(channels, "encoder.context_transform")?;
        }
        Ok(())
    }
}

/// Sequence decoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(rename = "type", default)]
    pub decoder_type: DecoderType,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Defaults to `hidden_size`.
    #[serde(default)]
    pub embedding_size: Option<usize>,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_true")]
    pub bias: bool,
    /// Share the embedding matrix with the output classifier.
    #[serde(default)]
    pub tie_embedding: bool,
    /// Filled from the model's vocabulary size when absent.
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub residual: bool,
    #[serde(default)]
    pub batch_first: bool,
    /// Injected from the encoder before the decoder is built.
    #[serde(default)]
    pub context_size: Option<usize>,
    /// Recurrent cell type (recurrent decoders only).
    #[serde(default)]
    pub mode: RnnMode,
    /// Attention scoring (recurrent-attention decoder only).
    #[serde(default)]
    pub attention: AttentionMode,
    /// Attention heads (transformer decoder only).
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Feed-forward width (transformer decoder only). Defaults to `4 * hidden_size`.
    #[serde(default)]
    pub inner_linear: Option<usize>,
    /// Longest target sequence the transformer decoder accepts.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::new(DecoderType::default())
    }
}

impl DecoderConfig {
    /// Configuration for `decoder_type` with every other field at its default.
    pub fn new(decoder_type: DecoderType) -> Self {
        Self {
            decoder_type,
            hidden_size: default_hidden_size(),
            embedding_size: None,
            num_layers: default_num_layers(),
            bias: true,
            tie_embedding: false,
            vocab_size: None,
            dropout: 0.0,
            residual: false,
            batch_first: false,
            context_size: None,
            mode: RnnMode::default(),
            attention: AttentionMode::default(),
            num_heads: default_num_heads(),
            inner_linear: None,
            max_positions: default_max_positions(),
        }
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_mode(mut self, mode: RnnMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    pub fn with_num_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    /// Fills the values that default to other values.
    ///
    /// `embedding_size` falls back to `hidden_size`, `vocab_size` to the
    /// model's vocabulary size, and `inner_linear` to four times the hidden
    /// size. Values that are already set are left alone.
    pub fn normalize(&mut self, vocab_size: usize) {
        self.embedding_size.get_or_insert(self.hidden_size);
        self.vocab_size.get_or_insert(vocab_size);
        self.inner_linear.get_or_insert(4 * self.hidden_size);
    }

    /// Sets the size of the context the decoder attends over.
    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = Some(context_size);
        self
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size.unwrap_or(self.hidden_size)
    }

    pub fn inner_linear(&self) -> usize {
        self.inner_linear.unwrap_or(4 * self.hidden_size)
    }

    /// The vocabulary size, which must have been filled by [`Self::normalize`].
    pub fn vocab_size(&self) -> Result<usize, Img2SeqError> {
        self.vocab_size
            .ok_or_else(|| Img2SeqError::config_error("decoder.vocab_size is not set"))
    }

    /// The context size, which must have been injected from the encoder.
    pub fn context_size(&self) -> Result<usize, Img2SeqError> {
        self.context_size
            .ok_or_else(|| Img2SeqError::config_error("decoder.context_size is not set"))
    }

    pub fn validate(&self) -> Result<(), Img2SeqError> {
        validate_positive(self.hidden_size, "decoder.hidden_size")?;
        validate_positive(self.embedding_size(), "decoder.embedding_size")?;
        validate_positive(self.num_layers, "decoder.num_layers")?;
        validate_positive(self.vocab_size()?, "decoder.vocab_size")?;
        validate_range(self.dropout, 0.0, 1.0, "decoder.dropout")?;
        if self.tie_embedding && self.embedding_size() != self.hidden_size {
            return Err(Img2SeqError::config_error_with_context(
                "decoder.tie_embedding",
                "true",
                &format!(
                    "embedding_size ({}) must equal hidden_size ({})",
                    self.embedding_size(),
                    self.hidden_size
                ),
            ));
        }
        if self.decoder_type == DecoderType::Transformer {
            validate_divisible(
                self.hidden_size,
                self.num_heads,
                "decoder.hidden_size",
                "decoder.num_heads",
            )?;
            validate_divisible(self.hidden_size, 2, "decoder.hidden_size", "2")?;
            validate_positive(self.max_positions, "decoder.max_positions")?;
            if self.embedding_size() != self.hidden_size {
                return Err(Img2SeqError::config_error_with_context(
                    "decoder.embedding_size",
                    &self.embedding_size().to_string(),
                    "transformer decoder needs embedding_size == hidden_size",
                ));
            }
        }
        Ok(())
    }
}

/// Complete model configuration, as stored next to a checkpoint in `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Img2SeqConfig {
    pub vocab_size: usize,
    #[serde(default)]
    pub encoder: Option<EncoderConfig>,
    #[serde(default)]
    pub decoder: Option<DecoderConfig>,
    #[serde(default)]
    pub transfer_hidden: bool,
}

impl Img2SeqConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Img2SeqError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| Img2SeqError::ConfigError {
            message: format!("failed to parse img2seq config.json: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_defaults_from_empty_object() -> Result<(), Img2SeqError> {
        let cfg: EncoderConfig = serde_json::from_str("{}")?;
        assert_eq!(cfg, EncoderConfig::default());
        assert_eq!(cfg.model, "resnet50");
        assert_eq!(cfg.context_transform, None);
        assert!(cfg.spatial_context);
        assert!(!cfg.finetune);
        Ok(())
    }

    #[test]
    fn test_decoder_defaults_and_normalize() -> Result<(), Img2SeqError> {
        let mut cfg: DecoderConfig = serde_json::from_str(r#"{"hidden_size": 64}"#)?;
        assert_eq!(cfg.decoder_type, DecoderType::RecurrentAttention);
        assert_eq!(cfg.num_layers, 1);
        assert!(cfg.bias);
        assert!(!cfg.tie_embedding);
        assert!(!cfg.residual);
        assert!(!cfg.batch_first);
        assert_eq!(cfg.dropout, 0.0);

        cfg.normalize(1000);
        assert_eq!(cfg.embedding_size, Some(64));
        assert_eq!(cfg.vocab_size, Some(1000));
        assert_eq!(cfg.inner_linear, Some(256));
        Ok(())
    }

    #[test]
    fn test_normalize_keeps_explicit_values() {
        let mut cfg = DecoderConfig::default();
        cfg.embedding_size = Some(32);
        cfg.vocab_size = Some(7);
        cfg.normalize(1000);
        assert_eq!(cfg.embedding_size, Some(32));
        assert_eq!(cfg.vocab_size, Some(7));
    }

    #[test]
    fn test_type_tag_round_trips_through_json() -> Result<(), Img2SeqError> {
        let cfg: DecoderConfig = serde_json::from_str(r#"{"type": "transformer"}"#)?;
        assert_eq!(cfg.decoder_type, DecoderType::Transformer);
        let value = serde_json::to_value(&cfg)?;
        assert_eq!(value["type"], "transformer");
        Ok(())
    }

    #[test]
    fn test_unknown_type_tag_is_rejected() {
        let parsed: Result<DecoderConfig, _> = serde_json::from_str(r#"{"type": "convolutional"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = DecoderConfig::new(DecoderType::Transformer).with_num_heads(3);
        cfg.normalize(10);
        assert!(cfg.validate().is_err());

        let mut cfg = DecoderConfig::default();
        cfg.dropout = 1.5;
        cfg.normalize(10);
        assert!(cfg.validate().is_err());

        let mut cfg = DecoderConfig::default();
        cfg.tie_embedding = true;
        cfg.embedding_size = Some(32);
        cfg.normalize(10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_requires_vocab_size() {
        let cfg = DecoderConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_model_config_from_path() -> Result<(), Img2SeqError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "vocab_size": 32,
                "encoder": {"model": "alexnet", "spatial_context": false},
                "decoder": {"type": "recurrent", "mode": "GRU", "num_layers": 2},
                "transfer_hidden": true
            }"#,
        )?;
        let cfg = Img2SeqConfig::from_path(&path)?;
        assert_eq!(cfg.vocab_size, 32);
        assert!(cfg.transfer_hidden);
        let encoder = cfg.encoder.as_ref().map(|e| e.spatial_context);
        assert_eq!(encoder, Some(false));
        let decoder = cfg.decoder.as_ref().map(|d| (d.decoder_type, d.mode, d.num_layers));
        assert_eq!(decoder, Some((DecoderType::Recurrent, RnnMode::Gru, 2)));
        Ok(())
    }
}
