//! Sequence decoders.
//!
//! Three decoders share the [`Decoder`] trait:
//!
//! * [`RecurrentDecoder`] (`"recurrent"`): a stacked RNN seeded by the encoder state.
//! * [`RecurrentAttentionDecoder`] (`"recurrent_attention"`, the default): a
//!   stacked RNN whose outputs attend over the encoder context.
//! * [`TransformerAttentionDecoder`] (`"transformer"`): causal self-attention
//!   plus cross-attention over the encoder context.

mod recurrent;
mod recurrent_attention;
mod transformer;

pub use recurrent::{RecurrentDecoder, RnnMode, StackedRecurrent};
pub use recurrent_attention::RecurrentAttentionDecoder;
pub use transformer::TransformerAttentionDecoder;

use crate::config::DecoderConfig;
use crate::core::{Img2SeqError, ProcessingStage};
use crate::state::State;
use crate::utils::candle_to_processing;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Decoder type tag, as written in the `type` field of a decoder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderType {
    Recurrent,
    #[default]
    RecurrentAttention,
    Transformer,
}

impl DecoderType {
    pub fn as_str(self) -> &'static str {
        match self {
            DecoderType::Recurrent => "recurrent",
            DecoderType::RecurrentAttention => "recurrent_attention",
            DecoderType::Transformer => "transformer",
        }
    }
}

impl FromStr for DecoderType {
    type Err = Img2SeqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recurrent" => Ok(DecoderType::Recurrent),
            "recurrent_attention" => Ok(DecoderType::RecurrentAttention),
            "transformer" => Ok(DecoderType::Transformer),
            other => Err(Img2SeqError::UnsupportedDecoder {
                tag: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for DecoderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token decoder conditioned on an encoder [`State`].
pub trait Decoder: std::fmt::Debug + Send + Sync {
    fn decoder_type(&self) -> DecoderType;

    /// Whether token ids and logits put the batch axis first.
    fn batch_first(&self) -> bool;

    /// Channel count of the context this decoder was built for.
    fn context_size(&self) -> usize;

    /// The recurrent module, for decoders that have one.
    ///
    /// The bridge reads the layer count and cell type from it to lay out the
    /// initial hidden state.
    fn recurrent(&self) -> Option<&StackedRecurrent>;

    /// Decodes `inputs` (token ids in the decoder's layout) under `state`.
    ///
    /// Returns logits of shape (batch, seq, vocab) or (seq, batch, vocab) and
    /// the state to continue decoding from.
    fn forward_t(
        &self,
        inputs: &Tensor,
        state: &State,
        train: bool,
    ) -> candle_core::Result<(Tensor, State)>;
}

/// Builds the decoder named by `cfg.decoder_type`.
///
/// `cfg` must have been normalized and carry the context size.
pub fn build_decoder(
    cfg: &DecoderConfig,
    vb: VarBuilder,
) -> Result<Box<dyn Decoder>, Img2SeqError> {
    let vocab_size = cfg.vocab_size()?;
    let context_size = cfg.context_size()?;
    let build_err =
        |e| candle_to_processing(ProcessingStage::Construction, cfg.decoder_type.as_str(), e);
    Ok(match cfg.decoder_type {
        DecoderType::Recurrent => Box::new(
            RecurrentDecoder::new(cfg, vocab_size, context_size, vb).map_err(build_err)?,
        ),
        DecoderType::RecurrentAttention => Box::new(
            RecurrentAttentionDecoder::new(cfg, vocab_size, context_size, vb)
                .map_err(build_err)?,
        ),
        DecoderType::Transformer => Box::new(
            TransformerAttentionDecoder::new(cfg, vocab_size, context_size, vb)
                .map_err(build_err)?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_type_tags() -> Result<(), Img2SeqError> {
        for ty in [
            DecoderType::Recurrent,
            DecoderType::RecurrentAttention,
            DecoderType::Transformer,
        ] {
            assert_eq!(ty.as_str().parse::<DecoderType>()?, ty);
        }
        assert_eq!(DecoderType::default(), DecoderType::RecurrentAttention);
        assert!(matches!(
            "lstm".parse::<DecoderType>(),
            Err(Img2SeqError::UnsupportedDecoder { ref tag }) if tag == "lstm"
        ));
        Ok(())
    }

    #[test]
    fn test_build_decoder_per_type() -> Result<(), Img2SeqError> {
        for ty in [
            DecoderType::Recurrent,
            DecoderType::RecurrentAttention,
            DecoderType::Transformer,
        ] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let mut cfg = DecoderConfig::new(ty).with_hidden_size(16).with_num_heads(4);
            cfg.normalize(10);
            let cfg = cfg.with_context_size(24);
            let decoder = build_decoder(&cfg, vb.pp("decoder"))?;
            assert_eq!(decoder.decoder_type(), ty);
            assert_eq!(decoder.context_size(), 24);
            assert_eq!(decoder.recurrent().is_some(), ty != DecoderType::Transformer);
        }
        Ok(())
    }

    #[test]
    fn test_build_decoder_needs_context_size() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut cfg = DecoderConfig::default();
        cfg.normalize(10);
        assert!(matches!(
            build_decoder(&cfg, vb),
            Err(Img2SeqError::ConfigError { .. })
        ));
    }
}
