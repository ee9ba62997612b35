//! Transformer decoder with cross-attention over the encoder context.
//!
//! Pre-norm layers of causal self-attention, cross-attention and a ReLU
//! feed-forward block. Token embeddings are scaled by sqrt(hidden_size) and
//! summed with fixed sinusoidal positions.
//!
//! The decoder keeps no key/value cache: during incremental decoding the
//! token prefix travels in [`State::inputs`] and is re-encoded each step.

use super::recurrent::StackedRecurrent;
use super::recurrent_attention::context_batch_first;
use super::{Decoder, DecoderType};
use crate::attention::{create_causal_mask, scaled_dot_product_attention};
use crate::config::DecoderConfig;
use crate::state::State;
use candle_core::{D, DType, Device, Module, Result, Tensor, bail};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder, linear_b};

/// Fixed sinusoidal position table: sin on the first half of the channels, cos on the second.
#[derive(Debug, Clone)]
struct SinusoidalPositions {
    table: Tensor,
}

impl SinusoidalPositions {
    fn new(max_positions: usize, embed_dim: usize, dtype: DType, device: &Device) -> Result<Self> {
        let half_dim = embed_dim / 2;
        let emb_scale = -(10000f64.ln()) / (half_dim as f64);

        let freqs = Tensor::arange(0u32, half_dim as u32, device)?.to_dtype(DType::F32)?;
        let freqs = (freqs * emb_scale)?
            .exp()?
            .reshape((1, half_dim))?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let angles = positions.broadcast_mul(&freqs)?;
        let table = Tensor::cat(&[&angles.sin()?, &angles.cos()?], D::Minus1)?.to_dtype(dtype)?;
        Ok(Self { table })
    }

    fn max_positions(&self) -> usize {
        self.table.dims()[0]
    }

    /// Positions `0..seq_len` as (1, seq_len, embed_dim).
    fn forward(&self, seq_len: usize) -> Result<Tensor> {
        self.table.narrow(0, 0, seq_len)?.unsqueeze(0)
    }
}

#[derive(Debug, Clone)]
struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadAttention {
    fn new(
        embed_dim: usize,
        kv_dim: usize,
        num_heads: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: linear_b(embed_dim, embed_dim, bias, vb.pp("q_proj"))?,
            k_proj: linear_b(kv_dim, embed_dim, bias, vb.pp("k_proj"))?,
            v_proj: linear_b(kv_dim, embed_dim, bias, vb.pp("v_proj"))?,
            out_proj: linear_b(embed_dim, embed_dim, bias, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        xs.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `query` (batch, seq_q, embed_dim) attends over `kv` (batch, seq_kv, kv_dim).
    fn forward(&self, query: &Tensor, kv: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq_len, _) = query.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(query)?)?;
        let k = self.split_heads(&self.k_proj.forward(kv)?)?;
        let v = self.split_heads(&self.v_proj.forward(kv)?)?;
        let attn = scaled_dot_product_attention(&q, &k, &v, mask, self.scale)?;
        let attn = attn
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&attn)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn_norm: LayerNorm,
    self_attn: MultiHeadAttention,
    cross_attn_norm: LayerNorm,
    cross_attn: MultiHeadAttention,
    ffn_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl DecoderLayer {
    fn new(cfg: &DecoderConfig, context_size: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            self_attn_norm: candle_nn::layer_norm(hidden, 1e-5, vb.pp("self_attn_norm"))?,
            self_attn: MultiHeadAttention::new(
                hidden,
                hidden,
                cfg.num_heads,
                cfg.bias,
                vb.pp("self_attn"),
            )?,
            cross_attn_norm: candle_nn::layer_norm(hidden, 1e-5, vb.pp("cross_attn_norm"))?,
            cross_attn: MultiHeadAttention::new(
                hidden,
                context_size,
                cfg.num_heads,
                cfg.bias,
                vb.pp("cross_attn"),
            )?,
            ffn_norm: candle_nn::layer_norm(hidden, 1e-5, vb.pp("ffn_norm"))?,
            fc1: linear_b(hidden, cfg.inner_linear(), cfg.bias, vb.pp("fc1"))?,
            fc2: linear_b(cfg.inner_linear(), hidden, cfg.bias, vb.pp("fc2"))?,
        })
    }

    fn forward_t(
        &self,
        xs: &Tensor,
        context: &Tensor,
        causal_mask: &Tensor,
        dropout: f32,
        train: bool,
    ) -> Result<Tensor> {
        let drop = |t: Tensor| -> Result<Tensor> {
            if train && dropout > 0.0 {
                candle_nn::ops::dropout(&t, dropout)
            } else {
                Ok(t)
            }
        };

        let normed = self.self_attn_norm.forward(xs)?;
        let xs = (xs + drop(self.self_attn.forward(&normed, &normed, Some(causal_mask))?)?)?;

        let normed = self.cross_attn_norm.forward(&xs)?;
        let xs = (&xs + drop(self.cross_attn.forward(&normed, context, None)?)?)?;

        let normed = self.ffn_norm.forward(&xs)?;
        let ffn = self.fc2.forward(&self.fc1.forward(&normed)?.relu()?)?;
        &xs + drop(ffn)?
    }
}

/// Transformer decoder. Exposes no recurrent module.
#[derive(Debug, Clone)]
pub struct TransformerAttentionDecoder {
    embedder: Embedding,
    positions: SinusoidalPositions,
    layers: Vec<DecoderLayer>,
    final_norm: LayerNorm,
    classifier: Linear,
    embed_scale: f64,
    dropout: f32,
    batch_first: bool,
    context_size: usize,
}

impl TransformerAttentionDecoder {
    pub fn new(
        cfg: &DecoderConfig,
        vocab_size: usize,
        context_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if cfg.embedding_size() != cfg.hidden_size {
            bail!(
                "transformer decoder needs embedding_size ({}) == hidden_size ({})",
                cfg.embedding_size(),
                cfg.hidden_size
            );
        }
        let embedder = candle_nn::embedding(vocab_size, cfg.hidden_size, vb.pp("embedder"))?;
        let positions =
            SinusoidalPositions::new(cfg.max_positions, cfg.hidden_size, vb.dtype(), vb.device())?;
        let layers = (0..cfg.num_layers)
            .map(|i| DecoderLayer::new(cfg, context_size, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = candle_nn::layer_norm(cfg.hidden_size, 1e-5, vb.pp("final_norm"))?;
        let classifier =
            super::recurrent::classifier(cfg, &embedder, vocab_size, vb.pp("classifier"))?;
        Ok(Self {
            embedder,
            positions,
            layers,
            final_norm,
            classifier,
            embed_scale: (cfg.hidden_size as f64).sqrt(),
            dropout: cfg.dropout,
            batch_first: cfg.batch_first,
            context_size,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl Decoder for TransformerAttentionDecoder {
    fn decoder_type(&self) -> DecoderType {
        DecoderType::Transformer
    }

    fn batch_first(&self) -> bool {
        self.batch_first
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn recurrent(&self) -> Option<&StackedRecurrent> {
        None
    }

    fn forward_t(&self, inputs: &Tensor, state: &State, train: bool) -> Result<(Tensor, State)> {
        let Some(context) = state.context.as_deref() else {
            bail!("transformer decoder needs a context");
        };
        let keys = context_batch_first(context)?;

        // the prefix is kept batch-first regardless of the decoder layout
        let new_ids = if self.batch_first {
            inputs.contiguous()?
        } else {
            inputs.t()?.contiguous()?
        };
        let new_len = new_ids.dim(1)?;
        let ids = match &state.inputs {
            Some(prefix) => Tensor::cat(&[prefix, &new_ids], 1)?,
            None => new_ids,
        };
        let seq_len = ids.dim(1)?;
        if seq_len > self.positions.max_positions() {
            bail!(
                "sequence of {seq_len} tokens exceeds max_positions ({})",
                self.positions.max_positions()
            );
        }

        let emb = (self.embedder.forward(&ids)? * self.embed_scale)?;
        let mut xs = emb.broadcast_add(&self.positions.forward(seq_len)?)?;
        if train && self.dropout > 0.0 {
            xs = candle_nn::ops::dropout(&xs, self.dropout)?;
        }
        let causal_mask = create_causal_mask(seq_len, seq_len, xs.dtype(), xs.device())?;
        for layer in &self.layers {
            xs = layer.forward_t(&xs, &keys, &causal_mask, self.dropout, train)?;
        }
        let xs = self.final_norm.forward(&xs)?;
        let xs = xs.narrow(1, seq_len - new_len, new_len)?;
        let logits = self.classifier.forward(&xs)?;
        let logits = if self.batch_first {
            logits
        } else {
            logits.transpose(0, 1)?.contiguous()?
        };

        let mut next = State::new()
            .with_inputs(Some(ids))
            .with_batch_first(self.batch_first);
        next.hidden = state.hidden.clone();
        next.context = state.context.clone();
        Ok((logits, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::DecoderType;
    use candle_nn::VarMap;

    fn decoder(batch_first: bool, varmap: &VarMap) -> Result<TransformerAttentionDecoder> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let mut cfg = DecoderConfig::new(DecoderType::Transformer)
            .with_hidden_size(16)
            .with_num_heads(4)
            .with_num_layers(2)
            .with_batch_first(batch_first);
        cfg.normalize(11);
        TransformerAttentionDecoder::new(&cfg, 11, 6, vb.pp("decoder"))
    }

    fn context(batch_first: bool) -> Result<State> {
        let shape = if batch_first { (2, 5, 6) } else { (5, 2, 6) };
        Ok(State::new()
            .with_outputs(Tensor::randn(0f32, 1., shape, &Device::Cpu)?)
            .with_batch_first(batch_first))
    }

    #[test]
    fn test_positions_table() -> Result<()> {
        let positions = SinusoidalPositions::new(8, 6, DType::F32, &Device::Cpu)?;
        let first = positions.forward(1)?.flatten_all()?.to_vec1::<f32>()?;
        // sin(0) = 0, cos(0) = 1
        assert_eq!(first, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_logits_layout_follows_batch_first() -> Result<()> {
        for batch_first in [true, false] {
            let varmap = VarMap::new();
            let decoder = decoder(batch_first, &varmap)?;
            let state = State::new().with_context(context(batch_first)?);
            let ids = if batch_first {
                Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu)?
            } else {
                Tensor::new(&[[1u32, 4], [2, 5], [3, 6]], &Device::Cpu)?
            };
            let (logits, next) = decoder.forward_t(&ids, &state, false)?;
            let expected: &[usize] = if batch_first { &[2, 3, 11] } else { &[3, 2, 11] };
            assert_eq!(logits.dims(), expected);
            let prefix = next.inputs.as_ref().map(|t| t.dims().to_vec());
            assert_eq!(prefix, Some(vec![2, 3]));
        }
        Ok(())
    }

    #[test]
    fn test_incremental_matches_full_pass() -> Result<()> {
        let varmap = VarMap::new();
        let decoder = decoder(true, &varmap)?;
        let state = State::new().with_context(context(true)?);
        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu)?;
        let (full, _) = decoder.forward_t(&ids, &state, false)?;

        let (_, state) = decoder.forward_t(&ids.narrow(1, 0, 2)?, &state, false)?;
        let (step, _) = decoder.forward_t(&ids.narrow(1, 2, 1)?, &state, false)?;
        let diff = (full.narrow(1, 2, 1)? - step)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_exposes_no_recurrent_module() -> Result<()> {
        let varmap = VarMap::new();
        let decoder = decoder(false, &varmap)?;
        assert!(decoder.recurrent().is_none());
        assert_eq!(decoder.num_layers(), 2);
        Ok(())
    }
}
