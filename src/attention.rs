//! Attention primitives shared by the decoders.
//!
//! - [`scaled_dot_product_attention`] and [`create_causal_mask`] for the
//!   transformer decoder.
//! - [`GlobalAttention`] for the recurrent-attention decoder: every decoder
//!   output attends over the whole encoder context, scored either additively
//!   or by dot product.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear_b};
use serde::{Deserialize, Serialize};

/// Runs `f` on the CPU when `device` is Metal, then moves the result back.
///
/// Metal lacks kernels for some of the operations used here (`arange`,
/// comparisons), so those masks are built on the CPU.
pub(crate) fn on_compute_device<F>(device: &Device, f: F) -> Result<Tensor>
where
    F: FnOnce(&Device) -> Result<Tensor>,
{
    if device.is_metal() {
        let tensor_on_cpu = f(&Device::Cpu)?;
        tensor_on_cpu.to_device(device)
    } else {
        f(device)
    }
}

/// Scaled dot-product attention.
///
/// Computes `softmax(Q @ K^T * scale + mask) @ V`.
///
/// # Arguments
/// * `q` - Query tensor: (batch, heads, seq_q, head_dim)
/// * `k` - Key tensor: (batch, heads, seq_kv, head_dim)
/// * `v` - Value tensor: (batch, heads, seq_kv, head_dim)
/// * `mask` - Optional additive mask, broadcast against (batch, heads, seq_q, seq_kv)
/// * `scale` - Scaling factor (typically 1/sqrt(head_dim))
///
/// # Returns
/// Output tensor: (batch, heads, seq_q, head_dim)
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor> {
    let attn_weights = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
    let attn_weights = (attn_weights * scale)?;

    let attn_weights = match mask {
        Some(m) => attn_weights.broadcast_add(m)?,
        None => attn_weights,
    };

    // Softmax in F32 for numerical stability
    let input_dtype = attn_weights.dtype();
    let attn_weights = attn_weights.to_dtype(DType::F32)?;
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_weights = attn_weights.to_dtype(input_dtype)?;

    attn_weights.matmul(v)
}

/// Create a causal (lower-triangular) attention mask.
///
/// Position `i` of the query may attend to key positions `<= i + (kv_len - seq_len)`.
/// Allowed positions hold 0, masked positions hold -inf.
///
/// # Returns
/// Mask tensor of shape (1, 1, seq_len, kv_len)
pub fn create_causal_mask(
    seq_len: usize,
    kv_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    on_compute_device(device, |compute_device| {
        let row_idx = Tensor::arange(0u32, seq_len as u32, compute_device)?
            .reshape((seq_len, 1))?
            .to_dtype(DType::F32)?;
        let col_idx = Tensor::arange(0u32, kv_len as u32, compute_device)?
            .reshape((1, kv_len))?
            .to_dtype(DType::F32)?;

        let offset = kv_len.saturating_sub(seq_len) as f64;
        // col - offset <= row
        let diff = (col_idx - offset)?;
        let mask_cond = diff.broadcast_le(&row_idx)?;

        let zero = Tensor::zeros(mask_cond.shape(), DType::F32, compute_device)?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, compute_device)?
            .broadcast_as(mask_cond.shape())?;

        mask_cond
            .where_cond(&zero, &neg_inf)?
            .to_dtype(dtype)?
            .reshape((1, 1, seq_len, kv_len))
    })
}

/// How [`GlobalAttention`] scores a query against each context position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionMode {
    /// `v^T tanh(W_q q + W_k k)`
    #[default]
    Bahdanau,
    /// `(W_q q) . k`
    DotProd,
}

/// Global attention over an encoder context.
#[derive(Debug, Clone)]
pub struct GlobalAttention {
    mode: AttentionMode,
    linear_q: Linear,
    linear_k: Option<Linear>,
    linear_v: Option<Linear>,
    linear_out: Linear,
}

impl GlobalAttention {
    /// Builds an attention layer for queries of `query_size` over a context of
    /// `context_size` channels, producing outputs of `output_size`.
    pub fn new(
        mode: AttentionMode,
        query_size: usize,
        context_size: usize,
        output_size: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (linear_q, linear_k, linear_v) = match mode {
            AttentionMode::Bahdanau => (
                linear_b(query_size, query_size, bias, vb.pp("linear_q"))?,
                Some(linear_b(context_size, query_size, bias, vb.pp("linear_k"))?),
                Some(candle_nn::linear_no_bias(query_size, 1, vb.pp("linear_v"))?),
            ),
            AttentionMode::DotProd => (
                linear_b(query_size, context_size, bias, vb.pp("linear_q"))?,
                None,
                None,
            ),
        };
        let linear_out = linear_b(
            context_size + query_size,
            output_size,
            bias,
            vb.pp("linear_out"),
        )?;
        Ok(Self {
            mode,
            linear_q,
            linear_k,
            linear_v,
            linear_out,
        })
    }

    pub fn mode(&self) -> AttentionMode {
        self.mode
    }

    /// Attends `query` (batch, seq_q, query_size) over `context` (batch, seq_kv, context_size).
    ///
    /// Returns the projected outputs (batch, seq_q, output_size) and the
    /// attention weights (batch, seq_q, seq_kv).
    pub fn forward(&self, query: &Tensor, context: &Tensor) -> Result<(Tensor, Tensor)> {
        let scores = match (&self.linear_k, &self.linear_v) {
            (Some(linear_k), Some(linear_v)) => {
                let q = self.linear_q.forward(query)?.unsqueeze(2)?;
                let k = linear_k.forward(context)?.unsqueeze(1)?;
                let energy = q.broadcast_add(&k)?.tanh()?;
                linear_v.forward(&energy)?.squeeze(D::Minus1)?
            }
            _ => {
                let q = self.linear_q.forward(query)?;
                q.matmul(&context.transpose(1, 2)?.contiguous()?)?
            }
        };

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let attended = weights.matmul(&context.contiguous()?)?;
        let combined = Tensor::cat(&[&attended, query], D::Minus1)?;
        let output = self.linear_out.forward(&combined)?.tanh()?;
        Ok((output, weights))
    }
}
