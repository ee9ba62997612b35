//! Stacked recurrent module and the plain recurrent decoder.

use super::{Decoder, DecoderType};
use crate::config::DecoderConfig;
use crate::state::{Hidden, State};
use candle_core::{DType, Module, Result, Tensor, bail};
use candle_nn::{Embedding, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Recurrent cell type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RnnMode {
    #[default]
    #[serde(rename = "LSTM")]
    Lstm,
    #[serde(rename = "GRU")]
    Gru,
    /// Elman RNN with tanh non-linearity.
    #[serde(rename = "RNN")]
    Rnn,
}

impl RnnMode {
    fn gates(self) -> usize {
        match self {
            RnnMode::Lstm => 4,
            RnnMode::Gru => 3,
            RnnMode::Rnn => 1,
        }
    }

    /// Whether the cell carries a (hidden, cell) pair rather than a single tensor.
    ///
    /// Only LSTM does; any future multi-tensor cell must be added here.
    pub fn is_paired(self) -> bool {
        matches!(self, RnnMode::Lstm)
    }
}

impl std::fmt::Display for RnnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RnnMode::Lstm => write!(f, "LSTM"),
            RnnMode::Gru => write!(f, "GRU"),
            RnnMode::Rnn => write!(f, "RNN"),
        }
    }
}

#[derive(Debug, Clone)]
struct RecurrentLayer {
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Option<Tensor>,
    bias_hh: Option<Tensor>,
}

impl RecurrentLayer {
    fn new(
        mode: RnnMode,
        layer: usize,
        input_size: usize,
        hidden_size: usize,
        bias: bool,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let gate_size = mode.gates() * hidden_size;
        let k = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform { lo: -k, up: k };
        let weight_ih =
            vb.get_with_hints((gate_size, input_size), &format!("weight_ih_l{layer}"), init)?;
        let weight_hh =
            vb.get_with_hints((gate_size, hidden_size), &format!("weight_hh_l{layer}"), init)?;
        let (bias_ih, bias_hh) = if bias {
            (
                Some(vb.get_with_hints(gate_size, &format!("bias_ih_l{layer}"), init)?),
                Some(vb.get_with_hints(gate_size, &format!("bias_hh_l{layer}"), init)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
        })
    }

    fn project(xs: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let ys = xs.matmul(&weight.t()?)?;
        match bias {
            Some(b) => ys.broadcast_add(b),
            None => Ok(ys),
        }
    }

    /// Runs the layer over a time-major sequence (seq, batch, input).
    fn forward(
        &self,
        mode: RnnMode,
        xs: &Tensor,
        mut h: Tensor,
        mut c: Option<Tensor>,
    ) -> Result<(Tensor, Tensor, Option<Tensor>)> {
        let (seq_len, batch, input_size) = xs.dims3()?;
        let gi = Self::project(
            &xs.reshape((seq_len * batch, input_size))?,
            &self.weight_ih,
            self.bias_ih.as_ref(),
        )?
        .reshape((seq_len, batch, ()))?;

        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x_t = gi.get(t)?;
            let h_t = Self::project(&h, &self.weight_hh, self.bias_hh.as_ref())?;
            match mode {
                RnnMode::Lstm => {
                    let gates = (x_t + h_t)?.chunk(4, 1)?;
                    let i = candle_nn::ops::sigmoid(&gates[0])?;
                    let f = candle_nn::ops::sigmoid(&gates[1])?;
                    let g = gates[2].tanh()?;
                    let o = candle_nn::ops::sigmoid(&gates[3])?;
                    let prev_c = match &c {
                        Some(c) => c.clone(),
                        None => h.zeros_like()?,
                    };
                    let next_c = ((f * prev_c)? + (i * g)?)?;
                    h = (o * next_c.tanh()?)?;
                    c = Some(next_c);
                }
                RnnMode::Gru => {
                    let xg = x_t.chunk(3, 1)?;
                    let hg = h_t.chunk(3, 1)?;
                    let r = candle_nn::ops::sigmoid(&(&xg[0] + &hg[0])?)?;
                    let z = candle_nn::ops::sigmoid(&(&xg[1] + &hg[1])?)?;
                    let n = (&xg[2] + (r * &hg[2])?)?.tanh()?;
                    // h' = (1 - z) * n + z * h
                    h = (&n + (z * (h - &n)?)?)?;
                }
                RnnMode::Rnn => {
                    h = (x_t + h_t)?.tanh()?;
                }
            }
            outputs.push(h.clone());
        }
        Ok((Tensor::stack(&outputs, 0)?, h, c))
    }
}

/// Multi-layer recurrent module with torch-compatible parameter names
/// (`weight_ih_l0`, `bias_hh_l1`, ...).
#[derive(Debug, Clone)]
pub struct StackedRecurrent {
    mode: RnnMode,
    hidden_size: usize,
    dropout: f32,
    residual: bool,
    layers: Vec<RecurrentLayer>,
}

impl StackedRecurrent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: RnnMode,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bias: bool,
        dropout: f32,
        residual: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|layer| {
                let layer_input = if layer == 0 { input_size } else { hidden_size };
                RecurrentLayer::new(mode, layer, layer_input, hidden_size, bias, &vb)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            mode,
            hidden_size,
            dropout,
            residual,
            layers,
        })
    }

    pub fn mode(&self) -> RnnMode {
        self.mode
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Zero state for `batch` sequences.
    pub fn zero_state(
        &self,
        batch: usize,
        dtype: DType,
        device: &candle_core::Device,
    ) -> Result<Hidden> {
        let h = Tensor::zeros((self.num_layers(), batch, self.hidden_size), dtype, device)?;
        Ok(if self.mode.is_paired() {
            Hidden::Paired {
                h: h.clone(),
                c: h,
            }
        } else {
            Hidden::Single(h)
        })
    }

    /// Runs the stack over a time-major sequence (seq, batch, input).
    ///
    /// `hidden` must be laid out as (num_layers, batch, hidden_size). A single
    /// tensor given to an LSTM seeds the hidden state and leaves the cell at zero.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        hidden: Option<&Hidden>,
        train: bool,
    ) -> Result<(Tensor, Hidden)> {
        let (_, batch, _) = xs.dims3()?;
        let hidden = match hidden {
            Some(hidden) => hidden.contiguous()?,
            None => self.zero_state(batch, xs.dtype(), xs.device())?,
        };
        let expected = [self.num_layers(), batch, self.hidden_size];
        if hidden.dims() != expected {
            bail!(
                "{} hidden state must have shape {:?}, got {:?}",
                self.mode,
                expected,
                hidden.dims()
            );
        }

        let last = self.layers.len() - 1;
        let mut xs = xs.clone();
        let mut final_h = Vec::with_capacity(self.layers.len());
        let mut final_c = Vec::with_capacity(self.layers.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            let h0 = hidden.h().get(idx)?;
            let c0 = hidden.c().map(|c| c.get(idx)).transpose()?;
            let (mut ys, h, c) = layer.forward(self.mode, &xs, h0, c0)?;
            if self.residual && idx > 0 {
                ys = (ys + &xs)?;
            }
            if train && self.dropout > 0.0 && idx != last {
                ys = candle_nn::ops::dropout(&ys, self.dropout)?;
            }
            final_h.push(h);
            if let Some(c) = c {
                final_c.push(c);
            }
            xs = ys;
        }

        let h = Tensor::stack(&final_h, 0)?;
        let hidden = if self.mode.is_paired() {
            Hidden::Paired {
                h,
                c: Tensor::stack(&final_c, 0)?,
            }
        } else {
            Hidden::Single(h)
        };
        Ok((xs, hidden))
    }
}

/// Builds the output classifier, sharing the embedding matrix when tied.
pub(crate) fn classifier(
    cfg: &DecoderConfig,
    embedder: &Embedding,
    vocab_size: usize,
    vb: VarBuilder,
) -> Result<Linear> {
    if cfg.tie_embedding {
        let bias = if cfg.bias {
            Some(vb.get_with_hints(vocab_size, "bias", Init::Const(0.))?)
        } else {
            None
        };
        Ok(Linear::new(embedder.embeddings().clone(), bias))
    } else {
        candle_nn::linear_b(cfg.hidden_size, vocab_size, cfg.bias, vb)
    }
}

/// Converts token ids to time-major (seq, batch).
pub(crate) fn time_major(inputs: &Tensor, batch_first: bool) -> Result<Tensor> {
    if batch_first {
        inputs.t()?.contiguous()
    } else {
        inputs.contiguous()
    }
}

/// Recurrent language-model decoder seeded by the bridged hidden state.
///
/// The context reaches this decoder only through the initial hidden state.
#[derive(Debug, Clone)]
pub struct RecurrentDecoder {
    embedder: Embedding,
    rnn: StackedRecurrent,
    classifier: Linear,
    dropout: f32,
    batch_first: bool,
    context_size: usize,
}

impl RecurrentDecoder {
    pub fn new(
        cfg: &DecoderConfig,
        vocab_size: usize,
        context_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embedder = candle_nn::embedding(vocab_size, cfg.embedding_size(), vb.pp("embedder"))?;
        let rnn = StackedRecurrent::new(
            cfg.mode,
            cfg.embedding_size(),
            cfg.hidden_size,
            cfg.num_layers,
            cfg.bias,
            cfg.dropout,
            cfg.residual,
            vb.pp("rnn"),
        )?;
        let classifier = classifier(cfg, &embedder, vocab_size, vb.pp("classifier"))?;
        Ok(Self {
            embedder,
            rnn,
            classifier,
            dropout: cfg.dropout,
            batch_first: cfg.batch_first,
            context_size,
        })
    }
}

impl Decoder for RecurrentDecoder {
    fn decoder_type(&self) -> DecoderType {
        DecoderType::Recurrent
    }

    fn batch_first(&self) -> bool {
        self.batch_first
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn recurrent(&self) -> Option<&StackedRecurrent> {
        Some(&self.rnn)
    }

    fn forward_t(&self, inputs: &Tensor, state: &State, train: bool) -> Result<(Tensor, State)> {
        let ids = time_major(inputs, self.batch_first)?;
        let mut emb = self.embedder.forward(&ids)?;
        if train && self.dropout > 0.0 {
            emb = candle_nn::ops::dropout(&emb, self.dropout)?;
        }
        let (mut outputs, hidden) = self.rnn.forward_t(&emb, state.hidden.as_ref(), train)?;
        if train && self.dropout > 0.0 {
            outputs = candle_nn::ops::dropout(&outputs, self.dropout)?;
        }
        let logits = self.classifier.forward(&outputs)?;
        let logits = if self.batch_first {
            logits.transpose(0, 1)?.contiguous()?
        } else {
            logits
        };

        let mut next = State::new()
            .with_hidden(Some(hidden))
            .with_batch_first(self.batch_first);
        next.context = state.context.clone();
        Ok((logits, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn stack(mode: RnnMode, num_layers: usize, varmap: &VarMap) -> Result<StackedRecurrent> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        StackedRecurrent::new(mode, 6, 4, num_layers, true, 0.0, false, vb.pp("rnn"))
    }

    #[test]
    fn test_output_and_state_shapes_per_mode() -> Result<()> {
        for mode in [RnnMode::Lstm, RnnMode::Gru, RnnMode::Rnn] {
            let varmap = VarMap::new();
            let rnn = stack(mode, 2, &varmap)?;
            let xs = Tensor::randn(0f32, 1., (5, 3, 6), &Device::Cpu)?;
            let (ys, hidden) = rnn.forward_t(&xs, None, false)?;
            assert_eq!(ys.dims(), &[5, 3, 4]);
            assert_eq!(hidden.dims(), &[2, 3, 4]);
            assert_eq!(hidden.is_paired(), mode == RnnMode::Lstm);
        }
        Ok(())
    }

    #[test]
    fn test_torch_parameter_names() -> Result<()> {
        let varmap = VarMap::new();
        let _rnn = stack(RnnMode::Gru, 2, &varmap)?;
        let data = varmap.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let w = data.get("rnn.weight_ih_l1").map(|v| v.dims().to_vec());
        assert_eq!(w, Some(vec![12, 4]));
        assert!(data.contains_key("rnn.bias_hh_l0"));
        Ok(())
    }

    #[test]
    fn test_final_state_matches_last_output() -> Result<()> {
        let varmap = VarMap::new();
        let rnn = stack(RnnMode::Rnn, 1, &varmap)?;
        let xs = Tensor::randn(0f32, 1., (3, 2, 6), &Device::Cpu)?;
        let (ys, hidden) = rnn.forward_t(&xs, None, false)?;
        let last = ys.get(2)?.to_vec2::<f32>()?;
        let h = hidden.h().get(0)?.to_vec2::<f32>()?;
        assert_eq!(last, h);
        Ok(())
    }

    #[test]
    fn test_rejects_misshaped_hidden() -> Result<()> {
        let varmap = VarMap::new();
        let rnn = stack(RnnMode::Gru, 2, &varmap)?;
        let xs = Tensor::randn(0f32, 1., (3, 2, 6), &Device::Cpu)?;
        let bad = Hidden::Single(Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu)?);
        assert!(rnn.forward_t(&xs, Some(&bad), false).is_err());
        Ok(())
    }

    #[test]
    fn test_mode_serde_names() -> serde_json::Result<()> {
        let mode: RnnMode = serde_json::from_str("\"GRU\"")?;
        assert_eq!(mode, RnnMode::Gru);
        assert_eq!(serde_json::to_string(&RnnMode::Lstm)?, "\"LSTM\"");
        Ok(())
    }
}
