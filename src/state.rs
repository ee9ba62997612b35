//! Per-forward-pass state passed between encoder, bridge and decoder.

use candle_core::{Result, Tensor};

/// Initial or running state of a recurrent decoder.
///
/// Tensors are laid out as `(num_layers, batch, hidden)` once they reach a
/// recurrent module. A decoder without a recurrent module may receive the
/// encoder seed in whatever layout the encoder produced.
#[derive(Debug, Clone)]
pub enum Hidden {
    /// Single-tensor state (GRU, tanh RNN).
    Single(Tensor),
    /// Hidden and cell state of an LSTM-style cell.
    Paired { h: Tensor, c: Tensor },
}

impl Hidden {
    /// The hidden tensor (the `h` half of a paired state).
    pub fn h(&self) -> &Tensor {
        match self {
            Hidden::Single(h) => h,
            Hidden::Paired { h, .. } => h,
        }
    }

    /// The cell tensor, if this is a paired state.
    pub fn c(&self) -> Option<&Tensor> {
        match self {
            Hidden::Single(_) => None,
            Hidden::Paired { c, .. } => Some(c),
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self, Hidden::Paired { .. })
    }

    /// Shape of the hidden tensor.
    pub fn dims(&self) -> &[usize] {
        self.h().dims()
    }

    /// Makes every tensor of the state contiguous.
    pub fn contiguous(&self) -> Result<Hidden> {
        Ok(match self {
            Hidden::Single(h) => Hidden::Single(h.contiguous()?),
            Hidden::Paired { h, c } => Hidden::Paired {
                h: h.contiguous()?,
                c: c.contiguous()?,
            },
        })
    }
}

/// Container handed from one stage of the sequence-to-sequence pipeline to the next.
///
/// A fresh `State` is created for each forward pass and never shared.
#[derive(Debug, Clone, Default)]
pub struct State {
    /// Feature tensor produced by the stage that built this state.
    pub outputs: Option<Tensor>,
    /// Decoder initial or running hidden state.
    pub hidden: Option<Hidden>,
    /// Encoder state the decoder attends over.
    pub context: Option<Box<State>>,
    /// Token prefix consumed so far (incremental transformer decoding).
    pub inputs: Option<Tensor>,
    /// Whether tensors in this state put the batch axis first.
    pub batch_first: bool,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outputs(mut self, outputs: Tensor) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_hidden(mut self, hidden: Option<Hidden>) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_context(mut self, context: State) -> Self {
        self.context = Some(Box::new(context));
        self
    }

    pub fn with_inputs(mut self, inputs: Option<Tensor>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    /// The context's output tensor, if both are present.
    pub fn context_outputs(&self) -> Option<&Tensor> {
        self.context.as_ref().and_then(|c| c.outputs.as_ref())
    }
}
