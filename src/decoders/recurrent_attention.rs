//! Recurrent decoder with global attention over the encoder context.

use super::recurrent::{StackedRecurrent, classifier, time_major};
use super::{Decoder, DecoderType};
use crate::attention::GlobalAttention;
use crate::config::DecoderConfig;
use crate::state::State;
use candle_core::{Module, Result, Tensor, bail};
use candle_nn::{Embedding, Linear, VarBuilder};

/// Brings a context tensor to (batch, positions, channels).
///
/// A pooled (batch, channels) context becomes a single position.
pub(crate) fn context_batch_first(context: &State) -> Result<Tensor> {
    let Some(outputs) = context.outputs.as_ref() else {
        bail!("decoder needs a context with outputs");
    };
    match outputs.rank() {
        2 => outputs.unsqueeze(1),
        3 if context.batch_first => Ok(outputs.clone()),
        3 => outputs.transpose(0, 1)?.contiguous(),
        rank => bail!("context outputs must be rank 2 or 3 after bridging, got rank {rank}"),
    }
}

/// Embedding, stacked RNN, then attention of every RNN output over the context.
#[derive(Debug, Clone)]
pub struct RecurrentAttentionDecoder {
    embedder: Embedding,
    rnn: StackedRecurrent,
    attention: GlobalAttention,
    classifier: Linear,
    dropout: f32,
    batch_first: bool,
    context_size: usize,
}

impl RecurrentAttentionDecoder {
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
        let attention = GlobalAttention::new(
            cfg.attention,
            cfg.hidden_size,
            context_size,
            cfg.hidden_size,
            cfg.bias,
            vb.pp("attention"),
        )?;
        let classifier = classifier(cfg, &embedder, vocab_size, vb.pp("classifier"))?;
        Ok(Self {
            embedder,
            rnn,
            attention,
            classifier,
            dropout: cfg.dropout,
            batch_first: cfg.batch_first,
            context_size,
        })
    }

    pub fn attention(&self) -> &GlobalAttention {
        &self.attention
    }
}

impl Decoder for RecurrentAttentionDecoder {
    fn decoder_type(&self) -> DecoderType {
        DecoderType::RecurrentAttention
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
        let Some(context) = state.context.as_deref() else {
            bail!("recurrent attention decoder needs a context");
        };
        let keys = context_batch_first(context)?;

        let ids = time_major(inputs, self.batch_first)?;
        let mut emb = self.embedder.forward(&ids)?;
        if train && self.dropout > 0.0 {
            emb = candle_nn::ops::dropout(&emb, self.dropout)?;
        }
        let (outputs, hidden) = self.rnn.forward_t(&emb, state.hidden.as_ref(), train)?;

        // (seq, batch, hidden) -> (batch, seq, hidden)
        let query = outputs.transpose(0, 1)?.contiguous()?;
        let (mut attended, _) = self.attention.forward(&query, &keys)?;
        if train && self.dropout > 0.0 {
            attended = candle_nn::ops::dropout(&attended, self.dropout)?;
        }
        let logits = self.classifier.forward(&attended)?;
        let logits = if self.batch_first {
            logits
        } else {
            logits.transpose(0, 1)?.contiguous()?
        };

        let mut next = State::new()
            .with_hidden(Some(hidden))
            .with_batch_first(self.batch_first);
        next.context = state.context.clone();
        Ok((logits, next))
    }
}
