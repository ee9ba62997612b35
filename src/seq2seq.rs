//! Generic encode → bridge → decode interface and greedy generation.

use crate::core::{Img2SeqError, ProcessingStage};
use crate::state::{Hidden, State};
use crate::utils::candle_to_processing;
use candle_core::{D, IndexOp, Tensor};

/// A sequence-to-sequence model split into the three pipeline steps.
pub trait Seq2Seq {
    /// Encodes the source batch into a context state.
    ///
    /// `hidden` exists for encoders that consume a running state; vision
    /// encoders ignore it.
    fn encode(
        &self,
        inputs: &Tensor,
        hidden: Option<&Hidden>,
        train: bool,
    ) -> Result<State, Img2SeqError>;

    /// Turns the encoder state into the decoder's initial state.
    fn bridge(&self, context: State) -> Result<State, Img2SeqError>;

    /// Runs the decoder on `inputs` token ids under `state`.
    fn decode(
        &self,
        inputs: &Tensor,
        state: &State,
        train: bool,
    ) -> Result<(Tensor, State), Img2SeqError>;

    /// Layout of token ids and logits seen by [`Self::decode`].
    fn batch_first(&self) -> bool;

    /// Teacher-forced pass over `targets`; returns the logits.
    fn forward_t(
        &self,
        inputs: &Tensor,
        targets: &Tensor,
        train: bool,
    ) -> Result<Tensor, Img2SeqError> {
        let context = self.encode(inputs, None, train)?;
        let state = self.bridge(context)?;
        let (logits, _) = self.decode(targets, &state, train)?;
        Ok(logits)
    }

    /// Greedy decoding from `bos`, one sequence per batch element.
    ///
    /// A sequence stops at `eos` (not included in the output) or after
    /// `max_len` tokens.
    fn generate(
        &self,
        inputs: &Tensor,
        bos: u32,
        eos: u32,
        max_len: usize,
    ) -> Result<Vec<Vec<u32>>, Img2SeqError> {
        let context = self.encode(inputs, None, false)?;
        let batch_size = context
            .outputs
            .as_ref()
            .ok_or_else(|| Img2SeqError::invalid_input("encoder produced no outputs"))?
            .dim(0)
            .map_err(|e| candle_to_processing(ProcessingStage::Generation, "batch size", e))?;
        let mut state = self.bridge(context)?;
        let device = inputs.device().clone();
        let batch_first = self.batch_first();

        let step_input = |tokens: Vec<u32>| -> Result<Tensor, Img2SeqError> {
            let shape = if batch_first {
                (batch_size, 1)
            } else {
                (1, batch_size)
            };
            Tensor::new(tokens, &device)
                .and_then(|t| t.reshape(shape))
                .map_err(|e| candle_to_processing(ProcessingStage::Generation, "create tokens", e))
        };

        let mut generated: Vec<Vec<u32>> = vec![Vec::new(); batch_size];
        let mut finished = vec![false; batch_size];
        let mut tokens = step_input(vec![bos; batch_size])?;

        for _ in 0..max_len {
            let (logits, next_state) = self.decode(&tokens, &state, false)?;
            state = next_state;

            let last = if batch_first {
                logits.dim(1).and_then(|len| logits.i((.., len - 1, ..)))
            } else {
                logits.dim(0).and_then(|len| logits.i(len - 1))
            };
            let next_tokens = last
                .and_then(|t| t.argmax(D::Minus1))
                .and_then(|t| t.to_vec1::<u32>())
                .map_err(|e| candle_to_processing(ProcessingStage::Generation, "argmax", e))?;

            for (i, &tok) in next_tokens.iter().enumerate() {
                if finished[i] {
                    continue;
                }
                if tok == eos {
                    finished[i] = true;
                } else {
                    generated[i].push(tok);
                }
            }
            if finished.iter().all(|&f| f) {
                break;
            }

            tokens = step_input(next_tokens)?;
        }

        tracing::debug!(
            "generated {} sequences, longest {}",
            batch_size,
            generated.iter().map(Vec::len).max().unwrap_or(0)
        );
        Ok(generated)
    }
}
