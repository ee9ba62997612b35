//! The image-to-sequence model assembler.
//!
//! [`Img2Seq`] wires a [`VisionEncoder`] to one of the sequence decoders,
//! bridges the encoder output into the decoder's context and initial hidden
//! state, and owns every parameter in a single [`VarMap`].
//!
//! Parameter names are `encoder.backbone.*` (torchvision names),
//! `encoder.context_transform.*` and `decoder.*`.

use crate::config::{DecoderConfig, EncoderConfig, Img2SeqConfig};
use crate::core::validation::validate_positive;
use crate::core::{Img2SeqError, ProcessingStage};
use crate::decoders::{Decoder, build_decoder};
use crate::encoders::VisionEncoder;
use crate::seq2seq::Seq2Seq;
use crate::state::{Hidden, State};
use crate::utils::{candle_to_processing, images_to_tensor};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use image::RgbImage;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// Name prefix of every backbone parameter.
const BACKBONE_PARAMS: &str = "encoder.backbone.";

fn is_backbone(name: &str) -> bool {
    name.starts_with(BACKBONE_PARAMS)
}

fn is_running_stat(name: &str) -> bool {
    name.ends_with(".running_mean") || name.ends_with(".running_var")
}

fn lock_err(e: impl std::fmt::Display) -> Img2SeqError {
    candle_to_processing(
        ProcessingStage::WeightLoading,
        "lock parameters",
        candle_core::Error::Msg(e.to_string()),
    )
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

/// Writes `tensor` into `var`, moving it to the variable's device and dtype.
fn assign(var: &Var, tensor: &Tensor, name: &str) -> Result<(), Img2SeqError> {
    tensor
        .to_device(var.device())
        .and_then(|t| t.to_dtype(var.dtype()))
        .and_then(|t| var.set(&t))
        .map_err(|e| candle_to_processing(ProcessingStage::WeightLoading, name, e))
}

/// Image encoder plus sequence decoder.
pub struct Img2Seq {
    varmap: VarMap,
    device: Device,
    encoder_config: EncoderConfig,
    decoder_config: DecoderConfig,
    encoder: VisionEncoder,
    decoder: Box<dyn Decoder>,
    transfer_hidden: bool,
}

impl std::fmt::Debug for Img2Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Img2Seq")
            .field("device", &self.device)
            .field("encoder", &self.encoder)
            .field("decoder", &self.decoder)
            .field("transfer_hidden", &self.transfer_hidden)
            .finish_non_exhaustive()
    }
}

impl Img2Seq {
    /// Builds a model with freshly initialized parameters on `device`.
    ///
    /// A missing encoder configuration means `resnet50`; a missing decoder
    /// configuration means a recurrent-attention decoder. The decoder's
    /// context size is taken from the constructed encoder.
    pub fn new(
        vocab_size: usize,
        encoder: Option<EncoderConfig>,
        decoder: Option<DecoderConfig>,
        transfer_hidden: bool,
        device: &Device,
    ) -> Result<Self, Img2SeqError> {
        validate_positive(vocab_size, "vocab_size")?;
        let encoder_config = encoder.unwrap_or_default();
        let mut decoder_config = decoder.unwrap_or_default();
        decoder_config.normalize(vocab_size);
        decoder_config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let encoder = VisionEncoder::new(&encoder_config, vb.pp("encoder"))?;
        tracing::debug!(
            "built {} for '{}' with context size {}",
            encoder.family(),
            encoder_config.model,
            encoder.context_size()
        );

        decoder_config.context_size = Some(encoder.context_size());
        let decoder = build_decoder(&decoder_config, vb.pp("decoder"))?;
        tracing::debug!(
            "built {} decoder (hidden {}, {} layers, batch_first {})",
            decoder_config.decoder_type,
            decoder_config.hidden_size,
            decoder_config.num_layers,
            decoder_config.batch_first
        );

        let model = Self {
            varmap,
            device: device.clone(),
            encoder_config,
            decoder_config,
            encoder,
            decoder,
            transfer_hidden,
        };
        if let Some(path) = &model.encoder_config.pretrained {
            model.load_pretrained_backbone(path)?;
        }
        Ok(model)
    }

    pub fn from_config(config: &Img2SeqConfig, device: &Device) -> Result<Self, Img2SeqError> {
        Self::new(
            config.vocab_size,
            config.encoder.clone(),
            config.decoder.clone(),
            config.transfer_hidden,
            device,
        )
    }

    /// Loads a model directory holding `config.json` and, optionally, `model.safetensors`.
    pub fn from_dir(model_dir: impl AsRef<Path>, device: &Device) -> Result<Self, Img2SeqError> {
        let model_dir = model_dir.as_ref();
        let config = Img2SeqConfig::from_path(model_dir.join("config.json"))?;
        let mut model = Self::from_config(&config, device)?;
        let weights = model_dir.join("model.safetensors");
        if weights.exists() {
            model.load(&weights)?;
        }
        Ok(model)
    }

    pub fn encoder(&self) -> &VisionEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &dyn Decoder {
        self.decoder.as_ref()
    }

    pub fn encoder_config(&self) -> &EncoderConfig {
        &self.encoder_config
    }

    /// The normalized decoder configuration, including the injected context size.
    pub fn decoder_config(&self) -> &DecoderConfig {
        &self.decoder_config
    }

    pub fn transfer_hidden(&self) -> bool {
        self.transfer_hidden
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether backbone parameters are trained and expected when loading.
    pub fn finetune(&self) -> bool {
        self.encoder.finetune()
    }

    pub fn set_finetune(&mut self, finetune: bool) {
        self.encoder.set_finetune(finetune);
    }

    /// Runs `f` with backbone fine-tuning set to `finetune`, restoring the
    /// previous setting afterwards, also when `f` panics.
    pub fn with_finetune<T>(&mut self, finetune: bool, f: impl FnOnce(&mut Img2Seq) -> T) -> T {
        let mut guard = ScopedFinetune::new(self, finetune);
        f(&mut *guard)
    }

    /// Greedy decoding straight from images.
    ///
    /// Images are resized to `width` x `height` and normalized before encoding.
    pub fn generate_from_images(
        &self,
        images: &[RgbImage],
        width: u32,
        height: u32,
        bos: u32,
        eos: u32,
        max_len: usize,
    ) -> Result<Vec<Vec<u32>>, Img2SeqError> {
        let inputs = images_to_tensor(images, width, height, &self.device, DType::F32)?;
        self.generate(&inputs, bos, eos, max_len)
    }

    /// Current parameter values by name.
    ///
    /// Backbone parameters are left out while fine-tuning is disabled.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>, Img2SeqError> {
        let finetune = self.finetune();
        let data = self.varmap.data().lock().map_err(lock_err)?;
        Ok(data
            .iter()
            .filter(|(name, _)| finetune || !is_backbone(name))
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    /// Variables an optimizer should update.
    ///
    /// Batch-norm running statistics are never included; backbone parameters
    /// only while fine-tuning.
    pub fn trainable_vars(&self) -> Result<Vec<Var>, Img2SeqError> {
        let finetune = self.finetune();
        let data = self.varmap.data().lock().map_err(lock_err)?;
        let mut vars: Vec<_> = data
            .iter()
            .filter(|(name, _)| (finetune || !is_backbone(name)) && !is_running_stat(name))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(b.0));
        Ok(vars.into_iter().map(|(_, var)| var.clone()).collect())
    }

    /// Loads `state_dict` under the current fine-tuning setting.
    ///
    /// Every expected parameter must be present with the right shape and no
    /// key may name an unknown parameter. Nothing is written unless the whole
    /// mapping passes. Backbone parameters are not expected while fine-tuning
    /// is disabled but are loaded when present.
    pub fn try_load(&self, state_dict: &HashMap<String, Tensor>) -> Result<(), Img2SeqError> {
        let finetune = self.finetune();
        let data = self.varmap.data().lock().map_err(lock_err)?;

        let missing: Vec<String> = data
            .keys()
            .filter(|name| finetune || !is_backbone(name))
            .filter(|name| !state_dict.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Img2SeqError::MissingParameters {
                names: sorted(missing),
            });
        }

        let unexpected: Vec<String> = state_dict
            .keys()
            .filter(|name| !data.contains_key(*name))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(Img2SeqError::UnexpectedParameters {
                names: sorted(unexpected),
            });
        }

        let mut names: Vec<&String> = state_dict.keys().collect();
        names.sort();
        let mut updates = Vec::with_capacity(names.len());
        for name in names {
            let (var, tensor) = (&data[name], &state_dict[name]);
            if var.dims() != tensor.dims() {
                return Err(Img2SeqError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    actual: tensor.dims().to_vec(),
                });
            }
            updates.push((name, var, tensor));
        }

        for (name, var, tensor) in updates {
            assign(var, tensor, name)?;
        }
        Ok(())
    }

    /// Loads `state_dict`, retrying once with backbone fine-tuning disabled.
    ///
    /// The retry covers checkpoints saved without backbone weights. The
    /// fine-tuning setting is restored whether or not the retry succeeds, and
    /// the retry's error is the one returned.
    pub fn load_state_dict(
        &mut self,
        state_dict: &HashMap<String, Tensor>,
    ) -> Result<(), Img2SeqError> {
        match self.try_load(state_dict) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    parameter_mismatch = err.is_parameter_mismatch(),
                    "loading state dict failed ({err}), retrying without backbone"
                );
                self.with_finetune(false, |model| model.try_load(state_dict))
            }
        }
    }

    /// Saves [`Self::state_dict`] as safetensors.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Img2SeqError> {
        let path = path.as_ref();
        let state_dict = self.state_dict()?;
        candle_core::safetensors::save(&state_dict, path).map_err(|e| {
            candle_to_processing(ProcessingStage::WeightLoading, path.display().to_string(), e)
        })
    }

    /// Loads a safetensors checkpoint through [`Self::load_state_dict`].
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), Img2SeqError> {
        let path = path.as_ref();
        let state_dict = candle_core::safetensors::load(path, &self.device).map_err(|e| {
            candle_to_processing(ProcessingStage::WeightLoading, path.display().to_string(), e)
        })?;
        self.load_state_dict(&state_dict)?;
        tracing::info!("loaded {} tensors from {}", state_dict.len(), path.display());
        Ok(())
    }

    /// Overwrites the backbone from a torchvision-named safetensors file.
    ///
    /// Keys without a counterpart in the backbone (classifier heads,
    /// `num_batches_tracked`) are ignored.
    fn load_pretrained_backbone(&self, path: &Path) -> Result<(), Img2SeqError> {
        let weights = candle_core::safetensors::load(path, &self.device).map_err(|e| {
            candle_to_processing(ProcessingStage::WeightLoading, path.display().to_string(), e)
        })?;
        let data = self.varmap.data().lock().map_err(lock_err)?;

        let mut missing = Vec::new();
        let mut updates = Vec::new();
        for (name, var) in data.iter().filter(|(name, _)| is_backbone(name)) {
            let key = &name[BACKBONE_PARAMS.len()..];
            match weights.get(key) {
                None => missing.push(name.clone()),
                Some(tensor) if tensor.dims() != var.dims() => {
                    return Err(Img2SeqError::ShapeMismatch {
                        name: name.clone(),
                        expected: var.dims().to_vec(),
                        actual: tensor.dims().to_vec(),
                    });
                }
                Some(tensor) => updates.push((name, var, tensor)),
            }
        }
        if !missing.is_empty() {
            return Err(Img2SeqError::MissingParameters {
                names: sorted(missing),
            });
        }

        for (name, var, tensor) in &updates {
            assign(var, tensor, name)?;
        }
        tracing::info!(
            "loaded {} pretrained backbone tensors from {}",
            updates.len(),
            path.display()
        );
        Ok(())
    }
}

impl Seq2Seq for Img2Seq {
    /// Drops the redundant leading axis of a (1, batch, channels, height,
    /// width) input and runs the vision encoder. `hidden` is ignored.
    fn encode(
        &self,
        inputs: &Tensor,
        _hidden: Option<&Hidden>,
        train: bool,
    ) -> Result<State, Img2SeqError> {
        let xs = match inputs.dims() {
            [1, _, _, _, _] => inputs
                .squeeze(0)
                .map_err(|e| candle_to_processing(ProcessingStage::Encode, "squeeze input", e))?,
            [_, _, _, _] => inputs.clone(),
            dims => {
                return Err(Img2SeqError::invalid_input(format!(
                    "encoder input must be (1, batch, channels, height, width) or \
                     (batch, channels, height, width), got {dims:?}"
                )));
            }
        };
        let outputs = self
            .encoder
            .forward_t(&xs, train)
            .map_err(|e| candle_to_processing(ProcessingStage::Encode, self.encoder.model(), e))?;
        Ok(State::new().with_outputs(outputs).with_batch_first(true))
    }

    /// Lays the encoder output out as the decoder's context and seeds its hidden state.
    fn bridge(&self, context: State) -> Result<State, Img2SeqError> {
        let bridge_err = |what: &str| {
            let what = what.to_string();
            move |e| candle_to_processing(ProcessingStage::Bridge, what, e)
        };
        let mut context = context;
        let batch_first = self.decoder.batch_first();
        let outputs = context
            .outputs
            .take()
            .ok_or_else(|| Img2SeqError::invalid_input("bridge needs encoder outputs"))?;

        let outputs = if outputs.rank() > 2 {
            let (b, c, h, w) = outputs.dims4().map_err(bridge_err("spatial output"))?;
            let seq = outputs
                .reshape((b, c, h * w))
                .and_then(|t| t.transpose(1, 2))
                .map_err(bridge_err("flatten spatial output"))?;
            let seq = if batch_first {
                seq
            } else {
                seq.transpose(0, 1).map_err(bridge_err("time-major context"))?
            };
            seq.contiguous().map_err(bridge_err("contiguous context"))?
        } else {
            outputs
        };

        let hidden = if self.transfer_hidden {
            Some(match self.decoder.recurrent() {
                Some(rnn) => {
                    let mut dims = vec![rnn.num_layers()];
                    dims.extend_from_slice(outputs.dims());
                    let h = outputs
                        .unsqueeze(0)
                        .and_then(|t| t.broadcast_as(dims))
                        .and_then(|t| t.contiguous())
                        .map_err(bridge_err("expand hidden seed"))?;
                    if rnn.mode().is_paired() {
                        Hidden::Paired { h: h.clone(), c: h }
                    } else {
                        Hidden::Single(h)
                    }
                }
                None => Hidden::Single(outputs.clone()),
            })
        } else {
            None
        };

        context.outputs = Some(outputs);
        context.batch_first = batch_first;
        Ok(State::new()
            .with_hidden(hidden)
            .with_context(context)
            .with_batch_first(batch_first))
    }

    fn decode(
        &self,
        inputs: &Tensor,
        state: &State,
        train: bool,
    ) -> Result<(Tensor, State), Img2SeqError> {
        self.decoder.forward_t(inputs, state, train).map_err(|e| {
            candle_to_processing(
                ProcessingStage::Decode,
                self.decoder.decoder_type().as_str(),
                e,
            )
        })
    }

    fn batch_first(&self) -> bool {
        self.decoder.batch_first()
    }
}

/// Overrides the encoder's fine-tuning flag until dropped.
struct ScopedFinetune<'a> {
    model: &'a mut Img2Seq,
    previous: bool,
}

impl<'a> ScopedFinetune<'a> {
    fn new(model: &'a mut Img2Seq, finetune: bool) -> Self {
        let previous = model.finetune();
        model.set_finetune(finetune);
        Self { model, previous }
    }
}

impl Deref for ScopedFinetune<'_> {
    type Target = Img2Seq;

    fn deref(&self) -> &Img2Seq {
        self.model
    }
}

impl DerefMut for ScopedFinetune<'_> {
    fn deref_mut(&mut self) -> &mut Img2Seq {
        self.model
    }
}

impl Drop for ScopedFinetune<'_> {
    fn drop(&mut self) {
        self.model.set_finetune(self.previous);
    }
}
