//! # img2seq
//!
//! Image-to-sequence models on candle: a pretrained convolutional backbone
//! encodes an image batch, a recurrent or transformer decoder emits tokens.
//!
//! ## Features
//!
//! - Five backbone families chosen by model name (`resnet`, `densenet`, `vgg`,
//!   `alexnet`, `squeezenet`) with torchvision parameter names
//! - Three decoders chosen by type tag (`recurrent`, `recurrent_attention`,
//!   `transformer`)
//! - Bridging of the spatial feature map into a decoder context and,
//!   optionally, the decoder's initial hidden state
//! - Strict safetensors loading that retries without the backbone, for
//!   checkpoints saved while the backbone was frozen
//! - Greedy generation
//!
//! ## Cargo features
//!
//! - `cuda` - Enable CUDA support for GPU acceleration
//! - `metal` - Enable Metal support on macOS
//!
//! ## Modules
//!
//! * [`core`] - Error types and configuration validation
//! * [`config`] - Encoder, decoder and model configuration
//! * [`encoders`] - Vision backbones
//! * [`decoders`] - Sequence decoders
//! * [`attention`] - Attention building blocks
//! * [`model`] - The [`Img2Seq`] assembler
//! * [`seq2seq`] - The encode / bridge / decode interface
//! * [`utils`] - Device parsing and image preprocessing
//!
//! ## Quick Start
//!
//! ```no_run
//! use img2seq::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = parse_device("cpu")?;
//! let encoder = EncoderConfig::new("resnet34").with_spatial_context(true);
//! let decoder: DecoderConfig =
//!     serde_json::from_str(r#"{"type": "transformer", "num_layers": 3}"#)?;
//! let mut model = Img2Seq::new(5000, Some(encoder), Some(decoder), false, &device)?;
//! model.load("checkpoints/model.safetensors")?;
//!
//! let image = load_image("formula.png")?;
//! let tokens = model.generate_from_images(&[image], 256, 64, 1, 2, 200)?;
//! # let _ = tokens;
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod config;
pub mod core;
pub mod decoders;
pub mod encoders;
pub mod model;
pub mod seq2seq;
pub mod state;
pub mod utils;

pub use config::{DecoderConfig, EncoderConfig, Img2SeqConfig};
pub use core::{Img2SeqError, ProcessingStage};
pub use model::Img2Seq;
pub use seq2seq::Seq2Seq;
pub use state::{Hidden, State};

/// Prelude module for convenient imports.
///
/// ```rust
/// use img2seq::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{DecoderConfig, EncoderConfig, Img2SeqConfig};
    pub use crate::core::Img2SeqError;
    pub use crate::decoders::{DecoderType, RnnMode};
    pub use crate::model::Img2Seq;
    pub use crate::seq2seq::Seq2Seq;
    pub use crate::state::{Hidden, State};
    pub use crate::utils::{load_image, parse_device};
}
