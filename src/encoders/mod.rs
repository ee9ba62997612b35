//! Vision encoders.
//!
//! A [`VisionEncoder`] wraps one of five convolutional backbones, optionally
//! followed by a 1x1 "context transform" convolution and global pooling. The
//! backbone is picked from the model name by [`BackboneFamily::from_model_name`].
//!
//! Parameters follow torchvision's names under `backbone.` (for example
//! `backbone.layer1.0.conv1.weight`), so a torchvision state dict exported to
//! safetensors loads without renaming.

mod alexnet;
mod densenet;
mod layers;
mod resnet;
mod squeezenet;
mod vgg;

pub use alexnet::AlexNet;
pub use densenet::{DenseNet, DenseNetVariant};
pub use resnet::{ResNet, ResNetVariant};
pub use squeezenet::{SqueezeNet, SqueezeNetVariant};
pub use vgg::{Vgg, VggVariant};

use crate::config::EncoderConfig;
use crate::core::{Img2SeqError, ProcessingStage};
use crate::utils::candle_to_processing;
use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Conv2d, VarBuilder};

/// Prefix of backbone parameters inside the encoder.
pub const BACKBONE_PREFIX: &str = "backbone";

/// Supported backbone families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackboneFamily {
    ResNet,
    DenseNet,
    Vgg,
    AlexNet,
    SqueezeNet,
}

impl BackboneFamily {
    /// Families in matching priority order.
    pub const ALL: [BackboneFamily; 5] = [
        BackboneFamily::ResNet,
        BackboneFamily::DenseNet,
        BackboneFamily::Vgg,
        BackboneFamily::AlexNet,
        BackboneFamily::SqueezeNet,
    ];

    /// The substring that selects this family.
    pub fn key(self) -> &'static str {
        match self {
            BackboneFamily::ResNet => "resnet",
            BackboneFamily::DenseNet => "densenet",
            BackboneFamily::Vgg => "vgg",
            BackboneFamily::AlexNet => "alexnet",
            BackboneFamily::SqueezeNet => "squeezenet",
        }
    }

    /// Name of the encoder built for this family.
    pub fn encoder_name(self) -> &'static str {
        match self {
            BackboneFamily::ResNet => "ResNetEncoder",
            BackboneFamily::DenseNet => "DenseNetEncoder",
            BackboneFamily::Vgg => "VGGEncoder",
            BackboneFamily::AlexNet => "AlexNetEncoder",
            BackboneFamily::SqueezeNet => "SqueezeNetEncoder",
        }
    }

    /// Picks the first family whose key is a substring of `model`.
    pub fn from_model_name(model: &str) -> Result<Self, Img2SeqError> {
        Self::ALL
            .into_iter()
            .find(|family| model.contains(family.key()))
            .ok_or_else(|| Img2SeqError::UnsupportedEncoder {
                model: model.to_string(),
            })
    }
}

impl std::fmt::Display for BackboneFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.encoder_name())
    }
}

#[derive(Debug, Clone)]
enum Backbone {
    ResNet(ResNet),
    DenseNet(DenseNet),
    Vgg(Vgg),
    AlexNet(AlexNet),
    SqueezeNet(SqueezeNet),
}

impl Backbone {
    fn new(
        family: BackboneFamily,
        model: &str,
        in_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self, Img2SeqError> {
        let unsupported = || Img2SeqError::UnsupportedEncoder {
            model: model.to_string(),
        };
        let build_err = |e| candle_to_processing(ProcessingStage::Construction, model, e);
        Ok(match family {
            BackboneFamily::ResNet => {
                let variant = ResNetVariant::from_model_name(model).ok_or_else(unsupported)?;
                Backbone::ResNet(ResNet::new(variant, in_channels, vb).map_err(build_err)?)
            }
            BackboneFamily::DenseNet => {
                let variant = DenseNetVariant::from_model_name(model).ok_or_else(unsupported)?;
                Backbone::DenseNet(DenseNet::new(variant, in_channels, vb).map_err(build_err)?)
            }
            BackboneFamily::Vgg => {
                let variant = VggVariant::from_model_name(model).ok_or_else(unsupported)?;
                Backbone::Vgg(Vgg::new(variant, in_channels, vb).map_err(build_err)?)
            }
            BackboneFamily::AlexNet => {
                Backbone::AlexNet(AlexNet::new(in_channels, vb).map_err(build_err)?)
            }
            BackboneFamily::SqueezeNet => {
                let variant = SqueezeNetVariant::from_model_name(model).ok_or_else(unsupported)?;
                Backbone::SqueezeNet(SqueezeNet::new(variant, in_channels, vb).map_err(build_err)?)
            }
        })
    }

    fn out_channels(&self) -> usize {
        match self {
            Backbone::ResNet(m) => m.out_channels(),
            Backbone::DenseNet(m) => m.out_channels(),
            Backbone::Vgg(m) => m.out_channels(),
            Backbone::AlexNet(m) => m.out_channels(),
            Backbone::SqueezeNet(m) => m.out_channels(),
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match self {
            Backbone::ResNet(m) => m.forward_t(xs, train),
            Backbone::DenseNet(m) => m.forward_t(xs, train),
            Backbone::Vgg(m) => m.forward_t(xs, train),
            Backbone::AlexNet(m) => m.forward(xs),
            Backbone::SqueezeNet(m) => m.forward(xs),
        }
    }
}

/// Pretrained convolutional backbone producing the decoder's context.
#[derive(Debug, Clone)]
pub struct VisionEncoder {
    family: BackboneFamily,
    model: String,
    backbone: Backbone,
    context_transform: Option<Conv2d>,
    spatial_context: bool,
    finetune: bool,
    context_size: usize,
}

impl VisionEncoder {
    /// Builds the encoder described by `cfg`, creating its parameters through `vb`.
    pub fn new(cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self, Img2SeqError> {
        cfg.validate()?;
        let family = BackboneFamily::from_model_name(&cfg.model)?;
        let backbone = Backbone::new(family, &cfg.model, cfg.in_channels, vb.pp(BACKBONE_PREFIX))?;

        let mut context_size = backbone.out_channels();
        let context_transform = match cfg.context_transform {
            Some(channels) => {
                let conv = candle_nn::conv2d(
                    context_size,
                    channels,
                    1,
                    Default::default(),
                    vb.pp("context_transform"),
                )
                .map_err(|e| {
                    candle_to_processing(ProcessingStage::Construction, "context_transform", e)
                })?;
                context_size = channels;
                Some(conv)
            }
            None => None,
        };

        Ok(Self {
            family,
            model: cfg.model.clone(),
            backbone,
            context_transform,
            spatial_context: cfg.spatial_context,
            finetune: cfg.finetune,
            context_size,
        })
    }

    pub fn family(&self) -> BackboneFamily {
        self.family
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Channel count of the encoder output.
    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn spatial_context(&self) -> bool {
        self.spatial_context
    }

    pub fn finetune(&self) -> bool {
        self.finetune
    }

    pub fn set_finetune(&mut self, finetune: bool) {
        self.finetune = finetune;
    }

    /// Runs the encoder on an image batch of shape (batch, channels, height, width).
    ///
    /// Returns (batch, context_size, h, w) with spatial context, otherwise
    /// (batch, context_size). When not fine-tuning, backbone features are
    /// detached and batch norm stays in inference mode.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let features = self.backbone.forward_t(xs, train && self.finetune)?;
        let features = if self.finetune {
            features
        } else {
            features.detach()
        };
        let features = match &self.context_transform {
            Some(conv) => features.apply(conv)?,
            None => features,
        };
        if self.spatial_context {
            Ok(features)
        } else {
            layers::global_avg_pool(&features)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_family_priority_order() -> Result<(), Img2SeqError> {
        assert_eq!(
            BackboneFamily::from_model_name("resnet50")?,
            BackboneFamily::ResNet
        );
        assert_eq!(
            BackboneFamily::from_model_name("densenet121")?,
            BackboneFamily::DenseNet
        );
        assert_eq!(
            BackboneFamily::from_model_name("vgg16_bn")?,
            BackboneFamily::Vgg
        );
        assert_eq!(
            BackboneFamily::from_model_name("alexnet")?,
            BackboneFamily::AlexNet
        );
        assert_eq!(
            BackboneFamily::from_model_name("squeezenet1_1")?,
            BackboneFamily::SqueezeNet
        );
        // first match wins
        assert_eq!(
            BackboneFamily::from_model_name("vgg_resnet_hybrid")?,
            BackboneFamily::ResNet
        );
        Ok(())
    }

    #[test]
    fn test_unknown_model_is_unsupported() {
        let err = BackboneFamily::from_model_name("mobilenet_v2");
        assert!(matches!(
            err,
            Err(Img2SeqError::UnsupportedEncoder { ref model }) if model == "mobilenet_v2"
        ));
    }

    #[test]
    fn test_unknown_depth_is_unsupported() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let result = VisionEncoder::new(&EncoderConfig::new("resnet7"), vb);
        assert!(matches!(
            result,
            Err(Img2SeqError::UnsupportedEncoder { .. })
        ));
    }

    #[test]
    fn test_context_transform_and_pooling() -> Result<(), Img2SeqError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = EncoderConfig::new("squeezenet1_1")
            .with_context_transform(32)
            .with_spatial_context(false);
        let encoder = VisionEncoder::new(&cfg, vb.pp("encoder"))?;
        assert_eq!(encoder.family(), BackboneFamily::SqueezeNet);
        assert_eq!(encoder.context_size(), 32);

        let ys = Tensor::randn(0f32, 1., (2, 3, 64, 64), &device)
            .and_then(|xs| encoder.forward_t(&xs, false))
            .map_err(|e| candle_to_processing(ProcessingStage::Encode, "forward", e))?;
        assert_eq!(ys.dims(), &[2, 32]);

        let names = varmap
            .data()
            .lock()
            .map(|d| d.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        assert!(names.iter().any(|n| n == "encoder.context_transform.weight"));
        assert!(names.iter().any(|n| n == "encoder.backbone.features.0.weight"));
        Ok(())
    }
}
