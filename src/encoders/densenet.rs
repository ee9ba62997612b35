//! DenseNet feature extractor (`features` trunk followed by the final ReLU).

use super::layers::{batch_norm, conv2d, max_pool2d_padded};
use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, VarBuilder};

const BN_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseNetVariant {
    DenseNet121,
    DenseNet161,
    DenseNet169,
    DenseNet201,
}

impl DenseNetVariant {
    pub fn from_model_name(name: &str) -> Option<Self> {
        [
            ("densenet121", Self::DenseNet121),
            ("densenet161", Self::DenseNet161),
            ("densenet169", Self::DenseNet169),
            ("densenet201", Self::DenseNet201),
        ]
        .into_iter()
        .find(|(key, _)| name.contains(key))
        .map(|(_, variant)| variant)
    }

    /// (growth rate, layers per block, initial features)
    fn layout(self) -> (usize, [usize; 4], usize) {
        match self {
            Self::DenseNet121 => (32, [6, 12, 24, 16], 64),
            Self::DenseNet161 => (48, [6, 12, 36, 24], 96),
            Self::DenseNet169 => (32, [6, 12, 32, 32], 64),
            Self::DenseNet201 => (32, [6, 12, 48, 32], 64),
        }
    }

    pub fn out_channels(self) -> usize {
        let (growth, blocks, mut features) = self.layout();
        for (i, &num_layers) in blocks.iter().enumerate() {
            features += num_layers * growth;
            if i != blocks.len() - 1 {
                features /= 2;
            }
        }
        features
    }
}

#[derive(Debug, Clone)]
struct DenseLayer {
    norm1: BatchNorm,
    conv1: Conv2d,
    norm2: BatchNorm,
    conv2: Conv2d,
}

impl DenseLayer {
    fn new(in_features: usize, growth: usize, vb: VarBuilder) -> Result<Self> {
        let inner = BN_SIZE * growth;
        Ok(Self {
            norm1: batch_norm(in_features, vb.pp("norm1"))?,
            conv1: conv2d(in_features, inner, 1, 1, 0, false, vb.pp("conv1"))?,
            norm2: batch_norm(inner, vb.pp("norm2"))?,
            conv2: conv2d(inner, growth, 3, 1, 1, false, vb.pp("conv2"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = xs
            .apply_t(&self.norm1, train)?
            .relu()?
            .apply(&self.conv1)?
            .apply_t(&self.norm2, train)?
            .relu()?
            .apply(&self.conv2)?;
        Tensor::cat(&[xs, &ys], 1)
    }
}

#[derive(Debug, Clone)]
struct Transition {
    norm: BatchNorm,
    conv: Conv2d,
}

impl Transition {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply_t(&self.norm, train)?
            .relu()?
            .apply(&self.conv)?
            .avg_pool2d(2)
    }
}

/// DenseNet trunk. Output stride is 32.
#[derive(Debug, Clone)]
pub struct DenseNet {
    variant: DenseNetVariant,
    conv0: Conv2d,
    norm0: BatchNorm,
    blocks: Vec<Vec<DenseLayer>>,
    transitions: Vec<Transition>,
    norm5: BatchNorm,
}

impl DenseNet {
    pub fn new(variant: DenseNetVariant, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("features");
        let (growth, block_config, init_features) = variant.layout();

        let conv0 = conv2d(in_channels, init_features, 7, 2, 3, false, vb.pp("conv0"))?;
        let norm0 = batch_norm(init_features, vb.pp("norm0"))?;

        let mut features = init_features;
        let mut blocks = Vec::with_capacity(block_config.len());
        let mut transitions = Vec::with_capacity(block_config.len() - 1);
        for (i, &num_layers) in block_config.iter().enumerate() {
            let vb_block = vb.pp(format!("denseblock{}", i + 1));
            let mut layers = Vec::with_capacity(num_layers);
            for j in 0..num_layers {
                let layer = DenseLayer::new(
                    features + j * growth,
                    growth,
                    vb_block.pp(format!("denselayer{}", j + 1)),
                )?;
                layers.push(layer);
            }
            blocks.push(layers);
            features += num_layers * growth;

            if i != block_config.len() - 1 {
                let vb_trans = vb.pp(format!("transition{}", i + 1));
                transitions.push(Transition {
                    norm: batch_norm(features, vb_trans.pp("norm"))?,
                    conv: conv2d(features, features / 2, 1, 1, 0, false, vb_trans.pp("conv"))?,
                });
                features /= 2;
            }
        }
        let norm5 = batch_norm(features, vb.pp("norm5"))?;

        Ok(Self {
            variant,
            conv0,
            norm0,
            blocks,
            transitions,
            norm5,
        })
    }

    pub fn variant(&self) -> DenseNetVariant {
        self.variant
    }

    pub fn out_channels(&self) -> usize {
        self.variant.out_channels()
    }
}

impl ModuleT for DenseNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply(&self.conv0)?.apply_t(&self.norm0, train)?.relu()?;
        let mut xs = max_pool2d_padded(&xs, 3, 2, 1)?;
        for (i, block) in self.blocks.iter().enumerate() {
            for layer in block {
                xs = layer.forward_t(&xs, train)?;
            }
            if let Some(transition) = self.transitions.get(i) {
                xs = transition.forward_t(&xs, train)?;
            }
        }
        xs.apply_t(&self.norm5, train)?.relu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_out_channels_match_torchvision() {
        assert_eq!(DenseNetVariant::DenseNet121.out_channels(), 1024);
        assert_eq!(DenseNetVariant::DenseNet161.out_channels(), 2208);
        assert_eq!(DenseNetVariant::DenseNet169.out_channels(), 1664);
        assert_eq!(DenseNetVariant::DenseNet201.out_channels(), 1920);
    }

    #[test]
    fn test_densenet121_feature_map() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = DenseNet::new(DenseNetVariant::DenseNet121, 3, vb)?;
        let xs = Tensor::randn(0f32, 1., (1, 3, 64, 64), &device)?;
        let ys = model.forward_t(&xs, false)?;
        assert_eq!(ys.dims(), &[1, 1024, 2, 2]);

        let names = varmap.data().lock().map(|d| d.keys().cloned().collect::<Vec<_>>());
        let names = names.unwrap_or_default();
        assert!(names.iter().any(|n| n == "features.denseblock4.denselayer16.conv2.weight"));
        assert!(names.iter().any(|n| n == "features.transition3.conv.weight"));
        Ok(())
    }
}
