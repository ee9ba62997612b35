//! ResNet feature extractor (convolutional trunk without pooling and classifier).

use super::layers::{batch_norm, conv2d, max_pool2d_padded};
use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResNetVariant {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

impl ResNetVariant {
    pub fn from_model_name(name: &str) -> Option<Self> {
        [
            ("resnet18", Self::ResNet18),
            ("resnet34", Self::ResNet34),
            ("resnet50", Self::ResNet50),
            ("resnet101", Self::ResNet101),
            ("resnet152", Self::ResNet152),
        ]
        .into_iter()
        .find(|(key, _)| name.contains(key))
        .map(|(_, variant)| variant)
    }

    fn blocks_per_stage(self) -> [usize; 4] {
        match self {
            Self::ResNet18 => [2, 2, 2, 2],
            Self::ResNet34 | Self::ResNet50 => [3, 4, 6, 3],
            Self::ResNet101 => [3, 4, 23, 3],
            Self::ResNet152 => [3, 8, 36, 3],
        }
    }

    fn bottleneck(self) -> bool {
        !matches!(self, Self::ResNet18 | Self::ResNet34)
    }

    fn expansion(self) -> usize {
        if self.bottleneck() { 4 } else { 1 }
    }

    pub fn out_channels(self) -> usize {
        512 * self.expansion()
    }
}

#[derive(Debug, Clone)]
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply_t(&self.bn, train)
    }
}

/// Residual block; two 3x3 convolutions (basic) or 1x1-3x3-1x1 (bottleneck).
#[derive(Debug, Clone)]
struct Block {
    convs: Vec<ConvBn>,
    downsample: Option<ConvBn>,
}

impl Block {
    fn basic(in_planes: usize, planes: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let convs = vec![
            ConvBn {
                conv: conv2d(in_planes, planes, 3, stride, 1, false, vb.pp("conv1"))?,
                bn: batch_norm(planes, vb.pp("bn1"))?,
            },
            ConvBn {
                conv: conv2d(planes, planes, 3, 1, 1, false, vb.pp("conv2"))?,
                bn: batch_norm(planes, vb.pp("bn2"))?,
            },
        ];
        let downsample = Self::downsample(in_planes, planes, stride, vb)?;
        Ok(Self { convs, downsample })
    }

    fn bottleneck(in_planes: usize, planes: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let out_planes = planes * 4;
        let convs = vec![
            ConvBn {
                conv: conv2d(in_planes, planes, 1, 1, 0, false, vb.pp("conv1"))?,
                bn: batch_norm(planes, vb.pp("bn1"))?,
            },
            // stride sits on the 3x3 convolution (torchvision "ResNet v1.5")
            ConvBn {
                conv: conv2d(planes, planes, 3, stride, 1, false, vb.pp("conv2"))?,
                bn: batch_norm(planes, vb.pp("bn2"))?,
            },
            ConvBn {
                conv: conv2d(planes, out_planes, 1, 1, 0, false, vb.pp("conv3"))?,
                bn: batch_norm(out_planes, vb.pp("bn3"))?,
            },
        ];
        let downsample = Self::downsample(in_planes, out_planes, stride, vb)?;
        Ok(Self { convs, downsample })
    }

    fn downsample(
        in_planes: usize,
        out_planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Option<ConvBn>> {
        if stride == 1 && in_planes == out_planes {
            return Ok(None);
        }
        let vb = vb.pp("downsample");
        Ok(Some(ConvBn {
            conv: conv2d(in_planes, out_planes, 1, stride, 0, false, vb.pp("0"))?,
            bn: batch_norm(out_planes, vb.pp("1"))?,
        }))
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let last = self.convs.len() - 1;
        let mut ys = xs.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            ys = conv.forward_t(&ys, train)?;
            if i != last {
                ys = ys.relu()?;
            }
        }
        let shortcut = match &self.downsample {
            Some(downsample) => downsample.forward_t(xs, train)?,
            None => xs.clone(),
        };
        (ys + shortcut)?.relu()
    }
}

/// ResNet trunk: stem and four residual stages. Output stride is 32.
#[derive(Debug, Clone)]
pub struct ResNet {
    variant: ResNetVariant,
    stem: ConvBn,
    stages: Vec<Vec<Block>>,
}

impl ResNet {
    pub fn new(variant: ResNetVariant, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let stem = ConvBn {
            conv: conv2d(in_channels, 64, 7, 2, 3, false, vb.pp("conv1"))?,
            bn: batch_norm(64, vb.pp("bn1"))?,
        };

        let mut in_planes = 64;
        let mut stages = Vec::with_capacity(4);
        for (stage_idx, &num_blocks) in variant.blocks_per_stage().iter().enumerate() {
            let planes = 64 << stage_idx;
            let vb_stage = vb.pp(format!("layer{}", stage_idx + 1));
            let mut blocks = Vec::with_capacity(num_blocks);
            for block_idx in 0..num_blocks {
                let stride = if stage_idx > 0 && block_idx == 0 { 2 } else { 1 };
                let vb_block = vb_stage.pp(block_idx.to_string());
                let block = if variant.bottleneck() {
                    Block::bottleneck(in_planes, planes, stride, vb_block)?
                } else {
                    Block::basic(in_planes, planes, stride, vb_block)?
                };
                in_planes = planes * variant.expansion();
                blocks.push(block);
            }
            stages.push(blocks);
        }

        Ok(Self {
            variant,
            stem,
            stages,
        })
    }

    pub fn variant(&self) -> ResNetVariant {
        self.variant
    }

    pub fn out_channels(&self) -> usize {
        self.variant.out_channels()
    }
}

impl ModuleT for ResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.stem.forward_t(xs, train)?.relu()?;
        let mut xs = max_pool2d_padded(&xs, 3, 2, 1)?;
        for stage in &self.stages {
            for block in stage {
                xs = block.forward_t(&xs, train)?;
            }
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_variant_from_model_name() {
        assert_eq!(
            ResNetVariant::from_model_name("resnet50"),
            Some(ResNetVariant::ResNet50)
        );
        assert_eq!(
            ResNetVariant::from_model_name("my_resnet101_v2"),
            Some(ResNetVariant::ResNet101)
        );
        assert_eq!(ResNetVariant::from_model_name("resnet"), None);
        assert_eq!(ResNetVariant::ResNet18.out_channels(), 512);
        assert_eq!(ResNetVariant::ResNet152.out_channels(), 2048);
    }

    #[test]
    fn test_resnet18_feature_map() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ResNet::new(ResNetVariant::ResNet18, 3, vb)?;
        let xs = Tensor::randn(0f32, 1., (2, 3, 64, 64), &device)?;
        let ys = model.forward_t(&xs, false)?;
        assert_eq!(ys.dims(), &[2, 512, 2, 2]);

        let names = varmap.data().lock().map(|d| d.keys().cloned().collect::<Vec<_>>());
        let names = names.unwrap_or_default();
        assert!(names.iter().any(|n| n == "layer2.0.downsample.0.weight"));
        assert!(names.iter().any(|n| n == "layer4.1.bn2.running_var"));
        assert!(!names.iter().any(|n| n == "layer1.0.downsample.0.weight"));
        Ok(())
    }
}
