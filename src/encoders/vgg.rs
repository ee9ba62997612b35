//! VGG feature extractor (`features` sequence only).

use super::layers::{batch_norm, conv2d};
use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VggVariant {
    pub depth: usize,
    pub batch_norm: bool,
}

impl VggVariant {
    pub fn from_model_name(name: &str) -> Option<Self> {
        let depth = [11, 13, 16, 19]
            .into_iter()
            .find(|depth| name.contains(&format!("vgg{depth}")))?;
        Some(Self {
            depth,
            batch_norm: name.contains("_bn"),
        })
    }

    /// Output channels of each convolution; `None` marks a max pool.
    fn layout(self) -> Vec<Option<usize>> {
        let per_stage: [usize; 5] = match self.depth {
            11 => [1, 1, 2, 2, 2],
            13 => [2, 2, 2, 2, 2],
            16 => [2, 2, 3, 3, 3],
            _ => [2, 2, 4, 4, 4],
        };
        let widths = [64, 128, 256, 512, 512];
        let mut layout = Vec::new();
        for (convs, width) in per_stage.into_iter().zip(widths) {
            layout.extend(std::iter::repeat_n(Some(width), convs));
            layout.push(None);
        }
        layout
    }

    pub fn out_channels(self) -> usize {
        512
    }
}

#[derive(Debug, Clone)]
enum Layer {
    Conv(Conv2d),
    Norm(BatchNorm),
    Relu,
    MaxPool,
}

/// VGG trunk. Output stride is 32.
#[derive(Debug, Clone)]
pub struct Vgg {
    variant: VggVariant,
    layers: Vec<Layer>,
}

impl Vgg {
    pub fn new(variant: VggVariant, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("features");
        let mut layers = Vec::new();
        let mut channels = in_channels;
        for entry in variant.layout() {
            match entry {
                Some(width) => {
                    let idx = layers.len();
                    layers.push(Layer::Conv(conv2d(
                        channels,
                        width,
                        3,
                        1,
                        1,
                        true,
                        vb.pp(idx.to_string()),
                    )?));
                    if variant.batch_norm {
                        let idx = layers.len();
                        layers.push(Layer::Norm(batch_norm(width, vb.pp(idx.to_string()))?));
                    }
                    layers.push(Layer::Relu);
                    channels = width;
                }
                None => layers.push(Layer::MaxPool),
            }
        }
        Ok(Self { variant, layers })
    }

    pub fn variant(&self) -> VggVariant {
        self.variant
    }

    pub fn out_channels(&self) -> usize {
        self.variant.out_channels()
    }
}

impl ModuleT for Vgg {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = match layer {
                Layer::Conv(conv) => xs.apply(conv)?,
                Layer::Norm(bn) => xs.apply_t(bn, train)?,
                Layer::Relu => xs.relu()?,
                Layer::MaxPool => xs.max_pool2d_with_stride(2, 2)?,
            };
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
            VggVariant::from_model_name("vgg16_bn"),
            Some(VggVariant {
                depth: 16,
                batch_norm: true
            })
        );
        assert_eq!(
            VggVariant::from_model_name("vgg19"),
            Some(VggVariant {
                depth: 19,
                batch_norm: false
            })
        );
        assert_eq!(VggVariant::from_model_name("vgg"), None);
    }

    #[test]
    fn test_parameter_indices_match_torchvision() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let variant = VggVariant {
            depth: 11,
            batch_norm: true,
        };
        let model = Vgg::new(variant, 3, vb)?;
        let names = varmap.data().lock().map(|d| d.keys().cloned().collect::<Vec<_>>());
        let names = names.unwrap_or_default();
        // vgg11_bn: conv 0, bn 1, relu 2, pool 3, conv 4, ...
        assert!(names.iter().any(|n| n == "features.0.weight"));
        assert!(names.iter().any(|n| n == "features.1.running_mean"));
        assert!(names.iter().any(|n| n == "features.4.weight"));
        assert!(names.iter().any(|n| n == "features.25.weight"));

        let xs = Tensor::randn(0f32, 1., (1, 3, 32, 32), &device)?;
        let ys = model.forward_t(&xs, false)?;
        assert_eq!(ys.dims(), &[1, 512, 1, 1]);
        Ok(())
    }
}
