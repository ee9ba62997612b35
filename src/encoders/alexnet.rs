//! AlexNet feature extractor (`features` sequence only).

use super::layers::conv2d;
use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};

pub const ALEXNET_OUT_CHANNELS: usize = 256;

#[derive(Debug, Clone)]
enum Layer {
    Conv(Conv2d),
    Relu,
    MaxPool,
}

/// AlexNet trunk.
#[derive(Debug, Clone)]
pub struct AlexNet {
    layers: Vec<Layer>,
}

impl AlexNet {
    pub fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("features");
        // (index, in, out, kernel, stride, padding, pool after relu)
        let convs = [
            (0, in_channels, 64, 11, 4, 2, true),
            (3, 64, 192, 5, 1, 2, true),
            (6, 192, 384, 3, 1, 1, false),
            (8, 384, 256, 3, 1, 1, false),
            (10, 256, 256, 3, 1, 1, true),
        ];
        let mut layers = Vec::with_capacity(13);
        for (idx, c_in, c_out, kernel, stride, padding, pool) in convs {
            layers.push(Layer::Conv(conv2d(
                c_in,
                c_out,
                kernel,
                stride,
                padding,
                true,
                vb.pp(idx.to_string()),
            )?));
            layers.push(Layer::Relu);
            if pool {
                layers.push(Layer::MaxPool);
            }
        }
        Ok(Self { layers })
    }

    pub fn out_channels(&self) -> usize {
        ALEXNET_OUT_CHANNELS
    }
}

impl Module for AlexNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = match layer {
                Layer::Conv(conv) => xs.apply(conv)?,
                Layer::Relu => xs.relu()?,
                Layer::MaxPool => xs.max_pool2d_with_stride(3, 2)?,
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
    fn test_alexnet_feature_map() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = AlexNet::new(3, vb)?;
        // 224 -> 55 -> 27 -> 13 -> 6
        let xs = Tensor::randn(0f32, 1., (2, 3, 224, 224), &device)?;
        let ys = model.forward(&xs)?;
        assert_eq!(ys.dims(), &[2, 256, 6, 6]);

        let names = varmap.data().lock().map(|d| d.keys().cloned().collect::<Vec<_>>());
        let mut names = names.unwrap_or_default();
        names.sort();
        assert_eq!(names.len(), 10);
        assert!(names.iter().any(|n| n == "features.10.bias"));
        Ok(())
    }
}
