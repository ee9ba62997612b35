//! SqueezeNet feature extractor (`features` sequence only).

use super::layers::{conv2d, max_pool2d_ceil};
use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqueezeNetVariant {
    V1_0,
    V1_1,
}

impl SqueezeNetVariant {
    pub fn from_model_name(name: &str) -> Option<Self> {
        if name.contains("squeezenet1_0") {
            Some(Self::V1_0)
        } else if name.contains("squeezenet1_1") {
            Some(Self::V1_1)
        } else {
            None
        }
    }

    pub fn out_channels(self) -> usize {
        512
    }
}

#[derive(Debug, Clone)]
struct Fire {
    squeeze: Conv2d,
    expand1x1: Conv2d,
    expand3x3: Conv2d,
}

impl Fire {
    fn new(
        in_channels: usize,
        squeeze: usize,
        expand1x1: usize,
        expand3x3: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            squeeze: conv2d(in_channels, squeeze, 1, 1, 0, true, vb.pp("squeeze"))?,
            expand1x1: conv2d(squeeze, expand1x1, 1, 1, 0, true, vb.pp("expand1x1"))?,
            expand3x3: conv2d(squeeze, expand3x3, 3, 1, 1, true, vb.pp("expand3x3"))?,
        })
    }
}

impl Module for Fire {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.apply(&self.squeeze)?.relu()?;
        let left = xs.apply(&self.expand1x1)?.relu()?;
        let right = xs.apply(&self.expand3x3)?.relu()?;
        Tensor::cat(&[&left, &right], 1)
    }
}

#[derive(Debug, Clone)]
enum Layer {
    Conv(Conv2d),
    Relu,
    MaxPool,
    Fire(Fire),
}

/// Entries of the `features` sequence after the stem, in torchvision order.
#[derive(Debug, Clone, Copy)]
enum Entry {
    Pool,
    Fire(usize, usize, usize, usize),
}

/// SqueezeNet trunk.
#[derive(Debug, Clone)]
pub struct SqueezeNet {
    variant: SqueezeNetVariant,
    layers: Vec<Layer>,
}

impl SqueezeNet {
    pub fn new(variant: SqueezeNetVariant, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        use Entry::{Fire as F, Pool};
        let vb = vb.pp("features");
        let (stem, body): ((usize, usize, usize), Vec<Entry>) = match variant {
            SqueezeNetVariant::V1_0 => (
                (96, 7, 2),
                vec![
                    Pool,
                    F(96, 16, 64, 64),
                    F(128, 16, 64, 64),
                    F(128, 32, 128, 128),
                    Pool,
                    F(256, 32, 128, 128),
                    F(256, 48, 192, 192),
                    F(384, 48, 192, 192),
                    F(384, 64, 256, 256),
                    Pool,
                    F(512, 64, 256, 256),
                ],
            ),
            SqueezeNetVariant::V1_1 => (
                (64, 3, 2),
                vec![
                    Pool,
                    F(64, 16, 64, 64),
                    F(128, 16, 64, 64),
                    Pool,
                    F(128, 32, 128, 128),
                    F(256, 32, 128, 128),
                    Pool,
                    F(256, 48, 192, 192),
                    F(384, 48, 192, 192),
                    F(384, 64, 256, 256),
                    F(512, 64, 256, 256),
                ],
            ),
        };

        let (stem_out, stem_kernel, stem_stride) = stem;
        let mut layers = vec![
            Layer::Conv(conv2d(
                in_channels,
                stem_out,
                stem_kernel,
                stem_stride,
                0,
                true,
                vb.pp("0"),
            )?),
            Layer::Relu,
        ];
        for entry in body {
            let idx = layers.len();
            layers.push(match entry {
                Pool => Layer::MaxPool,
                F(c_in, s, e1, e3) => {
                    Layer::Fire(Fire::new(c_in, s, e1, e3, vb.pp(idx.to_string()))?)
                }
            });
        }
        Ok(Self { variant, layers })
    }

    pub fn variant(&self) -> SqueezeNetVariant {
        self.variant
    }

    pub fn out_channels(&self) -> usize {
        self.variant.out_channels()
    }
}

impl Module for SqueezeNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = match layer {
                Layer::Conv(conv) => xs.apply(conv)?,
                Layer::Relu => xs.relu()?,
                Layer::MaxPool => max_pool2d_ceil(&xs, 3, 2)?,
                Layer::Fire(fire) => xs.apply(fire)?,
            };
        }
        Ok(xs)
    }
}
