//! Convolution and pooling helpers shared by the backbones.

use candle_core::{D, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

/// 2D convolution with torchvision's parameter names (`weight`, optional `bias`).
pub(crate) fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    if bias {
        candle_nn::conv2d(in_channels, out_channels, kernel_size, cfg, vb)
    } else {
        candle_nn::conv2d_no_bias(in_channels, out_channels, kernel_size, cfg, vb)
    }
}

pub(crate) fn batch_norm(num_features: usize, vb: VarBuilder) -> Result<BatchNorm> {
    candle_nn::batch_norm(num_features, 1e-5, vb)
}

/// Max pooling with symmetric padding.
///
/// Edge replication stands in for `-inf` padding: a replicated value is
/// already inside the window, so the maximum does not change.
pub(crate) fn max_pool2d_padded(
    xs: &Tensor,
    kernel_size: usize,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let xs = if padding > 0 {
        xs.pad_with_same(D::Minus1, padding, padding)?
            .pad_with_same(D::Minus2, padding, padding)?
    } else {
        xs.clone()
    };
    xs.max_pool2d_with_stride(kernel_size, stride)
}

/// Max pooling that rounds the output size up, keeping a partial last window.
pub(crate) fn max_pool2d_ceil(xs: &Tensor, kernel_size: usize, stride: usize) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    let extra = |len: usize| -> usize {
        if len <= kernel_size {
            return kernel_size.saturating_sub(len);
        }
        let out = (len - kernel_size).div_ceil(stride) + 1;
        ((out - 1) * stride + kernel_size).saturating_sub(len)
    };
    let (pad_h, pad_w) = (extra(h), extra(w));
    let xs = if pad_h > 0 || pad_w > 0 {
        xs.pad_with_same(D::Minus2, 0, pad_h)?
            .pad_with_same(D::Minus1, 0, pad_w)?
    } else {
        xs.clone()
    };
    xs.max_pool2d_with_stride(kernel_size, stride)
}

/// Global average pooling from (batch, channels, h, w) to (batch, channels).
pub(crate) fn global_avg_pool(xs: &Tensor) -> Result<Tensor> {
    xs.mean(D::Minus1)?.mean(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_max_pool_padded_output_size() -> Result<()> {
        let xs = Tensor::zeros((1, 2, 16, 16), DType::F32, &Device::Cpu)?;
        let ys = max_pool2d_padded(&xs, 3, 2, 1)?;
        assert_eq!(ys.dims(), &[1, 2, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_max_pool_ceil_keeps_partial_window() -> Result<()> {
        // floor((14 - 3) / 2) + 1 = 6, ceil gives 7
        let xs = Tensor::arange(0f32, 196., &Device::Cpu)?.reshape((1, 1, 14, 14))?;
        let ys = max_pool2d_ceil(&xs, 3, 2)?;
        assert_eq!(ys.dims(), &[1, 1, 7, 7]);
        let last = ys.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(last[last.len() - 1], 195.0);
        Ok(())
    }

    #[test]
    fn test_global_avg_pool() -> Result<()> {
        let xs = Tensor::ones((2, 3, 4, 5), DType::F32, &Device::Cpu)?;
        let ys = global_avg_pool(&xs)?;
        assert_eq!(ys.dims(), &[2, 3]);
        Ok(())
    }
}
