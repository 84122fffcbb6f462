//! Encodes control images and stacks them behind the noisy latents on the
//! channel axis, producing the `[B, n*16, H, W]` input of the noise predictor.

use candle_core::Tensor;
use log::debug;

use crate::error::Result;
use crate::models::flux_vae::LatentEncoder;
use crate::trainers::candle_image_utils::resize_bilinear;

/// Pixel size control images are brought to before encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    pub height: usize,
    pub width: usize,
}

impl TargetSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Size of the batch's `[B, C, H, W]` image tensor
    pub fn from_reference(images: &Tensor) -> Result<Self> {
        let (_, _, height, width) = images.dims4()?;
        Ok(Self { height, width })
    }

    /// Stored crop size, used when latents were cached and no image tensor is around
    pub fn from_crop(crop_width: usize, crop_height: usize) -> Self {
        Self {
            height: crop_height,
            width: crop_width,
        }
    }

    /// Reference tensor when present, stored crop size otherwise
    pub fn resolve(reference: Option<&Tensor>, crop: (usize, usize)) -> Result<Self> {
        match reference {
            Some(images) => Self::from_reference(images),
            None => Ok(Self::from_crop(crop.0, crop.1)),
        }
    }
}

/// Append encoded control images to `latents` as `[primary, control, origin_control]`.
///
/// Control tensors are `[B, 3, h, w]` in `[0, 1]`. The origin control is only
/// meaningful next to a control, callers pass it that way. The result carries
/// no gradient history.
pub fn condition_noisy_latents<E: LatentEncoder + ?Sized>(
    vae: &E,
    latents: &Tensor,
    control: Option<&Tensor>,
    origin_control: Option<&Tensor>,
    target: TargetSize,
) -> Result<Tensor> {
    if control.is_none() && origin_control.is_none() {
        return Ok(latents.detach());
    }

    let mut parts = vec![latents.clone()];
    for pixels in [control, origin_control].into_iter().flatten() {
        parts.push(encode_control(vae, pixels, latents, target)?);
    }
    Ok(Tensor::cat(&parts, 1)?.detach())
}

fn encode_control<E: LatentEncoder + ?Sized>(
    vae: &E,
    pixels: &Tensor,
    latents: &Tensor,
    target: TargetSize,
) -> Result<Tensor> {
    let pixels = ((pixels * 2.0)? - 1.0)?
        .to_device(vae.device())?
        .to_dtype(vae.dtype())?;
    let (_, _, h, w) = pixels.dims4()?;
    let pixels = if (h, w) != (target.height, target.width) {
        debug!(
            "resizing control image {}x{} -> {}x{}",
            w, h, target.width, target.height
        );
        resize_bilinear(&pixels, target.height, target.width)?
    } else {
        pixels
    };
    let encoded = vae.encode(&pixels)?;
    Ok(encoded.to_device(latents.device())?.to_dtype(latents.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};

    use crate::models::conditioning::LATENT_CHANNELS;

    /// 8x spatial downsampling, channel mean spread over 16 latent channels
    struct PoolEncoder;

    impl LatentEncoder for PoolEncoder {
        fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
            let pooled = pixels.avg_pool2d(8)?.mean_keepdim(1)?;
            Ok(pooled.repeat((1, LATENT_CHANNELS, 1, 1))?)
        }

        fn decode(&self, latents: &Tensor) -> Result<Tensor> {
            Ok(latents.narrow(1, 0, 3)?.upsample_nearest2d(
                latents.dim(2)? * 8,
                latents.dim(3)? * 8,
            )?)
        }

        fn device(&self) -> &Device {
            &Device::Cpu
        }

        fn dtype(&self) -> DType {
            DType::F32
        }
    }

    fn noisy_latents() -> Result<Tensor> {
        Ok(Tensor::randn(0f32, 1., (2, LATENT_CHANNELS, 4, 4), &Device::Cpu)?)
    }

    fn pixels(value: f32, size: usize) -> Result<Tensor> {
        Ok(Tensor::full(value, (2, 3, size, size), &Device::Cpu)?)
    }

    #[test]
    fn test_without_controls_returns_detached_input() -> Result<()> {
        let var = Var::from_tensor(&noisy_latents()?)?;
        let latents = var.as_tensor().clone();
        let out = condition_noisy_latents(&PoolEncoder, &latents, None, None, TargetSize::new(32, 32))?;

        let diff = (&out - &latents)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        assert!(latents.track_op());
        assert!(!out.track_op());
        Ok(())
    }

    #[test]
    fn test_control_is_appended_on_channel_axis() -> Result<()> {
        let latents = noisy_latents()?;
        let control = pixels(1.0, 32)?;
        let out = condition_noisy_latents(&PoolEncoder, &latents, Some(&control), None, TargetSize::new(32, 32))?;
        assert_eq!(out.dims(), &[2, 2 * LATENT_CHANNELS, 4, 4]);

        // [0, 1] pixels are shifted to [-1, 1] before encoding
        let ctrl = out.narrow(1, LATENT_CHANNELS, LATENT_CHANNELS)?;
        let mean = ctrl.mean_all()?.to_scalar::<f32>()?;
        assert!((mean - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_both_controls_keep_order_and_are_resized() -> Result<()> {
        let latents = noisy_latents()?;
        let control = pixels(1.0, 48)?;
        let origin = pixels(0.0, 16)?;
        let target = TargetSize::resolve(None, (32, 32))?;
        let out = condition_noisy_latents(&PoolEncoder, &latents, Some(&control), Some(&origin), target)?;
        assert_eq!(out.dims(), &[2, 3 * LATENT_CHANNELS, 4, 4]);

        let ctrl = out.narrow(1, LATENT_CHANNELS, LATENT_CHANNELS)?.mean_all()?.to_scalar::<f32>()?;
        let orig = out.narrow(1, 2 * LATENT_CHANNELS, LATENT_CHANNELS)?.mean_all()?.to_scalar::<f32>()?;
        assert!((ctrl - 1.0).abs() < 1e-5);
        assert!((orig + 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_target_size_prefers_reference_tensor() -> Result<()> {
        let reference = Tensor::zeros((1, 3, 24, 40), DType::F32, &Device::Cpu)?;
        assert_eq!(TargetSize::resolve(Some(&reference), (8, 8))?, TargetSize::new(24, 40));
        assert_eq!(TargetSize::resolve(None, (64, 32))?, TargetSize::new(32, 64));
        Ok(())
    }
}
