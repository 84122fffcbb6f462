// flux_vae.rs
// Flux VAE wrapper using candle-transformers implementation

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::flux;
use log::info;

use crate::error::Result;

/// Image encoder/decoder pair used to move between pixels and latents.
/// Pixels are in `[-1, 1]`.
pub trait LatentEncoder {
    /// `[B, 3, H, W]` pixels -> `[B, 16, H/8, W/8]` scaled latents
    fn encode(&self, pixels: &Tensor) -> Result<Tensor>;

    /// Scaled latents -> pixels in `[-1, 1]`
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;
}

/// Wrapper around candle-transformers Flux AutoEncoder.
/// Scaling and shifting of the latents happen inside the candle model.
pub struct AutoencoderKL {
    inner: flux::autoencoder::AutoEncoder,
    device: Device,
    dtype: DType,
}

impl AutoencoderKL {
    pub fn new(config: &flux::autoencoder::Config, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let inner = flux::autoencoder::AutoEncoder::new(config, vb)?;
        Ok(Self { inner, device, dtype })
    }
}

impl LatentEncoder for AutoencoderKL {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        Ok(self.inner.encode(&pixels.to_dtype(self.dtype)?)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.inner.decode(&latents.to_dtype(self.dtype)?)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Load the Flux VAE from one or more safetensors files
pub fn load_flux_vae<P: AsRef<Path>>(files: &[P], dtype: DType, device: &Device) -> Result<AutoencoderKL> {
    info!("Loading Flux VAE from {} file(s)", files.len());
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device)? };
    AutoencoderKL::new(&flux::autoencoder::Config::dev(), vb)
}
