//! Trait for the Flux Kontext transformer
//!
//! The noise-prediction code only needs a forward call, the model dtype/device
//! and whether the model carries a guidance embedding. Anything implementing
//! [`FluxModel`] can be driven by it; [`CandleFlux`] wraps the candle-transformers
//! implementations.

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::flux;

use crate::error::Result;
use crate::memory::ModelTensor;

/// How the guidance embedding takes part in a forward call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuidanceMode {
    /// Add the guidance embedding to the modulation vector
    #[default]
    Embedded,
    /// Skip the guidance embedding for this call only
    Bypass,
}

/// Inputs of one transformer forward call
#[derive(Debug, Clone)]
pub struct TransformerInputs {
    /// Packed tokens `[B, N, 64]`, control tokens (if any) after image tokens
    pub img: Tensor,
    /// Unbatched image/control ids `[N, 3]`
    pub img_ids: Tensor,
    /// T5 embeddings `[B, L, 4096]`
    pub txt: Tensor,
    /// Unbatched text ids `[L, 3]`
    pub txt_ids: Tensor,
    /// Timesteps on the 0-1 scale `[B]`
    pub timesteps: Tensor,
    /// Pooled CLIP embedding `[B, 768]`
    pub y: Tensor,
    pub guidance: Option<Tensor>,
    pub guidance_mode: GuidanceMode,
}

/// Common trait for Flux transformers
pub trait FluxModel {
    /// Forward pass, returns the predicted tokens `[B, N, 64]`
    fn forward(&self, inputs: &TransformerInputs) -> Result<ModelTensor>;

    /// Whether the model was distilled with a guidance embedding
    fn guidance_embeds(&self) -> bool;

    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;
}

impl<M: FluxModel + ?Sized> FluxModel for Box<M> {
    fn forward(&self, inputs: &TransformerInputs) -> Result<ModelTensor> {
        (**self).forward(inputs)
    }

    fn guidance_embeds(&self) -> bool {
        (**self).guidance_embeds()
    }

    fn dtype(&self) -> DType {
        (**self).dtype()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }
}

/// Adapter over `candle_transformers::models::flux` models
pub struct CandleFlux<M> {
    model: M,
    guidance_embed: bool,
    dtype: DType,
    device: Device,
}

impl<M: flux::WithForward> CandleFlux<M> {
    pub fn new(model: M, config: &flux::model::Config, dtype: DType, device: Device) -> Self {
        Self {
            model,
            guidance_embed: config.guidance_embed,
            dtype,
            device,
        }
    }

    pub fn inner(&self) -> &M {
        &self.model
    }
}

impl<M: flux::WithForward> FluxModel for CandleFlux<M> {
    fn forward(&self, inputs: &TransformerInputs) -> Result<ModelTensor> {
        let batch = inputs.img.dim(0)?;
        // candle's Flux wants one id block per sample
        let img_ids = batched(&inputs.img_ids, batch, self.dtype)?;
        let txt_ids = batched(&inputs.txt_ids, batch, self.dtype)?;
        let guidance = match inputs.guidance_mode {
            GuidanceMode::Embedded => inputs.guidance.as_ref(),
            GuidanceMode::Bypass => None,
        };
        let out = self.model.forward(
            &inputs.img,
            &img_ids,
            &inputs.txt,
            &txt_ids,
            &inputs.timesteps,
            &inputs.y,
            guidance,
        )?;
        Ok(ModelTensor::Full(out))
    }

    fn guidance_embeds(&self) -> bool {
        self.guidance_embed
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn batched(ids: &Tensor, batch: usize, dtype: DType) -> Result<Tensor> {
    let ids = match ids.rank() {
        2 => ids.unsqueeze(0)?.repeat((batch, 1, 1))?,
        _ => ids.clone(),
    };
    Ok(ids.to_dtype(dtype)?)
}
