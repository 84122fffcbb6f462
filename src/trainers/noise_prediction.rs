//! Flux Kontext noise prediction
//!
//! Takes channel-stacked latents `[B, n*16, H, W]`, selects the conditioning
//! source, packs everything into one token sequence, runs the transformer and
//! returns the prediction for the primary latent as `[B, 16, H, W]`.

use candle_core::{Device, Tensor};
use log::debug;

use crate::error::{KontextError, Result};
use crate::models::conditioning::{concat_conditioning_tokens, fold_conditioning, per_sample};
use crate::models::flux_model_trait::{FluxModel, GuidanceMode, TransformerInputs};
use crate::models::packing::{pack, unpack};
use crate::models::position_ids::{image_ids, text_ids, unbatch_ids, with_control_ids};
use crate::trainers::text_encoders::PromptEmbeds;

/// Timesteps arrive on the 0-1000 scale, the transformer takes 0-1
pub const TIMESTEP_SCALE: f64 = 1000.0;

/// Guidance strength for the guidance embedding
#[derive(Debug, Clone, PartialEq)]
pub enum GuidanceScale {
    Uniform(f32),
    PerSample(Vec<f32>),
}

impl GuidanceScale {
    fn to_tensor(&self, batch_size: usize, device: &Device) -> Result<Tensor> {
        Ok(match self {
            GuidanceScale::Uniform(scale) => Tensor::full(*scale, batch_size, device)?,
            GuidanceScale::PerSample(scales) if scales.len() == batch_size => {
                Tensor::new(scales.as_slice(), device)?
            }
            GuidanceScale::PerSample(scales) => {
                return Err(KontextError::shape(
                    "guidance",
                    format!("{} scales for a batch of {batch_size}", scales.len()),
                ))
            }
        })
    }
}

impl From<f32> for GuidanceScale {
    fn from(scale: f32) -> Self {
        GuidanceScale::Uniform(scale)
    }
}

/// Predict the flow-matching target for `latent_input`.
///
/// * `latent_input` - `[B, n*16, H, W]` with n = 1 (no conditioning), 2
///   (control) or 3 (control and origin control)
/// * `timestep` - scalar or `[B]` on the 0-1000 scale
/// * `reg_timestep` - samples with `timestep < reg_timestep` condition on the
///   origin control instead of the control; scalar or `[B]`
/// * `bypass_guidance` - skip the guidance embedding for this call only
pub fn predict_noise<M: FluxModel + ?Sized>(
    model: &M,
    latent_input: &Tensor,
    timestep: &Tensor,
    text_embeddings: &PromptEmbeds,
    guidance_scale: &GuidanceScale,
    bypass_guidance: bool,
    reg_timestep: Option<&Tensor>,
) -> Result<Tensor> {
    let (bs, _, h, w) = latent_input.dims4()?;
    let device = model.device();
    let dtype = model.dtype();
    let timestep = &per_sample(timestep, bs, "timestep")?;

    // With conditioning the batch is doubled: primary samples, then conditioning
    let folded = fold_conditioning(latent_input, timestep, reg_timestep)?;
    let channels = folded.latents.dim(1)?;
    let packed = pack(&folded.latents)?;

    let (img, img_ids) = if folded.active {
        (
            concat_conditioning_tokens(&packed)?,
            with_control_ids(h, w, bs, device)?,
        )
    } else {
        (packed, image_ids(h, w, bs, device)?)
    };
    let latent_size = img.dim(1)? / if folded.active { 2 } else { 1 };
    debug!(
        "kontext forward: batch {bs}, {latent_size} image tokens, conditioning {}",
        folded.active
    );

    let txt_ids = text_ids(bs, text_embeddings.seq_len()?, device)?;

    let guidance = if model.guidance_embeds() {
        Some(guidance_scale.to_tensor(bs, device)?.to_dtype(dtype)?)
    } else {
        None
    };
    let guidance_mode = if bypass_guidance {
        GuidanceMode::Bypass
    } else {
        GuidanceMode::Embedded
    };

    let inputs = TransformerInputs {
        img: img.to_device(device)?.to_dtype(dtype)?,
        img_ids: unbatch_ids(&img_ids)?,
        txt: text_embeddings.text_embeds.to_device(device)?.to_dtype(dtype)?,
        txt_ids: unbatch_ids(&txt_ids)?,
        timesteps: (timestep.to_device(device)?.to_dtype(dtype)? / TIMESTEP_SCALE)?,
        y: text_embeddings.pooled_embeds.to_device(device)?.to_dtype(dtype)?,
        guidance,
        guidance_mode,
    };
    let noise_pred = model.forward(&inputs)?.dequantize()?;

    // Control tokens carry no target
    let noise_pred = noise_pred.narrow(1, 0, latent_size)?;
    unpack(&noise_pred, h, w, channels)
}

/// Flow-matching target: the velocity from the clean latent to the noise
pub fn loss_target(noise: &Tensor, latents: &Tensor) -> Result<Tensor> {
    Ok((noise - latents)?.detach())
}
