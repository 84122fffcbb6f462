//! Kontext conditioning selection
//!
//! Training latents arrive channel-stacked: `[primary | control | origin_control]`,
//! each group [`LATENT_CHANNELS`] wide. The groups are split into an explicit
//! [`ConditioningInput`], one conditioning latent is selected per sample, and
//! the selection is later moved onto the token axis of the transformer input.

use candle_core::{DType, Tensor};

use crate::error::{KontextError, Result};

/// Flux VAE latent channels, the width of one channel group
pub const LATENT_CHANNELS: usize = 16;

/// Conditioning sources stacked behind the primary latent
#[derive(Debug, Clone)]
pub enum ConditioningInput {
    None,
    Single(Tensor),
    Paired { control: Tensor, origin_control: Tensor },
}

impl ConditioningInput {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Pick the conditioning latent for each sample.
    ///
    /// With a paired input, sample `i` uses `origin_control` when
    /// `timestep[i] < reg_timestep[i]` and `control` otherwise. Without a
    /// threshold every sample uses `control`. `reg_timestep` may be a scalar.
    pub fn select(&self, timestep: &Tensor, reg_timestep: Option<&Tensor>) -> Result<Option<Tensor>> {
        match self {
            Self::None => Ok(None),
            Self::Single(control) => Ok(Some(control.clone())),
            Self::Paired { control, origin_control } => {
                let Some(reg_timestep) = reg_timestep else {
                    return Ok(Some(control.clone()));
                };
                let batch = control.dim(0)?;
                let t = per_sample(timestep, batch, "timestep")?;
                let reg = per_sample(reg_timestep, batch, "reg_timestep")?;

                // (B,) -> (B, 1, 1, 1) -> (B, C, H, W)
                let mask = t
                    .lt(&reg)?
                    .reshape((batch, 1, 1, 1))?
                    .broadcast_as(control.shape())?;
                Ok(Some(mask.where_cond(origin_control, control)?))
            }
        }
    }
}

/// Channel-group stack split into the primary latent and its conditioning
#[derive(Debug, Clone)]
pub struct ChannelGroups {
    pub primary: Tensor,
    pub conditioning: ConditioningInput,
}

impl ChannelGroups {
    /// Split a `[B, n * block, H, W]` latent into its groups
    pub fn split(latents: &Tensor, block: usize) -> Result<Self> {
        let channels = latents.dim(1)?;
        if block == 0 || channels % block != 0 {
            return Err(KontextError::InvalidChannels { channels, block });
        }
        let groups = channels / block;
        let group = |i: usize| latents.narrow(1, i * block, block);

        let conditioning = match groups {
            1 => {
                return Ok(Self {
                    primary: latents.clone(),
                    conditioning: ConditioningInput::None,
                })
            }
            2 => ConditioningInput::Single(group(1)?),
            3 => ConditioningInput::Paired {
                control: group(1)?,
                origin_control: group(2)?,
            },
            _ => return Err(KontextError::UnsupportedConditioning { groups }),
        };
        Ok(Self {
            primary: group(0)?,
            conditioning,
        })
    }

    pub fn groups(&self) -> usize {
        match self.conditioning {
            ConditioningInput::None => 1,
            ConditioningInput::Single(_) => 2,
            ConditioningInput::Paired { .. } => 3,
        }
    }
}

/// Result of folding the selected conditioning onto the batch axis
#[derive(Debug, Clone)]
pub struct FoldedConditioning {
    /// `[B, C, H, W]` when inactive, `[2B, C, H, W]` (primary first) when active
    pub latents: Tensor,
    pub active: bool,
}

/// Interleave conditioning candidates for selection: primary samples first,
/// selected conditioning samples second along the batch axis.
pub fn interleave_conditioning(primary: &Tensor, selected: &Tensor) -> Result<Tensor> {
    if primary.dims() != selected.dims() {
        return Err(KontextError::shape(
            "interleave_conditioning",
            format!("primary {:?} vs conditioning {:?}", primary.shape(), selected.shape()),
        ));
    }
    Ok(Tensor::cat(&[primary, selected], 0)?)
}

/// Concatenate selected conditioning onto the token axis.
///
/// Takes packed tokens `[2B, N, F]` laid out as by [`interleave_conditioning`]
/// and returns `[B, 2N, F]`, each sample's control tokens after its own tokens.
pub fn concat_conditioning_tokens(packed: &Tensor) -> Result<Tensor> {
    let doubled = packed.dim(0)?;
    if doubled % 2 != 0 {
        return Err(KontextError::shape(
            "concat_conditioning_tokens",
            format!("batch {doubled} does not hold primary and conditioning halves"),
        ));
    }
    let batch = doubled / 2;
    let latent = packed.narrow(0, 0, batch)?;
    let control = packed.narrow(0, batch, batch)?;
    Ok(Tensor::cat(&[&latent, &control], 1)?)
}

/// Split a channel-group stack, select conditioning per sample and stack the
/// choice behind the primary samples on the batch axis.
pub fn fold_conditioning(
    latents: &Tensor,
    timestep: &Tensor,
    reg_timestep: Option<&Tensor>,
) -> Result<FoldedConditioning> {
    let groups = ChannelGroups::split(latents, LATENT_CHANNELS)?;
    match groups.conditioning.select(timestep, reg_timestep)? {
        None => Ok(FoldedConditioning {
            latents: groups.primary,
            active: false,
        }),
        Some(selected) => Ok(FoldedConditioning {
            latents: interleave_conditioning(&groups.primary, &selected)?,
            active: true,
        }),
    }
}

/// Flatten `values` to `[batch]` F32, broadcasting a scalar (or single value)
pub(crate) fn per_sample(values: &Tensor, batch: usize, name: &'static str) -> Result<Tensor> {
    let values = values.to_dtype(DType::F32)?.flatten_all()?;
    match values.dim(0)? {
        n if n == batch => Ok(values),
        1 => Ok(values.broadcast_as(batch)?.contiguous()?),
        n => Err(KontextError::shape(
            name,
            format!("{n} values for a batch of {batch}"),
        )),
    }
}
