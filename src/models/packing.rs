//! Patch packing for the Flux transformer
//!
//! A latent `[B, C, H, W]` is cut into 2x2 patches and flattened into a token
//! sequence `[B, (H/2)*(W/2), C*4]`. Tokens run row-major over the patch grid and
//! each feature vector holds the 4 pixels of every channel (`c*4 + ph*2 + pw`).

use candle_core::Tensor;

use crate::error::{KontextError, Result};

/// Side length of one spatial patch
pub const PATCH_SIZE: usize = 2;

/// Patchify a latent tensor: `[B, C, H, W] -> [B, H/2 * W/2, C * 4]`
pub fn pack(latents: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = latents.dims4()?;
    if h % PATCH_SIZE != 0 || w % PATCH_SIZE != 0 {
        return Err(KontextError::shape(
            "pack",
            format!("height {h} and width {w} must be divisible by {PATCH_SIZE}"),
        ));
    }
    let (hp, wp) = (h / PATCH_SIZE, w / PATCH_SIZE);

    // [B, C, H/2, 2, W/2, 2] -> [B, H/2, W/2, C, 2, 2]
    let tokens = latents
        .reshape((b, c, hp, PATCH_SIZE, wp, PATCH_SIZE))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b, hp * wp, c * PATCH_SIZE * PATCH_SIZE))?;
    Ok(tokens)
}

/// Inverse of [`pack`]. The spatial size and channel count cannot be recovered
/// from the tokens, so the caller passes the shape of the latent that was packed.
pub fn unpack(tokens: &Tensor, height: usize, width: usize, channels: usize) -> Result<Tensor> {
    let (b, seq_len, features) = tokens.dims3()?;
    if height % PATCH_SIZE != 0 || width % PATCH_SIZE != 0 {
        return Err(KontextError::shape(
            "unpack",
            format!("height {height} and width {width} must be divisible by {PATCH_SIZE}"),
        ));
    }
    if features != channels * PATCH_SIZE * PATCH_SIZE {
        return Err(KontextError::shape(
            "unpack",
            format!("token features {features} != {channels} channels * 4"),
        ));
    }
    let (hp, wp) = (height / PATCH_SIZE, width / PATCH_SIZE);
    if seq_len != hp * wp {
        return Err(KontextError::shape(
            "unpack",
            format!("{seq_len} tokens cannot fill a {hp}x{wp} patch grid"),
        ));
    }

    // [B, H/2, W/2, C, 2, 2] -> [B, C, H/2, 2, W/2, 2]
    let latents = tokens
        .reshape((b, hp, wp, channels, PATCH_SIZE, PATCH_SIZE))?
        .permute((0, 3, 1, 4, 2, 5))?
        .reshape((b, channels, height, width))?;
    Ok(latents)
}

/// Number of tokens produced by packing an `height x width` latent
pub fn token_count(height: usize, width: usize) -> usize {
    (height / PATCH_SIZE) * (width / PATCH_SIZE)
}
