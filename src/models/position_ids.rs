//! Position ids for the Flux rotary embedding
//!
//! Every token carries a `(kind, row, col)` triple. Primary image tokens use
//! kind 0, Kontext control tokens use kind 1 and otherwise share the primary
//! patch grid, so attention can tell a control patch from an image patch at the
//! same location.

use candle_core::{DType, Device, Tensor};

use crate::error::{KontextError, Result};
use crate::models::packing::PATCH_SIZE;

/// First coordinate of primary image tokens
pub const IMAGE_KIND: u32 = 0;
/// First coordinate of control image tokens
pub const CONTROL_KIND: u32 = 1;

/// Ids of the patch grid of one `height x width` latent, `[B, H/2 * W/2, 3]`
pub fn image_ids(height: usize, width: usize, batch_size: usize, device: &Device) -> Result<Tensor> {
    grid_ids(IMAGE_KIND, height, width, batch_size, device)
}

/// Same grid as [`image_ids`] tagged as control tokens
pub fn control_ids(height: usize, width: usize, batch_size: usize, device: &Device) -> Result<Tensor> {
    grid_ids(CONTROL_KIND, height, width, batch_size, device)
}

/// Primary ids followed by control ids along the token axis
pub fn with_control_ids(height: usize, width: usize, batch_size: usize, device: &Device) -> Result<Tensor> {
    let img_ids = image_ids(height, width, batch_size, device)?;
    let ctrl_ids = control_ids(height, width, batch_size, device)?;
    Ok(Tensor::cat(&[&img_ids, &ctrl_ids], 1)?)
}

/// Text tokens sit at the origin, `[B, L, 3]` of zeros
pub fn text_ids(batch_size: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((batch_size, seq_len, 3), DType::F32, device)?)
}

/// Ids are identical across the batch; the transformer takes a single
/// unbatched block and broadcasts it itself.
pub fn unbatch_ids(ids: &Tensor) -> Result<Tensor> {
    match ids.rank() {
        2 => Ok(ids.clone()),
        3 => Ok(ids.get(0)?),
        _ => Err(KontextError::shape(
            "unbatch_ids",
            format!("expected [N, 3] or [B, N, 3] ids, got {:?}", ids.shape()),
        )),
    }
}

fn grid_ids(kind: u32, height: usize, width: usize, batch_size: usize, device: &Device) -> Result<Tensor> {
    if height % PATCH_SIZE != 0 || width % PATCH_SIZE != 0 {
        return Err(KontextError::shape(
            "position_ids",
            format!("height {height} and width {width} must be divisible by {PATCH_SIZE}"),
        ));
    }
    let (hp, wp) = (height / PATCH_SIZE, width / PATCH_SIZE);
    let ids = Tensor::stack(
        &[
            Tensor::full(kind, (hp, wp), device)?,
            Tensor::arange(0u32, hp as u32, device)?
                .reshape((hp, 1))?
                .broadcast_as((hp, wp))?,
            Tensor::arange(0u32, wp as u32, device)?
                .reshape((1, wp))?
                .broadcast_as((hp, wp))?,
        ],
        2,
    )?
    .to_dtype(DType::F32)?
    .reshape((1, hp * wp, 3))?
    .repeat((batch_size, 1, 1))?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ids_layout() -> Result<()> {
        let ids = image_ids(4, 6, 2, &Device::Cpu)?;
        assert_eq!(ids.dims(), &[2, 6, 3]);
        let rows = ids.get(1)?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0., 0., 0.]);
        assert_eq!(rows[2], vec![0., 0., 2.]);
        assert_eq!(rows[3], vec![0., 1., 0.]);
        assert_eq!(rows[5], vec![0., 1., 2.]);
        Ok(())
    }

    #[test]
    fn test_control_ids_follow_primary_ids() -> Result<()> {
        let ids = with_control_ids(4, 4, 1, &Device::Cpu)?;
        assert_eq!(ids.dims(), &[1, 8, 3]);
        let rows = ids.squeeze(0)?.to_vec2::<f32>()?;
        for row in &rows[..4] {
            assert_eq!(row[0], IMAGE_KIND as f32);
        }
        for (primary, control) in rows[..4].iter().zip(&rows[4..]) {
            assert_eq!(control[0], CONTROL_KIND as f32);
            assert_eq!(control[1..], primary[1..]);
        }
        Ok(())
    }

    #[test]
    fn test_unbatch_ids() -> Result<()> {
        let ids = image_ids(2, 2, 3, &Device::Cpu)?;
        assert_eq!(unbatch_ids(&ids)?.dims(), &[1, 3]);
        let flat = text_ids(1, 5, &Device::Cpu)?;
        assert_eq!(unbatch_ids(&flat)?.dims(), &[5, 3]);
        assert!(unbatch_ids(&flat.flatten_all()?).is_err());
        Ok(())
    }

    #[test]
    fn test_odd_grid_is_rejected() {
        assert!(image_ids(3, 4, 1, &Device::Cpu).is_err());
    }
}
