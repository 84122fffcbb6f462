//! Image utilities: control image loading, bilinear resizing and saving samples

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};

use crate::error::{KontextError, Result};

/// Bilinear resize of `[B, C, H, W]` (or `[C, H, W]`) to `height x width`.
///
/// Half-pixel centers (`align_corners = false`) without antialiasing.
pub fn resize_bilinear(x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let rank = x.rank();
    let x4 = match rank {
        3 => x.unsqueeze(0)?,
        4 => x.clone(),
        _ => {
            return Err(KontextError::shape(
                "resize_bilinear",
                format!("expected [C, H, W] or [B, C, H, W], got {:?}", x.shape()),
            ))
        }
    };
    let (_, _, h, w) = x4.dims4()?;
    if (h, w) == (height, width) {
        return Ok(x.clone());
    }

    let resized = x4.upsample_bilinear2d(height, width, false)?;
    if rank == 3 {
        Ok(resized.squeeze(0)?)
    } else {
        Ok(resized)
    }
}

/// Convert an image to `[3, H, W]` in `[0, 1]`.
///
/// With `use_alpha` the RGB channels are premultiplied by the alpha channel,
/// so transparent regions come through as black.
pub fn image_to_tensor(img: &DynamicImage, use_alpha: bool, device: &Device) -> Result<Tensor> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let tensor = if use_alpha {
        let rgba = img.to_rgba8().into_raw();
        let t = Tensor::from_vec(rgba, (height, width, 4), device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        let t = (t / 255.0)?;
        let rgb = t.narrow(0, 0, 3)?;
        let alpha = t.narrow(0, 3, 1)?;
        rgb.broadcast_mul(&alpha)?
    } else {
        let rgb = img.to_rgb8().into_raw();
        let t = Tensor::from_vec(rgb, (height, width, 3), device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        (t / 255.0)?
    };
    Ok(tensor)
}

/// Load a control image as `[1, 3, height, width]` in `[0, 1]`
pub fn load_control_image<P: AsRef<Path>>(
    path: P,
    use_alpha: bool,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let img = image::open(path.as_ref())?;
    let tensor = image_to_tensor(&img, use_alpha, device)?.unsqueeze(0)?;
    resize_bilinear(&tensor, height, width)
}

/// Convert `[3, H, W]` (or `[1, 3, H, W]`) in `[-1, 1]` to an RGB image
pub fn tensor_to_image(tensor: &Tensor) -> Result<DynamicImage> {
    let tensor = if tensor.rank() == 4 {
        tensor.squeeze(0)?
    } else {
        tensor.clone()
    };
    let (channel, height, width) = tensor.dims3()?;
    if channel != 3 {
        return Err(KontextError::shape(
            "tensor_to_image",
            format!("expected 3 channels (RGB), got {channel}"),
        ));
    }
    let tensor = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let data = tensor
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let img = RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| KontextError::shape("tensor_to_image", "buffer does not match image size"))?;
    Ok(DynamicImage::ImageRgb8(img))
}

/// Save a `[-1, 1]` tensor as an image, format taken from the extension
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tensor_to_image(tensor)?.save(path)?;
    Ok(())
}

/// Round a pixel size down to the given multiple, never below one multiple
pub fn round_to_multiple(size: usize, multiple: usize) -> usize {
    (size / multiple).max(1) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn test_resize_keeps_constant_image() -> Result<()> {
        let x = Tensor::full(0.25f32, (1, 3, 8, 12), &Device::Cpu)?;
        let y = resize_bilinear(&x, 5, 7)?;
        assert_eq!(y.dims(), &[1, 3, 5, 7]);
        let max_err = (y - 0.25)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max_err < 1e-6);
        Ok(())
    }

    #[test]
    fn test_resize_downscale_averages_neighbours() -> Result<()> {
        let x = Tensor::new(&[[[0f32, 1., 2., 3.]]], &Device::Cpu)?;
        let y = resize_bilinear(&x, 1, 2)?;
        assert_eq!(y.dims(), &[1, 1, 2]);
        assert_close(&y, &[0.5, 2.5]);
        Ok(())
    }

    #[test]
    fn test_resize_upscale_clamps_at_edges() -> Result<()> {
        let x = Tensor::new(&[[[0f32, 1.]]], &Device::Cpu)?;
        let y = resize_bilinear(&x, 1, 4)?;
        assert_close(&y, &[0.0, 0.25, 0.75, 1.0]);
        Ok(())
    }

    #[test]
    fn test_resize_matches_torch_interpolate_grid() -> Result<()> {
        // torch.arange(16.).reshape(1, 1, 4, 4) interpolated to 8x8, first two rows
        let x = Tensor::arange(0f32, 16f32, &Device::Cpu)?.reshape((1, 1, 4, 4))?;
        let y = resize_bilinear(&x, 8, 8)?;
        assert_eq!(y.dims(), &[1, 1, 8, 8]);
        assert_close(
            &y.narrow(2, 0, 2)?,
            &[
                0.0, 0.25, 0.75, 1.25, 1.75, 2.25, 2.75, 3.0, //
                1.0, 1.25, 1.75, 2.25, 2.75, 3.25, 3.75, 4.0,
            ],
        );
        Ok(())
    }

    fn assert_close(t: &Tensor, expected: &[f32]) {
        let got = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-5, "{got:?} != {expected:?}");
        }
    }

    #[test]
    fn test_resize_rejects_flat_tensor() {
        let x = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        assert!(resize_bilinear(&x, 2, 2).is_err());
    }

    #[test]
    fn test_alpha_is_premultiplied() -> Result<()> {
        let mut img = RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 255]));
        img.put_pixel(1, 0, Rgba([255, 255, 255, 0]));
        let img = DynamicImage::ImageRgba8(img);

        let t = image_to_tensor(&img, true, &Device::Cpu)?;
        assert_eq!(t.dims(), &[3, 2, 2]);
        let row = t.get(0)?.get(0)?.to_vec1::<f32>()?;
        assert!((row[0] - 1.0).abs() < 1e-5);
        assert_eq!(row[1], 0.0);

        let opaque = image_to_tensor(&img, false, &Device::Cpu)?;
        let row = opaque.get(0)?.get(0)?.to_vec1::<f32>()?;
        assert!(row.iter().all(|v| (v - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn test_control_image_is_loaded_at_target_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ctrl.png");
        RgbaImage::from_pixel(20, 10, Rgba([0, 255, 0, 255])).save(&path)?;

        let t = load_control_image(&path, false, 32, 16, &Device::Cpu)?;
        assert_eq!(t.dims(), &[1, 3, 16, 32]);
        let green = t.narrow(1, 1, 1)?.mean_all()?.to_scalar::<f32>()?;
        let red = t.narrow(1, 0, 1)?.max_all()?.to_scalar::<f32>()?;
        assert!((green - 1.0).abs() < 1e-5);
        assert_eq!(red, 0.0);
        Ok(())
    }

    #[test]
    fn test_save_image_round_trips_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("samples").join("out.png");
        let t = Tensor::full(-1f32, (3, 4, 4), &Device::Cpu)?;
        save_image(&t, &path)?;
        let img = image::open(&path)?.to_rgb8();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_round_to_multiple() {
        assert_eq!(round_to_multiple(1024, 16), 1024);
        assert_eq!(round_to_multiple(1000, 16), 992);
        assert_eq!(round_to_multiple(7, 16), 16);
    }
}
