//! Kontext image generation: denoise from noise while every step attends to
//! the encoded control image.

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{KontextError, Result};
use crate::models::conditioning::LATENT_CHANNELS;
use crate::models::flux_model_trait::FluxModel;
use crate::models::flux_vae::LatentEncoder;
use crate::models::packing::token_count;
use crate::trainers::candle_image_utils::{load_control_image, round_to_multiple, tensor_to_image};
use crate::trainers::flux_kontext::BUCKET_DIVISIBILITY;
use crate::trainers::noise_prediction::{predict_noise, GuidanceScale};
use crate::trainers::scheduler::FlowMatchScheduler;
use crate::trainers::text_encoders::PromptEmbeds;
use crate::trainers::GenerateImageConfig;

/// VAE spatial downsampling factor
const VAE_SCALE: usize = 8;

/// Generate one image for `request`, conditioned on its control image
pub fn generate_single_image<M, E>(
    model: &M,
    vae: &E,
    scheduler: &FlowMatchScheduler,
    request: &GenerateImageConfig,
    embeds: &PromptEmbeds,
) -> Result<DynamicImage>
where
    M: FluxModel + ?Sized,
    E: LatentEncoder + ?Sized,
{
    let ctrl_img = request
        .ctrl_img
        .as_deref()
        .ok_or(KontextError::MissingControlImage)?;

    let width = round_to_multiple(request.width, BUCKET_DIVISIBILITY);
    let height = round_to_multiple(request.height, BUCKET_DIVISIBILITY);
    info!("Generating {width}x{height} image: {}", request.prompt);

    let control = load_control_image(ctrl_img, request.use_alpha, width, height, vae.device())?;
    let control = ((control * 2.0)? - 1.0)?.to_dtype(vae.dtype())?;
    let control_latents = vae
        .encode(&control)?
        .to_device(model.device())?
        .to_dtype(DType::F32)?;

    let (h, w) = (height / VAE_SCALE, width / VAE_SCALE);
    let mut latents = initial_noise(request.seed, (1, LATENT_CHANNELS, h, w), model.device())?;

    let sigmas = scheduler.sigmas(request.num_inference_steps, token_count(h, w));
    let scale = scheduler.num_train_timesteps() as f32;
    let guidance = GuidanceScale::Uniform(request.guidance_scale);
    let embeds = embeds.expand(1)?;

    for (step, window) in sigmas.windows(2).enumerate() {
        let (sigma, sigma_next) = (window[0], window[1]);
        debug!("step {step}: sigma {sigma:.4} -> {sigma_next:.4}");
        let timestep = Tensor::new(&[sigma as f32 * scale], model.device())?;
        let input = Tensor::cat(&[&latents, &control_latents], 1)?;
        let pred = predict_noise(model, &input, &timestep, &embeds, &guidance, false, None)?;
        latents = scheduler.step(&pred.to_dtype(DType::F32)?, sigma, sigma_next, &latents)?;
    }

    let decoded = vae.decode(&latents.to_device(vae.device())?.to_dtype(vae.dtype())?)?;
    tensor_to_image(&decoded)
}

/// Standard normal latents, reproducible when a seed is given
fn initial_noise(seed: Option<u64>, shape: (usize, usize, usize, usize), device: &Device) -> Result<Tensor> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let num_elements = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..num_elements).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use image::{GenericImageView, Rgb, RgbImage};

    use crate::memory::ModelTensor;
    use crate::models::flux_model_trait::TransformerInputs;

    /// Predicts zero velocity, so the sample stays at its initial noise
    #[derive(Default)]
    struct StillFlux {
        calls: Cell<usize>,
        saw_control_tokens: Cell<bool>,
    }

    impl FluxModel for StillFlux {
        fn forward(&self, inputs: &TransformerInputs) -> Result<ModelTensor> {
            self.calls.set(self.calls.get() + 1);
            let tokens = inputs.img.dim(1)?;
            let last_kind = inputs.img_ids.get(tokens - 1)?.get(0)?.to_scalar::<f32>()?;
            self.saw_control_tokens.set(last_kind == 1.0);
            Ok(ModelTensor::Full(inputs.img.zeros_like()?))
        }

        fn guidance_embeds(&self) -> bool {
            true
        }

        fn dtype(&self) -> DType {
            DType::F32
        }

        fn device(&self) -> &Device {
            &Device::Cpu
        }
    }

    struct PoolEncoder;

    impl LatentEncoder for PoolEncoder {
        fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
            let pooled = pixels.avg_pool2d(VAE_SCALE)?.mean_keepdim(1)?;
            Ok(pooled.repeat((1, LATENT_CHANNELS, 1, 1))?)
        }

        fn decode(&self, latents: &Tensor) -> Result<Tensor> {
            let (_, _, h, w) = latents.dims4()?;
            Ok(latents
                .narrow(1, 0, 3)?
                .clamp(-1f32, 1f32)?
                .upsample_nearest2d(h * VAE_SCALE, w * VAE_SCALE)?)
        }

        fn device(&self) -> &Device {
            &Device::Cpu
        }

        fn dtype(&self) -> DType {
            DType::F32
        }
    }

    fn embeds() -> Result<PromptEmbeds> {
        Ok(PromptEmbeds::new(
            Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?,
            Tensor::zeros((1, 4), DType::F32, &Device::Cpu)?,
        ))
    }

    fn request(ctrl_img: Option<String>) -> GenerateImageConfig {
        GenerateImageConfig {
            prompt: "turn the cat blue".to_string(),
            ctrl_img,
            width: 70,
            height: 40,
            num_inference_steps: 3,
            guidance_scale: 2.5,
            seed: Some(7),
            use_alpha: false,
            output_path: None,
        }
    }

    #[test]
    fn test_missing_control_image_is_rejected() -> Result<()> {
        let model = StillFlux::default();
        let err = generate_single_image(&model, &PoolEncoder, &FlowMatchScheduler::default(), &request(None), &embeds()?)
            .unwrap_err();
        assert!(matches!(err, KontextError::MissingControlImage));
        assert_eq!(model.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn test_generation_rounds_size_and_runs_every_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctrl = dir.path().join("ctrl.png");
        RgbImage::from_pixel(50, 50, Rgb([128, 64, 255])).save(&ctrl)?;

        let model = StillFlux::default();
        let req = request(Some(ctrl.display().to_string()));
        let img = generate_single_image(&model, &PoolEncoder, &FlowMatchScheduler::default(), &req, &embeds()?)?;
        assert_eq!(img.dimensions(), (64, 32));
        assert_eq!(model.calls.get(), 3);
        assert!(model.saw_control_tokens.get());
        Ok(())
    }

    #[test]
    fn test_seeded_noise_is_reproducible() -> Result<()> {
        let a = initial_noise(Some(3), (1, 2, 2, 2), &Device::Cpu)?;
        let b = initial_noise(Some(3), (1, 2, 2, 2), &Device::Cpu)?;
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
