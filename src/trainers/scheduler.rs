//! Flow-matching Euler scheduler with resolution-dependent timestep shifting

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Scheduler settings stored next to the Flux Kontext weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowMatchConfig {
    pub base_image_seq_len: usize,
    pub base_shift: f64,
    pub max_image_seq_len: usize,
    pub max_shift: f64,
    pub num_train_timesteps: usize,
    pub shift: f64,
    pub use_dynamic_shifting: bool,
}

impl Default for FlowMatchConfig {
    fn default() -> Self {
        Self {
            base_image_seq_len: 256,
            base_shift: 0.5,
            max_image_seq_len: 4096,
            max_shift: 1.15,
            num_train_timesteps: 1000,
            shift: 3.0,
            use_dynamic_shifting: true,
        }
    }
}

pub struct FlowMatchScheduler {
    config: FlowMatchConfig,
}

impl FlowMatchScheduler {
    pub fn new(config: FlowMatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FlowMatchConfig {
        &self.config
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.config.num_train_timesteps
    }

    /// Shift exponent for a token sequence of `image_seq_len`, linear between
    /// the base and max sequence lengths
    pub fn mu(&self, image_seq_len: usize) -> f64 {
        let c = &self.config;
        let m = (c.max_shift - c.base_shift) / (c.max_image_seq_len as f64 - c.base_image_seq_len as f64);
        let b = c.base_shift - m * c.base_image_seq_len as f64;
        image_seq_len as f64 * m + b
    }

    fn shift_sigma(&self, sigma: f64, image_seq_len: usize) -> f64 {
        if self.config.use_dynamic_shifting {
            let e = self.mu(image_seq_len).exp();
            e / (e + (1.0 / sigma - 1.0))
        } else {
            let s = self.config.shift;
            s * sigma / (1.0 + (s - 1.0) * sigma)
        }
    }

    /// `num_steps + 1` decreasing noise levels from 1 to 0, the last one terminal
    pub fn sigmas(&self, num_steps: usize, image_seq_len: usize) -> Vec<f64> {
        let num_steps = num_steps.max(1);
        let mut sigmas: Vec<f64> = (0..num_steps)
            .map(|i| {
                let sigma = 1.0 - i as f64 * (1.0 - 1.0 / num_steps as f64) / (num_steps.max(2) - 1) as f64;
                self.shift_sigma(sigma, image_seq_len)
            })
            .collect();
        sigmas.push(0.0);
        sigmas
    }

    /// Inference timesteps on the 0-1000 scale, one per step
    pub fn timesteps(&self, num_steps: usize, image_seq_len: usize) -> Vec<f64> {
        let scale = self.config.num_train_timesteps as f64;
        let sigmas = self.sigmas(num_steps, image_seq_len);
        sigmas[..sigmas.len() - 1].iter().map(|s| s * scale).collect()
    }

    /// Draw one training timestep per sample from the shifted train schedule
    pub fn sample_timesteps<R: Rng>(
        &self,
        rng: &mut R,
        batch_size: usize,
        image_seq_len: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let schedule = self.timesteps(self.config.num_train_timesteps, image_seq_len);
        let picked: Vec<f32> = (0..batch_size)
            .map(|_| schedule[rng.gen_range(0..schedule.len())] as f32)
            .collect();
        Ok(Tensor::from_vec(picked, batch_size, device)?)
    }

    /// `(1 - σ) * latents + σ * noise` with `σ = t / 1000` per sample
    pub fn add_noise(&self, latents: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let b = latents.dim(0)?;
        let sigma = (timesteps.to_dtype(DType::F32)? / self.config.num_train_timesteps as f64)?
            .reshape((b, 1, 1, 1))?
            .to_dtype(latents.dtype())?;
        let one_minus = (1.0 - &sigma)?;
        Ok((latents.broadcast_mul(&one_minus)? + noise.broadcast_mul(&sigma)?)?)
    }

    /// Euler update from `sigma` to `sigma_next`
    pub fn step(&self, model_output: &Tensor, sigma: f64, sigma_next: f64, sample: &Tensor) -> Result<Tensor> {
        Ok((sample + (model_output * (sigma_next - sigma))?)?)
    }
}

impl Default for FlowMatchScheduler {
    fn default() -> Self {
        Self::new(FlowMatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_mu_interpolates_between_shifts() {
        let scheduler = FlowMatchScheduler::default();
        assert!((scheduler.mu(256) - 0.5).abs() < 1e-9);
        assert!((scheduler.mu(4096) - 1.15).abs() < 1e-9);
    }

    #[test]
    fn test_sigmas_decrease_and_are_shifted() {
        let scheduler = FlowMatchScheduler::default();
        let sigmas = scheduler.sigmas(4, 4096);
        assert_eq!(sigmas.len(), 5);
        assert!((sigmas[0] - 1.0).abs() < 1e-9);
        assert_eq!(sigmas[4], 0.0);
        assert!(sigmas.windows(2).all(|w| w[0] > w[1]));
        // Positive mu pushes noise levels up
        assert!(sigmas[2] > 0.5);
    }

    #[test]
    fn test_static_shift_when_dynamic_shifting_is_off() {
        let scheduler = FlowMatchScheduler::new(FlowMatchConfig {
            use_dynamic_shifting: false,
            ..Default::default()
        });
        let sigmas = scheduler.sigmas(2, 1024);
        // shift 3: 3 * 0.5 / (1 + 2 * 0.5)
        assert!((sigmas[1] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_timesteps_scale_to_train_range() {
        let scheduler = FlowMatchScheduler::default();
        let ts = scheduler.timesteps(28, 4096);
        assert_eq!(ts.len(), 28);
        assert!((ts[0] - 1000.0).abs() < 1e-6);
        assert!(ts.iter().all(|t| *t > 0.0 && *t <= 1000.0));
    }

    #[test]
    fn test_add_noise_interpolates() -> Result<()> {
        let scheduler = FlowMatchScheduler::default();
        let latents = Tensor::zeros((2, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let noise = Tensor::ones((2, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let t = Tensor::new(&[0f32, 250.], &Device::Cpu)?;
        let noisy = scheduler.add_noise(&latents, &noise, &t)?;
        assert_eq!(noisy.get(0)?.max_all()?.to_scalar::<f32>()?, 0.0);
        let second = noisy.get(1)?.mean_all()?.to_scalar::<f32>()?;
        assert!((second - 0.25).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_euler_step_follows_velocity() -> Result<()> {
        let scheduler = FlowMatchScheduler::default();
        let sample = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
        let velocity = Tensor::full(2f32, (1, 4), &Device::Cpu)?;
        let next = scheduler.step(&velocity, 1.0, 0.5, &sample)?;
        assert_eq!(next.to_vec2::<f32>()?, vec![vec![0.0; 4]]);
        Ok(())
    }

    #[test]
    fn test_sampled_timesteps_are_in_range() -> Result<()> {
        let scheduler = FlowMatchScheduler::default();
        let mut rng = StdRng::seed_from_u64(42);
        let t = scheduler.sample_timesteps(&mut rng, 8, 1024, &Device::Cpu)?;
        assert_eq!(t.dims(), &[8]);
        assert!(t.to_vec1::<f32>()?.iter().all(|v| *v > 0.0 && *v <= 1000.0));
        Ok(())
    }

    #[test]
    fn test_config_defaults_fill_missing_yaml_keys() -> Result<()> {
        let config: FlowMatchConfig = serde_yaml::from_str("shift: 1.0\n")?;
        assert_eq!(config.shift, 1.0);
        assert_eq!(config.num_train_timesteps, 1000);
        assert!(config.use_dynamic_shifting);
        Ok(())
    }
}
