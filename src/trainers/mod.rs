pub mod artifact;
pub mod candle_image_utils;
pub mod flux_kontext;
pub mod latent_conditioning;
pub mod noise_prediction;
pub mod sampling;
pub mod scheduler;
pub mod text_encoders;

// Re-export key types
pub use flux_kontext::{FluxKontextModel, ModelPaths};
pub use latent_conditioning::{condition_noisy_latents, TargetSize};
pub use noise_prediction::{predict_noise, GuidanceScale};
pub use scheduler::{FlowMatchConfig, FlowMatchScheduler};
pub use text_encoders::{PromptEmbeds, TextEncoders};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::memory::PrecisionMode;

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    pub config: ConfigData,
    /// Flat key/value run metadata, written next to saved weights
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigData {
    pub name: Option<String>,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(rename = "type")]
    pub process_type: Option<String>,
    pub device: Option<String>,
    pub training_folder: Option<String>,
    pub model: ModelConfig,
    pub save: Option<SaveConfig>,
    pub sample: Option<SampleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name_or_path: String,
    /// Where text encoders, tokenizers and the VAE come from when
    /// `name_or_path` only holds a transformer
    pub extras_name_or_path: Option<String>,
    pub pretrained_vae_model: Option<String>,
    #[serde(default)]
    pub quantize: bool,
    #[serde(default)]
    pub quantize_te: bool,
    #[serde(default = "default_qtype")]
    pub qtype: String,
    pub qtype_te: Option<String>,
    #[serde(default)]
    pub dtype: PrecisionMode,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    #[serde(default)]
    pub dtype: PrecisionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    #[serde(default)]
    pub sample_every: Option<usize>,
    #[serde(default)]
    pub samples: Vec<GenerateImageConfig>,
}

/// One image generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateImageConfig {
    pub prompt: String,
    pub ctrl_img: Option<String>,
    #[serde(default = "default_size")]
    pub width: usize,
    #[serde(default = "default_size")]
    pub height: usize,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    pub seed: Option<u64>,
    #[serde(default)]
    pub use_alpha: bool,
    pub output_path: Option<String>,
}

fn default_qtype() -> String {
    "qfloat8".to_string()
}

fn default_size() -> usize {
    1024
}

fn default_steps() -> usize {
    28
}

fn default_guidance_scale() -> f32 {
    2.5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}
