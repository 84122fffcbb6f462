//! Flux Kontext model: loads the transformer, both text encoders and the VAE
//! from a checkpoint directory and exposes the training-time operations.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::{flux, t5};
use image::DynamicImage;
use log::{debug, info};

use crate::error::{KontextError, Result};
use crate::memory::{dequantize_weights, quantize_weights, ModelTensor, QuantizationMode, QuantoConfig};
use crate::models::flux_model_trait::CandleFlux;
use crate::models::flux_vae::{load_flux_vae, AutoencoderKL};
use crate::trainers::artifact::{save_transformer, TransformerConfigFile};
use crate::trainers::latent_conditioning::{self, TargetSize};
use crate::trainers::noise_prediction::{self, GuidanceScale};
use crate::trainers::sampling::generate_single_image;
use crate::trainers::scheduler::{FlowMatchConfig, FlowMatchScheduler};
use crate::trainers::text_encoders::{PromptEmbeds, TextEncoders, T5_MAX_LENGTH};
use crate::trainers::{GenerateImageConfig, ModelConfig};

pub const ARCH: &str = "flux_kontext";
pub const BASE_MODEL_VERSION: &str = "flux.1_kontext";
/// Image sides must be multiples of this: VAE downsampling (8) times patch size (2)
pub const BUCKET_DIVISIBILITY: usize = 16;

/// Where each sub-model of a Kontext checkpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    /// Transformer weights: a directory of safetensors shards or a single file
    pub transformer: PathBuf,
    /// Checkpoint holding text encoders, tokenizers and the scheduler config
    pub base: PathBuf,
    /// VAE weights: a directory or a single file
    pub vae: PathBuf,
}

impl ModelPaths {
    pub fn text_encoder(&self) -> PathBuf {
        self.base.join("text_encoder")
    }

    pub fn text_encoder_2(&self) -> PathBuf {
        self.base.join("text_encoder_2")
    }

    pub fn tokenizer(&self) -> PathBuf {
        self.base.join("tokenizer").join("tokenizer.json")
    }

    pub fn tokenizer_2(&self) -> PathBuf {
        self.base.join("tokenizer_2").join("tokenizer.json")
    }

    pub fn scheduler_config(&self) -> PathBuf {
        self.base.join("scheduler").join("scheduler_config.json")
    }
}

/// Work out the sub-model locations of `model_config`.
///
/// The transformer always comes from `name_or_path` (its `transformer`
/// subfolder, or the path itself when it is a file). A directory that also has
/// a `text_encoder` folder is a complete checkpoint and supplies everything
/// else; otherwise the remaining parts come from `extras_name_or_path`.
pub fn resolve_model_paths(model_config: &ModelConfig) -> Result<ModelPaths> {
    let model_path = PathBuf::from(&model_config.name_or_path);

    let transformer = if model_path.is_file() {
        model_path.clone()
    } else {
        model_path.join("transformer")
    };

    let base = if model_path.join("text_encoder").is_dir() {
        model_path
    } else {
        match &model_config.extras_name_or_path {
            Some(extras) => PathBuf::from(extras),
            None => {
                return Err(KontextError::Config(format!(
                    "{} is not a complete checkpoint and no extras_name_or_path is set",
                    model_config.name_or_path
                )))
            }
        }
    };

    let vae = match &model_config.pretrained_vae_model {
        Some(vae) => PathBuf::from(vae),
        None => base.join("vae"),
    };

    Ok(ModelPaths {
        transformer,
        base,
        vae,
    })
}

/// Safetensors files at `path`: the file itself, or the sorted shards of a directory
pub fn safetensor_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let file = entry?.path();
        if file.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            files.push(file);
        }
    }
    if files.is_empty() {
        return Err(KontextError::Weights(format!(
            "no safetensors files in {}",
            path.display()
        )));
    }
    files.sort();
    Ok(files)
}

/// Load every shard into one map, cast to `dtype`. With a quantization config
/// eligible weights are kept as int8; [`dequantize_weights`] materializes them.
pub fn load_frozen_weights(
    files: &[PathBuf],
    quantization: Option<&QuantoConfig>,
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, ModelTensor>> {
    let mut weights = HashMap::new();
    for file in files {
        debug!("loading {}", file.display());
        for (name, t) in candle_core::safetensors::load(file, device)? {
            weights.insert(name, t.to_dtype(dtype)?);
        }
    }
    match quantization {
        Some(config) => quantize_weights(config, weights),
        None => Ok(weights.into_iter().map(|(name, t)| (name, ModelTensor::Full(t))).collect()),
    }
}

/// Copy checkpoint values into the vars of an already built model
pub fn load_into_varmap(varmap: &VarMap, files: &[PathBuf], dtype: DType, device: &Device) -> Result<()> {
    let mut weights = HashMap::new();
    for file in files {
        weights.extend(candle_core::safetensors::load(file, device)?);
    }
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| KontextError::Weights("var map lock poisoned".to_string()))?;
    for (name, var) in vars.iter() {
        let value = weights
            .get(name)
            .ok_or_else(|| KontextError::Weights(format!("missing weight {name}")))?;
        var.set(&value.to_dtype(dtype)?)?;
    }
    info!("Loaded {} of {} checkpoint tensors", vars.len(), weights.len());
    Ok(())
}

fn parse_qtype(qtype: &str) -> Result<QuantizationMode> {
    QuantizationMode::from_qtype(qtype)
        .ok_or_else(|| KontextError::Config(format!("unsupported qtype {qtype}")))
}

/// Transformer weights, either trainable vars or frozen (quantized) tensors
enum TransformerWeights {
    Trainable(VarMap),
    Frozen(HashMap<String, ModelTensor>),
}

pub struct FluxKontextModel {
    transformer: CandleFlux<flux::model::Flux>,
    weights: TransformerWeights,
    flux_config: flux::model::Config,
    text_encoders: TextEncoders,
    vae: AutoencoderKL,
    scheduler: FlowMatchScheduler,
    pub device: Device,
    pub dtype: DType,
}

impl FluxKontextModel {
    pub fn load(model_config: &ModelConfig, device: &Device) -> Result<Self> {
        info!("Loading Flux Kontext model");
        let dtype = model_config.dtype.dtype();
        let paths = resolve_model_paths(model_config)?;
        debug!("model paths: {paths:?}");
        let flux_config = flux::model::Config::dev();

        info!("Loading transformer");
        let transformer_files = safetensor_files(&paths.transformer)?;
        let (model, weights) = if model_config.quantize {
            info!("Quantizing transformer");
            let quanto = QuantoConfig::flux(parse_qtype(&model_config.qtype)?);
            let frozen = load_frozen_weights(&transformer_files, Some(&quanto), dtype, device)?;
            // candle's linear layers take dense weights
            let vb = VarBuilder::from_tensors(dequantize_weights(&frozen)?, dtype, device);
            (flux::model::Flux::new(&flux_config, vb)?, TransformerWeights::Frozen(frozen))
        } else {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, dtype, device);
            let model = flux::model::Flux::new(&flux_config, vb)?;
            load_into_varmap(&varmap, &transformer_files, dtype, device)?;
            (model, TransformerWeights::Trainable(varmap))
        };

        info!("Loading T5");
        let t5_dir = paths.text_encoder_2();
        let t5_config: t5::Config = serde_json::from_str(&fs::read_to_string(t5_dir.join("config.json"))?)?;
        let t5_files = safetensor_files(&t5_dir)?;
        let t5_vb = if model_config.quantize_te {
            info!("Quantizing T5");
            let qtype = model_config.qtype_te.as_deref().unwrap_or(&model_config.qtype);
            let quanto = QuantoConfig {
                default_qtype: parse_qtype(qtype)?,
                ..Default::default()
            };
            let frozen = load_frozen_weights(&t5_files, Some(&quanto), dtype, device)?;
            VarBuilder::from_tensors(dequantize_weights(&frozen)?, dtype, device)
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&t5_files, dtype, device)? }
        };

        info!("Loading CLIP");
        let clip_files = safetensor_files(&paths.text_encoder())?;
        let clip_vb = unsafe { VarBuilder::from_mmaped_safetensors(&clip_files, dtype, device)? };
        let text_encoders = TextEncoders::load(
            clip_vb,
            t5_vb,
            &t5_config,
            &paths.tokenizer(),
            &paths.tokenizer_2(),
            device,
        )?;

        info!("Loading VAE");
        let vae = load_flux_vae(&safetensor_files(&paths.vae)?, dtype, device)?;

        info!("Making pipe");
        let transformer = CandleFlux::new(model, &flux_config, dtype, device.clone());
        let scheduler_path = paths.scheduler_config();
        let scheduler_config: FlowMatchConfig = if scheduler_path.is_file() {
            serde_json::from_str(&fs::read_to_string(&scheduler_path)?)?
        } else {
            FlowMatchConfig::default()
        };

        info!("Preparing Model");
        let model = Self {
            transformer,
            weights,
            flux_config,
            text_encoders,
            vae,
            scheduler: FlowMatchScheduler::new(scheduler_config),
            device: device.clone(),
            dtype,
        };
        info!("Model Loaded");
        Ok(model)
    }

    pub fn arch(&self) -> &'static str {
        ARCH
    }

    pub fn base_model_version(&self) -> &'static str {
        BASE_MODEL_VERSION
    }

    pub fn bucket_divisibility(&self) -> usize {
        BUCKET_DIVISIBILITY
    }

    pub fn is_quantized(&self) -> bool {
        match &self.weights {
            TransformerWeights::Trainable(_) => false,
            TransformerWeights::Frozen(weights) => weights.values().any(ModelTensor::is_quantized),
        }
    }

    pub fn transformer(&self) -> &CandleFlux<flux::model::Flux> {
        &self.transformer
    }

    pub fn vae(&self) -> &AutoencoderKL {
        &self.vae
    }

    pub fn scheduler(&self) -> &FlowMatchScheduler {
        &self.scheduler
    }

    /// Vars an optimizer may update; empty when the transformer is frozen
    pub fn trainable_vars(&self) -> Vec<Var> {
        match &self.weights {
            TransformerWeights::Trainable(varmap) => varmap.all_vars(),
            TransformerWeights::Frozen(_) => Vec::new(),
        }
    }

    /// T5 (512 tokens) and pooled CLIP embeddings of each prompt
    pub fn encode_prompt(&mut self, prompts: &[String]) -> Result<PromptEmbeds> {
        self.text_encoders.encode_batch(prompts, T5_MAX_LENGTH)
    }

    pub fn predict_noise(
        &self,
        latent_input: &Tensor,
        timestep: &Tensor,
        text_embeddings: &PromptEmbeds,
        guidance_scale: &GuidanceScale,
        bypass_guidance: bool,
        reg_timestep: Option<&Tensor>,
    ) -> Result<Tensor> {
        noise_prediction::predict_noise(
            &self.transformer,
            latent_input,
            timestep,
            text_embeddings,
            guidance_scale,
            bypass_guidance,
            reg_timestep,
        )
    }

    pub fn condition_noisy_latents(
        &self,
        latents: &Tensor,
        control: Option<&Tensor>,
        origin_control: Option<&Tensor>,
        target: TargetSize,
    ) -> Result<Tensor> {
        latent_conditioning::condition_noisy_latents(&self.vae, latents, control, origin_control, target)
    }

    pub fn loss_target(&self, noise: &Tensor, latents: &Tensor) -> Result<Tensor> {
        noise_prediction::loss_target(noise, latents)
    }

    pub fn generate_image(&mut self, request: &GenerateImageConfig) -> Result<DynamicImage> {
        let embeds = self.encode_prompt(std::slice::from_ref(&request.prompt))?;
        generate_single_image(&self.transformer, &self.vae, &self.scheduler, request, &embeds)
    }

    /// Current transformer weights by checkpoint name
    pub fn named_weights(&self) -> Result<HashMap<String, Tensor>> {
        match &self.weights {
            TransformerWeights::Trainable(varmap) => {
                let vars = varmap
                    .data()
                    .lock()
                    .map_err(|_| KontextError::Weights("var map lock poisoned".to_string()))?;
                Ok(vars
                    .iter()
                    .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
                    .collect())
            }
            TransformerWeights::Frozen(weights) => dequantize_weights(weights),
        }
    }

    /// Write the transformer to `<output_dir>/transformer` and `meta` to
    /// `<output_dir>/aitk_meta.yaml`
    pub fn save_model(
        &self,
        output_dir: &Path,
        meta: &BTreeMap<String, serde_yaml::Value>,
        save_dtype: DType,
    ) -> Result<PathBuf> {
        let config = TransformerConfigFile::from(&self.flux_config);
        save_transformer(output_dir, &self.named_weights()?, &config, meta, save_dtype)
    }
}
