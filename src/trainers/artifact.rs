//! Writes a trained transformer as a diffusers-style directory:
//!
//! ```text
//! <out>/transformer/diffusion_pytorch_model.safetensors
//! <out>/transformer/config.json
//! <out>/aitk_meta.yaml
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use candle_transformers::models::flux;
use log::info;
use safetensors::tensor::TensorView;
use safetensors::Dtype as SafeDtype;
use serde::{Deserialize, Serialize};

use crate::error::{KontextError, Result};

pub const TRANSFORMER_SUBFOLDER: &str = "transformer";
pub const WEIGHTS_NAME: &str = "diffusion_pytorch_model.safetensors";
pub const CONFIG_NAME: &str = "config.json";
pub const META_NAME: &str = "aitk_meta.yaml";

/// `config.json` written next to the transformer weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfigFile {
    #[serde(rename = "_class_name")]
    pub class_name: String,
    pub in_channels: usize,
    pub num_layers: usize,
    pub num_single_layers: usize,
    pub attention_head_dim: usize,
    pub num_attention_heads: usize,
    pub joint_attention_dim: usize,
    pub pooled_projection_dim: usize,
    pub guidance_embeds: bool,
    pub axes_dims_rope: Vec<usize>,
}

impl From<&flux::model::Config> for TransformerConfigFile {
    fn from(cfg: &flux::model::Config) -> Self {
        Self {
            class_name: "FluxTransformer2DModel".to_string(),
            in_channels: cfg.in_channels,
            num_layers: cfg.depth,
            num_single_layers: cfg.depth_single_blocks,
            attention_head_dim: cfg.hidden_size / cfg.num_heads,
            num_attention_heads: cfg.num_heads,
            joint_attention_dim: cfg.context_in_dim,
            pooled_projection_dim: cfg.vec_in_dim,
            guidance_embeds: cfg.guidance_embed,
            axes_dims_rope: cfg.axes_dim.clone(),
        }
    }
}

/// Save transformer weights, their config and the run metadata under `output_dir`.
/// Returns the path of the weights file.
pub fn save_transformer(
    output_dir: &Path,
    weights: &HashMap<String, Tensor>,
    config: &TransformerConfigFile,
    meta: &BTreeMap<String, serde_yaml::Value>,
    save_dtype: DType,
) -> Result<PathBuf> {
    let transformer_dir = output_dir.join(TRANSFORMER_SUBFOLDER);
    fs::create_dir_all(&transformer_dir)?;

    let weights_path = transformer_dir.join(WEIGHTS_NAME);
    info!("Saving transformer weights to: {}", weights_path.display());
    write_safetensors(&weights_path, weights, save_dtype)?;

    fs::write(transformer_dir.join(CONFIG_NAME), serde_json::to_string_pretty(config)?)?;
    fs::write(output_dir.join(META_NAME), serde_yaml::to_string(meta)?)?;
    Ok(weights_path)
}

fn write_safetensors(path: &Path, weights: &HashMap<String, Tensor>, save_dtype: DType) -> Result<()> {
    // First collect all data and info
    let mut all_data: Vec<Vec<u8>> = Vec::with_capacity(weights.len());
    let mut tensor_info = Vec::with_capacity(weights.len());
    for (name, tensor) in weights {
        let tensor = tensor.to_dtype(save_dtype)?;
        tensor_info.push((
            name.clone(),
            convert_dtype(save_dtype)?,
            tensor.dims().to_vec(),
            all_data.len(),
        ));
        all_data.push(tensor_to_vec(&tensor)?);
    }

    // Now create TensorViews using indices
    let mut views = HashMap::with_capacity(tensor_info.len());
    for (name, dtype, shape, idx) in tensor_info {
        views.insert(name, TensorView::new(dtype, shape, &all_data[idx])?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    safetensors::serialize_to_file(&views, &Some(metadata), path)?;
    Ok(())
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::U8 => Ok(SafeDtype::U8),
        other => Err(KontextError::Weights(format!(
            "Unsupported dtype for safetensors: {other:?}"
        ))),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;
    let data = match tensor.dtype() {
        DType::F32 => bytemuck::cast_slice(&flattened.to_vec1::<f32>()?).to_vec(),
        DType::F16 => bytemuck::cast_slice(&flattened.to_vec1::<half::f16>()?).to_vec(),
        DType::BF16 => bytemuck::cast_slice(&flattened.to_vec1::<half::bf16>()?).to_vec(),
        DType::U8 => flattened.to_vec1::<u8>()?,
        other => {
            return Err(KontextError::Weights(format!(
                "Unsupported tensor dtype for conversion: {other:?}"
            )))
        }
    };
    Ok(data)
}
