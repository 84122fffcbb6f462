// Quanto-style int8 quantization for frozen Flux weights

use std::collections::HashMap;

use candle_core::{DType, Shape, Tensor};
use log::{debug, info};
use rayon::prelude::*;

use super::QuantizationMode;
use crate::error::Result;

/// Quantized tensor representation
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub shape: Shape,
    pub quantized_data: Tensor,
    pub scale: f32,
    pub qtype: QuantizationMode,
    pub original_dtype: DType,
}

impl QuantizedTensor {
    /// INT8 absmax quantization, values stored as `u8` shifted by 128
    pub fn quantize_int8(tensor: &Tensor) -> Result<Self> {
        let tensor_f32 = tensor.to_dtype(DType::F32)?;
        let abs_max = tensor_f32.abs()?.max_all()?.to_scalar::<f32>()?;
        let scale = if abs_max > 0.0 { abs_max / 127.0 } else { 1.0 };

        let quantized = ((tensor_f32 / scale as f64)?.round()?.clamp(-127f32, 127f32)? + 128.0)?
            .to_dtype(DType::U8)?;

        Ok(Self {
            shape: tensor.shape().clone(),
            quantized_data: quantized,
            scale,
            qtype: QuantizationMode::INT8,
            original_dtype: tensor.dtype(),
        })
    }

    /// Back to the original dtype
    pub fn dequantize(&self) -> Result<Tensor> {
        match self.qtype {
            QuantizationMode::INT8 => {
                let centered = (self.quantized_data.to_dtype(DType::F32)? - 128.0)?;
                Ok((centered * self.scale as f64)?.to_dtype(self.original_dtype)?)
            }
            QuantizationMode::None => Ok(self.quantized_data.to_dtype(self.original_dtype)?),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.shape.elem_count() * self.qtype.bytes_per_element(self.original_dtype)
    }
}

/// A tensor as handed out by a model: full precision, or quantized and in need
/// of [`ModelTensor::dequantize`] before any arithmetic.
#[derive(Debug, Clone)]
pub enum ModelTensor {
    Full(Tensor),
    Quantized(QuantizedTensor),
}

impl ModelTensor {
    pub fn is_quantized(&self) -> bool {
        matches!(self, ModelTensor::Quantized(_))
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            ModelTensor::Full(t) => t.dims(),
            ModelTensor::Quantized(q) => q.shape.dims(),
        }
    }

    pub fn dequantize(self) -> Result<Tensor> {
        match self {
            ModelTensor::Full(t) => Ok(t),
            ModelTensor::Quantized(q) => q.dequantize(),
        }
    }
}

impl From<Tensor> for ModelTensor {
    fn from(t: Tensor) -> Self {
        ModelTensor::Full(t)
    }
}

/// Configuration for quantization
#[derive(Clone, Debug)]
pub struct QuantoConfig {
    pub default_qtype: QuantizationMode,
    pub exclude_patterns: Vec<String>,
    pub per_layer_config: HashMap<String, QuantizationMode>,
    /// Tensors smaller than this stay in full precision
    pub min_elements: usize,
}

impl Default for QuantoConfig {
    fn default() -> Self {
        Self {
            default_qtype: QuantizationMode::INT8,
            exclude_patterns: vec!["norm".to_string(), "embed".to_string()],
            per_layer_config: HashMap::new(),
            min_elements: 1024,
        }
    }
}

impl QuantoConfig {
    /// Flux transformer: keep the input/output projections and the
    /// time/vector/guidance embedders in full precision
    pub fn flux(qtype: QuantizationMode) -> Self {
        let mut config = Self {
            default_qtype: qtype,
            ..Self::default()
        };
        for layer in ["img_in", "txt_in", "final_layer"] {
            config.per_layer_config.insert(layer.to_string(), QuantizationMode::None);
        }
        config.exclude_patterns = ["norm", "time_in", "vector_in", "guidance_in", "pe_embedder"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        config
    }

    fn qtype_for(&self, name: &str, tensor: &Tensor) -> QuantizationMode {
        if self.exclude_patterns.iter().any(|p| name.contains(p.as_str()))
            || !name.ends_with(".weight")
            || tensor.rank() < 2
            || tensor.elem_count() < self.min_elements
        {
            return QuantizationMode::None;
        }
        self.per_layer_config
            .iter()
            .find(|(layer, _)| name.starts_with(layer.as_str()))
            .map(|(_, q)| *q)
            .unwrap_or(self.default_qtype)
    }
}

/// Quantize a weight map. Returned weights are frozen: callers build the model
/// from plain tensors, never from trainable vars.
pub fn quantize_weights(
    config: &QuantoConfig,
    weights: HashMap<String, Tensor>,
) -> Result<HashMap<String, ModelTensor>> {
    let total = weights.len();
    let quantized = weights
        .into_par_iter()
        .map(|(name, tensor)| {
            let value = match config.qtype_for(&name, &tensor) {
                QuantizationMode::INT8 => {
                    ModelTensor::Quantized(QuantizedTensor::quantize_int8(&tensor)?)
                }
                QuantizationMode::None => ModelTensor::Full(tensor),
            };
            Ok((name, value))
        })
        .collect::<Result<HashMap<_, _>>>()?;

    let count = quantized.values().filter(|t| t.is_quantized()).count();
    info!("Quantized {count} of {total} weights");
    Ok(quantized)
}

/// Dequantize a frozen weight map, e.g. to build a model or save it
pub fn dequantize_weights(weights: &HashMap<String, ModelTensor>) -> Result<HashMap<String, Tensor>> {
    weights
        .iter()
        .map(|(name, t)| {
            debug!("dequantize {name} {:?}", t.dims());
            Ok((name.clone(), t.clone().dequantize()?))
        })
        .collect()
}
