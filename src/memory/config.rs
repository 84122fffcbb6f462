//! Precision and quantization settings

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Precision mode the sub-models are loaded in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    #[serde(alias = "fp32")]
    Float32,
    #[serde(alias = "fp16")]
    Float16,
    #[default]
    #[serde(alias = "bf16")]
    BFloat16,
}

impl PrecisionMode {
    pub fn dtype(&self) -> DType {
        match self {
            PrecisionMode::Float32 => DType::F32,
            PrecisionMode::Float16 => DType::F16,
            PrecisionMode::BFloat16 => DType::BF16,
        }
    }
}

/// Quantization mode for frozen weights
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum QuantizationMode {
    None,
    INT8,
}

impl QuantizationMode {
    /// Map a qtype name as written in job configs ("qfloat8", "qint8", ...).
    /// Every 8-bit type is stored as int8 absmax.
    pub fn from_qtype(qtype: &str) -> Option<Self> {
        match qtype.to_ascii_lowercase().as_str() {
            "none" | "" => Some(QuantizationMode::None),
            "qfloat8" | "qfloat8_e4m3fn" | "qfloat8_e5m2" | "qint8" | "int8" | "uint8" => {
                Some(QuantizationMode::INT8)
            }
            _ => None,
        }
    }

    /// Get bytes per element for this quantization mode
    pub fn bytes_per_element(&self, original: DType) -> usize {
        match self {
            QuantizationMode::None => original.size_in_bytes(),
            QuantizationMode::INT8 => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qtype_names() {
        assert_eq!(QuantizationMode::from_qtype("qfloat8"), Some(QuantizationMode::INT8));
        assert_eq!(QuantizationMode::from_qtype("QINT8"), Some(QuantizationMode::INT8));
        assert_eq!(QuantizationMode::from_qtype("none"), Some(QuantizationMode::None));
        assert_eq!(QuantizationMode::from_qtype("qint4"), None);
    }

    #[test]
    fn test_precision_aliases() {
        let mode: PrecisionMode = serde_yaml::from_str("bf16").unwrap();
        assert_eq!(mode.dtype(), DType::BF16);
        let mode: PrecisionMode = serde_yaml::from_str("fp32").unwrap();
        assert_eq!(mode, PrecisionMode::Float32);
    }
}
