//! Precision settings and weight quantization for the Kontext transformer

pub mod config;
pub mod quanto;

pub use config::{PrecisionMode, QuantizationMode};
pub use quanto::{dequantize_weights, quantize_weights, ModelTensor, QuantizedTensor, QuantoConfig};
