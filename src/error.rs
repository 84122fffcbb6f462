//! Error type shared by the Kontext modules

#[derive(thiserror::Error, Debug)]
pub enum KontextError {
    #[error("Control image is required for Flux Kontext model generation")]
    MissingControlImage,
    #[error("Shape mismatch in {op}: {msg}")]
    ShapeMismatch { op: &'static str, msg: String },
    #[error("Unsupported conditioning layout: {groups} channel groups (expected 1, 2 or 3)")]
    UnsupportedConditioning { groups: usize },
    #[error("Latent channel count {channels} is not a multiple of the block size {block}")]
    InvalidChannels { channels: usize, block: usize },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Weight error: {0}")]
    Weights(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl KontextError {
    pub(crate) fn shape(op: &'static str, msg: impl Into<String>) -> Self {
        Self::ShapeMismatch { op, msg: msg.into() }
    }
}

pub type Result<T> = std::result::Result<T, KontextError>;
