//! Flux Kontext building blocks: latent packing, position ids, conditioning
//! selection and the transformer/VAE seams.

pub mod conditioning;
pub mod flux_model_trait;
pub mod flux_vae;
pub mod packing;
pub mod position_ids;

// Re-export key types
pub use conditioning::{ChannelGroups, ConditioningInput, LATENT_CHANNELS};
pub use flux_model_trait::{CandleFlux, FluxModel, GuidanceMode, TransformerInputs};
pub use flux_vae::{load_flux_vae, AutoencoderKL as FluxVAE, LatentEncoder};
pub use packing::{pack, unpack};
