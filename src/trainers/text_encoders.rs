//! Flux text conditioning: T5-XXL token embeddings plus the pooled CLIP-L vector

use std::path::Path;

use candle_core::{Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{clip, t5};
use tokenizers::Tokenizer;

use crate::error::{KontextError, Result};

/// T5 sequence length used for Flux prompts
pub const T5_MAX_LENGTH: usize = 512;
/// CLIP context length
pub const CLIP_MAX_LENGTH: usize = 77;

/// Text conditioning of one prompt (or a batch of prompts)
#[derive(Debug, Clone)]
pub struct PromptEmbeds {
    /// Per-token T5 embeddings `[B, L, 4096]`
    pub text_embeds: Tensor,
    /// Pooled CLIP embedding `[B, 768]`
    pub pooled_embeds: Tensor,
}

impl PromptEmbeds {
    pub fn new(text_embeds: Tensor, pooled_embeds: Tensor) -> Self {
        Self {
            text_embeds,
            pooled_embeds,
        }
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.text_embeds.dim(1)?)
    }

    /// Repeat a single prompt to cover `batch_size` samples
    pub fn expand(&self, batch_size: usize) -> Result<Self> {
        if self.text_embeds.dim(0)? == batch_size {
            return Ok(self.clone());
        }
        Ok(Self {
            text_embeds: self.text_embeds.repeat((batch_size, 1, 1))?,
            pooled_embeds: self.pooled_embeds.repeat((batch_size, 1))?,
        })
    }
}

/// The two Flux text encoders with their tokenizers.
/// `text_encoder` is CLIP-L, `text_encoder_2` is T5-XXL.
pub struct TextEncoders {
    clip: clip::text_model::ClipTextTransformer,
    t5: t5::T5EncoderModel,
    tokenizer_clip: Tokenizer,
    tokenizer_t5: Tokenizer,
    pub device: Device,
}

impl TextEncoders {
    pub fn new(
        clip: clip::text_model::ClipTextTransformer,
        t5: t5::T5EncoderModel,
        tokenizer_clip: Tokenizer,
        tokenizer_t5: Tokenizer,
        device: Device,
    ) -> Self {
        Self {
            clip,
            t5,
            tokenizer_clip,
            tokenizer_t5,
            device,
        }
    }

    /// Build both encoders from their weights. CLIP weights carry the
    /// `text_model.` prefix of the transformers checkpoint layout.
    pub fn load(
        clip_vb: VarBuilder,
        t5_vb: VarBuilder,
        t5_config: &t5::Config,
        tokenizer_clip: &Path,
        tokenizer_t5: &Path,
        device: &Device,
    ) -> Result<Self> {
        let t5 = t5::T5EncoderModel::load(t5_vb, t5_config)?;
        let tokenizer_t5 = load_tokenizer(tokenizer_t5)?;
        let clip = clip::text_model::ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_l_config())?;
        let tokenizer_clip = load_tokenizer(tokenizer_clip)?;
        Ok(Self::new(clip, t5, tokenizer_clip, tokenizer_t5, device.clone()))
    }

    /// Encode one prompt into `[1, max_length, 4096]` and `[1, 768]`
    pub fn encode(&mut self, prompt: &str, max_length: usize) -> Result<PromptEmbeds> {
        let mut t5_ids = tokenize(&self.tokenizer_t5, prompt)?;
        t5_ids.resize(max_length, 0);
        let t5_ids = Tensor::new(t5_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let text_embeds = self.t5.forward(&t5_ids)?;

        let mut clip_ids = tokenize(&self.tokenizer_clip, prompt)?;
        truncate_keep_eos(&mut clip_ids, CLIP_MAX_LENGTH);
        let clip_ids = Tensor::new(clip_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let pooled_embeds = self.clip.forward(&clip_ids)?;

        Ok(PromptEmbeds::new(text_embeds, pooled_embeds))
    }

    pub fn encode_batch(&mut self, prompts: &[String], max_length: usize) -> Result<PromptEmbeds> {
        let mut text = Vec::with_capacity(prompts.len());
        let mut pooled = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let embeds = self.encode(prompt, max_length)?;
            text.push(embeds.text_embeds);
            pooled.push(embeds.pooled_embeds);
        }
        Ok(PromptEmbeds::new(Tensor::cat(&text, 0)?, Tensor::cat(&pooled, 0)?))
    }
}

fn clip_l_config() -> clip::text_model::ClipTextConfig {
    clip::text_model::ClipTextConfig {
        vocab_size: 49408,
        embed_dim: 768,
        activation: clip::text_model::Activation::QuickGelu,
        intermediate_size: 3072,
        max_position_embeddings: CLIP_MAX_LENGTH,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        projection_dim: 768,
    }
}

/// Cut `ids` to `max_length`, keeping the final token (EOS) in the last slot.
/// CLIP pools the hidden state at the EOS position.
fn truncate_keep_eos(ids: &mut Vec<u32>, max_length: usize) {
    if ids.len() <= max_length || max_length == 0 {
        ids.truncate(max_length);
        return;
    }
    if let Some(&eos) = ids.last() {
        ids.truncate(max_length);
        ids[max_length - 1] = eos;
    }
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| KontextError::Tokenizer(format!("{}: {e}", path.display())))
}

fn tokenize(tokenizer: &Tokenizer, text: &str) -> Result<Vec<u32>> {
    Ok(tokenizer
        .encode(text, true)
        .map_err(|e| KontextError::Tokenizer(e.to_string()))?
        .get_ids()
        .to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_expand_repeats_single_prompt() -> Result<()> {
        let embeds = PromptEmbeds::new(
            Tensor::ones((1, 7, 8), DType::F32, &Device::Cpu)?,
            Tensor::ones((1, 4), DType::F32, &Device::Cpu)?,
        );
        let expanded = embeds.expand(3)?;
        assert_eq!(expanded.text_embeds.dims(), &[3, 7, 8]);
        assert_eq!(expanded.pooled_embeds.dims(), &[3, 4]);
        assert_eq!(expanded.seq_len()?, 7);
        Ok(())
    }

    #[test]
    fn test_clip_config_matches_flux_pooled_width() {
        let config = clip_l_config();
        assert_eq!(config.projection_dim, 768);
        assert_eq!(config.max_position_embeddings, CLIP_MAX_LENGTH);
        assert_eq!(config.embed_dim, 768);
        assert!(matches!(config.activation, clip::text_model::Activation::QuickGelu));
    }

    #[test]
    fn test_long_clip_prompt_keeps_eos() {
        let mut ids: Vec<u32> = (0..100).collect();
        ids[0] = 49406;
        ids[99] = 49407;
        truncate_keep_eos(&mut ids, CLIP_MAX_LENGTH);
        assert_eq!(ids.len(), CLIP_MAX_LENGTH);
        assert_eq!(ids[0], 49406);
        assert_eq!(ids[75], 75);
        assert_eq!(ids[76], 49407);
    }

    #[test]
    fn test_short_clip_prompt_is_untouched() {
        let mut ids = vec![49406, 320, 2368, 49407];
        truncate_keep_eos(&mut ids, CLIP_MAX_LENGTH);
        assert_eq!(ids, vec![49406, 320, 2368, 49407]);
    }
}
