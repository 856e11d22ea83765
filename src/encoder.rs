//! Vision-language encoder: the scoring side of the loop.
use std::path::Path;

use log::info;
use tch::{CModule, Device, IValue, Kind, Tensor};
use tokenizers::Tokenizer;

use crate::error::{Result, SynthError};
use crate::generator::{expect_tensor, freeze};

/// CLIP text context length.
pub const CONTEXT_LENGTH: usize = 77;

/// Separate image and text embedding paths.
pub trait ImageTextEncoder {
    fn encode_image(&self, images: &Tensor) -> Result<Tensor>;
    fn encode_text(&self, tokens: &Tensor) -> Result<Tensor>;
}

/// Joint call returning `(image_logits, text_logits)`.
pub trait JointEncoder {
    fn logits(&self, images: &Tensor, tokens: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// TorchScript CLIP export exposing `encode_image`, `encode_text` and a
/// `forward(image, text)` that returns the logit pair.
pub struct ScriptedEncoder {
    module: CModule,
}

impl ScriptedEncoder {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<ScriptedEncoder> {
        let path = path.as_ref();
        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        freeze(&module)?;
        info!("Loaded encoder: {}", path.display());
        Ok(ScriptedEncoder { module })
    }
}

impl ImageTextEncoder for ScriptedEncoder {
    fn encode_image(&self, images: &Tensor) -> Result<Tensor> {
        Ok(self
            .module
            .method_ts("encode_image", &[images])?
            .to_kind(Kind::Float))
    }

    fn encode_text(&self, tokens: &Tensor) -> Result<Tensor> {
        Ok(self
            .module
            .method_ts("encode_text", &[tokens])?
            .to_kind(Kind::Float))
    }
}

impl JointEncoder for ScriptedEncoder {
    fn logits(&self, images: &Tensor, tokens: &Tensor) -> Result<(Tensor, Tensor)> {
        let out = self.module.forward_is(&[
            IValue::Tensor(images.shallow_clone()),
            IValue::Tensor(tokens.shallow_clone()),
        ])?;
        match out {
            IValue::Tuple(mut values) if values.len() == 2 => {
                let text = expect_tensor("joint encoder text logits", values.remove(1))?;
                let image = expect_tensor("joint encoder image logits", values.remove(0))?;
                Ok((image, text))
            }
            other => Err(SynthError::Model(format!(
                "joint encoder returned {other:?}, expected (image_logits, text_logits)"
            ))),
        }
    }
}

/// BPE tokenizer producing fixed-length CLIP token rows.
pub struct PromptTokenizer {
    tokenizer: Tokenizer,
    device: Device,
}

impl PromptTokenizer {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<PromptTokenizer> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            SynthError::Model(format!("cannot load tokenizer {}: {e}", path.display()))
        })?;
        Ok(PromptTokenizer { tokenizer, device })
    }

    /// `(1, 77)` int64 row, zero padded.
    pub fn encode(&self, text: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| SynthError::Model(format!("cannot tokenize `{text}`: {e}")))?;
        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        Ok(Tensor::from_slice(&pad_tokens(ids, CONTEXT_LENGTH))
            .view([1, CONTEXT_LENGTH as i64])
            .to_device(self.device))
    }
}

/// Pads with zeros or truncates to `context`, keeping the end-of-text
/// token in the last slot when truncating.
pub fn pad_tokens(mut ids: Vec<i64>, context: usize) -> Vec<i64> {
    if ids.len() > context {
        let eot = ids[ids.len() - 1];
        ids.truncate(context);
        ids[context - 1] = eot;
    }
    ids.resize(context, 0);
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_prompts_are_zero_padded() {
        let ids = pad_tokens(vec![49406, 320, 49407], 8);
        assert_eq!(ids, vec![49406, 320, 49407, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn long_prompts_keep_their_end_token() {
        let ids: Vec<i64> = (0..100).collect();
        let padded = pad_tokens(ids, CONTEXT_LENGTH);
        assert_eq!(padded.len(), CONTEXT_LENGTH);
        assert_eq!(padded[0], 0);
        assert_eq!(padded[CONTEXT_LENGTH - 1], 99);
    }
}
