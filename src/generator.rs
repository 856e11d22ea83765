//! Pretrained generators, consumed as frozen differentiable black boxes.
//!
//! Each protocol talks to its generator through one of the traits below.
//! `ScriptedGenerator` backs the first three with a TorchScript export
//! loaded through `tch::CModule`; `ScriptedVqgan` adds the codebook.
use std::path::Path;

use log::info;
use tch::{CModule, Device, IValue, Tensor};

use crate::error::{Result, SynthError};

/// BigGAN-style: `(noise, class_probs, truncation) -> image in [-1, 1]`.
pub trait ClassConditionalGenerator {
    fn generate(&self, noise: &Tensor, class_probs: &Tensor, truncation: f64) -> Result<Tensor>;
}

/// DALL-E style decoder: relaxed token grid -> pixel logits.
pub trait PixelLogitDecoder {
    fn decode(&self, relaxed: &Tensor) -> Result<Tensor>;
}

/// StyleGAN-style synthesis from per-layer styles `(1, layers, dim)`.
pub trait StyleSynthesizer {
    fn synthesize(&self, styles: &Tensor) -> Result<Tensor>;
}

/// VQGAN-style decoder with its fixed codebook `(entries, e_dim)`.
pub trait QuantizedDecoder {
    fn codebook(&self) -> &Tensor;
    fn decode(&self, z_q: &Tensor) -> Result<Tensor>;
}

/// Stops gradients from accumulating on a loaded module's weights.
pub fn freeze(module: &CModule) -> Result<()> {
    for (_, parameter) in module.named_parameters()? {
        let _ = parameter.set_requires_grad(false);
    }
    Ok(())
}

pub fn expect_tensor(op: &str, value: IValue) -> Result<Tensor> {
    match value {
        IValue::Tensor(t) => Ok(t),
        other => Err(SynthError::Model(format!(
            "{op} returned {other:?}, expected a tensor"
        ))),
    }
}

pub struct ScriptedGenerator {
    module: CModule,
}

impl ScriptedGenerator {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<ScriptedGenerator> {
        let path = path.as_ref();
        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        freeze(&module)?;
        info!("Loaded generator: {}", path.display());
        Ok(ScriptedGenerator { module })
    }
}

/// VQGAN export with a `decode(z_q)` method and a `codebook()` method
/// returning the embedding matrix.
pub struct ScriptedVqgan {
    module: CModule,
    codebook: Tensor,
}

impl ScriptedVqgan {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<ScriptedVqgan> {
        let ScriptedGenerator { module } = ScriptedGenerator::load(path, device)?;
        let codebook = module.method_ts::<Tensor>("codebook", &[])?.detach();
        info!("Codebook: {:?}", codebook.size());
        Ok(ScriptedVqgan { module, codebook })
    }
}

impl ClassConditionalGenerator for ScriptedGenerator {
    fn generate(&self, noise: &Tensor, class_probs: &Tensor, truncation: f64) -> Result<Tensor> {
        let out = self.module.forward_is(&[
            IValue::Tensor(noise.shallow_clone()),
            IValue::Tensor(class_probs.shallow_clone()),
            IValue::Double(truncation),
        ])?;
        expect_tensor("generator forward", out)
    }
}

impl PixelLogitDecoder for ScriptedGenerator {
    fn decode(&self, relaxed: &Tensor) -> Result<Tensor> {
        Ok(self.module.forward_ts(&[relaxed])?)
    }
}

impl StyleSynthesizer for ScriptedGenerator {
    fn synthesize(&self, styles: &Tensor) -> Result<Tensor> {
        Ok(self.module.forward_ts(&[styles])?)
    }
}

impl QuantizedDecoder for ScriptedVqgan {
    fn codebook(&self) -> &Tensor {
        &self.codebook
    }

    fn decode(&self, z_q: &Tensor) -> Result<Tensor> {
        Ok(self.module.method_ts("decode", &[z_q])?)
    }
}
