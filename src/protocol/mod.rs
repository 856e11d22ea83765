//! The four generator protocols behind one interface.
//!
//! A protocol owns its latent `VarStore`, its frozen generator and encoder,
//! and the prompt targets. `Trainer` only ever talks to `GeneratorProtocol`.
use std::path::Path;

use log::{info, warn};
use rand::rngs::StdRng;
use tch::{nn, Device, Tensor};

use crate::config::{RunConfig, Variant};
use crate::encoder::{ImageTextEncoder, PromptTokenizer, ScriptedEncoder};
use crate::error::{ensure_device, shape_mismatch, Result, SynthError};
use crate::export::PixelRange;
use crate::generator::{ScriptedGenerator, ScriptedVqgan};
use crate::grad::GradTape;
use crate::loss::LossComponents;
use crate::prompt::{ParsedPrompt, PromptTarget};

mod codebook;
mod dual_latent;
mod quantized;
mod style;

pub use codebook::CodebookProtocol;
pub use dual_latent::DualLatentProtocol;
pub use quantized::QuantizedProtocol;
pub use style::StyleProtocol;

/// Per-step randomness and the clamp tape the backward pass replays.
pub struct StepContext<'a> {
    pub rng: &'a mut StdRng,
    pub tape: &'a mut GradTape,
}

pub trait GeneratorProtocol {
    fn variant(&self) -> Variant;

    /// Store holding the trainable latents; the optimizer is built on it.
    fn var_store(&self) -> &nn::VarStore;

    /// How rendered frames map to pixels.
    fn pixel_range(&self) -> PixelRange;

    /// Generator-ready latent tensors for the current parameters.
    fn latent(&self) -> Vec<Tensor>;

    /// Runs the generator on `latent` without tracking gradients.
    fn render(&self, latent: &[Tensor]) -> Result<Tensor>;

    /// Builds the loss components for one step.
    fn ascend_txt(&self, ctx: &mut StepContext<'_>) -> Result<LossComponents>;
}

/// Looks up `latent[index]`, failing when a caller hands in a short slice.
pub(crate) fn latent_at<'a>(latent: &'a [Tensor], index: usize, op: &'static str) -> Result<&'a Tensor> {
    latent
        .get(index)
        .ok_or_else(|| shape_mismatch(op, format!("expected at least {} latent tensors", index + 1)))
}

/// Encodes `prompt` into a detached text embedding on `device`.
fn embed_prompt(
    encoder: &dyn ImageTextEncoder,
    tokenizer: &PromptTokenizer,
    prompt: &ParsedPrompt,
    device: Device,
) -> Result<PromptTarget> {
    let tokens = tokenizer.encode(&prompt.text)?;
    let embed = tch::no_grad(|| encoder.encode_text(&tokens))?;
    ensure_device("encode_text", device, &embed)?;
    Ok(PromptTarget::weighted(embed, prompt.weight, prompt.stop))
}

fn first_prompt<'a>(variant: Variant, prompts: &'a [ParsedPrompt]) -> Result<&'a ParsedPrompt> {
    let Some(first) = prompts.first() else {
        return Err(SynthError::InvalidPrompt("at least one prompt is required".into()));
    };
    if prompts.len() > 1 {
        warn!(
            "{variant} uses a single prompt; ignoring {} extra",
            prompts.len() - 1
        );
    }
    Ok(first)
}

/// Loads the variant's generator and the encoder from TorchScript exports
/// and builds the protocol on `device`.
pub fn build(
    config: &RunConfig,
    device: Device,
    generator_path: &Path,
    encoder_path: &Path,
    tokenizer: &PromptTokenizer,
    prompts: &[ParsedPrompt],
) -> Result<Box<dyn GeneratorProtocol>> {
    let vs = nn::VarStore::new(device);
    let encoder = ScriptedEncoder::load(encoder_path, device)?;
    info!("Building {} protocol on {device:?}", config.variant);

    let protocol: Box<dyn GeneratorProtocol> = match config.variant {
        Variant::DualLatent => {
            let prompt = first_prompt(config.variant, prompts)?;
            let target = embed_prompt(&encoder, tokenizer, prompt, device)?;
            let generator = ScriptedGenerator::load(generator_path, device)?;
            Box::new(DualLatentProtocol::new(
                vs,
                config,
                Box::new(generator),
                Box::new(encoder),
                target.embed,
            )?)
        }
        Variant::Codebook => {
            let prompt = first_prompt(config.variant, prompts)?;
            let target = embed_prompt(&encoder, tokenizer, prompt, device)?;
            let generator = ScriptedGenerator::load(generator_path, device)?;
            Box::new(CodebookProtocol::new(
                vs,
                config,
                Box::new(generator),
                Box::new(encoder),
                target.embed,
            )?)
        }
        Variant::Style => {
            let prompt = first_prompt(config.variant, prompts)?;
            let tokens = tokenizer.encode(&prompt.text)?;
            let generator = ScriptedGenerator::load(generator_path, device)?;
            Box::new(StyleProtocol::new(
                vs,
                config,
                Box::new(generator),
                Box::new(encoder),
                tokens,
            )?)
        }
        Variant::Quantized => {
            if prompts.is_empty() {
                return Err(SynthError::InvalidPrompt("at least one prompt is required".into()));
            }
            let targets = prompts
                .iter()
                .map(|prompt| embed_prompt(&encoder, tokenizer, prompt, device))
                .collect::<Result<Vec<_>>>()?;
            let generator = ScriptedVqgan::load(generator_path, device)?;
            Box::new(QuantizedProtocol::new(
                vs,
                config,
                Box::new(generator),
                Box::new(encoder),
                targets,
            )?)
        }
    };
    Ok(protocol)
}
