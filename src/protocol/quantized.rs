use tch::{nn, Tensor};

use super::{latent_at, GeneratorProtocol, StepContext};
use crate::augment::clip_normalize;
use crate::config::{RunConfig, Variant};
use crate::cutouts::MakeCutouts;
use crate::encoder::ImageTextEncoder;
use crate::error::{ensure_device, Result};
use crate::export::PixelRange;
use crate::generator::QuantizedDecoder;
use crate::grad::GradTape;
use crate::latent::{vector_quantize, GridLatent};
use crate::loss::{LossComponents, Reduction};
use crate::prompt::PromptTarget;

/// VQGAN-style protocol: a continuous grid snapped to the codebook on
/// every step, scored by one spherical-distance loss per prompt.
pub struct QuantizedProtocol {
    vs: nn::VarStore,
    latent: GridLatent,
    decoder: Box<dyn QuantizedDecoder>,
    encoder: Box<dyn ImageTextEncoder>,
    prompts: Vec<PromptTarget>,
    cutouts: MakeCutouts,
}

impl QuantizedProtocol {
    pub fn new(
        vs: nn::VarStore,
        config: &RunConfig,
        decoder: Box<dyn QuantizedDecoder>,
        encoder: Box<dyn ImageTextEncoder>,
        prompts: Vec<PromptTarget>,
    ) -> Result<QuantizedProtocol> {
        for prompt in &prompts {
            ensure_device("quantized prompt", vs.device(), &prompt.embed)?;
        }
        let cutouts = MakeCutouts::new(&config.cutouts)?;
        let latent = GridLatent::new(&vs.root(), decoder.codebook(), &config.quantized)?;
        Ok(QuantizedProtocol {
            vs,
            latent,
            decoder,
            encoder,
            prompts,
            cutouts,
        })
    }

    /// Snaps `z` to the codebook, decodes, and maps to `[0, 1]`.
    fn decode(&self, z: &Tensor, tape: &mut GradTape) -> Result<Tensor> {
        let z_q = vector_quantize(&z.permute([0, 2, 3, 1]), self.decoder.codebook())
            .permute([0, 3, 1, 2]);
        let image = self.decoder.decode(&z_q)?;
        ensure_device("quantized decoder", self.vs.device(), &image)?;
        Ok(tape.clamp_with_grad(&((image + 1.0) / 2.0), 0.0, 1.0))
    }
}

impl GeneratorProtocol for QuantizedProtocol {
    fn variant(&self) -> Variant {
        Variant::Quantized
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn pixel_range(&self) -> PixelRange {
        PixelRange::Unit
    }

    /// The pre-snap grid; snapping happens on decode.
    fn latent(&self) -> Vec<Tensor> {
        vec![self.latent.forward()]
    }

    fn render(&self, latent: &[Tensor]) -> Result<Tensor> {
        let z = latent_at(latent, 0, "quantized render")?;
        tch::no_grad(|| self.decode(z, &mut GradTape::new()))
    }

    fn ascend_txt(&self, ctx: &mut StepContext<'_>) -> Result<LossComponents> {
        let z = self.latent.forward();
        let image = self.decode(&z, ctx.tape)?;

        let crops = self.cutouts.forward(&image, &mut *ctx.rng, ctx.tape)?;
        let encoded = self.encoder.encode_image(&clip_normalize(&crops))?;
        ensure_device("quantized encode_image", self.vs.device(), &encoded)?;

        let terms = self
            .prompts
            .iter()
            .map(|prompt| prompt.loss(&encoded))
            .collect();
        Ok(LossComponents {
            terms,
            reduction: Reduction::Sum,
            latent: vec![z],
            image: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_config, IdentityDecoder, MeanPoolEncoder};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::{Device, Kind};

    fn protocol(prompts: usize) -> QuantizedProtocol {
        let config = tiny_config(Variant::Quantized);
        let targets = (0..prompts)
            .map(|_| PromptTarget::new(Tensor::from_slice(&[1.0f32]).view([1, 1])))
            .collect();
        QuantizedProtocol::new(
            nn::VarStore::new(Device::Cpu),
            &config,
            Box::new(IdentityDecoder::new(Device::Cpu)),
            Box::new(MeanPoolEncoder),
            targets,
        )
        .unwrap()
    }

    #[test]
    fn one_term_per_prompt_and_clamps_recorded() {
        tch::manual_seed(2);
        let protocol = protocol(2);
        let mut rng = StdRng::seed_from_u64(2);
        let mut tape = GradTape::new();
        let mut ctx = StepContext {
            rng: &mut rng,
            tape: &mut tape,
        };
        let components = protocol.ascend_txt(&mut ctx).unwrap();
        assert_eq!(components.terms.len(), 2);
        assert_eq!(components.reduction, Reduction::Sum);
        // Decode clamp and cutout clamp.
        assert_eq!(tape.len(), 2);
        let total = components.total().unwrap();
        tape.backward(&total).unwrap();
        let grad = protocol.latent.z.grad();
        assert!(grad.defined());
        assert_eq!(grad.size(), protocol.latent.z.size());
    }

    #[test]
    fn render_stays_in_unit_range() {
        tch::manual_seed(3);
        let protocol = protocol(1);
        let frame = protocol.render(&protocol.latent()).unwrap();
        assert!(!frame.requires_grad());
        assert!(frame.min().double_value(&[]) >= 0.0);
        assert!(frame.max().double_value(&[]) <= 1.0);
        assert_eq!(frame.kind(), Kind::Float);
    }
}
