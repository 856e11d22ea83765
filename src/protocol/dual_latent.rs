use tch::{nn, Tensor};

use super::{latent_at, GeneratorProtocol, StepContext};
use crate::augment::{clip_normalize, jitter_crops};
use crate::config::{DualLatentConfig, JitterConfig, RunConfig, Variant};
use crate::encoder::ImageTextEncoder;
use crate::error::{ensure_device, Result};
use crate::export::PixelRange;
use crate::generator::ClassConditionalGenerator;
use crate::latent::DualLatent;
use crate::loss::{class_regularity, latent_regularity, similarity_loss, LossComponents, Reduction};

/// BigGAN-style protocol: noise rows plus class probabilities.
pub struct DualLatentProtocol {
    vs: nn::VarStore,
    latent: DualLatent,
    generator: Box<dyn ClassConditionalGenerator>,
    encoder: Box<dyn ImageTextEncoder>,
    target: Tensor,
    dual: DualLatentConfig,
    jitter: JitterConfig,
}

impl DualLatentProtocol {
    pub fn new(
        vs: nn::VarStore,
        config: &RunConfig,
        generator: Box<dyn ClassConditionalGenerator>,
        encoder: Box<dyn ImageTextEncoder>,
        target: Tensor,
    ) -> Result<DualLatentProtocol> {
        ensure_device("dual-latent target", vs.device(), &target)?;
        let latent = DualLatent::new(&vs.root(), &config.dual);
        Ok(DualLatentProtocol {
            vs,
            latent,
            generator,
            encoder,
            target: target.detach(),
            dual: config.dual.clone(),
            jitter: config.jitter.clone(),
        })
    }

    fn generate(&self, noise: &Tensor, class_probs: &Tensor) -> Result<Tensor> {
        let image = self
            .generator
            .generate(noise, class_probs, self.dual.truncation)?;
        ensure_device("dual-latent generator", self.vs.device(), &image)?;
        Ok(image)
    }
}

impl GeneratorProtocol for DualLatentProtocol {
    fn variant(&self) -> Variant {
        Variant::DualLatent
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn pixel_range(&self) -> PixelRange {
        PixelRange::Unit
    }

    fn latent(&self) -> Vec<Tensor> {
        let (noise, class_probs) = self.latent.forward();
        vec![noise, class_probs]
    }

    /// The generator emits `[-1, 1]`; frames come back in `[0, 1]`.
    fn render(&self, latent: &[Tensor]) -> Result<Tensor> {
        let noise = latent_at(latent, 0, "dual-latent render")?;
        let class_probs = latent_at(latent, 1, "dual-latent render")?;
        tch::no_grad(|| -> Result<Tensor> {
            Ok((self.generate(noise, class_probs)? + 1.0) / 2.0)
        })
    }

    fn ascend_txt(&self, ctx: &mut StepContext<'_>) -> Result<LossComponents> {
        let (noise, class_probs) = self.latent.forward();
        let image = self.generate(&noise, &class_probs)?;

        let crops = jitter_crops(&image, self.jitter.dual_cutn, &self.jitter, &mut *ctx.rng)?;
        let crops = &crops + crops.randn_like() * self.jitter.up_noise;
        let crops = clip_normalize(&((crops + 1.0) / self.jitter.rescale_divisor));
        let encoded = self.encoder.encode_image(&crops)?;
        ensure_device("dual-latent encode_image", self.vs.device(), &encoded)?;

        let terms = vec![
            latent_regularity(&noise, self.dual.latent_threshold),
            class_regularity(&class_probs),
            similarity_loss(&self.target, &encoded, 100.0),
        ];
        Ok(LossComponents {
            terms,
            reduction: Reduction::Sum,
            latent: vec![noise, class_probs],
            image: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grad::GradTape;
    use crate::testing::{tiny_config, IdentityGenerator, MeanPoolEncoder};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::{Device, Kind};

    fn protocol() -> DualLatentProtocol {
        let config = tiny_config(Variant::DualLatent);
        let target = Tensor::from_slice(&[1.0f32]).view([1, 1]);
        DualLatentProtocol::new(
            nn::VarStore::new(Device::Cpu),
            &config,
            Box::new(IdentityGenerator),
            Box::new(MeanPoolEncoder),
            target,
        )
        .unwrap()
    }

    #[test]
    fn loss_has_three_summed_terms() {
        tch::manual_seed(0);
        let protocol = protocol();
        let mut rng = StdRng::seed_from_u64(0);
        let mut tape = GradTape::new();
        let mut ctx = StepContext {
            rng: &mut rng,
            tape: &mut tape,
        };
        let components = protocol.ascend_txt(&mut ctx).unwrap();
        assert_eq!(components.terms.len(), 3);
        assert_eq!(components.reduction, Reduction::Sum);
        assert_eq!(components.latent.len(), 2);
        let total = components.total().unwrap();
        assert!(total.double_value(&[]).is_finite());
        assert_eq!(tape.len(), 0);
    }

    #[test]
    fn render_maps_to_unit_range() {
        tch::manual_seed(1);
        let protocol = protocol();
        let frame = protocol.render(&protocol.latent()).unwrap();
        assert!(!frame.requires_grad());
        let expected = (protocol.latent.noise.detach() + 1.0) / 2.0;
        let flat = frame.reshape([frame.size()[0], -1]);
        assert!(flat.allclose(&expected.to_kind(Kind::Float), 1e-6, 1e-6, false));
    }

    #[test]
    fn target_on_another_device_is_rejected() {
        let config = tiny_config(Variant::DualLatent);
        let vs = nn::VarStore::new(Device::Cuda(0));
        let target = Tensor::from_slice(&[1.0f32]).view([1, 1]);
        let built = DualLatentProtocol::new(
            vs,
            &config,
            Box::new(IdentityGenerator),
            Box::new(MeanPoolEncoder),
            target,
        );
        assert!(built.is_err());
    }
}
