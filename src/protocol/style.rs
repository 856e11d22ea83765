use tch::{nn, Tensor};

use super::{latent_at, GeneratorProtocol, StepContext};
use crate::config::{RunConfig, StyleConfig, Variant};
use crate::encoder::JointEncoder;
use crate::error::{ensure_device, Result};
use crate::export::PixelRange;
use crate::generator::StyleSynthesizer;
use crate::latent::StyleLatent;
use crate::loss::{LossComponents, Reduction};

/// StyleGAN-style protocol scored by the encoder's joint logits.
pub struct StyleProtocol {
    vs: nn::VarStore,
    latent: StyleLatent,
    synthesizer: Box<dyn StyleSynthesizer>,
    encoder: Box<dyn JointEncoder>,
    tokens: Tensor,
    style: StyleConfig,
}

impl StyleProtocol {
    pub fn new(
        vs: nn::VarStore,
        config: &RunConfig,
        synthesizer: Box<dyn StyleSynthesizer>,
        encoder: Box<dyn JointEncoder>,
        tokens: Tensor,
    ) -> Result<StyleProtocol> {
        ensure_device("style tokens", vs.device(), &tokens)?;
        let latent = StyleLatent::new(&vs.root(), &config.style);
        Ok(StyleProtocol {
            vs,
            latent,
            synthesizer,
            encoder,
            tokens,
            style: config.style.clone(),
        })
    }

    /// `(1, 1, dim)` -> `(1, layers, dim)`.
    fn styles(&self) -> Tensor {
        self.latent.forward().repeat([1, self.style.layers, 1])
    }

    fn synthesize(&self, styles: &Tensor) -> Result<Tensor> {
        let image = self.synthesizer.synthesize(styles)?;
        ensure_device("style synthesizer", self.vs.device(), &image)?;
        Ok(image)
    }
}

impl GeneratorProtocol for StyleProtocol {
    fn variant(&self) -> Variant {
        Variant::Style
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn pixel_range(&self) -> PixelRange {
        PixelRange::Symmetric
    }

    fn latent(&self) -> Vec<Tensor> {
        vec![self.styles()]
    }

    fn render(&self, latent: &[Tensor]) -> Result<Tensor> {
        let styles = latent_at(latent, 0, "style render")?;
        tch::no_grad(|| self.synthesize(styles))
    }

    fn ascend_txt(&self, _ctx: &mut StepContext<'_>) -> Result<LossComponents> {
        let styles = self.styles();
        let image = self.synthesize(&styles)?;
        let size = self.style.encoder_size;
        let image = image.upsample_bilinear2d([size, size], true, None::<f64>, None::<f64>);

        let (image_logits, _) = self.encoder.logits(&image, &self.tokens)?;
        ensure_device("style joint encoder", self.vs.device(), &image_logits)?;

        Ok(LossComponents {
            terms: vec![image_logits.reciprocal() * 100.0],
            reduction: Reduction::Direct,
            latent: vec![styles],
            image: Some(image),
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

    fn protocol() -> StyleProtocol {
        let config = tiny_config(Variant::Style);
        let tokens = Tensor::zeros([1, 77], (Kind::Int64, Device::Cpu));
        StyleProtocol::new(
            nn::VarStore::new(Device::Cpu),
            &config,
            Box::new(IdentityGenerator),
            Box::new(MeanPoolEncoder),
            tokens,
        )
        .unwrap()
    }

    #[test]
    fn latent_repeats_across_layers() {
        let protocol = protocol();
        let styles = &protocol.latent()[0];
        assert_eq!(styles.size(), vec![1, protocol.style.layers, protocol.style.style_dim]);
    }

    #[test]
    fn loss_is_inverse_image_logits() {
        let protocol = protocol();
        let mut rng = StdRng::seed_from_u64(0);
        let mut tape = GradTape::new();
        let mut ctx = StepContext {
            rng: &mut rng,
            tape: &mut tape,
        };
        let components = protocol.ascend_txt(&mut ctx).unwrap();
        assert_eq!(components.reduction, Reduction::Direct);
        let image = components.image.as_ref().unwrap();
        let size = protocol.style.encoder_size;
        assert_eq!(image.size()[2..], [size, size]);
        // Zero styles give a zero image; the synthetic logits are mean + 2.
        let total = components.total().unwrap().double_value(&[]);
        assert!((total - 50.0).abs() < 1e-4, "total={total}");
    }
}
