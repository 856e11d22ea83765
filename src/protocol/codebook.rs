use tch::{nn, Kind, Tensor};

use super::{latent_at, GeneratorProtocol, StepContext};
use crate::augment::{clip_normalize, jitter_crops};
use crate::config::{JitterConfig, RunConfig, Variant};
use crate::encoder::ImageTextEncoder;
use crate::error::{ensure_device, shape_mismatch, Result};
use crate::export::PixelRange;
use crate::generator::PixelLogitDecoder;
use crate::latent::CodebookLatent;
use crate::loss::{cosine_to_target, LossComponents, Reduction};

/// Margin the DALL-E decoder keeps away from 0 and 1 in logit-Laplace space.
pub const LOGIT_LAPLACE_EPS: f64 = 0.1;

/// Inverse of the decoder's pixel mapping, clamped to `[0, 1]`.
pub fn unmap_pixels(x: &Tensor) -> Tensor {
    ((x - LOGIT_LAPLACE_EPS) / (1.0 - 2.0 * LOGIT_LAPLACE_EPS)).clamp(0.0, 1.0)
}

/// DALL-E style protocol: relaxed token grid through the discrete VAE decoder.
pub struct CodebookProtocol {
    vs: nn::VarStore,
    latent: CodebookLatent,
    decoder: Box<dyn PixelLogitDecoder>,
    encoder: Box<dyn ImageTextEncoder>,
    target: Tensor,
    jitter: JitterConfig,
}

impl CodebookProtocol {
    pub fn new(
        vs: nn::VarStore,
        config: &RunConfig,
        decoder: Box<dyn PixelLogitDecoder>,
        encoder: Box<dyn ImageTextEncoder>,
        target: Tensor,
    ) -> Result<CodebookProtocol> {
        ensure_device("codebook target", vs.device(), &target)?;
        let latent = CodebookLatent::new(&vs.root(), &config.codebook);
        Ok(CodebookProtocol {
            vs,
            latent,
            decoder,
            encoder,
            target: target.detach(),
            jitter: config.jitter.clone(),
        })
    }

    /// Decoder logits to pixels in `[0, 1]`.
    fn pixels(&self, relaxed: &Tensor) -> Result<Tensor> {
        let logits = self.decoder.decode(relaxed)?;
        ensure_device("codebook decoder", self.vs.device(), &logits)?;
        let (_, channels, _, _) = logits.size4()?;
        if channels < 3 {
            return Err(shape_mismatch(
                "codebook decoder",
                format!("expected at least 3 output channels, got {channels}"),
            ));
        }
        Ok(unmap_pixels(&logits.narrow(1, 0, 3).to_kind(Kind::Float).sigmoid()))
    }
}

impl GeneratorProtocol for CodebookProtocol {
    fn variant(&self) -> Variant {
        Variant::Codebook
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn pixel_range(&self) -> PixelRange {
        PixelRange::Unit
    }

    fn latent(&self) -> Vec<Tensor> {
        vec![self.latent.forward()]
    }

    fn render(&self, latent: &[Tensor]) -> Result<Tensor> {
        let relaxed = latent_at(latent, 0, "codebook render")?;
        tch::no_grad(|| self.pixels(relaxed))
    }

    fn ascend_txt(&self, ctx: &mut StepContext<'_>) -> Result<LossComponents> {
        let relaxed = self.latent.forward();
        let image = self.pixels(&relaxed)?;

        let crops = jitter_crops(&image, self.jitter.codebook_cutn, &self.jitter, &mut *ctx.rng)?;
        let crops = clip_normalize(&((crops + 1.0) / 2.0));
        let encoded = self.encoder.encode_image(&crops)?;
        ensure_device("codebook encode_image", self.vs.device(), &encoded)?;

        let similarity = cosine_to_target(&self.target, &encoded)
            .view([1, -1])
            .mean_dim(Some([1i64].as_slice()), false, Kind::Float)
            * -10.0;
        let zero = Tensor::zeros(&[] as &[i64], (Kind::Float, self.vs.device()));
        Ok(LossComponents {
            terms: vec![zero, similarity],
            reduction: Reduction::Mean,
            latent: vec![relaxed],
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
    use tch::Device;

    fn protocol() -> CodebookProtocol {
        let config = tiny_config(Variant::Codebook);
        CodebookProtocol::new(
            nn::VarStore::new(Device::Cpu),
            &config,
            Box::new(IdentityGenerator),
            Box::new(MeanPoolEncoder),
            Tensor::from_slice(&[1.0f32]).view([1, 1]),
        )
        .unwrap()
    }

    #[test]
    fn unmap_stretches_and_clamps() {
        let x = Tensor::from_slice(&[0.0f32, 0.1, 0.5, 0.9, 1.0]);
        let y = unmap_pixels(&x);
        let expected = Tensor::from_slice(&[0.0f32, 0.0, 0.5, 1.0, 1.0]);
        assert!(y.allclose(&expected, 1e-5, 1e-6, false));
    }

    #[test]
    fn loss_is_a_scaled_mean_similarity() {
        tch::manual_seed(4);
        let protocol = protocol();
        let mut rng = StdRng::seed_from_u64(4);
        let mut tape = GradTape::new();
        let mut ctx = StepContext {
            rng: &mut rng,
            tape: &mut tape,
        };
        let components = protocol.ascend_txt(&mut ctx).unwrap();
        assert_eq!(components.reduction, Reduction::Mean);
        assert_eq!(components.terms[1].size(), vec![1]);
        let total = components.total().unwrap().double_value(&[]);
        // One-dimensional embeddings have cosine +-1 with the target.
        assert!((-10.0..=10.0).contains(&total), "total={total}");
    }

    #[test]
    fn relaxed_latent_sums_to_one_per_cell() {
        tch::manual_seed(5);
        let protocol = protocol();
        let relaxed = &protocol.latent()[0];
        let sums = relaxed.sum_dim_intlist(Some([1i64].as_slice()), false, Kind::Float);
        assert!(sums.allclose(&sums.ones_like(), 1e-5, 1e-5, false));
    }

    #[test]
    fn too_few_channels_fail() {
        let mut config = tiny_config(Variant::Codebook);
        config.codebook.vocab = 2;
        let protocol = CodebookProtocol::new(
            nn::VarStore::new(Device::Cpu),
            &config,
            Box::new(IdentityGenerator),
            Box::new(MeanPoolEncoder),
            Tensor::from_slice(&[1.0f32]).view([1, 1]),
        )
        .unwrap();
        assert!(protocol.render(&protocol.latent()).is_err());
    }
}
