//! Synthetic collaborators for unit tests: generators that reshape their
//! latent into an image and an encoder that mean-pools pixels into a
//! one-dimensional embedding.
use tch::{Device, Kind, Tensor};

use crate::config::{RunConfig, Variant};
use crate::encoder::{ImageTextEncoder, JointEncoder};
use crate::error::{shape_mismatch, Result};
use crate::generator::{
    ClassConditionalGenerator, PixelLogitDecoder, QuantizedDecoder, StyleSynthesizer,
};

/// Small shapes that keep every protocol fast on the CPU.
pub fn tiny_config(variant: Variant) -> RunConfig {
    let mut config = RunConfig {
        variant,
        iterations: 3,
        learning_rate: 0.01,
        seed: Some(0),
        ..RunConfig::default()
    };
    config.cutouts.cut_size = 4;
    config.cutouts.cutn = 2;
    config.jitter.crop_size = 8;
    config.jitter.pad_max = 2;
    config.jitter.dual_cutn = 8;
    config.jitter.codebook_cutn = 4;
    config.dual.batch = 2;
    config.dual.latent_dim = 3 * 8 * 8;
    config.dual.classes = 10;
    config.codebook.vocab = 4;
    config.codebook.grid = 8;
    config.style.style_dim = 3 * 4 * 4;
    config.style.layers = 2;
    config.style.encoder_size = 8;
    config.quantized.grid_width = 8;
    config.quantized.grid_height = 8;
    config
}

/// Views `rows x (3 * s * s)` as `rows x 3 x s x s`.
fn as_square_image(flat: &Tensor) -> Result<Tensor> {
    let (rows, cols) = flat.size2()?;
    let side = ((cols / 3) as f64).sqrt() as i64;
    if 3 * side * side != cols {
        return Err(shape_mismatch(
            "synthetic generator",
            format!("{cols} values do not form a 3-channel square"),
        ));
    }
    Ok(flat.reshape([rows, 3, side, side]))
}

/// Every generator contract as a reshape of its input.
pub struct IdentityGenerator;

impl ClassConditionalGenerator for IdentityGenerator {
    fn generate(&self, noise: &Tensor, _class_probs: &Tensor, _truncation: f64) -> Result<Tensor> {
        as_square_image(noise)
    }
}

impl PixelLogitDecoder for IdentityGenerator {
    fn decode(&self, relaxed: &Tensor) -> Result<Tensor> {
        Ok(relaxed.shallow_clone())
    }
}

impl StyleSynthesizer for IdentityGenerator {
    fn synthesize(&self, styles: &Tensor) -> Result<Tensor> {
        as_square_image(&styles.select(1, 0))
    }
}

/// Identity decoder over a fixed four-entry RGB codebook.
pub struct IdentityDecoder {
    codebook: Tensor,
}

impl IdentityDecoder {
    pub fn new(device: Device) -> IdentityDecoder {
        let codebook = Tensor::from_slice(&[
            -1.0f32, -1.0, -1.0, //
            1.0, 1.0, 1.0, //
            0.5, -0.5, 0.0, //
            -0.5, 0.5, 0.2,
        ])
        .view([4, 3])
        .to_device(device);
        IdentityDecoder { codebook }
    }
}

impl QuantizedDecoder for IdentityDecoder {
    fn codebook(&self) -> &Tensor {
        &self.codebook
    }

    fn decode(&self, z_q: &Tensor) -> Result<Tensor> {
        Ok(z_q.shallow_clone())
    }
}

/// Embeds an image as its mean pixel value and every text as `[1.0]`.
pub struct MeanPoolEncoder;

impl MeanPoolEncoder {
    fn pool(images: &Tensor) -> Tensor {
        images
            .mean_dim(Some([1i64, 2, 3].as_slice()), false, Kind::Float)
            .unsqueeze(-1)
    }
}

impl ImageTextEncoder for MeanPoolEncoder {
    fn encode_image(&self, images: &Tensor) -> Result<Tensor> {
        Ok(MeanPoolEncoder::pool(images))
    }

    fn encode_text(&self, tokens: &Tensor) -> Result<Tensor> {
        Ok(Tensor::ones([1, 1], (Kind::Float, tokens.device())))
    }
}

impl JointEncoder for MeanPoolEncoder {
    fn logits(&self, images: &Tensor, _tokens: &Tensor) -> Result<(Tensor, Tensor)> {
        let image_logits = MeanPoolEncoder::pool(images) + 2.0;
        let text_logits = image_logits.tr();
        Ok((image_logits, text_logits))
    }
}
