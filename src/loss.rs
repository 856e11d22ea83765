//! Loss terms shared by the protocols and the container the optimization
//! step reduces to a scalar.
use tch::{Kind, Tensor};

use crate::error::{shape_mismatch, Result};

/// Floor on per-row variance in the moment penalties. Constant rows would
/// otherwise divide by zero and poison the step with NaNs.
pub const VARIANCE_FLOOR: f64 = 1e-12;

/// How a protocol's terms combine into the scalar that is backpropagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    /// Sum of the terms, then mean over its elements.
    Mean,
    /// A single one-element term used as is.
    Direct,
}

/// Output of one loss evaluation.
pub struct LossComponents {
    pub terms: Vec<Tensor>,
    pub reduction: Reduction,
    /// Generator-ready latent tensors at the time of evaluation.
    pub latent: Vec<Tensor>,
    /// Image fed to the encoder, when the protocol exposes it.
    pub image: Option<Tensor>,
}

impl LossComponents {
    pub fn total(&self) -> Result<Tensor> {
        let Some((first, rest)) = self.terms.split_first() else {
            return Err(shape_mismatch("loss total", "no loss terms"));
        };
        let summed = rest.iter().fold(first.shallow_clone(), |acc, t| acc + t);
        match self.reduction {
            Reduction::Sum => Ok(summed.sum(Kind::Float)),
            Reduction::Mean => Ok(summed.mean(Kind::Float)),
            Reduction::Direct => {
                if self.terms.len() != 1 || first.numel() != 1 {
                    return Err(shape_mismatch(
                        "loss total",
                        format!(
                            "direct reduction needs one single-element term, got {} of {:?}",
                            self.terms.len(),
                            first.size()
                        ),
                    ));
                }
                Ok(first.squeeze())
            }
        }
    }
}

/// Keeps BigGAN noise rows close to a standard normal: unit std, zero
/// mean, bounded energy, and no skew or excess kurtosis.
pub fn latent_regularity(noise: &Tensor, threshold: f64) -> Tensor {
    let rows = noise.size()[0] as f64;
    let cols = noise.size()[1] as f64;
    let dim = Some([1i64].as_slice());

    let centred = noise - noise.mean_dim(dim, true, Kind::Float);
    let squares = centred.square();

    let unbiased_std = (squares.sum_dim_intlist(dim, false, Kind::Float) / (cols - 1.0).max(1.0))
        .clamp_min(VARIANCE_FLOOR)
        .sqrt();
    let spread = (1.0f64 - unbiased_std).abs().mean(Kind::Float);
    let offset = noise.mean(Kind::Float).abs();
    let energy = noise.square().mean(Kind::Float).clamp_min(threshold) * 4.0;

    let std = squares
        .mean_dim(dim, true, Kind::Float)
        .clamp_min(VARIANCE_FLOOR)
        .sqrt();
    let zscores = centred / std;
    let skews = zscores.pow_tensor_scalar(3).mean_dim(dim, false, Kind::Float);
    let kurtoses = zscores.pow_tensor_scalar(4).mean_dim(dim, false, Kind::Float) - 3.0;
    let moments = (kurtoses.abs() + skews.abs()).sum(Kind::Float) / rows;

    spread + offset + energy + moments
}

/// Penalises probability mass on every class but the most likely one.
pub fn class_regularity(class_probs: &Tensor) -> Tensor {
    let k = class_probs.size()[1] - 1;
    let (smallest, _) = class_probs.topk(k, 1, false, true);
    (smallest * 50.0).square().mean(Kind::Float)
}

/// Cosine similarity of each encoded crop against the target embedding.
pub fn cosine_to_target(target: &Tensor, encoded: &Tensor) -> Tensor {
    Tensor::cosine_similarity(target, encoded, -1, 1e-8)
}

/// `-scale * mean(cos(target, encoded))`.
pub fn similarity_loss(target: &Tensor, encoded: &Tensor, scale: f64) -> Tensor {
    cosine_to_target(target, encoded).mean(Kind::Float) * -scale
}
