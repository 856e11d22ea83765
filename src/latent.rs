//! Trainable latents, one container per generator protocol. Each one
//! registers its tensors on the run's `VarStore`, which is the only state
//! the optimizer updates.
use tch::{nn, Kind, Tensor};

use crate::config::{CodebookConfig, DualLatentConfig, QuantizedConfig, StyleConfig};
use crate::error::{ensure_device, shape_mismatch, Result};
use crate::grad::replace_grad;

/// Relaxed categorical sample along `dim` at temperature `tau`.
pub fn gumbel_softmax(logits: &Tensor, tau: f64, dim: i64) -> Tensor {
    let uniform = logits.rand_like().clamp(1e-10, 1.0 - 1e-7);
    let gumbels = -(-uniform.log()).log();
    ((logits + gumbels) / tau).softmax(dim, logits.kind())
}

/// Snaps each row of `x` (`..., e_dim`) to its nearest codebook row by
/// squared euclidean distance, ties going to the lowest index. The
/// gradient passes straight through to `x`.
pub fn vector_quantize(x: &Tensor, codebook: &Tensor) -> Tensor {
    let kind = x.kind();
    let distances = x.square().sum_dim_intlist(Some([-1i64].as_slice()), true, kind)
        + codebook.square().sum_dim_intlist(Some([1i64].as_slice()), false, kind)
        - 2.0f64 * x.matmul(&codebook.tr());
    let indices = distances.argmin(-1, false);
    let snapped = indices
        .one_hot(codebook.size()[0])
        .to_kind(kind)
        .matmul(codebook);
    replace_grad(&snapped, x)
}

/// BigGAN-style noise rows plus class logits.
pub struct DualLatent {
    pub noise: Tensor,
    pub class_logits: Tensor,
}

impl DualLatent {
    pub fn new(path: &nn::Path, config: &DualLatentConfig) -> DualLatent {
        let noise = path.var(
            "noise",
            &[config.batch, config.latent_dim],
            nn::Init::Randn {
                mean: 0.0,
                stdev: config.noise_std,
            },
        );
        let class_logits = path.var(
            "class_logits",
            &[config.batch, config.classes],
            nn::Init::Randn {
                mean: config.class_mean,
                stdev: config.class_std,
            },
        );
        DualLatent {
            noise,
            class_logits,
        }
    }

    /// `(noise, sigmoid(class_logits))`.
    pub fn forward(&self) -> (Tensor, Tensor) {
        (self.noise.shallow_clone(), self.class_logits.sigmoid())
    }
}

/// Token logits over a `vocab x grid x grid` lattice for the discrete VAE.
pub struct CodebookLatent {
    pub logits: Tensor,
    pub temperature: f64,
}

impl CodebookLatent {
    pub fn new(path: &nn::Path, config: &CodebookConfig) -> CodebookLatent {
        let logits = path.var(
            "logits",
            &[1, config.vocab, config.grid, config.grid],
            nn::Init::Const(0.),
        );
        CodebookLatent {
            logits,
            temperature: config.temperature,
        }
    }

    /// Soft one-hot per grid cell: sums to one along the vocabulary axis.
    pub fn forward(&self) -> Tensor {
        gumbel_softmax(&self.logits, self.temperature, 1)
    }
}

pub struct StyleLatent {
    pub style: Tensor,
}

impl StyleLatent {
    pub fn new(path: &nn::Path, config: &StyleConfig) -> StyleLatent {
        let style = path.var("style", &[1, 1, config.style_dim], nn::Init::Const(0.));
        StyleLatent { style }
    }

    pub fn forward(&self) -> Tensor {
        self.style.shallow_clone()
    }
}

/// Continuous `(1, e_dim, h, w)` grid, seeded from random codebook rows.
pub struct GridLatent {
    pub z: Tensor,
}

impl GridLatent {
    pub fn new(path: &nn::Path, codebook: &Tensor, config: &QuantizedConfig) -> Result<GridLatent> {
        ensure_device("grid latent init", path.device(), codebook)?;
        let dims = codebook.size();
        if dims.len() != 2 {
            return Err(shape_mismatch(
                "grid latent init",
                format!("codebook must be (entries, e_dim), got {dims:?}"),
            ));
        }
        let (n_toks, e_dim) = (dims[0], dims[1]);
        let (toks_y, toks_x) = (config.grid_height, config.grid_width);

        let indices = Tensor::randint(n_toks, [toks_y * toks_x], (Kind::Int64, path.device()));
        let z = indices
            .one_hot(n_toks)
            .to_kind(codebook.kind())
            .matmul(codebook)
            .view([1, toks_y, toks_x, e_dim])
            .permute([0, 3, 1, 2]);
        let z = path.var_copy("z", &z);
        Ok(GridLatent { z })
    }

    pub fn forward(&self) -> Tensor {
        self.z.shallow_clone()
    }
}
