//! Run configuration. Every field has a default; a YAML file may override
//! any subset of them and the command line overrides the common ones.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Result, SynthError};

/// Which generator protocol drives the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// BigGAN-style noise + class latents.
    #[serde(alias = "biggan")]
    DualLatent,
    /// DALL-E discrete VAE decoder over relaxed token grids.
    #[serde(alias = "dall-e")]
    Codebook,
    /// StyleGAN style vector repeated across synthesis layers.
    #[serde(alias = "stylegan")]
    Style,
    /// VQGAN grid snapped to its codebook.
    #[serde(alias = "vqgan")]
    Quantized,
}

impl FromStr for Variant {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dual-latent" | "biggan" => Ok(Variant::DualLatent),
            "codebook" | "dall-e" => Ok(Variant::Codebook),
            "style" | "stylegan" | "stylegan_1024" => Ok(Variant::Style),
            "quantized" | "vqgan" => Ok(Variant::Quantized),
            other => Err(SynthError::InvalidConfig(format!("unknown generator `{other}`"))),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::DualLatent => "dual-latent",
            Variant::Codebook => "codebook",
            Variant::Style => "style",
            Variant::Quantized => "quantized",
        };
        f.write_str(name)
    }
}

/// Cutout sampler used by the quantized-grid protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CutoutConfig {
    pub cut_size: i64,
    pub cutn: usize,
    pub cut_pow: f64,
}

impl Default for CutoutConfig {
    fn default() -> Self {
        Self {
            cut_size: 224,
            cutn: 64,
            cut_pow: 1.0,
        }
    }
}

/// Crop sampler and input noise for the dual-latent and codebook
/// protocols. These constants were tuned empirically; moving them changes
/// convergence noticeably.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub size_mean: f64,
    pub size_std: f64,
    pub size_min: f64,
    pub size_max: f64,
    pub up_noise: f64,
    pub rescale_divisor: f64,
    pub pad_max: i64,
    pub crop_size: i64,
    pub dual_cutn: usize,
    pub codebook_cutn: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            size_mean: 0.39,
            size_std: 0.865,
            size_min: 0.362,
            size_max: 0.7099,
            up_noise: 0.01649,
            rescale_divisor: 1.8,
            pad_max: 50,
            crop_size: 224,
            dual_cutn: 128,
            codebook_cutn: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DualLatentConfig {
    pub batch: i64,
    pub latent_dim: i64,
    pub classes: i64,
    pub noise_std: f64,
    pub class_mean: f64,
    pub class_std: f64,
    pub latent_threshold: f64,
    pub truncation: f64,
}

impl Default for DualLatentConfig {
    fn default() -> Self {
        Self {
            batch: 32,
            latent_dim: 128,
            classes: 1000,
            noise_std: 1.0,
            class_mean: -3.9,
            class_std: 0.3,
            latent_threshold: 1.0,
            truncation: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodebookConfig {
    pub vocab: i64,
    pub grid: i64,
    pub temperature: f64,
}

impl Default for CodebookConfig {
    fn default() -> Self {
        Self {
            vocab: 8192,
            grid: 64,
            temperature: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    pub style_dim: i64,
    pub layers: i64,
    pub encoder_size: i64,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            style_dim: 512,
            layers: 18,
            encoder_size: 224,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuantizedConfig {
    pub grid_width: i64,
    pub grid_height: i64,
}

impl Default for QuantizedConfig {
    fn default() -> Self {
        Self {
            grid_width: 48,
            grid_height: 48,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub variant: Variant,
    pub iterations: usize,
    pub learning_rate: f64,
    pub seed: Option<u64>,
    pub save_every: usize,
    pub output_dir: PathBuf,
    pub cutouts: CutoutConfig,
    pub jitter: JitterConfig,
    pub dual: DualLatentConfig,
    pub codebook: CodebookConfig,
    pub style: StyleConfig,
    pub quantized: QuantizedConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            variant: Variant::DualLatent,
            iterations: 200,
            learning_rate: 0.07,
            seed: None,
            save_every: 0,
            output_dir: PathBuf::from("results"),
            cutouts: CutoutConfig::default(),
            jitter: JitterConfig::default(),
            dual: DualLatentConfig::default(),
            codebook: CodebookConfig::default(),
            style: StyleConfig::default(),
            quantized: QuantizedConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<RunConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SynthError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        RunConfig::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<RunConfig> {
        serde_yaml::from_str(text).map_err(|e| SynthError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SynthError::InvalidConfig(msg.to_string()));
        if self.iterations == 0 {
            return invalid("iterations must be at least 1");
        }
        if !(self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive");
        }
        if self.cutouts.cutn == 0 || self.jitter.dual_cutn == 0 || self.jitter.codebook_cutn == 0 {
            return invalid("cut counts must be at least 1");
        }
        if self.cutouts.cut_size < 1 || self.jitter.crop_size < 1 {
            return invalid("crop sizes must be positive");
        }
        if !(self.jitter.size_min <= self.jitter.size_max) || self.jitter.size_min <= 0.0 {
            return invalid("jitter size bounds must satisfy 0 < size_min <= size_max");
        }
        if !self.cutouts.cut_pow.is_finite() || self.cutouts.cut_pow <= 0.0 {
            return invalid("cut_pow must be finite and positive");
        }
        if !self.jitter.size_std.is_finite() || self.jitter.size_std <= 0.0 {
            return invalid("jitter size_std must be finite and positive");
        }
        if self.jitter.size_max >= 1.0 {
            return invalid("jitter size_max must stay below 1 so crops fit the image");
        }
        if !(self.codebook.temperature > 0.0) {
            return invalid("codebook temperature must be positive");
        }
        if self.dual.classes < 2 {
            return invalid("dual-latent needs at least two classes");
        }
        Ok(())
    }
}
