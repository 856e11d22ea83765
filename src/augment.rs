//! Encoder-side augmentation for the dual-latent and codebook protocols:
//! normally distributed crop sizes, random edge padding, nearest resize.
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tch::Tensor;

use crate::config::JitterConfig;
use crate::error::{shape_mismatch, Result, SynthError};

// CLIP preprocessing statistics.
pub const CLIP_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Per-channel CLIP normalisation of a `(n, 3, h, w)` batch.
pub fn clip_normalize(x: &Tensor) -> Tensor {
    let stat = |values: &[f64; 3]| {
        Tensor::from_slice(values)
            .to_kind(x.kind())
            .to_device(x.device())
            .view([1, 3, 1, 1])
    };
    (x - stat(&CLIP_MEAN)) / stat(&CLIP_STD)
}

/// Pads between 1 and `pad_max` pixels with the value 1, split randomly
/// between the two edges of each axis.
pub fn pad_augs<R: Rng + ?Sized>(image: &Tensor, pad_max: i64, rng: &mut R) -> Tensor {
    let pad = rng.gen_range(1..=pad_max.max(1));
    let split_x = rng.gen_range(10..=90) as f64 / 100.0;
    let split_y = rng.gen_range(10..=90) as f64 / 100.0;
    let left = (pad as f64 * split_x) as i64;
    let top = (pad as f64 * split_y) as i64;
    (image - 1.0).constant_pad_nd([left, pad - left, top, pad - top]) + 1.0
}

/// Takes `cutn` crops whose side is `width * clip(N(mean, std))`, pads
/// each with `pad_augs` and resizes it (nearest) to `crop_size`.
pub fn jitter_crops<R: Rng + ?Sized>(
    image: &Tensor,
    cutn: usize,
    config: &JitterConfig,
    rng: &mut R,
) -> Result<Tensor> {
    let (_, _, height, width) = image.size4()?;
    let normal = Normal::new(config.size_mean, config.size_std)
        .map_err(|e| SynthError::InvalidConfig(format!("crop size distribution: {e}")))?;

    let mut crops = Vec::with_capacity(cutn);
    for _ in 0..cutn {
        let frac = normal.sample(rng).clamp(config.size_min, config.size_max);
        let size = ((width as f64 * frac) as i64).max(1);
        if size >= width || size >= height {
            return Err(shape_mismatch(
                "jitter_crops",
                format!("crop side {size} does not fit a {height}x{width} image"),
            ));
        }
        let offset_x = rng.gen_range(0..width - size);
        let offset_y = rng.gen_range(0..height - size);
        let crop = image.narrow(2, offset_y, size).narrow(3, offset_x, size);
        let crop = pad_augs(&crop, config.pad_max, rng);
        crops.push(crop.upsample_nearest2d(
            [config.crop_size, config.crop_size],
            None::<f64>,
            None::<f64>,
        ));
    }
    Ok(Tensor::cat(&crops, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::{Device, Kind};

    #[test]
    fn clip_mean_maps_to_zero() {
        let mean = Tensor::from_slice(&CLIP_MEAN)
            .to_kind(Kind::Float)
            .view([1, 3, 1, 1])
            .expand([2, 3, 4, 4], false);
        let out = clip_normalize(&mean);
        assert!(out.abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn padding_grows_both_axes_with_ones() {
        let mut rng = StdRng::seed_from_u64(11);
        let image = Tensor::zeros([1, 3, 5, 5], (Kind::Float, Device::Cpu));
        let padded = pad_augs(&image, 50, &mut rng);
        let (_, _, h, w) = padded.size4().unwrap();
        assert_eq!(h, w);
        assert!(h > 5 && h <= 55);
        let ones = padded.eq(1.0).to_kind(Kind::Float).sum(Kind::Float).double_value(&[]);
        let expected = 3.0 * ((h * w) as f64 - 25.0);
        assert_eq!(ones, expected);
    }

    #[test]
    fn jitter_crops_have_the_encoder_size() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = JitterConfig {
            crop_size: 16,
            ..JitterConfig::default()
        };
        let image = Tensor::rand([2, 3, 32, 32], (Kind::Float, Device::Cpu));
        let crops = jitter_crops(&image, 6, &config, &mut rng).unwrap();
        assert_eq!(crops.size(), vec![12, 3, 16, 16]);
    }

    #[test]
    fn crops_wider_than_a_short_image_fail() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = JitterConfig::default();
        let image = Tensor::rand([1, 3, 4, 64], (Kind::Float, Device::Cpu));
        assert!(jitter_crops(&image, 2, &config, &mut rng).is_err());
    }
}
