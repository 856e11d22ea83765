use rand::Rng;
use tch::Tensor;

use crate::config::CutoutConfig;
use crate::error::{shape_mismatch, Result, SynthError};
use crate::grad::GradTape;
use crate::resample::resample;

/// Random square crops resized to `cut_size`, stacked along the batch axis.
#[derive(Debug, Clone)]
pub struct MakeCutouts {
    pub cut_size: i64,
    pub cutn: usize,
    pub cut_pow: f64,
}

impl MakeCutouts {
    pub fn new(config: &CutoutConfig) -> Result<MakeCutouts> {
        if config.cutn == 0 {
            return Err(SynthError::InvalidConfig("cutn must be at least 1".into()));
        }
        if config.cut_size < 1 {
            return Err(SynthError::InvalidConfig("cut_size must be positive".into()));
        }
        if !config.cut_pow.is_finite() || config.cut_pow <= 0.0 {
            return Err(SynthError::InvalidConfig(format!(
                "cut_pow must be finite and positive, got {}",
                config.cut_pow
            )));
        }
        Ok(MakeCutouts {
            cut_size: config.cut_size,
            cutn: config.cutn,
            cut_pow: config.cut_pow,
        })
    }

    /// One crop side in `[min_size, max_size]`, biased by `cut_pow`.
    pub fn sample_size<R: Rng + ?Sized>(&self, min_size: i64, max_size: i64, rng: &mut R) -> i64 {
        let u: f64 = rng.gen();
        let span = (max_size - min_size) as f64;
        let size = (u.powf(self.cut_pow) * span) as i64 + min_size;
        size.clamp(min_size, max_size)
    }

    /// Crops `input` (`n, c, h, w`) `cutn` times; output is
    /// `(n * cutn, c, cut_size, cut_size)` clamped to `[0, 1]`.
    ///
    /// Crop sides are drawn from `[min(cut_size, side), side]` with
    /// `u^cut_pow`, so powers above one favour small crops.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        input: &Tensor,
        rng: &mut R,
        tape: &mut GradTape,
    ) -> Result<Tensor> {
        let (_, _, side_y, side_x) = input.size4()?;
        if side_x < 1 || side_y < 1 {
            return Err(shape_mismatch(
                "cutouts",
                format!("input extent {side_y}x{side_x} is empty"),
            ));
        }
        let max_size = side_x.min(side_y);
        let min_size = max_size.min(self.cut_size);

        let mut cutouts = Vec::with_capacity(self.cutn);
        for _ in 0..self.cutn {
            let size = self.sample_size(min_size, max_size, rng);
            let offset_x = rng.gen_range(0..=side_x - size);
            let offset_y = rng.gen_range(0..=side_y - size);
            let cutout = input.narrow(2, offset_y, size).narrow(3, offset_x, size);
            cutouts.push(resample(&cutout, (self.cut_size, self.cut_size))?);
        }
        Ok(tape.clamp_with_grad(&Tensor::cat(&cutouts, 0), 0.0, 1.0))
    }
}
