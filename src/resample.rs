//! Anti-aliased resize: lanczos low-pass along each shrinking axis, then
//! corner-aligned bicubic interpolation to the exact target size.
use std::f64::consts::PI;

use tch::{Device, Kind, Tensor};

use crate::error::{shape_mismatch, Result};

/// Kernel support of the lanczos window.
pub const LANCZOS_SUPPORT: f64 = 2.0;

/// Normalised sinc, 1 at the origin.
pub fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

/// Lanczos window evaluated at `xs`, normalised to sum to one.
pub fn lanczos(xs: &[f64], a: f64) -> Vec<f64> {
    let raw: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if -a < x && x < a {
                sinc(x) * sinc(x / a)
            } else {
                0.0
            }
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / total).collect()
}

/// Symmetric sample positions `..., -ratio, 0, ratio, ...` covering `width`
/// on each side, with the outermost pair dropped.
pub fn ramp(ratio: f64, width: f64) -> Vec<f64> {
    let n = (width / ratio + 1.0).ceil() as usize;
    let half: Vec<f64> = (0..n).map(|i| i as f64 * ratio).collect();
    let mut out: Vec<f64> = half[1..].iter().rev().map(|v| -v).collect();
    out.extend_from_slice(&half);
    out[1..out.len() - 1].to_vec()
}

fn lanczos_kernel(ratio: f64, kind: Kind, device: Device) -> Tensor {
    let taps = lanczos(&ramp(ratio, LANCZOS_SUPPORT), LANCZOS_SUPPORT);
    Tensor::from_slice(&taps).to_kind(kind).to_device(device)
}

/// Resizes a `(n, c, h, w)` tensor to `(n, c, size.0, size.1)`.
///
/// The low-pass only runs on axes that shrink; reflect padding keeps the
/// filtered extent unchanged, which needs the axis to be wider than the
/// kernel's half width.
pub fn resample(input: &Tensor, size: (i64, i64)) -> Result<Tensor> {
    let (n, c, h, w) = input.size4()?;
    let (dh, dw) = size;
    if dh < 1 || dw < 1 {
        return Err(shape_mismatch(
            "resample",
            format!("target size {dh}x{dw} must be at least 1x1"),
        ));
    }

    let mut x = input.reshape([n * c, 1, h, w]);

    if dh < h {
        let kernel = lanczos_kernel(dh as f64 / h as f64, x.kind(), x.device());
        let pad = (kernel.size()[0] - 1) / 2;
        if pad >= h {
            return Err(shape_mismatch(
                "resample",
                format!("height {h} too small for a {pad}px reflect pad"),
            ));
        }
        x = x.reflection_pad2d([0, 0, pad, pad]).conv2d(
            &kernel.view([1, 1, -1, 1]),
            None::<Tensor>,
            [1, 1],
            [0, 0],
            [1, 1],
            1,
        );
    }

    if dw < w {
        let kernel = lanczos_kernel(dw as f64 / w as f64, x.kind(), x.device());
        let pad = (kernel.size()[0] - 1) / 2;
        if pad >= w {
            return Err(shape_mismatch(
                "resample",
                format!("width {w} too small for a {pad}px reflect pad"),
            ));
        }
        x = x.reflection_pad2d([pad, pad, 0, 0]).conv2d(
            &kernel.view([1, 1, 1, -1]),
            None::<Tensor>,
            [1, 1],
            [0, 0],
            [1, 1],
            1,
        );
    }

    Ok(x
        .reshape([n, c, h, w])
        .upsample_bicubic2d([dh, dw], true, None::<f64>, None::<f64>))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanczos_taps_sum_to_one() {
        for a in [0.5, 1.0, 2.0, 3.0, 4.5] {
            for ratio in [0.1, 0.25, 0.5, 0.9] {
                let taps = lanczos(&ramp(ratio, a), a);
                let total: f64 = taps.iter().sum();
                assert!((total - 1.0).abs() < 1e-9, "a={a} ratio={ratio} sum={total}");
            }
        }
    }

    #[test]
    fn ramp_is_symmetric_and_centred() {
        let r = ramp(0.5, 2.0);
        assert_eq!(r.len() % 2, 1);
        assert_eq!(r[r.len() / 2], 0.0);
        for (lo, hi) in r.iter().zip(r.iter().rev()) {
            assert!((lo + hi).abs() < 1e-12);
        }
        assert_eq!(r, vec![-1.5, -1.0, -0.5, 0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn sinc_is_one_at_zero() {
        assert_eq!(sinc(0.0), 1.0);
        assert!(sinc(1.0).abs() < 1e-12);
    }

    #[test]
    fn resample_hits_target_shape() {
        let x = Tensor::rand([2, 3, 37, 53], (Kind::Float, Device::Cpu));
        let down = resample(&x, (8, 8)).unwrap();
        assert_eq!(down.size(), vec![2, 3, 8, 8]);

        let up = resample(&x, (64, 40)).unwrap();
        assert_eq!(up.size(), vec![2, 3, 64, 40]);
    }

    #[test]
    fn same_size_skips_the_filter() {
        let x = Tensor::rand([1, 3, 12, 12], (Kind::Float, Device::Cpu));
        let y = resample(&x, (12, 12)).unwrap();
        let bicubic = x.upsample_bicubic2d([12, 12], true, None::<f64>, None::<f64>);
        assert!(y.allclose(&bicubic, 1e-6, 1e-6, false));
        assert!(y.allclose(&x, 1e-5, 1e-5, false));
    }

    #[test]
    fn constant_image_stays_constant() {
        let x = Tensor::full([1, 1, 30, 30], 0.25, (Kind::Float, Device::Cpu));
        let y = resample(&x, (7, 7)).unwrap();
        assert!(y.allclose(&Tensor::full([1, 1, 7, 7], 0.25, (Kind::Float, Device::Cpu)), 1e-5, 1e-5, false));
    }

    #[test]
    fn tiny_axis_fails_fast() {
        let x = Tensor::rand([1, 1, 2, 2], (Kind::Float, Device::Cpu));
        assert!(resample(&x, (1, 1)).is_err());
    }

    #[test]
    fn empty_target_is_rejected() {
        let x = Tensor::rand([1, 1, 4, 4], (Kind::Float, Device::Cpu));
        assert!(resample(&x, (0, 4)).is_err());
    }
}
