//! Gradient plumbing that libtorch does not offer through `tch`.
//!
//! `replace_grad` is the straight-through estimator used for codebook
//! snapping and prompt stop thresholds. `GradTape` carries the clamp whose
//! backward only lets through gradients that pull saturated values back
//! into range. `tch` has no custom autograd functions, so each clamp cuts
//! the graph at a fresh leaf and the tape replays the masked gradient into
//! the clamp input once the main backward pass is done.
use tch::Tensor;

use crate::error::Result;

/// Returns `forward` unchanged while sending gradients to `backward`.
///
/// The second summand is exactly zero, so the forward value is bit-for-bit
/// `forward`. When `backward` was broadcast, autograd sums the gradient
/// back down to its shape. `forward` itself receives no gradient.
pub fn replace_grad(forward: &Tensor, backward: &Tensor) -> Tensor {
    forward.detach() + (backward - backward.detach())
}

/// Gradient rule for `clamp_with_grad`: zero where descent would push the
/// value further outside `[low, high]`.
pub fn clamp_grad_mask(input: &Tensor, grad: &Tensor, low: f64, high: f64) -> Tensor {
    let input = input.detach();
    let overshoot = &input - input.clamp(low, high);
    let keep = (grad * overshoot).ge(0.0).to_kind(grad.kind());
    grad * keep
}

struct ClampRecord {
    input: Tensor,
    output: Tensor,
    low: f64,
    high: f64,
}

/// Per-step record of the clamps taken during loss construction.
#[derive(Default)]
pub struct GradTape {
    records: Vec<ClampRecord>,
}

impl GradTape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Clamps `input` into `[low, high]`.
    ///
    /// Outside of autograd (no grad mode, detached input) this is a plain
    /// clamp and nothing is recorded.
    pub fn clamp_with_grad(&mut self, input: &Tensor, low: f64, high: f64) -> Tensor {
        let clamped = input.detach().clamp(low, high);
        if !input.requires_grad() {
            return clamped;
        }
        let output = clamped.set_requires_grad(true);
        self.records.push(ClampRecord {
            input: input.shallow_clone(),
            output: output.shallow_clone(),
            low,
            high,
        });
        output
    }

    /// Backpropagates `loss`, then replays every recorded clamp from the
    /// last one taken to the first.
    pub fn backward(&mut self, loss: &Tensor) -> Result<()> {
        loss.f_backward()?;
        while let Some(record) = self.records.pop() {
            let grad = record.output.grad();
            if !grad.defined() || !record.input.requires_grad() {
                continue;
            }
            let masked = clamp_grad_mask(&record.input, &grad, record.low, record.high);
            (&record.input * masked.detach())
                .sum(record.input.kind())
                .f_backward()?;
        }
        Ok(())
    }
}
