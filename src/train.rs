use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::nn::{self, OptimizerConfig};
use tch::Tensor;

use crate::config::RunConfig;
use crate::error::Result;
use crate::grad::GradTape;
use crate::protocol::{GeneratorProtocol, StepContext};

/// Drives one protocol through a fixed number of Adam steps.
pub struct Trainer {
    protocol: Box<dyn GeneratorProtocol>,
    optimizer: nn::Optimizer,
    rng: StdRng,
    epochs: usize,
    last_loss: Option<f64>,
}

impl Trainer {
    pub fn new(protocol: Box<dyn GeneratorProtocol>, config: &RunConfig) -> Result<Trainer> {
        let optimizer = nn::Adam::default().build(protocol.var_store(), config.learning_rate)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Trainer {
            protocol,
            optimizer,
            rng,
            epochs: config.iterations,
            last_loss: None,
        })
    }

    pub fn protocol(&self) -> &dyn GeneratorProtocol {
        self.protocol.as_ref()
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.last_loss
    }

    /// Resets both the crop sampler and libtorch's generator.
    #[cfg(test)]
    pub fn reseed(&mut self, seed: u64) {
        tch::manual_seed(seed as i64);
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Loss at the current latents, without touching gradients.
    pub fn evaluate(&mut self) -> Result<f64> {
        let mut tape = GradTape::new();
        let mut ctx = StepContext {
            rng: &mut self.rng,
            tape: &mut tape,
        };
        let protocol = &self.protocol;
        let loss = tch::no_grad(|| -> Result<Tensor> { protocol.ascend_txt(&mut ctx)?.total() })?;
        Ok(loss.double_value(&[]))
    }

    /// Runs step `i`. Returns a detached copy of the latents after the
    /// last configured step and `None` before it.
    pub fn train(&mut self, i: usize) -> Result<Option<Vec<Tensor>>> {
        let mut tape = GradTape::new();
        let components = {
            let mut ctx = StepContext {
                rng: &mut self.rng,
                tape: &mut tape,
            };
            self.protocol.ascend_txt(&mut ctx)?
        };
        let loss = components.total()?;
        let value = loss.double_value(&[]);
        if !value.is_finite() {
            warn!("Step {}: non-finite loss {value}", i + 1);
        }
        debug!(
            "Step {}: loss {value:.5} over {} terms ({:?}), {} clamps",
            i + 1,
            components.terms.len(),
            components.reduction,
            tape.len()
        );
        if let Some(image) = &components.image {
            debug!("Step {}: encoder input {:?}", i + 1, image.size());
        }

        self.optimizer.zero_grad();
        tape.backward(&loss)?;
        self.optimizer.step();
        self.last_loss = Some(value);

        if i + 1 == self.epochs {
            let snapshot = components
                .latent
                .iter()
                .map(|t| t.detach().copy())
                .collect();
            return Ok(Some(snapshot));
        }
        Ok(None)
    }
}
