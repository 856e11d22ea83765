use tch::{Kind, Tensor};

use crate::error::{Result, SynthError};
use crate::grad::replace_grad;

/// Text prompt with its optional `:weight:stop` suffix split off.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPrompt {
    pub text: String,
    pub weight: f64,
    pub stop: f64,
}

/// Parses `text[:weight[:stop]]`, splitting from the right so the text
/// itself may contain colons.
pub fn parse_prompt(prompt: &str) -> Result<ParsedPrompt> {
    let mut parts: Vec<&str> = prompt.rsplitn(3, ':').collect();
    parts.reverse();
    let number = |s: &str, default: f64| -> Result<f64> {
        match s.trim() {
            "" => Ok(default),
            "-inf" => Ok(f64::NEG_INFINITY),
            v => v
                .parse::<f64>()
                .map_err(|_| SynthError::InvalidPrompt(format!("`{v}` is not a number in `{prompt}`"))),
        }
    };
    let weight = number(parts.get(1).copied().unwrap_or(""), 1.0)?;
    let stop = number(parts.get(2).copied().unwrap_or(""), f64::NEG_INFINITY)?;
    Ok(ParsedPrompt {
        text: parts[0].to_string(),
        weight,
        stop,
    })
}

/// L2-normalises along `dim`, guarding against zero vectors.
pub fn l2_normalize(x: &Tensor, dim: i64) -> Tensor {
    x / x.norm_scalaropt_dim(2, [dim], true).clamp_min(1e-12)
}

/// Target embedding for one prompt plus its weight and stop threshold.
/// Built once per run and never mutated.
#[derive(Debug)]
pub struct PromptTarget {
    pub embed: Tensor,
    pub weight: f64,
    pub stop: f64,
}

impl PromptTarget {
    #[cfg(test)]
    pub fn new(embed: Tensor) -> PromptTarget {
        PromptTarget::weighted(embed, 1.0, f64::NEG_INFINITY)
    }

    pub fn weighted(embed: Tensor, weight: f64, stop: f64) -> PromptTarget {
        PromptTarget {
            embed: embed.detach(),
            weight,
            stop,
        }
    }

    /// Squared spherical distance between each encoded crop and the target.
    ///
    /// The forward value is the signed distance; its gradient only flows
    /// while the distance is above `stop`.
    pub fn loss(&self, encoded: &Tensor) -> Tensor {
        let input_normed = l2_normalize(&encoded.unsqueeze(1), 2);
        let embed_normed = l2_normalize(&self.embed.unsqueeze(0), 2);
        let half_chord = (input_normed - embed_normed).norm_scalaropt_dim(2, [2i64], false) / 2.0;
        let dists = half_chord.arcsin().square() * 2.0 * self.weight.signum();
        let gated = replace_grad(&dists, &dists.clamp_min(self.stop));
        gated.mean(Kind::Float) * self.weight.abs()
    }
}
