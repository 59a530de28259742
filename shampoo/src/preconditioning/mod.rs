mod adagrad;
mod factor;
mod shampoo;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    linalg::RootSolver,
    specs::{LargeDimMethod, Precision, ShampooSpec},
};

pub use adagrad::AdagradPreconditioner;
pub use factor::FactorMatrix;
pub use shampoo::ShampooPreconditioner;

/// The options every preconditioner reads on each call.
#[derive(Debug, Clone, Copy)]
pub struct PreconditionerConfig {
    pub beta2: f64,
    pub epsilon: f64,
    pub use_bias_correction: bool,
    pub statistics_precision: Precision,
    pub exponent_override: u32,
    pub exponent_multiplier: f64,
    pub use_protected_eigh: bool,
    pub debug_mode: bool,
    pub solver: RootSolver,
}

impl PreconditionerConfig {
    /// Creates a new `PreconditionerConfig` out of the optimizer's specification.
    pub fn from_spec(spec: &ShampooSpec) -> Result<Self> {
        Ok(Self {
            beta2: spec.betas.1,
            epsilon: spec.epsilon,
            use_bias_correction: spec.use_bias_correction,
            statistics_precision: spec.statistics_precision,
            exponent_override: spec.exponent_override,
            exponent_multiplier: spec.exponent_multiplier,
            use_protected_eigh: spec.use_protected_eigh,
            debug_mode: spec.debug_mode,
            solver: RootSolver::from_spec(spec)?,
        })
    }

    /// The divisor that unbiases the statistics at `step`.
    pub fn bias_correction(&self, step: u64) -> f64 {
        if self.use_bias_correction && self.beta2 < 1. {
            1. - self.beta2.powf(step as f64 + 1.)
        } else {
            1.
        }
    }

    /// Folds a new observation into an accumulator, then rounds it to the statistics precision.
    fn accumulate(&self, acc: f64, x: f64) -> f64 {
        let next = if self.beta2 < 1. {
            self.beta2 * acc + (1. - self.beta2) * x
        } else {
            acc + x
        };

        self.statistics_precision.round(next)
    }
}

/// The preconditioner held by a single block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPreconditioner {
    Shampoo(ShampooPreconditioner),
    Adagrad(AdagradPreconditioner),
}

impl BlockPreconditioner {
    /// Creates the preconditioner for a block.
    ///
    /// # Arguments
    /// * `shape` - The shape of the block.
    /// * `method` - How dimensions larger than `max_dim` are handled.
    /// * `max_dim` - The largest dimension preconditioned with a full factor matrix.
    ///
    /// # Returns
    /// A new zeroed `BlockPreconditioner`.
    pub fn new(shape: &[usize], method: LargeDimMethod, max_dim: usize) -> Self {
        let too_large = shape.iter().any(|&d| d > max_dim);

        match method {
            _ if shape.is_empty() => Self::Adagrad(AdagradPreconditioner::new(shape)),
            LargeDimMethod::Adagrad if too_large => {
                Self::Adagrad(AdagradPreconditioner::new(shape))
            }
            LargeDimMethod::Diagonal => Self::Shampoo(ShampooPreconditioner::new(
                shape.iter().map(|&d| {
                    if d > max_dim {
                        FactorMatrix::diagonal(d)
                    } else {
                        FactorMatrix::full(d)
                    }
                }),
            )),
            _ => Self::Shampoo(ShampooPreconditioner::new(
                shape.iter().map(|&d| FactorMatrix::full(d)),
            )),
        }
    }

    /// Accumulates a gradient into the statistics.
    pub fn update(&mut self, grad: &ArrayD<f64>, cfg: &PreconditionerConfig) -> Result<()> {
        match self {
            Self::Shampoo(p) => p.update(grad, cfg),
            Self::Adagrad(p) => p.update(grad, cfg),
        }
    }

    /// Applies the preconditioner to a gradient.
    pub fn precondition(
        &self,
        grad: &ArrayD<f64>,
        cfg: &PreconditionerConfig,
        step: u64,
    ) -> Result<ArrayD<f64>> {
        match self {
            Self::Shampoo(p) => p.precondition(grad),
            Self::Adagrad(p) => Ok(p.precondition(grad, cfg, step)),
        }
    }

    /// Whether this block holds inverse roots that need to be recomputed periodically.
    pub fn has_roots(&self) -> bool {
        matches!(self, Self::Shampoo(_))
    }

    /// The cost estimate of recomputing this block's roots.
    pub fn cost(&self) -> u64 {
        match self {
            Self::Shampoo(p) => p.cost(),
            Self::Adagrad(_) => 0,
        }
    }

    /// The amount of `f64`s needed to ship this block's inverse roots.
    pub fn root_len(&self) -> usize {
        match self {
            Self::Shampoo(p) => p.root_len(),
            Self::Adagrad(_) => 0,
        }
    }

    /// Recomputes every inverse root of this block.
    ///
    /// # Returns
    /// The relative residuals of the new roots when in debug mode, otherwise nothing.
    pub fn refresh_roots(&mut self, cfg: &PreconditionerConfig, step: u64) -> Result<Vec<f64>> {
        match self {
            Self::Shampoo(p) => p.refresh_roots(cfg, step),
            Self::Adagrad(_) => Ok(Vec::new()),
        }
    }

    /// Writes every inverse root into `out`, which must be `root_len` long.
    pub fn write_roots(&self, out: &mut [f64]) {
        if let Self::Shampoo(p) = self {
            p.write_roots(out);
        }
    }

    /// Overwrites every inverse root out of `src`, which must be `root_len` long.
    pub fn read_roots(&mut self, src: &[f64]) {
        if let Self::Shampoo(p) = self {
            p.read_roots(src);
        }
    }

    /// The amount of preconditioner elements held by this block.
    pub fn len(&self) -> usize {
        match self {
            Self::Shampoo(p) => p.len(),
            Self::Adagrad(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A short name of the kind of preconditioner and of every factor.
    pub fn kind(&self) -> String {
        match self {
            Self::Adagrad(_) => "adagrad".into(),
            Self::Shampoo(p) => {
                let factors: Vec<_> = p
                    .factors()
                    .iter()
                    .map(|f| if f.is_diagonal() { "diagonal" } else { "full" })
                    .collect();
                format!("shampoo [{}]", factors.join(", "))
            }
        }
    }

    /// The shape of every array held, used to check restored state.
    pub fn layout(&self) -> Vec<Vec<usize>> {
        match self {
            Self::Shampoo(p) => p.layout(),
            Self::Adagrad(p) => vec![p.layout()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(beta2: f64) -> PreconditionerConfig {
        let spec = ShampooSpec {
            betas: (0.9, beta2),
            ..Default::default()
        };

        PreconditionerConfig::from_spec(&spec).unwrap()
    }

    #[test]
    fn test_bias_correction_past_i32_steps() {
        let cfg = config(0.999);

        assert!((cfg.bias_correction(0) - 1e-3).abs() < 1e-12);
        assert_eq!(cfg.bias_correction(u64::from(u32::MAX) + 7), 1.);
    }

    #[test]
    fn test_no_bias_correction_for_plain_sums() {
        assert_eq!(config(1.).bias_correction(3), 1.);
    }
}
