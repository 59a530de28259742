use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use super::{OptimizerConfig, Phase};
use crate::{
    error::{Result, ShampooErr},
    grafting::Grafting,
    preconditioning::BlockPreconditioner,
    specs::ShampooSpec,
};

/// Everything the optimizer keeps for a single block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockState {
    pub(crate) preconditioner: BlockPreconditioner,
    pub(crate) grafting: Grafting,
    pub(crate) exp_avg: Option<ArrayD<f64>>,
    pub(crate) momentum: Option<ArrayD<f64>>,
}

impl BlockState {
    /// Creates the zeroed state of a block.
    ///
    /// # Arguments
    /// * `shape` - The shape of the block.
    /// * `spec` - The optimizer's specification.
    ///
    /// # Returns
    /// A new `BlockState` instance.
    pub fn new(shape: &[usize], spec: &ShampooSpec) -> Self {
        let zeros = || ArrayD::zeros(IxDyn(shape));

        Self {
            preconditioner: BlockPreconditioner::new(
                shape,
                spec.large_dim_method,
                spec.max_preconditioner_dim,
            ),
            grafting: Grafting::new(spec.grafting_type, shape),
            exp_avg: (spec.betas.0 > 0.).then(zeros),
            momentum: (spec.momentum > 0.).then(zeros),
        }
    }

    pub fn preconditioner(&self) -> &BlockPreconditioner {
        &self.preconditioner
    }

    pub fn grafting(&self) -> &Grafting {
        &self.grafting
    }

    /// Accumulates the statistics of a gradient and filters it.
    ///
    /// A gradient made only of zeros doesn't touch the statistics nor the grafting state.
    ///
    /// # Arguments
    /// * `grad` - The block gradient, with l2 weight decay already added.
    /// * `cfg` - The optimizer options.
    /// * `step` - The current step.
    ///
    /// # Returns
    /// The gradient to precondition, its exponential moving average when `beta1 > 0`.
    pub fn accumulate(
        &mut self,
        grad: ArrayD<f64>,
        cfg: &OptimizerConfig,
        step: u64,
    ) -> Result<ArrayD<f64>> {
        if grad.iter().any(|&g| g != 0.) {
            self.preconditioner.update(&grad, &cfg.preconditioner)?;
            self.grafting.update(&grad, &cfg.grafting);
        }

        let Some(exp_avg) = self.exp_avg.as_mut() else {
            return Ok(grad);
        };

        let beta1 = cfg.beta1;
        exp_avg.zip_mut_with(&grad, |m, &g| *m = beta1 * *m + (1. - beta1) * g);

        let mut filtered = exp_avg.clone();
        if cfg.use_bias_correction {
            let bias_correction = 1. - beta1.powf(step as f64 + 1.);
            filtered.mapv_inplace(|m| m / bias_correction);
        }

        Ok(filtered)
    }

    /// Computes the search direction of this block, before momentum.
    pub fn direction(
        &self,
        grad: &ArrayD<f64>,
        phase: Phase,
        cfg: &OptimizerConfig,
        step: u64,
    ) -> Result<ArrayD<f64>> {
        if phase == Phase::Warmup {
            return Ok(self.grafting.direction(grad, &cfg.grafting, step));
        }

        match &self.preconditioner {
            BlockPreconditioner::Adagrad(p) => Ok(p.precondition(grad, &cfg.preconditioner, step)),
            BlockPreconditioner::Shampoo(p) => {
                let mut direction = p.precondition(grad)?;
                self.grafting
                    .graft(&mut direction, grad, &cfg.grafting, step);
                Ok(direction)
            }
        }
    }

    /// Folds `direction` into the momentum buffer.
    ///
    /// # Returns
    /// The final step of the block, `direction` itself without momentum.
    pub fn apply_momentum(&mut self, direction: ArrayD<f64>, cfg: &OptimizerConfig) -> ArrayD<f64> {
        let Some(buffer) = self.momentum.as_mut() else {
            return direction;
        };

        let momentum = cfg.momentum;
        buffer.zip_mut_with(&direction, |b, &d| *b = momentum * *b + d);

        if cfg.nesterov {
            let mut lookahead = direction;
            lookahead.scaled_add(momentum, buffer);
            lookahead
        } else {
            buffer.clone()
        }
    }

    /// Checks that `saved` comes from an optimizer configured like the one holding this block.
    ///
    /// # Arguments
    /// * `saved` - The restored state of this same block.
    /// * `what` - The name of the block, for the error.
    ///
    /// # Returns
    /// An `InvalidConfig` error naming the first option that differs.
    pub fn check_restorable(&self, saved: &BlockState, what: &str) -> Result<()> {
        let (live_grafting, saved_grafting) = (self.grafting.spec(), saved.grafting.spec());
        if live_grafting != saved_grafting {
            return Err(ShampooErr::invalid(
                "grafting_type",
                format!("{what} was saved with {saved_grafting:?}, not {live_grafting:?}"),
            ));
        }

        let (live_kind, saved_kind) = (self.preconditioner.kind(), saved.preconditioner.kind());
        if live_kind != saved_kind {
            return Err(ShampooErr::invalid(
                "large_dim_method",
                format!("{what} was saved with a {saved_kind} preconditioner, not {live_kind}"),
            ));
        }

        let presence = |state: &Option<ArrayD<f64>>| {
            if state.is_some() { "with" } else { "without" }
        };

        if self.exp_avg.is_some() != saved.exp_avg.is_some() {
            return Err(ShampooErr::invalid(
                "betas",
                format!("{what} was saved {} a gradient average", presence(&saved.exp_avg)),
            ));
        }

        if self.momentum.is_some() != saved.momentum.is_some() {
            return Err(ShampooErr::invalid(
                "momentum",
                format!("{what} was saved {} a momentum buffer", presence(&saved.momentum)),
            ));
        }

        Ok(())
    }

    /// The amount of `f64`s held by this block.
    pub fn len(&self) -> usize {
        self.preconditioner.len()
            + self.grafting.len()
            + self.exp_avg.as_ref().map_or(0, ArrayD::len)
            + self.momentum.as_ref().map_or(0, ArrayD::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shape of every array held, in a fixed order.
    pub fn layout(&self) -> Vec<Vec<usize>> {
        let mut layout = self.preconditioner.layout();
        layout.extend(self.grafting.layout());
        layout.extend(self.exp_avg.iter().map(|m| m.shape().to_vec()));
        layout.extend(self.momentum.iter().map(|m| m.shape().to_vec()));
        layout
    }
}
