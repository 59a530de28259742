use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::{linalg::frobenius, specs::GraftingSpec};

const NORM_FLOOR: f64 = 1e-16;

/// The options of the grafting method, independent of shampoo's own.
#[derive(Debug, Clone, Copy)]
pub struct GraftingConfig {
    pub epsilon: f64,
    pub beta2: f64,
}

/// How the second moment of an adaptive grafting method is accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveRule {
    Adagrad,
    Rmsprop,
    Adam,
}

/// The per block state of the grafting method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grafting {
    None,
    Sgd,
    Adaptive {
        rule: AdaptiveRule,
        normalized: bool,
        second_moment: ArrayD<f64>,
    },
}

impl Grafting {
    /// Creates the grafting state for a block.
    ///
    /// # Arguments
    /// * `spec` - The grafting method.
    /// * `shape` - The shape of the block.
    ///
    /// # Returns
    /// A new `Grafting` with zeroed state.
    pub fn new(spec: GraftingSpec, shape: &[usize]) -> Self {
        let adaptive = |rule, normalized| Self::Adaptive {
            rule,
            normalized,
            second_moment: ArrayD::zeros(IxDyn(shape)),
        };

        match spec {
            GraftingSpec::None => Self::None,
            GraftingSpec::Sgd => Self::Sgd,
            GraftingSpec::Adagrad => adaptive(AdaptiveRule::Adagrad, false),
            GraftingSpec::Rmsprop => adaptive(AdaptiveRule::Rmsprop, false),
            GraftingSpec::Adam => adaptive(AdaptiveRule::Adam, false),
            GraftingSpec::AdagradNormalized => adaptive(AdaptiveRule::Adagrad, true),
            GraftingSpec::RmspropNormalized => adaptive(AdaptiveRule::Rmsprop, true),
            GraftingSpec::AdamNormalized => adaptive(AdaptiveRule::Adam, true),
        }
    }

    /// The method this state was created for.
    pub fn spec(&self) -> GraftingSpec {
        match self {
            Self::None => GraftingSpec::None,
            Self::Sgd => GraftingSpec::Sgd,
            Self::Adaptive {
                rule, normalized, ..
            } => match (rule, normalized) {
                (AdaptiveRule::Adagrad, false) => GraftingSpec::Adagrad,
                (AdaptiveRule::Rmsprop, false) => GraftingSpec::Rmsprop,
                (AdaptiveRule::Adam, false) => GraftingSpec::Adam,
                (AdaptiveRule::Adagrad, true) => GraftingSpec::AdagradNormalized,
                (AdaptiveRule::Rmsprop, true) => GraftingSpec::RmspropNormalized,
                (AdaptiveRule::Adam, true) => GraftingSpec::AdamNormalized,
            },
        }
    }

    /// Accumulates a gradient into the second moment, normalizing it first for the
    /// normalized variants.
    pub fn update(&mut self, grad: &ArrayD<f64>, cfg: &GraftingConfig) {
        let Self::Adaptive {
            rule,
            normalized,
            second_moment,
        } = self
        else {
            return;
        };

        let scale = if *normalized {
            1. / frobenius(grad).max(NORM_FLOOR)
        } else {
            1.
        };

        let beta2 = match rule {
            AdaptiveRule::Adagrad => 1.,
            AdaptiveRule::Rmsprop | AdaptiveRule::Adam => cfg.beta2,
        };

        Zip::from(second_moment).and(grad).for_each(|v, &g| {
            let g = g * scale;
            *v = if beta2 < 1. {
                beta2 * *v + (1. - beta2) * g * g
            } else {
                *v + g * g
            };
        });
    }

    /// The step the grafting method alone would take for `grad`.
    ///
    /// # Arguments
    /// * `grad` - The (filtered) block gradient.
    /// * `cfg` - The grafting options.
    /// * `step` - The current step, for the bias correction of adam.
    ///
    /// # Returns
    /// The grafted direction, the gradient itself for `None` and `Sgd`.
    pub fn direction(&self, grad: &ArrayD<f64>, cfg: &GraftingConfig, step: u64) -> ArrayD<f64> {
        let Self::Adaptive {
            rule,
            second_moment,
            ..
        } = self
        else {
            return grad.clone();
        };

        let bias_correction = match rule {
            AdaptiveRule::Adam => 1. - cfg.beta2.powf(step as f64 + 1.),
            _ => 1.,
        };

        Zip::from(grad)
            .and(second_moment)
            .map_collect(|&g, &v| g / ((v / bias_correction).sqrt() + cfg.epsilon))
    }

    /// The norm the shampoo direction of a block is rescaled to, `None` if there's no grafting.
    pub fn graft_norm(
        &self,
        grad: &ArrayD<f64>,
        cfg: &GraftingConfig,
        step: u64,
    ) -> Option<f64> {
        match self {
            Self::None => None,
            _ => Some(frobenius(&self.direction(grad, cfg, step))),
        }
    }

    /// Rescales `direction` in place so its norm matches the grafted one.
    pub fn graft(
        &self,
        direction: &mut ArrayD<f64>,
        grad: &ArrayD<f64>,
        cfg: &GraftingConfig,
        step: u64,
    ) {
        if let Some(norm) = self.graft_norm(grad, cfg, step) {
            let scale = norm / (frobenius(direction) + NORM_FLOOR);
            direction.mapv_inplace(|x| x * scale);
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Adaptive { second_moment, .. } => second_moment.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> Vec<Vec<usize>> {
        match self {
            Self::Adaptive { second_moment, .. } => vec![second_moment.shape().to_vec()],
            _ => Vec::new(),
        }
    }
}
