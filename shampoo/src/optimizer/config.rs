use log::warn;

use crate::{
    error::Result,
    grafting::GraftingConfig,
    preconditioning::PreconditionerConfig,
    specs::ShampooSpec,
};

/// The options read by the step controller, resolved out of a `ShampooSpec`.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub beta1: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub decoupled_weight_decay: bool,
    pub nesterov: bool,
    pub use_bias_correction: bool,
    pub preconditioner: PreconditionerConfig,
    pub grafting: GraftingConfig,
}

impl OptimizerConfig {
    /// Resolves the options of an already validated specification.
    pub fn from_spec(spec: &ShampooSpec) -> Result<Self> {
        let nesterov = spec.use_nesterov && spec.momentum > 0.;
        if spec.use_nesterov && !nesterov {
            warn!("use_nesterov has no effect without momentum, ignoring it");
        }

        Ok(Self {
            lr: spec.lr,
            beta1: spec.betas.0,
            momentum: spec.momentum,
            weight_decay: spec.weight_decay,
            decoupled_weight_decay: spec.use_decoupled_weight_decay,
            nesterov,
            use_bias_correction: spec.use_bias_correction,
            preconditioner: PreconditionerConfig::from_spec(spec)?,
            grafting: GraftingConfig {
                epsilon: spec.grafting_epsilon,
                beta2: spec.grafting_beta2,
            },
        })
    }
}
