use log::warn;
use serde::{Deserialize, Serialize};

use super::{GraftingSpec, NewtonSpec, Precision, RootInverseSpec};
use crate::error::{Result, ShampooErr};

/// How parameters with dimensions above `max_preconditioner_dim` are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LargeDimMethod {
    #[default]
    Blocking,
    Adagrad,
    Diagonal,
}

/// The specification for the `DistributedShampoo` optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ShampooSpec {
    pub lr: f64,
    pub betas: (f64, f64),
    pub epsilon: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub use_decoupled_weight_decay: bool,
    pub max_preconditioner_dim: usize,
    pub precondition_frequency: usize,
    pub start_preconditioning_step: Option<usize>,
    pub exponent_override: u32,
    pub exponent_multiplier: f64,
    pub grafting_type: GraftingSpec,
    pub grafting_epsilon: f64,
    pub grafting_beta2: f64,
    pub use_nesterov: bool,
    pub use_bias_correction: bool,
    pub root_inverse_method: RootInverseSpec,
    pub newton: NewtonSpec,
    pub statistics_precision: Precision,
    pub root_inverse_precision: Precision,
    pub large_dim_method: LargeDimMethod,
    pub use_merge_dims: bool,
    pub use_protected_eigh: bool,
    pub debug_mode: bool,
}

impl Default for ShampooSpec {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            betas: (0.9, 1.),
            epsilon: 1e-12,
            momentum: 0.,
            weight_decay: 0.,
            use_decoupled_weight_decay: true,
            max_preconditioner_dim: 1024,
            precondition_frequency: 1,
            start_preconditioning_step: None,
            exponent_override: 0,
            exponent_multiplier: 1.,
            grafting_type: GraftingSpec::Adagrad,
            grafting_epsilon: 1e-3,
            grafting_beta2: 1.,
            use_nesterov: false,
            use_bias_correction: true,
            root_inverse_method: RootInverseSpec::Eigen,
            newton: NewtonSpec::default(),
            statistics_precision: Precision::F32,
            root_inverse_precision: Precision::F64,
            large_dim_method: LargeDimMethod::Blocking,
            use_merge_dims: true,
            use_protected_eigh: true,
            debug_mode: false,
        }
    }
}

fn check(ok: bool, field: &'static str, reason: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(ShampooErr::invalid(field, reason()))
    }
}

impl ShampooSpec {
    /// Checks every option of this specification.
    ///
    /// # Returns
    /// An error naming the first offending field, if any.
    pub fn validate(&self) -> Result<()> {
        let (beta1, beta2) = self.betas;

        check(self.lr >= 0., "lr", || format!("must be >= 0, got {}", self.lr))?;
        check((0. ..1.).contains(&beta1), "betas", || {
            format!("beta1 must be in [0, 1), got {beta1}")
        })?;
        check(beta2 > 0. && beta2 <= 1., "betas", || {
            format!("beta2 must be in (0, 1], got {beta2}")
        })?;
        check(self.epsilon > 0., "epsilon", || {
            format!("must be > 0, got {}", self.epsilon)
        })?;
        check((0. ..1.).contains(&self.momentum), "momentum", || {
            format!("must be in [0, 1), got {}", self.momentum)
        })?;
        check(self.weight_decay >= 0., "weight_decay", || {
            format!("must be >= 0, got {}", self.weight_decay)
        })?;
        check(
            self.max_preconditioner_dim >= 1,
            "max_preconditioner_dim",
            || "must be at least 1".into(),
        )?;
        check(
            self.precondition_frequency >= 1,
            "precondition_frequency",
            || "must be at least 1".into(),
        )?;

        if let Some(start) = self.start_preconditioning_step {
            let freq = self.precondition_frequency;
            check(
                freq == 1 || start >= freq,
                "start_preconditioning_step",
                || format!("must be >= precondition_frequency ({freq}), got {start}"),
            )?;
        }

        check(self.exponent_multiplier > 0., "exponent_multiplier", || {
            format!("must be > 0, got {}", self.exponent_multiplier)
        })?;
        check(self.grafting_epsilon > 0., "grafting_epsilon", || {
            format!("must be > 0, got {}", self.grafting_epsilon)
        })?;
        check(
            self.grafting_beta2 > 0. && self.grafting_beta2 <= 1.,
            "grafting_beta2",
            || format!("must be in (0, 1], got {}", self.grafting_beta2),
        )?;
        check(
            !self.grafting_type.uses_beta2() || self.grafting_beta2 < 1.,
            "grafting_beta2",
            || format!("must be < 1 for {:?} grafting", self.grafting_type),
        )?;
        check(
            self.root_inverse_precision.supports_roots(),
            "root_inverse_precision",
            || format!("roots can't be computed in {:?}", self.root_inverse_precision),
        )?;

        if self.root_inverse_method == RootInverseSpec::Newton {
            check(self.exponent_multiplier == 1., "exponent_multiplier", || {
                "must be 1 with the newton root inverse method".into()
            })?;
            check(self.newton.max_iterations >= 1, "newton", || {
                "max_iterations must be at least 1".into()
            })?;
            check(self.newton.tolerance > 0., "newton", || {
                format!("tolerance must be > 0, got {}", self.newton.tolerance)
            })?;
        }

        Ok(())
    }

    /// The step at which the shampoo direction starts being applied.
    pub fn start_step(&self) -> usize {
        match self.start_preconditioning_step {
            Some(start) => start,
            None if self.precondition_frequency == 1 => 0,
            None => {
                warn!(
                    "start_preconditioning_step not set, defaulting to precondition_frequency ({})",
                    self.precondition_frequency
                );
                self.precondition_frequency
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_is_valid() {
        let spec = ShampooSpec::default();
        spec.validate().unwrap();
        assert_eq!(spec.start_step(), 0);
    }

    #[test]
    fn test_start_step_defaults_to_frequency() {
        let spec = ShampooSpec {
            precondition_frequency: 10,
            ..Default::default()
        };

        assert_eq!(spec.start_step(), 10);
    }

    #[test]
    fn test_start_step_before_frequency_is_rejected() {
        let spec = ShampooSpec {
            precondition_frequency: 10,
            start_preconditioning_step: Some(5),
            ..Default::default()
        };

        assert!(matches!(
            spec.validate(),
            Err(ShampooErr::InvalidConfig {
                field: "start_preconditioning_step",
                ..
            })
        ));
    }

    #[test]
    fn test_rmsprop_grafting_needs_beta2_below_one() {
        let spec = ShampooSpec {
            grafting_type: GraftingSpec::Rmsprop,
            ..Default::default()
        };
        assert!(spec.validate().is_err());

        let spec = ShampooSpec {
            grafting_beta2: 0.999,
            ..spec
        };
        spec.validate().unwrap();
    }

    #[test]
    fn test_newton_rejects_exponent_multiplier() {
        let spec = ShampooSpec {
            root_inverse_method: RootInverseSpec::Newton,
            exponent_multiplier: 0.5,
            ..Default::default()
        };

        assert!(matches!(
            spec.validate(),
            Err(ShampooErr::InvalidConfig {
                field: "exponent_multiplier",
                ..
            })
        ));
    }

    #[test]
    fn test_half_precision_roots_are_rejected() {
        let spec = ShampooSpec {
            root_inverse_precision: Precision::Bf16,
            ..Default::default()
        };

        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let spec: ShampooSpec = serde_json::from_str(
            r#"{ "lr": 0.1, "grafting_type": "adam_normalized", "newton": { "tolerance": 1e-8 } }"#,
        )
        .unwrap();

        assert_eq!(spec.lr, 0.1);
        assert_eq!(spec.grafting_type, GraftingSpec::AdamNormalized);
        assert_eq!(spec.newton.tolerance, 1e-8);
        assert_eq!(spec.newton.max_iterations, 1000);
        assert_eq!(spec.max_preconditioner_dim, 1024);
    }
}
