use serde::{Deserialize, Serialize};

/// The specification for the method used to compute inverse matrix roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootInverseSpec {
    #[default]
    Eigen,
    Newton,
}

/// What to do when the coupled newton iteration fails to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewtonFallback {
    #[default]
    Eigen,
    ReusePrevious,
}

/// Knobs of the coupled newton iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSpec {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub fallback: NewtonFallback,
}

impl Default for NewtonSpec {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-6,
            fallback: NewtonFallback::Eigen,
        }
    }
}
