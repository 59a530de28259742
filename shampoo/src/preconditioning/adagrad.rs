use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use super::PreconditionerConfig;
use crate::error::{Result, ShampooErr};

/// Diagonal preconditioner, for blocks too large or too small for factor matrices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdagradPreconditioner {
    second_moment: ArrayD<f64>,
}

impl AdagradPreconditioner {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            second_moment: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn update(&mut self, grad: &ArrayD<f64>, cfg: &PreconditionerConfig) -> Result<()> {
        if grad.shape() != self.second_moment.shape() {
            return Err(ShampooErr::ShapeMismatch {
                what: "block gradient".into(),
                got: grad.shape().to_vec(),
                expected: self.second_moment.shape().to_vec(),
            });
        }

        Zip::from(&mut self.second_moment)
            .and(grad)
            .for_each(|v, &g| *v = cfg.accumulate(*v, g * g));

        Ok(())
    }

    /// Computes `g / (sqrt(v / bias_correction) + epsilon)`.
    pub fn precondition(
        &self,
        grad: &ArrayD<f64>,
        cfg: &PreconditionerConfig,
        step: u64,
    ) -> ArrayD<f64> {
        let bias_correction = cfg.bias_correction(step);

        Zip::from(grad)
            .and(&self.second_moment)
            .map_collect(|&g, &v| g / ((v / bias_correction).sqrt() + cfg.epsilon))
    }

    pub fn len(&self) -> usize {
        self.second_moment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.second_moment.is_empty()
    }

    pub fn layout(&self) -> Vec<usize> {
        self.second_moment.shape().to_vec()
    }
}
