use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::{FactorMatrix, PreconditionerConfig};
use crate::{
    error::{Result, ShampooErr},
    linalg::Exponent,
};

/// Kronecker factored preconditioner, one factor matrix per axis of the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShampooPreconditioner {
    factors: Vec<FactorMatrix>,
}

impl ShampooPreconditioner {
    /// Creates a new `ShampooPreconditioner`.
    ///
    /// # Arguments
    /// * `factors` - The factor of every axis, in axis order.
    ///
    /// # Returns
    /// A new `ShampooPreconditioner` instance.
    pub fn new(factors: impl IntoIterator<Item = FactorMatrix>) -> Self {
        Self {
            factors: factors.into_iter().collect(),
        }
    }

    pub fn factors(&self) -> &[FactorMatrix] {
        &self.factors
    }

    fn check_shape(&self, grad: &ArrayD<f64>) -> Result<()> {
        let expected: Vec<_> = self.factors.iter().map(FactorMatrix::dim).collect();
        if grad.shape() != expected.as_slice() {
            return Err(ShampooErr::ShapeMismatch {
                what: "block gradient".into(),
                got: grad.shape().to_vec(),
                expected,
            });
        }

        Ok(())
    }

    fn exponent(&self, cfg: &PreconditionerConfig) -> Exponent {
        Exponent::for_order(
            self.factors.len(),
            cfg.exponent_override,
            cfg.exponent_multiplier,
        )
    }

    pub fn update(&mut self, grad: &ArrayD<f64>, cfg: &PreconditionerConfig) -> Result<()> {
        self.check_shape(grad)?;

        for (axis, factor) in self.factors.iter_mut().enumerate() {
            factor.update(grad, axis, cfg)?;
        }

        Ok(())
    }

    /// Computes `R_0 · G ×_1 R_1 ×_2 ... ×_{k-1} R_{k-1}` with the cached roots.
    pub fn precondition(&self, grad: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.check_shape(grad)?;

        self.factors
            .iter()
            .enumerate()
            .try_fold(grad.clone(), |acc, (axis, factor)| factor.apply(acc, axis))
    }

    pub fn refresh_roots(&mut self, cfg: &PreconditionerConfig, step: u64) -> Result<Vec<f64>> {
        let exponent = self.exponent(cfg);
        let mut residuals = Vec::new();

        for factor in &mut self.factors {
            if let Some(residual) = factor.refresh_root(cfg, exponent, step)? {
                residuals.push(residual);
            }
        }

        Ok(residuals)
    }

    pub fn cost(&self) -> u64 {
        self.factors.iter().map(FactorMatrix::cost).sum()
    }

    pub fn root_len(&self) -> usize {
        self.factors.iter().map(FactorMatrix::root_len).sum()
    }

    pub fn write_roots(&self, out: &mut [f64]) {
        let mut offset = 0;
        for factor in &self.factors {
            let len = factor.root_len();
            factor.write_root(&mut out[offset..offset + len]);
            offset += len;
        }
    }

    pub fn read_roots(&mut self, src: &[f64]) {
        let mut offset = 0;
        for factor in &mut self.factors {
            let len = factor.root_len();
            factor.read_root(&src[offset..offset + len]);
            offset += len;
        }
    }

    pub fn len(&self) -> usize {
        self.factors.iter().map(|f| 2 * f.root_len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> Vec<Vec<usize>> {
        self.factors.iter().flat_map(FactorMatrix::layout).collect()
    }
}
