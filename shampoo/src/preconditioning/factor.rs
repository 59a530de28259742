use log::warn;
use ndarray::{Array1, Array2, ArrayD, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::PreconditionerConfig;
use crate::{
    error::{Result, ShampooErr},
    linalg::{Exponent, mode_product, relative_residual, unfold},
    specs::Precision,
};

/// The statistics of a single axis of a block and their cached inverse root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorMatrix {
    Full {
        statistics: Array2<f64>,
        inverse_root: Array2<f64>,
    },
    Diagonal {
        statistics: Array1<f64>,
        inverse_root: Array1<f64>,
    },
}

impl FactorMatrix {
    /// A `dim x dim` factor with zeroed statistics and an identity root.
    pub fn full(dim: usize) -> Self {
        Self::Full {
            statistics: Array2::zeros((dim, dim)),
            inverse_root: Array2::eye(dim),
        }
    }

    /// A factor that only keeps the diagonal of the statistics.
    pub fn diagonal(dim: usize) -> Self {
        Self::Diagonal {
            statistics: Array1::zeros(dim),
            inverse_root: Array1::ones(dim),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Full { statistics, .. } => statistics.nrows(),
            Self::Diagonal { statistics, .. } => statistics.len(),
        }
    }

    pub fn is_diagonal(&self) -> bool {
        matches!(self, Self::Diagonal { .. })
    }

    pub fn cost(&self) -> u64 {
        let d = self.dim() as u64;
        match self {
            Self::Full { .. } => d * d * d,
            Self::Diagonal { .. } => d,
        }
    }

    pub fn root_len(&self) -> usize {
        match self {
            Self::Full { inverse_root, .. } => inverse_root.len(),
            Self::Diagonal { inverse_root, .. } => inverse_root.len(),
        }
    }

    /// Accumulates the contraction of `grad` with itself over every axis but `axis`.
    pub fn update(
        &mut self,
        grad: &ArrayD<f64>,
        axis: usize,
        cfg: &PreconditionerConfig,
    ) -> Result<()> {
        let g = unfold(grad, axis)?;

        match self {
            Self::Full { statistics, .. } => {
                let outer = g.dot(&g.t());
                Zip::from(statistics)
                    .and(&outer)
                    .for_each(|s, &o| *s = cfg.accumulate(*s, o));
            }
            Self::Diagonal { statistics, .. } => {
                let squares = g.mapv(|x| x * x).sum_axis(Axis(1));
                Zip::from(statistics)
                    .and(&squares)
                    .for_each(|s, &o| *s = cfg.accumulate(*s, o));
            }
        }

        Ok(())
    }

    /// Recomputes the inverse root out of the current statistics.
    ///
    /// A failed root is retried in `f64` if it was computed in `f32` and the
    /// computation is protected. If it still fails, the previous root is kept
    /// when protected or when the newton iteration didn't converge.
    ///
    /// # Arguments
    /// * `cfg` - The preconditioner configuration.
    /// * `exponent` - The exponent of the block.
    /// * `step` - The current step, for bias correction.
    ///
    /// # Returns
    /// The relative residual of the new root, if in debug mode and a new root was computed.
    pub fn refresh_root(
        &mut self,
        cfg: &PreconditionerConfig,
        exponent: Exponent,
        step: u64,
    ) -> Result<Option<f64>> {
        let bias_correction = cfg.bias_correction(step);

        match self {
            Self::Full {
                statistics,
                inverse_root,
            } => {
                let factor = statistics.mapv(|x| x / bias_correction);
                let solver = cfg.solver;

                let result = match solver.compute_inverse_root(&factor, exponent) {
                    Err(e) if cfg.use_protected_eigh && solver.precision() == Precision::F32 => {
                        warn!("{e}, retrying the inverse root in f64");
                        solver
                            .with_precision(Precision::F64)?
                            .compute_inverse_root(&factor, exponent)
                    }
                    other => other,
                };

                match result {
                    Ok(root) => {
                        let residual = if cfg.debug_mode {
                            relative_residual(&factor, &root, exponent)
                                .inspect_err(|e| warn!("{e}, skipping the residual check"))
                                .ok()
                        } else {
                            None
                        };

                        *inverse_root = root;
                        Ok(residual)
                    }
                    Err(e)
                        if cfg.use_protected_eigh
                            || matches!(e, ShampooErr::NewtonNotConverged { .. }) =>
                    {
                        warn!("{e}, reusing the previous inverse root");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Self::Diagonal {
                statistics,
                inverse_root,
            } => {
                let alpha = exponent.alpha();
                let epsilon = cfg.epsilon;
                Zip::from(inverse_root).and(&*statistics).for_each(|r, &s| {
                    *r = (s / bias_correction).max(epsilon).powf(-alpha);
                });

                Ok(None)
            }
        }
    }

    /// Contracts `axis` of `t` with the inverse root.
    pub fn apply(&self, t: ArrayD<f64>, axis: usize) -> Result<ArrayD<f64>> {
        match self {
            Self::Full { inverse_root, .. } => mode_product(&t, inverse_root, axis),
            Self::Diagonal { inverse_root, .. } => {
                let mut t = t;
                for (mut lane, &r) in t.axis_iter_mut(Axis(axis)).zip(inverse_root) {
                    lane.mapv_inplace(|x| x * r);
                }

                Ok(t)
            }
        }
    }

    pub fn inverse_root(&self) -> ArrayD<f64> {
        match self {
            Self::Full { inverse_root, .. } => inverse_root.clone().into_dyn(),
            Self::Diagonal { inverse_root, .. } => inverse_root.clone().into_dyn(),
        }
    }

    pub fn statistics(&self) -> ArrayD<f64> {
        match self {
            Self::Full { statistics, .. } => statistics.clone().into_dyn(),
            Self::Diagonal { statistics, .. } => statistics.clone().into_dyn(),
        }
    }

    pub fn write_root(&self, out: &mut [f64]) {
        match self {
            Self::Full { inverse_root, .. } => {
                out.iter_mut().zip(inverse_root).for_each(|(o, &r)| *o = r)
            }
            Self::Diagonal { inverse_root, .. } => {
                out.iter_mut().zip(inverse_root).for_each(|(o, &r)| *o = r)
            }
        }
    }

    pub fn read_root(&mut self, src: &[f64]) {
        match self {
            Self::Full { inverse_root, .. } => {
                inverse_root.iter_mut().zip(src).for_each(|(r, &s)| *r = s)
            }
            Self::Diagonal { inverse_root, .. } => {
                inverse_root.iter_mut().zip(src).for_each(|(r, &s)| *r = s)
            }
        }
    }

    pub fn layout(&self) -> Vec<Vec<usize>> {
        match self {
            Self::Full {
                statistics,
                inverse_root,
            } => vec![statistics.shape().to_vec(), inverse_root.shape().to_vec()],
            Self::Diagonal {
                statistics,
                inverse_root,
            } => vec![statistics.shape().to_vec(), inverse_root.shape().to_vec()],
        }
    }
}
