use log::{debug, warn};
use ndarray::Array2;

use super::{Eigh, Real, cast, eigh, newton_inverse_root, spd_power};
use crate::{
    error::{Result, ShampooErr},
    specs::{NewtonFallback, Precision, RootInverseSpec, ShampooSpec},
};

/// The exponent of an inverse root, `R = A^{-multiplier / root}`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exponent {
    pub root: u32,
    pub multiplier: f64,
}

impl Exponent {
    /// The exponent for a block with `order` axes.
    ///
    /// # Arguments
    /// * `order` - The amount of axes of the block.
    /// * `override_root` - If not zero, used as the root instead of `2 * order`.
    /// * `multiplier` - The multiplicative correction of the exponent.
    pub fn for_order(order: usize, override_root: u32, multiplier: f64) -> Self {
        let root = if override_root == 0 {
            2 * order as u32
        } else {
            override_root
        };

        Self { root, multiplier }
    }

    /// The real valued power `multiplier / root`.
    pub fn alpha(&self) -> f64 {
        self.multiplier / self.root as f64
    }
}

/// The closed set of root computation methods.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RootMethod {
    Eigen,
    Newton {
        max_iterations: usize,
        tolerance: f64,
        fallback: NewtonFallback,
    },
}

/// Computes inverse matrix roots of factor matrices.
#[derive(Debug, Clone, Copy)]
pub struct RootSolver {
    method: RootMethod,
    epsilon: f64,
    precision: Precision,
}

impl RootSolver {
    /// Creates a new `RootSolver`.
    ///
    /// # Arguments
    /// * `method` - The root computation method.
    /// * `epsilon` - The eigenvalue floor, or the ridge for the newton method.
    /// * `precision` - Either `F32` or `F64`, the precision the root is computed in.
    ///
    /// # Returns
    /// A new `RootSolver` or an error if roots can't be computed at `precision`.
    pub fn new(method: RootMethod, epsilon: f64, precision: Precision) -> Result<Self> {
        if !precision.supports_roots() {
            return Err(ShampooErr::invalid(
                "root_inverse_precision",
                format!("roots can't be computed in {precision:?}"),
            ));
        }

        Ok(Self {
            method,
            epsilon,
            precision,
        })
    }

    /// Creates a `RootSolver` out of the optimizer's specification.
    pub fn from_spec(spec: &ShampooSpec) -> Result<Self> {
        let method = match spec.root_inverse_method {
            RootInverseSpec::Eigen => RootMethod::Eigen,
            RootInverseSpec::Newton => RootMethod::Newton {
                max_iterations: spec.newton.max_iterations,
                tolerance: spec.newton.tolerance,
                fallback: spec.newton.fallback,
            },
        };

        Self::new(method, spec.epsilon, spec.root_inverse_precision)
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// This same solver, computing at a different precision.
    pub fn with_precision(self, precision: Precision) -> Result<Self> {
        Self::new(self.method, self.epsilon, precision)
    }

    /// Computes the inverse root of a factor matrix.
    ///
    /// # Arguments
    /// * `factor` - A symmetric positive semidefinite matrix.
    /// * `exponent` - The exponent of the root.
    ///
    /// # Returns
    /// `factor^{-alpha}`, or an error if the method failed and had no fallback.
    pub fn compute_inverse_root(
        &self,
        factor: &Array2<f64>,
        exponent: Exponent,
    ) -> Result<Array2<f64>> {
        match self.precision {
            Precision::F64 => self.solve(factor, exponent),
            _ => {
                let narrow = factor.mapv(|x| x as f32);
                let root = self.solve(&narrow, exponent)?;
                Ok(root.mapv(f64::from))
            }
        }
    }

    fn solve<T: Real>(&self, factor: &Array2<T>, exponent: Exponent) -> Result<Array2<T>> {
        let epsilon: T = cast(self.epsilon);

        match self.method {
            RootMethod::Eigen => eigen_inverse_root(factor, exponent, epsilon),
            RootMethod::Newton {
                max_iterations,
                tolerance,
                fallback,
            } => {
                let result = newton_inverse_root(
                    factor,
                    exponent.root,
                    epsilon,
                    max_iterations,
                    cast(tolerance),
                );

                match (result, fallback) {
                    (Ok(root), _) => Ok(root),
                    (Err(e), NewtonFallback::Eigen) => {
                        warn!("{e}, falling back to the eigendecomposition");
                        eigen_inverse_root(factor, exponent, epsilon)
                    }
                    (Err(e), NewtonFallback::ReusePrevious) => Err(e),
                }
            }
        }
    }
}

/// Computes `U diag(max(λ, ε)^{-alpha}) U^T` out of the eigendecomposition of `factor`.
fn eigen_inverse_root<T: Real>(
    factor: &Array2<T>,
    exponent: Exponent,
    epsilon: T,
) -> Result<Array2<T>> {
    let Eigh { values, vectors } = eigh(factor)?;
    let alpha: T = cast(-exponent.alpha());

    let mut clamped = 0usize;
    let scaled = values.mapv(|l| {
        let l = if l < epsilon {
            clamped += 1;
            epsilon
        } else {
            l
        };
        l.powf(alpha)
    });

    if clamped > 0 {
        debug!(clamped = clamped, size = factor.nrows(); "applied the eigenvalue floor");
    }

    Ok((&vectors * &scaled).dot(&vectors.t()))
}

/// The relative error `‖R^{-1/alpha} - A‖_∞ / ‖A‖_∞` of an inverse root.
///
/// # Arguments
/// * `factor` - The matrix `A`.
/// * `root` - The computed inverse root `R`.
/// * `exponent` - The exponent `R` was computed with.
///
/// # Returns
/// The relative residual.
pub fn relative_residual(
    factor: &Array2<f64>,
    root: &Array2<f64>,
    exponent: Exponent,
) -> Result<f64> {
    let reconstructed = spd_power(root, -1. / exponent.alpha())?;
    let norm = super::max_abs(factor);
    let error = super::max_abs(&(reconstructed - factor));

    Ok(if norm > 0. { error / norm } else { error })
}
