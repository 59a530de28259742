mod eigen;
mod newton;
mod root;

use std::fmt::{Debug, Display};

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::{Array2, ArrayD, Axis, IxDyn, LinalgScalar, ScalarOperand};
use num_traits::Float;

use crate::error::{Result, ShampooErr};

pub use eigen::{Eigh, eigh};
pub use newton::newton_inverse_root;
pub use root::{Exponent, RootMethod, RootSolver, relative_residual};

/// The floating point types the root solvers can run on.
pub trait Real: Float + LinalgScalar + ScalarOperand + Debug + Display + Send + Sync {
    /// Diagonalizes a symmetric matrix, `None` if it didn't converge within `max_iterations`.
    fn symmetric_eigen(
        m: DMatrix<Self>,
        max_iterations: usize,
    ) -> Option<(DVector<Self>, DMatrix<Self>)>;
}

macro_rules! impl_real {
    ($($t:ty),*) => {
        $(
            impl Real for $t {
                fn symmetric_eigen(
                    m: DMatrix<Self>,
                    max_iterations: usize,
                ) -> Option<(DVector<Self>, DMatrix<Self>)> {
                    SymmetricEigen::try_new(m, <$t>::EPSILON, max_iterations)
                        .map(|e| (e.eigenvalues, e.eigenvectors))
                }
            }
        )*
    };
}

impl_real!(f32, f64);

/// Converts an `f64` constant into `T`.
pub(crate) fn cast<T: Real>(x: f64) -> T {
    T::from(x).unwrap_or_else(T::nan)
}

/// The frobenius norm of any array.
pub fn frobenius<T: Real, D: ndarray::Dimension>(a: &ndarray::Array<T, D>) -> T {
    a.iter().fold(T::zero(), |acc, &x| acc + x * x).sqrt()
}

/// The largest absolute entry of `a`, or zero if it's empty.
pub fn max_abs<T: Real>(a: &Array2<T>) -> T {
    a.iter().fold(T::zero(), |acc, &x| acc.max(x.abs()))
}

/// Raises a square matrix to a non negative integer power by repeated squaring.
pub fn matrix_power<T: Real>(a: &Array2<T>, mut p: u32) -> Array2<T> {
    let mut result = Array2::eye(a.nrows());
    let mut base = a.clone();

    while p > 0 {
        if p & 1 == 1 {
            result = result.dot(&base);
        }

        p >>= 1;
        if p > 0 {
            base = base.dot(&base);
        }
    }

    result
}

/// Raises a symmetric positive definite matrix to a real power through its eigendecomposition.
///
/// # Arguments
/// * `a` - The matrix.
/// * `exponent` - The power, may be negative.
///
/// # Returns
/// `a^exponent` or an error if the decomposition fails.
pub fn spd_power(a: &Array2<f64>, exponent: f64) -> Result<Array2<f64>> {
    let Eigh { values, vectors } = eigh(a)?;
    let scaled = &vectors * &values.mapv(|l| l.powf(exponent));
    Ok(scaled.dot(&vectors.t()))
}

/// Flattens every axis except `axis` of `t`, leaving `axis` as the rows.
///
/// # Arguments
/// * `t` - The tensor to unfold.
/// * `axis` - The axis that becomes the rows.
///
/// # Returns
/// A `(t.shape[axis], rest)` matrix.
pub fn unfold(t: &ArrayD<f64>, axis: usize) -> Result<Array2<f64>> {
    let rows = t.len_of(Axis(axis));
    let cols = if rows == 0 { 0 } else { t.len() / rows };

    let mut order: Vec<usize> = (0..t.ndim()).collect();
    order.remove(axis);
    order.insert(0, axis);

    let moved = t.view().permuted_axes(IxDyn(&order));
    Ok(moved.to_shape((rows, cols))?.into_owned())
}

/// Computes the mode product `t ×_axis m`, contracting `axis` of `t` with the columns of `m`.
///
/// # Arguments
/// * `t` - The tensor.
/// * `m` - A square matrix with as many rows as `t` has entries along `axis`.
/// * `axis` - The axis to contract.
///
/// # Returns
/// A tensor shaped like `t`.
pub fn mode_product(t: &ArrayD<f64>, m: &Array2<f64>, axis: usize) -> Result<ArrayD<f64>> {
    let rows = t.len_of(Axis(axis));
    if m.dim() != (rows, rows) {
        return Err(ShampooErr::ShapeMismatch {
            what: format!("inverse root for axis {axis}"),
            got: m.shape().to_vec(),
            expected: vec![rows, rows],
        });
    }

    let product = m.dot(&unfold(t, axis)?);

    let mut moved_shape = t.shape().to_vec();
    let dim = moved_shape.remove(axis);
    moved_shape.insert(0, dim);

    let mut inverse: Vec<usize> = (1..t.ndim()).collect();
    inverse.insert(axis, 0);

    let folded = product.into_shape_with_order(IxDyn(&moved_shape))?;
    Ok(folded
        .permuted_axes(IxDyn(&inverse))
        .as_standard_layout()
        .into_owned())
}
