use nalgebra::DMatrix;
use ndarray::{Array1, Array2};

use super::{Real, cast};
use crate::error::{Result, ShampooErr};

const ITERATIONS_PER_DIM: usize = 30;

/// The eigendecomposition of a symmetric matrix, `a = vectors * diag(values) * vectors^T`.
#[derive(Debug, Clone)]
pub struct Eigh<T> {
    pub values: Array1<T>,
    pub vectors: Array2<T>,
}

/// Diagonalizes a symmetric matrix.
///
/// The input is symmetrized first, so small asymmetries from accumulated
/// rounding don't matter.
///
/// # Arguments
/// * `a` - A square symmetric matrix.
///
/// # Returns
/// The eigenvalues (unsorted) and the orthonormal eigenvectors as columns.
pub fn eigh<T: Real>(a: &Array2<T>) -> Result<Eigh<T>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(ShampooErr::ShapeMismatch {
            what: "eigendecomposition input".into(),
            got: a.shape().to_vec(),
            expected: vec![n, n],
        });
    }

    if a.iter().any(|x| !x.is_finite()) {
        return Err(ShampooErr::NonFinite {
            what: "eigendecomposition input",
        });
    }

    if n == 0 {
        return Ok(Eigh {
            values: Array1::zeros(0),
            vectors: Array2::zeros((0, 0)),
        });
    }

    let half: T = cast(0.5);
    let symmetric = DMatrix::from_fn(n, n, |i, j| (a[[i, j]] + a[[j, i]]) * half);

    let max_iterations = ITERATIONS_PER_DIM * n;
    let (values, vectors) = T::symmetric_eigen(symmetric, max_iterations).ok_or(
        ShampooErr::EigenNotConverged {
            iterations: max_iterations,
        },
    )?;

    Ok(Eigh {
        values: values.iter().copied().collect(),
        vectors: Array2::from_shape_fn((n, n), |(i, j)| vectors[(i, j)]),
    })
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn reconstruct(e: &Eigh<f64>) -> Array2<f64> {
        (&e.vectors * &e.values).dot(&e.vectors.t())
    }

    fn sorted(values: &Array1<f64>) -> Vec<f64> {
        let mut values: Vec<f64> = values.to_vec();
        values.sort_by(|a, b| a.total_cmp(b));
        values
    }

    #[test]
    fn test_diagonal_matrix_keeps_its_entries() {
        let a: Array2<f64> = array![[3., 0.], [0., 1.]];
        let e = eigh(&a).unwrap();

        assert_eq!(sorted(&e.values), vec![1., 3.]);
        let diff = reconstruct(&e) - &a;
        assert!(diff.iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn test_reconstructs_symmetric_matrix() {
        let a: Array2<f64> = array![[4., 1., 0.5], [1., 3., 0.2], [0.5, 0.2, 2.]];
        let e = eigh(&a).unwrap();

        let diff = reconstruct(&e) - &a;
        assert!(diff.iter().all(|x| x.abs() < 1e-12));

        let gram = e.vectors.t().dot(&e.vectors);
        let diff = gram - Array2::<f64>::eye(3);
        assert!(diff.iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn test_rank_deficient_matrix() {
        let a: Array2<f64> = array![[1., 1.], [1., 1.]];
        let values = sorted(&eigh(&a).unwrap().values);

        assert!(values[0].abs() < 1e-12);
        assert!((values[1] - 2.).abs() < 1e-12);
    }

    #[test]
    fn test_single_precision() {
        let a: Array2<f32> = array![[2., 1.], [1., 2.]];
        let e = eigh(&a).unwrap();

        let mut values = e.values.to_vec();
        values.sort_by(|a, b| a.total_cmp(b));
        assert!((values[0] - 1.).abs() < 1e-5);
        assert!((values[1] - 3.).abs() < 1e-5);
    }

    #[test]
    fn test_empty_matrix() {
        let e = eigh(&Array2::<f64>::zeros((0, 0))).unwrap();
        assert!(e.values.is_empty());
    }

    #[test]
    fn test_rejects_non_finite() {
        let a: Array2<f64> = array![[1., f64::NAN], [f64::NAN, 1.]];
        assert!(matches!(eigh(&a), Err(ShampooErr::NonFinite { .. })));
    }
}
