use ndarray::Array2;

use super::{Real, cast, frobenius, matrix_power, max_abs};
use crate::error::{Result, ShampooErr};

/// Computes `(a + εI)^{-1/p}` with the coupled newton iteration.
///
/// Starting from `X = z^{1/p} I` and `M = z (a + εI)` with `z = (1 + p) / (2 ‖a + εI‖_F)`,
/// every iteration sets `T = ((p + 1) I - M) / p`, `X = X T` and `M = T^p M`. `M`
/// converges to the identity and `X` to the inverse root.
///
/// # Arguments
/// * `a` - A symmetric positive semidefinite matrix.
/// * `root` - The root `p`.
/// * `epsilon` - The ridge added to the diagonal.
/// * `max_iterations` - The iteration budget.
/// * `tolerance` - The largest accepted entry of `|M - I|`.
///
/// # Returns
/// The inverse root, or an error if the residual didn't reach `tolerance`.
pub fn newton_inverse_root<T: Real>(
    a: &Array2<T>,
    root: u32,
    epsilon: T,
    max_iterations: usize,
    tolerance: T,
) -> Result<Array2<T>> {
    let n = a.nrows();
    let identity = Array2::<T>::eye(n);
    let p: T = cast(root as f64);
    let one = T::one();

    let ridged = a + &identity.mapv(|x| x * epsilon);
    if ridged.iter().any(|x| !x.is_finite()) {
        return Err(ShampooErr::NonFinite {
            what: "newton iteration input",
        });
    }

    let z = (p + one) / (cast::<T>(2.) * frobenius(&ridged));
    let mut x = identity.mapv(|e| e * z.powf(one / p));
    let mut m = ridged.mapv(|e| e * z);
    let mut residual = max_abs(&(&m - &identity));
    let mut iterations = 0;

    while residual > tolerance && iterations < max_iterations {
        let t = (identity.mapv(|e| e * (p + one)) - &m).mapv(|e| e / p);
        x = x.dot(&t);
        m = matrix_power(&t, root).dot(&m);
        residual = max_abs(&(&m - &identity));
        iterations += 1;

        if !residual.is_finite() {
            return Err(ShampooErr::NonFinite {
                what: "newton iteration",
            });
        }
    }

    if residual > tolerance {
        return Err(ShampooErr::NewtonNotConverged {
            iterations,
            residual: residual.to_f64().unwrap_or(f64::NAN),
        });
    }

    Ok(x)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_inverse_square_root_of_diagonal() {
        let a: Array2<f64> = array![[4., 0.], [0., 9.]];
        let x = newton_inverse_root(&a, 2, 0., 100, 1e-12).unwrap();

        assert!((x[[0, 0]] - 0.5).abs() < 1e-10);
        assert!((x[[1, 1]] - 1. / 3.).abs() < 1e-10);
        assert!(x[[0, 1]].abs() < 1e-10);
    }

    #[test]
    fn test_fourth_root_matches_definition() {
        let a: Array2<f64> = array![[2., 0.5], [0.5, 1.]];
        let x = newton_inverse_root(&a, 4, 0., 100, 1e-12).unwrap();

        let check = matrix_power(&x, 4).dot(&a);
        let diff = check - Array2::<f64>::eye(2);
        assert!(diff.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_iteration_budget_is_reported() {
        let a: Array2<f64> = array![[1e3, 0.], [0., 1e-3]];
        let result = newton_inverse_root(&a, 2, 0., 1, 1e-12);

        assert!(matches!(
            result,
            Err(ShampooErr::NewtonNotConverged { iterations: 1, .. })
        ));
    }
}
