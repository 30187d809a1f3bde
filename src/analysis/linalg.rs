//! Dense solves for the analysis modules.
//!
//! Ensemble matrices live in `ndarray`; factorizations are done by
//! `nalgebra` and converted at the boundary.

use nalgebra::DMatrix;
use ndarray::Array2;

fn to_nalgebra(m: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| m[[i, j]])
}

fn from_nalgebra(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}

/// Solve `C X = B` for symmetric positive definite `C` (Cholesky).
pub(super) fn solve_spd(c: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>, String> {
    let not_spd = || "observation covariance is not positive definite".to_string();
    let factor = to_nalgebra(c).cholesky().ok_or_else(not_spd)?;
    // A zero pivot factors without error but cannot be solved against.
    if !factor.l_dirty().diagonal().iter().all(|d| d.is_finite() && *d > 0.0) {
        return Err(not_spd());
    }
    Ok(from_nalgebra(&factor.solve(&to_nalgebra(b))))
}

/// Solve `A X = B` for square `A` (LU with partial pivoting).
pub(super) fn solve(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>, String> {
    to_nalgebra(a)
        .lu()
        .solve(&to_nalgebra(b))
        .map(|x| from_nalgebra(&x))
        .ok_or_else(|| "matrix is singular".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_solve_spd() {
        let c = array![[4.0, 2.0], [2.0, 3.0]];
        let b = array![[2.0], [1.0]];
        let x = solve_spd(&c, &b).unwrap();
        let back = c.dot(&x);
        assert!((back[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((back[[1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_not_positive_definite() {
        assert!(solve_spd(&array![[0.0]], &array![[1.0]]).is_err());
        assert!(solve_spd(&array![[-1.0]], &array![[1.0]]).is_err());
    }

    #[test]
    fn test_general_solve() {
        let a = array![[0.0, 1.0], [2.0, 0.0]];
        let x = solve(&a, &array![[3.0], [4.0]]).unwrap();
        assert!((x[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((x[[1, 0]] - 3.0).abs() < 1e-12);
        assert!(solve(&array![[1.0, 2.0], [2.0, 4.0]], &array![[1.0], [1.0]]).is_err());
    }
}
