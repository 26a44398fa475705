// src/linalg.rs
//! Small dense solvers for the normal equations and design-effect matrices.

use ndarray::{Array1, Array2, ArrayView2};

const PIVOT_TOL: f64 = 1e-12;

/// Solves `A X = B` by Gaussian elimination with partial pivoting.
/// Returns `None` when `A` is singular to working precision.
pub fn solve(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.nrows() != n {
        return None;
    }
    let m = b.ncols();
    let scale = a.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if n == 0 {
        return Some(Array2::zeros((0, m)));
    }
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }

    // Augmented matrix [A|B]
    let mut aug = Array2::zeros((n, n + m));
    aug.slice_mut(ndarray::s![.., ..n]).assign(&a);
    aug.slice_mut(ndarray::s![.., n..]).assign(&b);

    for k in 0..n {
        let mut max_val = aug[[k, k]].abs();
        let mut max_row = k;
        for i in (k + 1)..n {
            let val = aug[[i, k]].abs();
            if val > max_val {
                max_val = val;
                max_row = i;
            }
        }
        if max_val < PIVOT_TOL * scale {
            return None;
        }
        if max_row != k {
            for j in 0..(n + m) {
                aug.swap([k, j], [max_row, j]);
            }
        }
        for i in (k + 1)..n {
            let factor = aug[[i, k]] / aug[[k, k]];
            if factor == 0.0 {
                continue;
            }
            for j in k..(n + m) {
                aug[[i, j]] -= factor * aug[[k, j]];
            }
        }
    }

    // Back substitution
    let mut x = Array2::zeros((n, m));
    for c in 0..m {
        for i in (0..n).rev() {
            let mut sum = aug[[i, n + c]];
            for j in (i + 1)..n {
                sum -= aug[[i, j]] * x[[j, c]];
            }
            x[[i, c]] = sum / aug[[i, i]];
        }
    }
    Some(x)
}

pub fn solve_vector(a: ArrayView2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let col = b.view().insert_axis(ndarray::Axis(1));
    solve(a, col).map(|x| x.column(0).to_owned())
}

pub fn invert(a: ArrayView2<f64>) -> Option<Array2<f64>> {
    solve(a, Array2::eye(a.nrows()).view())
}

pub fn trace(a: ArrayView2<f64>) -> f64 {
    a.diag().sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_solve_needs_pivoting() {
        let a = array![[0.0, 2.0], [3.0, 1.0]];
        let b = array![4.0, 5.0];
        let x = solve_vector(a.view(), &b).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invert_roundtrip() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let inv = invert(a.view()).unwrap();
        let id = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(id[[i, j]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_singular_is_none() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(invert(a.view()).is_none());
        assert!(invert(Array2::<f64>::zeros((2, 2)).view()).is_none());
    }

    #[test]
    fn test_trace() {
        assert_eq!(trace(array![[1.0, 9.0], [9.0, 2.5]].view()), 3.5);
    }
}
