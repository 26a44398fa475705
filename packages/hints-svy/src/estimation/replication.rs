// src/estimation/replication.rs
//! Replication-based variance estimation (JK1, JKn, BRR, Bootstrap, SDR)

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Replication method
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepMethod {
    JK1,
    JKn,
    BRR,
    Bootstrap,
    SDR,
}

/// Centering method for variance estimation
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum VarianceCenter {
    /// Center on full sample estimate (mse = TRUE)
    #[default]
    FullSample,
    /// Center on mean of replicate estimates
    ReplicateMean,
}

impl VarianceCenter {
    pub fn from_mse(mse: bool) -> Self {
        if mse {
            VarianceCenter::FullSample
        } else {
            VarianceCenter::ReplicateMean
        }
    }
}

/// `scale * sum_r rscale_r * (theta_r - center)(theta_r - center)'`
///
/// `theta_reps` is R x k (one row per replicate), paired with `rscales` by row.
pub fn covariance_from_replicates(
    scale: f64,
    rscales: &[f64],
    theta_full: ArrayView1<f64>,
    theta_reps: ArrayView2<f64>,
    center: VarianceCenter,
) -> Array2<f64> {
    let k = theta_full.len();
    let n_reps = theta_reps.nrows();
    let mut cov = Array2::zeros((k, k));
    if n_reps == 0 {
        return cov;
    }
    let c: Array1<f64> = match center {
        VarianceCenter::FullSample => theta_full.to_owned(),
        VarianceCenter::ReplicateMean => theta_reps.mean_axis(Axis(0)).unwrap_or_else(|| theta_full.to_owned()),
    };
    for (row, &rs) in theta_reps.outer_iter().zip(rscales.iter()) {
        let d = &row - &c;
        for a in 0..k {
            for b in 0..k {
                cov[[a, b]] += rs * d[a] * d[b];
            }
        }
    }
    cov * scale
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn variance(scale: f64, rscales: &[f64], full: f64, reps: &[f64], center: VarianceCenter) -> f64 {
        let reps = Array2::from_shape_vec((reps.len(), 1), reps.to_vec()).unwrap();
        covariance_from_replicates(scale, rscales, array![full].view(), reps.view(), center)[[0, 0]]
    }

    #[test]
    fn test_variance_full_sample_center() {
        // Var = 1.0 * ((98-105)^2 + (102-105)^2 + (99-105)^2 + (101-105)^2) = 110
        let var = variance(1.0, &[1.0; 4], 105.0, &[98.0, 102.0, 99.0, 101.0], VarianceCenter::FullSample);
        assert!((var - 110.0).abs() < 1e-10);
    }

    #[test]
    fn test_variance_replicate_mean_center() {
        // Mean of replicates = 100, Var = 4 + 4 + 1 + 1 = 10
        let var = variance(1.0, &[1.0; 4], 105.0, &[98.0, 102.0, 99.0, 101.0], VarianceCenter::ReplicateMean);
        assert!((var - 10.0).abs() < 1e-10);
        assert_eq!(VarianceCenter::from_mse(false), VarianceCenter::ReplicateMean);
    }

    #[test]
    fn test_variance_ignores_replicate_order() {
        let reps = [1.0, 4.0, 2.5, 3.0];
        let rscales = [0.5, 1.0, 2.0, 1.5];
        let a = variance(0.9, &rscales, 2.0, &reps, VarianceCenter::FullSample);

        let perm = [2, 0, 3, 1];
        let reps_p: Vec<f64> = perm.iter().map(|&i| reps[i]).collect();
        let rscales_p: Vec<f64> = perm.iter().map(|&i| rscales[i]).collect();
        let b = variance(0.9, &rscales_p, 2.0, &reps_p, VarianceCenter::FullSample);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn test_covariance_off_diagonal() {
        let full = array![1.0, 2.0];
        let reps = array![[1.5, 1.0], [0.5, 3.0], [1.0, 2.5]];
        let cov = covariance_from_replicates(2.0 / 3.0, &[1.0; 3], full.view(), reps.view(), VarianceCenter::FullSample);
        let v0 = variance(2.0 / 3.0, &[1.0; 3], 1.0, &[1.5, 0.5, 1.0], VarianceCenter::FullSample);
        assert!((cov[[0, 0]] - v0).abs() < 1e-12);
        // (0.5)(-1) + (-0.5)(1) + 0 = -1, scaled by 2/3
        assert!((cov[[0, 1]] + 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(cov[[0, 1]], cov[[1, 0]]);
    }

    #[test]
    fn test_rep_method_serde_names() {
        #[derive(Deserialize)]
        struct Holder {
            method: RepMethod,
        }
        let h: Holder = toml::from_str("method = \"brr\"").unwrap();
        assert_eq!(h.method, RepMethod::BRR);
    }
}
