// src/estimation/taylor.rs
//! Taylor-series linearization: PSU layout and the with-replacement
//! stratified variance of score totals.

use std::collections::HashMap;

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SvyError};

// ============================================================================
// Enums & Config
// ============================================================================

/// Treatment of strata holding a single PSU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SingletonMethod {
    /// The stratum contributes nothing to the variance.
    #[default]
    Skip,
    /// The lone PSU total is centered on the grand mean of PSU totals.
    Center,
}

// ============================================================================
// PSU layout
// ============================================================================

fn index_categorical(col: &[Option<String>]) -> (Vec<u32>, u32) {
    let mut map: HashMap<&str, u32> = HashMap::new();
    let mut next_idx = 0u32;
    let indices: Vec<u32> = col
        .iter()
        .map(|opt| match opt {
            Some(s) => *map.entry(s.as_str()).or_insert_with(|| {
                let i = next_idx;
                next_idx += 1;
                i
            }),
            None => u32::MAX,
        })
        .collect();
    (indices, next_idx)
}

fn build_stratum_psu_map(strata_indices: &[u32], n_strata: u32, psu_indices: &[u32]) -> Vec<Vec<u32>> {
    let mut stratum_psus: Vec<Vec<u32>> = vec![Vec::new(); n_strata as usize];
    let mut seen = HashMap::new();
    for (&stratum, &psu) in strata_indices.iter().zip(psu_indices.iter()) {
        if stratum != u32::MAX && psu != u32::MAX && seen.insert(psu, stratum).is_none() {
            stratum_psus[stratum as usize].push(psu);
        }
    }
    stratum_psus
}

/// Row-to-PSU and PSU-to-stratum assignment of a linearization design.
///
/// Rows with `u32::MAX` (missing identifiers) take no part in the variance.
#[derive(Debug, Clone)]
pub struct PsuLayout {
    psu: Vec<u32>,
    n_psus: usize,
    psu_per_stratum: Vec<Vec<u32>>,
}

impl PsuLayout {
    /// `strata` absent: one stratum. `clusters` absent: every row is its own PSU.
    /// With `nested`, cluster labels are only meaningful within a stratum.
    pub fn new(
        strata: Option<&[Option<String>]>,
        clusters: Option<&[Option<String>]>,
        nested: bool,
        n_rows: usize,
    ) -> Result<Self> {
        let (strata_indices, n_strata) = match strata {
            Some(s) => index_categorical(s),
            None => (vec![0; n_rows], if n_rows > 0 { 1 } else { 0 }),
        };

        let (psu_indices, n_psus) = match clusters {
            None => {
                let idx: Vec<u32> = (0..n_rows as u32)
                    .map(|i| if strata_indices[i as usize] == u32::MAX { u32::MAX } else { i })
                    .collect();
                (idx, n_rows as u32)
            }
            Some(c) if nested => {
                let keyed: Vec<Option<String>> = c
                    .iter()
                    .zip(strata_indices.iter())
                    .map(|(id, &h)| match (id, h) {
                        (Some(id), h) if h != u32::MAX => Some(format!("{}\u{1f}{}", h, id)),
                        _ => None,
                    })
                    .collect();
                index_categorical(&keyed)
            }
            Some(c) => {
                let (idx, n) = index_categorical(c);
                let mut owner: HashMap<u32, u32> = HashMap::new();
                for (i, (&p, &h)) in idx.iter().zip(strata_indices.iter()).enumerate() {
                    if p == u32::MAX || h == u32::MAX {
                        continue;
                    }
                    if let Some(&prev) = owner.get(&p) {
                        if prev != h {
                            return Err(SvyError::config(format!(
                                "cluster '{}' appears in more than one stratum; set nested = true \
                                 if cluster labels are reused across strata",
                                c[i].as_deref().unwrap_or_default()
                            )));
                        }
                    } else {
                        owner.insert(p, h);
                    }
                }
                (idx, n)
            }
        };

        let psu: Vec<u32> = psu_indices
            .iter()
            .zip(strata_indices.iter())
            .map(|(&p, &h)| if h == u32::MAX { u32::MAX } else { p })
            .collect();
        let skipped = psu.iter().filter(|&&p| p == u32::MAX).count();
        if skipped > 0 {
            log::warn!("{} rows have a missing stratum or cluster and are left out of the variance", skipped);
        }
        let psu_per_stratum = build_stratum_psu_map(&strata_indices, n_strata, &psu);

        Ok(PsuLayout { psu, n_psus: n_psus as usize, psu_per_stratum })
    }

    pub fn n_psus(&self) -> usize {
        self.psu_per_stratum.iter().map(Vec::len).sum()
    }

    pub fn n_strata(&self) -> usize {
        self.psu_per_stratum.iter().filter(|p| !p.is_empty()).count()
    }

    /// Number of PSUs minus number of strata.
    pub fn degrees_of_freedom(&self) -> usize {
        self.n_psus().saturating_sub(self.n_strata())
    }

    pub fn singleton_strata(&self) -> usize {
        self.psu_per_stratum.iter().filter(|p| p.len() == 1).count()
    }
}

// ============================================================================
// Variance
// ============================================================================

/// `sum_h n_h/(n_h - 1) sum_j (t_hj - tbar_h)(t_hj - tbar_h)'` over score
/// columns, where `t_hj` are PSU totals of the n x k score matrix.
pub fn taylor_covariance(scores: ArrayView2<f64>, layout: &PsuLayout, singleton: SingletonMethod) -> Array2<f64> {
    let k = scores.ncols();
    let mut cov = Array2::zeros((k, k));
    if scores.nrows() == 0 || k == 0 {
        return cov;
    }

    let mut psu_totals = Array2::<f64>::zeros((layout.n_psus, k));
    for (row, &p) in scores.outer_iter().zip(layout.psu.iter()) {
        if p == u32::MAX {
            continue;
        }
        let mut t = psu_totals.row_mut(p as usize);
        t += &row;
    }

    let mut grand_mean = Array1::<f64>::zeros(k);
    if singleton == SingletonMethod::Center && layout.singleton_strata() > 0 {
        let used: Vec<u32> = layout.psu_per_stratum.iter().flatten().copied().collect();
        for &p in &used {
            grand_mean += &psu_totals.row(p as usize);
        }
        grand_mean /= used.len() as f64;
    }

    let mut accumulate = |d: &Array1<f64>, factor: f64| {
        for a in 0..k {
            for b in 0..k {
                cov[[a, b]] += factor * d[a] * d[b];
            }
        }
    };

    for psus in &layout.psu_per_stratum {
        let n_h = psus.len();
        if n_h == 0 {
            continue;
        }
        if n_h == 1 {
            if singleton == SingletonMethod::Center {
                let d = &psu_totals.row(psus[0] as usize) - &grand_mean;
                accumulate(&d, 1.0);
            }
            continue;
        }
        let mut mean_h = Array1::<f64>::zeros(k);
        for &p in psus {
            mean_h += &psu_totals.row(p as usize);
        }
        mean_h /= n_h as f64;
        let factor = n_h as f64 / (n_h as f64 - 1.0);
        for &p in psus {
            let d = &psu_totals.row(p as usize) - &mean_h;
            accumulate(&d, factor);
        }
    }
    cov
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayView1};

    fn variance(scores: ArrayView1<f64>, layout: &PsuLayout, singleton: SingletonMethod) -> f64 {
        taylor_covariance(scores.insert_axis(ndarray::Axis(1)), layout, singleton)[[0, 0]]
    }

    fn ids(v: &[&str]) -> Vec<Option<String>> {
        v.iter().map(|s| Some(s.to_string())).collect()
    }

    #[test]
    fn test_unstratified_rows_as_psus() {
        // scores 1,2,3,4: mean 2.5, sum sq dev 5, * 4/3
        let layout = PsuLayout::new(None, None, false, 4).unwrap();
        let v = variance(array![1.0, 2.0, 3.0, 4.0].view(), &layout, SingletonMethod::Skip);
        assert!((v - 20.0 / 3.0).abs() < 1e-12);
        assert_eq!(layout.degrees_of_freedom(), 3);
    }

    #[test]
    fn test_stratified_clusters() {
        let strata = ids(&["1", "1", "1", "2", "2", "2"]);
        let psu = ids(&["a", "a", "b", "c", "d", "d"]);
        let layout = PsuLayout::new(Some(&strata), Some(&psu), false, 6).unwrap();
        assert_eq!(layout.n_psus(), 4);
        assert_eq!(layout.degrees_of_freedom(), 2);

        // stratum 1: totals 3, 3 -> 0; stratum 2: totals 4, 11 -> 2 * 24.5 = 49
        let scores = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let v = variance(scores.view(), &layout, SingletonMethod::Skip);
        assert!((v - 49.0).abs() < 1e-12);
    }

    #[test]
    fn test_nested_relabels_within_strata() {
        let strata = ids(&["1", "1", "2", "2"]);
        let psu = ids(&["1", "2", "1", "2"]);
        assert!(matches!(
            PsuLayout::new(Some(&strata), Some(&psu), false, 4),
            Err(SvyError::Config(_))
        ));
        let layout = PsuLayout::new(Some(&strata), Some(&psu), true, 4).unwrap();
        assert_eq!(layout.n_psus(), 4);
        assert_eq!(layout.n_strata(), 2);
    }

    #[test]
    fn test_singleton_skip_and_center() {
        let strata = ids(&["1", "1", "2"]);
        let psu = ids(&["a", "b", "c"]);
        let layout = PsuLayout::new(Some(&strata), Some(&psu), false, 3).unwrap();
        let scores = array![1.0, 3.0, 8.0];

        let skip = variance(scores.view(), &layout, SingletonMethod::Skip);
        // stratum 1 only: 2 * ((1-2)^2 + (3-2)^2) = 4
        assert!((skip - 4.0).abs() < 1e-12);

        let center = variance(scores.view(), &layout, SingletonMethod::Center);
        // grand mean of PSU totals = 4, singleton adds (8-4)^2
        assert!((center - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_covariance_is_symmetric_and_matches_diagonal() {
        let layout = PsuLayout::new(None, None, false, 3).unwrap();
        let scores = array![[1.0, 0.5], [2.0, -1.0], [4.0, 0.0]];
        let cov = taylor_covariance(scores.view(), &layout, SingletonMethod::Skip);
        assert!((cov[[0, 1]] - cov[[1, 0]]).abs() < 1e-12);
        let v1 = variance(scores.column(1), &layout, SingletonMethod::Skip);
        assert!((cov[[1, 1]] - v1).abs() < 1e-12);
    }
}
