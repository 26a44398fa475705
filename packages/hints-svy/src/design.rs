// src/design.rs
//! Survey designs: a dataset bound to the metadata its variance estimator needs.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::{Result, SvyError};
use crate::estimation::replication::{covariance_from_replicates, RepMethod, VarianceCenter};
use crate::estimation::taylor::{taylor_covariance, PsuLayout, SingletonMethod};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateSpec {
    pub weight: String,
    pub replicate_weights: Vec<String>,
    #[serde(rename = "type", default = "ReplicateSpec::default_type")]
    pub rep_type: RepMethod,
    pub scale: f64,
    /// One multiplier per replicate column, paired by position.
    pub rscales: Vec<f64>,
    /// Center replicate deviations on the full-sample estimate.
    #[serde(default = "default_true")]
    pub mse: bool,
}

impl ReplicateSpec {
    fn default_type() -> RepMethod {
        RepMethod::JK1
    }

    /// JK1 design over `{prefix}1..{prefix}{n_reps}` with unit rscales.
    pub fn jackknife(weight: &str, prefix: &str, n_reps: usize, scale: f64) -> Self {
        ReplicateSpec {
            weight: weight.to_string(),
            replicate_weights: (1..=n_reps).map(|r| format!("{}{}", prefix, r)).collect(),
            rep_type: RepMethod::JK1,
            scale,
            rscales: vec![1.0; n_reps],
            mse: true,
        }
    }

    pub fn center(&self) -> VarianceCenter {
        VarianceCenter::from_mse(self.mse)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearizationSpec {
    pub weight: String,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub stratum: Option<String>,
    #[serde(default)]
    pub nested: bool,
    #[serde(default)]
    pub lonely_psu: SingletonMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VarianceMethod {
    #[serde(rename = "replicate")]
    ReplicateWeights(ReplicateSpec),
    Linearization(LinearizationSpec),
}

impl VarianceMethod {
    pub fn weight(&self) -> &str {
        match self {
            VarianceMethod::ReplicateWeights(r) => &r.weight,
            VarianceMethod::Linearization(l) => &l.weight,
        }
    }
}

#[derive(Debug, Clone)]
enum Resolved {
    Replicate { reps: Array2<f64> },
    Linearization { layout: PsuLayout },
}

/// Dataset plus resolved variance metadata. The dataset is never modified.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    data: Dataset,
    method: VarianceMethod,
    weights: Array1<f64>,
    resolved: Resolved,
}

fn weight_column(data: &Dataset, name: &str) -> Result<Array1<f64>> {
    let values = data.numeric(name)?;
    let mut out = Array1::zeros(values.len());
    for (i, v) in values.into_iter().enumerate() {
        match v {
            Some(w) if w >= 0.0 && w.is_finite() => out[i] = w,
            Some(w) => {
                return Err(SvyError::config(format!(
                    "weight column '{}' has invalid value {} at row {}",
                    name, w, i
                )))
            }
            None => {
                return Err(SvyError::config(format!(
                    "weight column '{}' is missing at row {}",
                    name, i
                )))
            }
        }
    }
    Ok(out)
}

fn id_column(data: &Dataset, name: &str, require_complete: bool) -> Result<Vec<Option<String>>> {
    let ids = data.text(name)?;
    if require_complete {
        if let Some(i) = ids.iter().position(Option::is_none) {
            return Err(SvyError::config(format!(
                "nested design requires '{}' to be fully populated; row {} is missing",
                name, i
            )));
        }
    }
    Ok(ids)
}

impl SurveyDesign {
    pub fn new(data: Dataset, method: VarianceMethod) -> Result<Self> {
        let weights = weight_column(&data, method.weight())?;
        let resolved = match &method {
            VarianceMethod::ReplicateWeights(spec) => {
                if spec.replicate_weights.is_empty() {
                    return Err(SvyError::config("replicate design lists no replicate weight columns"));
                }
                if spec.replicate_weights.len() != spec.rscales.len() {
                    return Err(SvyError::config(format!(
                        "{} replicate weight columns but {} rscales",
                        spec.replicate_weights.len(),
                        spec.rscales.len()
                    )));
                }
                if !(spec.scale > 0.0 && spec.scale.is_finite()) {
                    return Err(SvyError::config(format!("replicate scale must be positive, got {}", spec.scale)));
                }
                if spec.rscales.iter().any(|r| !(*r >= 0.0 && r.is_finite())) {
                    return Err(SvyError::config("rscales must be finite and non-negative"));
                }
                let mut reps = Array2::zeros((data.height(), spec.replicate_weights.len()));
                for (r, col) in spec.replicate_weights.iter().enumerate() {
                    reps.column_mut(r).assign(&weight_column(&data, col)?);
                }
                log::debug!(
                    "replicate design: {} rows, {} replicates ({:?}, scale {})",
                    data.height(),
                    spec.replicate_weights.len(),
                    spec.rep_type,
                    spec.scale
                );
                Resolved::Replicate { reps }
            }
            VarianceMethod::Linearization(spec) => {
                if spec.nested && (spec.cluster.is_none() || spec.stratum.is_none()) {
                    return Err(SvyError::config("a nested design needs both a cluster and a stratum column"));
                }
                let strata = spec
                    .stratum
                    .as_deref()
                    .map(|s| id_column(&data, s, spec.nested))
                    .transpose()?;
                let clusters = spec
                    .cluster
                    .as_deref()
                    .map(|c| id_column(&data, c, spec.nested))
                    .transpose()?;
                let layout = PsuLayout::new(strata.as_deref(), clusters.as_deref(), spec.nested, data.height())?;
                if layout.singleton_strata() > 0 {
                    log::warn!(
                        "{} strata hold a single PSU (lonely PSU handling: {:?})",
                        layout.singleton_strata(),
                        spec.lonely_psu
                    );
                }
                log::debug!(
                    "linearization design: {} rows, {} PSUs in {} strata",
                    data.height(),
                    layout.n_psus(),
                    layout.n_strata()
                );
                Resolved::Linearization { layout }
            }
        };
        Ok(SurveyDesign { data, method, weights, resolved })
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }

    pub fn method(&self) -> &VarianceMethod {
        &self.method
    }

    pub fn weights(&self) -> ArrayView1<f64> {
        self.weights.view()
    }

    pub fn n_replicates(&self) -> Option<usize> {
        match &self.resolved {
            Resolved::Replicate { reps } => Some(reps.ncols()),
            Resolved::Linearization { .. } => None,
        }
    }

    /// n x R replicate weights of a replicate design.
    pub fn replicate_weights(&self) -> Option<ArrayView2<f64>> {
        match &self.resolved {
            Resolved::Replicate { reps } => Some(reps.view()),
            Resolved::Linearization { .. } => None,
        }
    }

    /// Replicate: `R - 1`. Linearization: `#PSU - #strata`.
    pub fn degrees_of_freedom(&self) -> usize {
        match &self.resolved {
            Resolved::Replicate { reps } => reps.ncols().saturating_sub(1),
            Resolved::Linearization { layout } => layout.degrees_of_freedom(),
        }
    }

    /// Design covariance of a vector statistic.
    ///
    /// Replicate designs recompute `stat` under every replicate weight column;
    /// linearization designs take the n x k score matrix from `scores`. Only the
    /// closure matching the design's method is called.
    pub(crate) fn covariance<S, Z>(&self, theta_full: ArrayView1<f64>, mut stat: S, scores: Z) -> Result<Array2<f64>>
    where
        S: FnMut(ArrayView1<f64>) -> Result<Array1<f64>>,
        Z: FnOnce() -> Result<Array2<f64>>,
    {
        match (&self.resolved, &self.method) {
            (Resolved::Replicate { reps }, VarianceMethod::ReplicateWeights(spec)) => {
                let k = theta_full.len();
                let mut theta_reps = Array2::zeros((reps.ncols(), k));
                for (r, w) in reps.columns().into_iter().enumerate() {
                    let theta = stat(w)?;
                    theta_reps.row_mut(r).assign(&theta);
                }
                Ok(covariance_from_replicates(
                    spec.scale,
                    &spec.rscales,
                    theta_full,
                    theta_reps.view(),
                    spec.center(),
                ))
            }
            (Resolved::Linearization { layout }, VarianceMethod::Linearization(spec)) => {
                let s = scores()?;
                Ok(taylor_covariance(s.view(), layout, spec.lonely_psu))
            }
            _ => Err(SvyError::config("design metadata does not match its variance method")),
        }
    }
}
