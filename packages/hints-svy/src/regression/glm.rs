// src/regression/glm.rs
//! Survey-weighted generalized linear models.
//!
//! Coefficients solve the weighted score equations by iteratively reweighted
//! least squares on prior weights normalized to mean one. Their covariance is
//! design-based: replicate refits for replicate-weight designs, the sandwich
//! `A^-1 V(U) A^-1` for linearization designs.

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::design::SurveyDesign;
use crate::distributions::{normal_quantile, t_quantile, t_two_sided_p};
use crate::error::{Result, SvyError};
use crate::linalg::{invert, solve_vector};
use crate::regression::formula::Formula;
use crate::regression::model_matrix::{build, ModelFrame, ResponseKind};

const ETA_BOUND: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Logit link, variance mu(1 - mu), free dispersion.
    QuasiBinomial,
    /// Identity link, constant variance.
    Gaussian,
}

impl Family {
    fn response_kind(self) -> ResponseKind {
        match self {
            Family::QuasiBinomial => ResponseKind::Binary,
            Family::Gaussian => ResponseKind::Continuous,
        }
    }

    fn linkinv(self, eta: f64) -> f64 {
        match self {
            Family::QuasiBinomial => 1.0 / (1.0 + (-eta.clamp(-ETA_BOUND, ETA_BOUND)).exp()),
            Family::Gaussian => eta,
        }
    }

    fn link(self, mu: f64) -> f64 {
        match self {
            Family::QuasiBinomial => (mu / (1.0 - mu)).ln(),
            Family::Gaussian => mu,
        }
    }

    /// d mu / d eta
    fn mu_eta(self, mu: f64) -> f64 {
        match self {
            Family::QuasiBinomial => (mu * (1.0 - mu)).max(f64::EPSILON),
            Family::Gaussian => 1.0,
        }
    }

    fn variance(self, mu: f64) -> f64 {
        match self {
            Family::QuasiBinomial => (mu * (1.0 - mu)).max(f64::EPSILON),
            Family::Gaussian => 1.0,
        }
    }

    fn unit_deviance(self, y: f64, mu: f64) -> f64 {
        match self {
            Family::QuasiBinomial => {
                let ylogy = |a: f64, b: f64| if a > 0.0 { a * (a / b).ln() } else { 0.0 };
                2.0 * (ylogy(y, mu) + ylogy(1.0 - y, 1.0 - mu))
            }
            Family::Gaussian => (y - mu).powi(2),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::QuasiBinomial => write!(f, "quasibinomial(logit)"),
            Family::Gaussian => write!(f, "gaussian(identity)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlmOptions {
    pub max_iter: usize,
    pub tol: f64,
    pub start: Option<Vec<f64>>,
}

impl Default for GlmOptions {
    fn default() -> Self {
        GlmOptions { max_iter: 25, tol: 1e-8, start: None }
    }
}

// ============================================================================
// IRLS
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct IrlsFit {
    pub beta: Array1<f64>,
    pub mu: Array1<f64>,
    pub deviance: f64,
    pub iterations: usize,
    /// Inverse of X'WX at the solution.
    pub xtwx_inv: Array2<f64>,
}

fn normalized(w: ArrayView1<f64>) -> Array1<f64> {
    let positive: Vec<f64> = w.iter().copied().filter(|&v| v > 0.0).collect();
    if positive.is_empty() {
        return w.to_owned();
    }
    let mean = positive.iter().sum::<f64>() / positive.len() as f64;
    w.mapv(|v| v / mean)
}

fn deviance(family: Family, y: ArrayView1<f64>, mu: &Array1<f64>, w: &Array1<f64>) -> f64 {
    (0..y.len())
        .filter(|&i| w[i] > 0.0)
        .map(|i| w[i] * family.unit_deviance(y[i], mu[i]))
        .sum()
}

fn weighted_normal_equations(
    x: ArrayView2<f64>,
    w: &Array1<f64>,
    z: Option<&Array1<f64>>,
) -> (Array2<f64>, Array1<f64>) {
    let p = x.ncols();
    let mut xtwx = Array2::zeros((p, p));
    let mut xtwz = Array1::zeros(p);
    for (i, row) in x.outer_iter().enumerate() {
        let wi = w[i];
        if wi <= 0.0 {
            continue;
        }
        for a in 0..p {
            let xa = row[a] * wi;
            if xa == 0.0 {
                continue;
            }
            for b in 0..p {
                xtwx[[a, b]] += xa * row[b];
            }
            if let Some(z) = z {
                xtwz[a] += xa * z[i];
            }
        }
    }
    (xtwx, xtwz)
}

fn rank_deficient() -> SvyError {
    SvyError::config("model matrix is rank deficient (collinear predictors or an empty factor level)")
}

pub(crate) fn irls(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior: ArrayView1<f64>,
    family: Family,
    opts: &GlmOptions,
    start: Option<&Array1<f64>>,
) -> Result<IrlsFit> {
    let w = normalized(prior);
    let n = x.nrows();

    let mut eta: Array1<f64> = match start {
        Some(beta) => x.dot(beta),
        None => Array1::from_iter((0..n).map(|i| match family {
            Family::QuasiBinomial => family.link((w[i] * y[i] + 0.5) / (w[i] + 1.0)),
            Family::Gaussian => y[i],
        })),
    };
    let mut mu = eta.mapv(|e| family.linkinv(e));
    let mut dev_old = deviance(family, y, &mu, &w);
    let mut delta = f64::INFINITY;

    for iter in 1..=opts.max_iter {
        let mut working = Array1::zeros(n);
        let mut z = Array1::zeros(n);
        for i in 0..n {
            let d = family.mu_eta(mu[i]);
            z[i] = eta[i] + (y[i] - mu[i]) / d;
            working[i] = w[i] * d * d / family.variance(mu[i]);
        }
        let (xtwx, xtwz) = weighted_normal_equations(x, &working, Some(&z));
        let beta = solve_vector(xtwx.view(), &xtwz).ok_or_else(rank_deficient)?;
        eta = x.dot(&beta);
        mu = eta.mapv(|e| family.linkinv(e));
        let dev = deviance(family, y, &mu, &w);
        if !dev.is_finite() {
            return Err(SvyError::Convergence { iterations: iter, delta: f64::NAN });
        }
        delta = (dev - dev_old).abs() / (dev.abs() + 0.1);
        log::debug!("IRLS iteration {}: deviance {:.6}, relative change {:.3e}", iter, dev, delta);
        if delta < opts.tol {
            let mut working = Array1::zeros(n);
            for i in 0..n {
                let d = family.mu_eta(mu[i]);
                working[i] = w[i] * d * d / family.variance(mu[i]);
            }
            let (xtwx, _) = weighted_normal_equations(x, &working, None);
            let xtwx_inv = invert(xtwx.view()).ok_or_else(rank_deficient)?;
            return Ok(IrlsFit { beta, mu, deviance: dev, iterations: iter, xtwx_inv });
        }
        dev_old = dev;
    }
    Err(SvyError::Convergence { iterations: opts.max_iter, delta })
}

// ============================================================================
// Fitted model
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ConfInt {
    pub term: String,
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone)]
pub struct GlmFit {
    pub formula: String,
    pub family: Family,
    pub terms: Vec<String>,
    pub coefficients: Array1<f64>,
    pub cov: Array2<f64>,
    pub df_resid: f64,
    pub deviance: f64,
    pub null_deviance: f64,
    pub dispersion: f64,
    pub iterations: usize,
    pub n_obs: usize,
}

impl GlmFit {
    pub fn std_errors(&self) -> Array1<f64> {
        self.cov.diag().mapv(|v| v.max(0.0).sqrt())
    }

    pub fn t_values(&self) -> Array1<f64> {
        &self.coefficients / &self.std_errors()
    }

    pub fn p_values(&self) -> Array1<f64> {
        let df = self.df_resid;
        self.t_values().mapv(|t| if df > 0.0 { t_two_sided_p(t, df) } else { f64::NAN })
    }

    /// Estimate and standard error of a named term.
    pub fn coefficient(&self, term: &str) -> Option<(f64, f64)> {
        let k = self.terms.iter().position(|t| t == term)?;
        Some((self.coefficients[k], self.cov[[k, k]].max(0.0).sqrt()))
    }

    /// Wald intervals on t quantiles with the residual df (normal quantiles
    /// when no residual df remain). With `exponentiate`, logit fits report odds
    /// ratios; gaussian fits stay on the raw scale.
    pub fn confint(&self, level: f64, exponentiate: bool) -> Result<Vec<ConfInt>> {
        if !(level > 0.0 && level < 1.0) {
            return Err(SvyError::config(format!("confidence level must be in (0, 1), got {}", level)));
        }
        let transform = exponentiate && self.family == Family::QuasiBinomial;
        if exponentiate && !transform {
            log::warn!("exponentiate requested for a {} model; reporting the raw scale", self.family);
        }
        let upper_p = 1.0 - (1.0 - level) / 2.0;
        let z = if self.df_resid > 0.0 { t_quantile(upper_p, self.df_resid) } else { normal_quantile(upper_p) };
        let se = self.std_errors();
        Ok(self
            .terms
            .iter()
            .enumerate()
            .map(|(k, term)| {
                let b = self.coefficients[k];
                let (est, lo, hi) = (b, b - z * se[k], b + z * se[k]);
                let (est, lower, upper) = if transform { (est.exp(), lo.exp(), hi.exp()) } else { (est, lo, hi) };
                ConfInt { term: term.clone(), estimate: est, lower, upper }
            })
            .collect())
    }

    pub fn to_frame(&self) -> Result<DataFrame> {
        let frame = df![
            "term" => self.terms.clone(),
            "estimate" => self.coefficients.to_vec(),
            "std_error" => self.std_errors().to_vec(),
            "t_value" => self.t_values().to_vec(),
            "p_value" => self.p_values().to_vec(),
        ]?;
        Ok(frame)
    }

    pub fn confint_frame(&self, level: f64, exponentiate: bool) -> Result<DataFrame> {
        let ci = self.confint(level, exponentiate)?;
        let frame = df![
            "term" => ci.iter().map(|c| c.term.clone()).collect::<Vec<_>>(),
            "estimate" => ci.iter().map(|c| c.estimate).collect::<Vec<_>>(),
            "lower" => ci.iter().map(|c| c.lower).collect::<Vec<_>>(),
            "upper" => ci.iter().map(|c| c.upper).collect::<Vec<_>>(),
        ]?;
        Ok(frame)
    }
}

impl fmt::Display for GlmFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "svyglm: {}  family {}", self.formula, self.family)?;
        writeln!(
            f,
            "n = {}, residual df = {}, deviance = {:.4} (null {:.4}), dispersion = {:.4}, iterations = {}",
            self.n_obs, self.df_resid, self.deviance, self.null_deviance, self.dispersion, self.iterations
        )
    }
}

// ============================================================================
// Fitting
// ============================================================================

fn masked(w: ArrayView1<f64>, mf: &ModelFrame) -> Array1<f64> {
    Array1::from_iter(w.iter().zip(mf.included.iter()).map(|(&w, &inc)| if inc { w } else { 0.0 }))
}

fn null_deviance(mf: &ModelFrame, family: Family, w: &Array1<f64>, intercept: bool) -> f64 {
    let wn = normalized(w.view());
    let mu0 = if intercept {
        let sw: f64 = wn.sum();
        let swy: f64 = wn.iter().zip(mf.y.iter()).map(|(a, b)| a * b).sum();
        if sw > 0.0 {
            swy / sw
        } else {
            f64::NAN
        }
    } else {
        family.linkinv(0.0)
    };
    deviance(family, mf.y.view(), &Array1::from_elem(mf.y.len(), mu0), &wn)
}

/// Fits `formula` over the rows of `design` with complete data.
pub fn svyglm(design: &SurveyDesign, formula: &str, family: Family, opts: &GlmOptions) -> Result<GlmFit> {
    let parsed: Formula = formula.parse()?;
    let mf = build(design.data(), &parsed, family.response_kind())?;
    let p = mf.names.len();
    if mf.n_included() <= p {
        return Err(SvyError::config(format!(
            "'{}' has {} complete rows for {} coefficients",
            formula,
            mf.n_included(),
            p
        )));
    }
    let start = match &opts.start {
        Some(s) if s.len() != p => {
            return Err(SvyError::config(format!(
                "{} starting values given for {} coefficients",
                s.len(),
                p
            )))
        }
        Some(s) => Some(Array1::from_vec(s.clone())),
        None => None,
    };

    let w = masked(design.weights(), &mf);
    let fit = irls(mf.x.view(), mf.y.view(), w.view(), family, opts, start.as_ref())?;
    log::info!("Fitted '{}' ({}) in {} iterations", formula, family, fit.iterations);

    let wn = normalized(w.view());
    let x = mf.x.view();
    let cov = design.covariance(
        fit.beta.view(),
        |rw| {
            let rw = masked(rw, &mf);
            irls(x, mf.y.view(), rw.view(), family, opts, Some(&fit.beta)).map(|f| f.beta)
        },
        || {
            // influence functions U_i A^-1 with U_i = x_i w_i (y_i - mu_i) mu'_i / V(mu_i)
            let mut u = Array2::zeros((x.nrows(), p));
            for i in 0..x.nrows() {
                if wn[i] <= 0.0 {
                    continue;
                }
                let mu = fit.mu[i];
                let r = wn[i] * (mf.y[i] - mu) * family.mu_eta(mu) / family.variance(mu);
                for a in 0..p {
                    u[[i, a]] = x[[i, a]] * r;
                }
            }
            Ok(u.dot(&fit.xtwx_inv))
        },
    )?;

    let pearson: f64 = (0..mf.y.len())
        .filter(|&i| wn[i] > 0.0)
        .map(|i| {
            let mu = fit.mu[i];
            wn[i] * (mf.y[i] - mu).powi(2) / family.variance(mu)
        })
        .sum();
    let dispersion = pearson / wn.sum();

    let df_resid = design.degrees_of_freedom() as f64 - p as f64 + 1.0;
    if df_resid <= 0.0 {
        log::warn!("'{}' leaves {} residual degrees of freedom; p-values are undefined", formula, df_resid);
    }

    Ok(GlmFit {
        formula: parsed.to_string(),
        family,
        terms: mf.names.clone(),
        coefficients: fit.beta.clone(),
        cov,
        df_resid,
        deviance: fit.deviance,
        null_deviance: null_deviance(&mf, family, &w, parsed.intercept),
        dispersion,
        iterations: fit.iterations,
        n_obs: mf.n_included(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_gaussian_matches_weighted_least_squares() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![1.0, 3.0, 5.0, 7.0];
        let w = array![1.0, 2.0, 1.0, 2.0];
        let fit = irls(x.view(), y.view(), w.view(), Family::Gaussian, &GlmOptions::default(), None).unwrap();
        assert_abs_diff_eq!(fit.beta[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.beta[1], 2.0, epsilon = 1e-10);
        assert!(fit.iterations <= 3);
    }

    #[test]
    fn test_logit_saturated_two_groups() {
        // group 0: 1 of 4 successes, group 1: 3 of 4
        let x = array![
            [1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 0.0],
            [1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]
        ];
        let y = array![1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0];
        let w = Array1::from_elem(8, 1.0);
        let fit = irls(x.view(), y.view(), w.view(), Family::QuasiBinomial, &GlmOptions::default(), None).unwrap();
        assert_abs_diff_eq!(fit.beta[0], (1.0f64 / 3.0).ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(fit.beta[1], 9.0f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_iteration_budget_exhausted() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = array![0.0, 1.0, 1.0, 0.0];
        let w = Array1::from_elem(4, 1.0);
        let opts = GlmOptions { max_iter: 1, tol: 1e-30, start: None };
        let err = irls(x.view(), y.view(), w.view(), Family::QuasiBinomial, &opts, None).unwrap_err();
        assert!(matches!(err, SvyError::Convergence { iterations: 1, .. }));
    }

    #[test]
    fn test_collinear_columns_rejected() {
        let x = array![[1.0, 2.0], [1.0, 2.0], [1.0, 2.0]];
        let y = array![1.0, 2.0, 3.0];
        let w = Array1::from_elem(3, 1.0);
        let err = irls(x.view(), y.view(), w.view(), Family::Gaussian, &GlmOptions::default(), None).unwrap_err();
        assert!(matches!(err, SvyError::Config(_)));
    }

    fn fitted(df_resid: f64) -> GlmFit {
        GlmFit {
            formula: "y ~ x".to_string(),
            family: Family::QuasiBinomial,
            terms: vec!["(Intercept)".to_string(), "x".to_string()],
            coefficients: array![0.2, 0.5],
            cov: array![[0.04, 0.0], [0.0, 0.09]],
            df_resid,
            deviance: 10.0,
            null_deviance: 12.0,
            dispersion: 1.0,
            iterations: 4,
            n_obs: 100,
        }
    }

    #[test]
    fn test_interval_agrees_with_p_value() {
        let fit = fitted(48.0);
        let p = fit.p_values()[1];
        assert!(p > 0.05 && p < 0.2);
        // at level 1 - p the interval has zero on its boundary
        let ci = fit.confint(1.0 - p, false).unwrap();
        assert_abs_diff_eq!(ci[1].lower, 0.0, epsilon = 1e-8);

        let ci95 = fit.confint(0.95, false).unwrap();
        assert!(ci95[1].lower < 0.0);
        // t intervals are wider than normal ones at small df
        let half = ci95[1].upper - 0.5;
        assert!(half > 1.96 * 0.3);
    }

    #[test]
    fn test_interval_without_residual_df_uses_normal() {
        let fit = fitted(0.0);
        let ci = fit.confint(0.95, false).unwrap();
        assert_abs_diff_eq!(ci[1].upper - 0.5, normal_quantile(0.975) * 0.3, epsilon = 1e-9);
    }
}
