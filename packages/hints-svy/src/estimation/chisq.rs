// src/estimation/chisq.rs
//! Rao-Scott design-corrected Pearson test of independence for two-way tables.
//!
//! The Pearson statistic is computed on the weighted table rescaled to the
//! unweighted sample size, divided by the mean generalized design effect, and
//! referred to an F distribution with Satterthwaite-matched degrees of freedom:
//!
//! ```text
//! Delta = (C' D^-1 C / n)^-1 (C' D^-1 V D^-1 C)
//! F     = X^2 / tr(Delta)
//! ndf   = tr(Delta)^2 / tr(Delta^2),   ddf = ndf * design df
//! ```
//!
//! `C` spans the interaction space of the cell layout orthogonal to the main
//! effects, `D` is the diagonal of cell proportions and `V` their design-based
//! covariance.

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1};
use polars::prelude::*;

use crate::design::SurveyDesign;
use crate::distributions::{chi_squared_sf, f_sf};
use crate::error::{Result, SvyError};
use crate::estimation::crosstab::{column_keys, group_rows, proportion_scores};
use crate::linalg::{invert, solve, trace};
use crate::regression::formula::Formula;

#[derive(Debug, Clone)]
pub struct ChisqTest {
    pub row: String,
    pub col: String,
    pub row_levels: Vec<String>,
    pub col_levels: Vec<String>,
    /// Weighted totals, `table[i][j]` for row level i and column level j.
    pub table: Vec<Vec<f64>>,
    pub n: usize,
    pub pearson: f64,
    pub pearson_df: usize,
    pub pearson_p: f64,
    pub f_statistic: f64,
    pub ndf: f64,
    pub ddf: f64,
    pub p_value: f64,
}

impl ChisqTest {
    pub fn table_frame(&self) -> Result<DataFrame> {
        let mut cols: Vec<Column> = Vec::with_capacity(self.col_levels.len() + 1);
        cols.push(Column::new(self.row.as_str().into(), self.row_levels.clone()));
        for (j, level) in self.col_levels.iter().enumerate() {
            let values: Vec<f64> = self.table.iter().map(|r| r[j]).collect();
            cols.push(Column::new(level.as_str().into(), values));
        }
        Ok(DataFrame::new(cols)?)
    }
}

impl fmt::Display for ChisqTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pearson's X^2: Rao & Scott adjustment ({} by {})", self.row, self.col)?;
        writeln!(
            f,
            "F = {:.4}, ndf = {:.4}, ddf = {:.3}, p-value = {:.4e}",
            self.f_statistic, self.ndf, self.ddf, self.p_value
        )?;
        write!(
            f,
            "uncorrected X-squared = {:.4}, df = {}, p-value = {:.4e}",
            self.pearson, self.pearson_df, self.pearson_p
        )
    }
}

/// Cell proportions in row-fastest order (cell `i + nr * j`).
fn cell_proportions(weights: ArrayView1<f64>, cells: &[u32], n_cells: usize) -> Array1<f64> {
    let mut p = Array1::zeros(n_cells);
    for (i, &c) in cells.iter().enumerate() {
        if c != u32::MAX {
            p[c as usize] += weights[i];
        }
    }
    let total = p.sum();
    if total > 0.0 {
        p /= total;
    }
    p
}

/// Interaction contrasts of an `nr x nc` layout, residualized on the main effects.
fn interaction_contrasts(nr: usize, nc: usize) -> Result<Array2<f64>> {
    let n_cells = nr * nc;
    let n_main = nr + nc - 1;
    let n_int = (nr - 1) * (nc - 1);
    let mut x1 = Array2::zeros((n_cells, n_main));
    let mut x12 = Array2::zeros((n_cells, n_int));
    for j in 0..nc {
        for i in 0..nr {
            let cell = i + nr * j;
            x1[[cell, 0]] = 1.0;
            if i > 0 {
                x1[[cell, i]] = 1.0;
            }
            if j > 0 {
                x1[[cell, nr - 1 + j]] = 1.0;
            }
            if i > 0 && j > 0 {
                x12[[cell, (i - 1) + (nr - 1) * (j - 1)]] = 1.0;
            }
        }
    }
    let xtx = x1.t().dot(&x1);
    let coef = solve(xtx.view(), x1.t().dot(&x12).view())
        .ok_or_else(|| SvyError::config("main-effects design of the table is singular"))?;
    Ok(&x12 - &x1.dot(&coef))
}

/// Test of independence between two categorical columns.
pub fn chisq_test(design: &SurveyDesign, row: &str, col: &str) -> Result<ChisqTest> {
    let ds = design.data();
    // complete pairs only: a level seen only beside a missing partner is not a level of the table
    let row_keys = column_keys(ds, row)?;
    let col_keys = column_keys(ds, col)?;
    let complete: Vec<bool> = row_keys
        .iter()
        .zip(col_keys.iter())
        .map(|(r, c)| r.is_some() && c.is_some())
        .collect();
    let rows = group_rows(ds, &[row], &complete)?;
    let cols = group_rows(ds, &[col], &complete)?;
    let nr = rows.keys.len();
    let nc = cols.keys.len();
    if nr < 2 || nc < 2 {
        return Err(SvyError::config(format!(
            "chi-square test needs at least two levels on each side: '{}' has {}, '{}' has {}",
            row, nr, col, nc
        )));
    }

    let n_cells = nr * nc;
    let cells: Vec<u32> = rows
        .ids
        .iter()
        .zip(cols.ids.iter())
        .map(|(&r, &c)| {
            if r == u32::MAX || c == u32::MAX {
                u32::MAX
            } else {
                r + nr as u32 * c
            }
        })
        .collect();
    let n = cells.iter().filter(|&&c| c != u32::MAX).count();

    let w = design.weights();
    let p = cell_proportions(w, &cells, n_cells);
    let mut table = vec![vec![0.0; nc]; nr];
    for (i, &c) in cells.iter().enumerate() {
        if c != u32::MAX {
            table[c as usize % nr][c as usize / nr] += w[i];
        }
    }
    let row_margin: Vec<f64> = (0..nr).map(|i| (0..nc).map(|j| p[i + nr * j]).sum()).collect();
    let col_margin: Vec<f64> = (0..nc).map(|j| (0..nr).map(|i| p[i + nr * j]).sum()).collect();
    if row_margin.iter().chain(col_margin.iter()).any(|&m| m <= 0.0) {
        return Err(SvyError::config(format!(
            "table of '{}' by '{}' has a row or column with zero weight",
            row, col
        )));
    }

    // Pearson on the table scaled to the unweighted sample size
    let nf = n as f64;
    let mut pearson = 0.0;
    for j in 0..nc {
        for i in 0..nr {
            let expected = nf * row_margin[i] * col_margin[j];
            let observed = nf * p[i + nr * j];
            pearson += (observed - expected).powi(2) / expected;
        }
    }
    let pearson_df = (nr - 1) * (nc - 1);

    // Design covariance of the cell proportions
    let cell_theta = {
        let mut t = Array1::zeros(2 * n_cells);
        for (i, &c) in cells.iter().enumerate() {
            if c != u32::MAX {
                t[c as usize] += w[i];
            }
        }
        for k in 0..n_cells {
            t[n_cells + k] = p[k];
        }
        t
    };
    let full = design.covariance(
        p.view(),
        |rw| Ok(cell_proportions(rw, &cells, n_cells)),
        || {
            let scores = proportion_scores(w, &cells, n_cells, &cell_theta);
            Ok(scores.slice(ndarray::s![.., n_cells..]).to_owned())
        },
    )?;

    let cmat = interaction_contrasts(nr, nc)?;
    let id_diag: Array1<f64> = p.mapv(|x| if x > 0.0 { 1.0 / x } else { 0.0 });
    let id_c = Array2::from_shape_fn(cmat.dim(), |(a, b)| id_diag[a] * cmat[[a, b]]);
    let denom = cmat.t().dot(&id_c) / nf;
    let numr = id_c.t().dot(&full).dot(&id_c);
    let delta = match solve(denom.view(), numr.view()) {
        Some(d) => d,
        None => invert(denom.view())
            .map(|inv| inv.dot(&numr))
            .ok_or_else(|| SvyError::config("design-effect matrix of the table is singular"))?,
    };
    let tr = trace(delta.view());
    let tr2 = trace(delta.dot(&delta).view());

    let df_design = design.degrees_of_freedom() as f64;
    let (f_statistic, ndf, ddf, p_value) = if tr > 0.0 && tr2 > 0.0 {
        let ndf = tr * tr / tr2;
        let ddf = ndf * df_design;
        let f = pearson / tr;
        (f, ndf, ddf, f_sf(f, ndf, ddf))
    } else {
        log::warn!("design effect of '{}' by '{}' is zero; F statistic undefined", row, col);
        (f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    };

    log::debug!(
        "chisq {} x {}: X2 = {:.4}, tr(Delta) = {:.4}, ndf = {:.4}, ddf = {:.4}",
        row,
        col,
        pearson,
        tr,
        ndf,
        ddf
    );

    Ok(ChisqTest {
        row: row.to_string(),
        col: col.to_string(),
        row_levels: rows.keys.into_iter().map(|mut k| k.remove(0)).collect(),
        col_levels: cols.keys.into_iter().map(|mut k| k.remove(0)).collect(),
        table,
        n,
        pearson,
        pearson_df,
        pearson_p: chi_squared_sf(pearson, pearson_df as f64),
        f_statistic,
        ndf,
        ddf,
        p_value,
    })
}

/// Formula form: `"~ a + b"` with exactly two terms and no response.
pub fn chisq_formula(design: &SurveyDesign, formula: &str) -> Result<ChisqTest> {
    let f: Formula = formula.parse()?;
    if f.response.is_some() || f.terms.len() != 2 {
        return Err(SvyError::config(format!(
            "chi-square formula must have the form '~ a + b', got '{}'",
            formula
        )));
    }
    chisq_test(design, &f.terms[0], &f.terms[1])
}
