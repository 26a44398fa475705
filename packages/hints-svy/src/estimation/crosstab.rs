// src/estimation/crosstab.rs
//! Weighted counts, totals and proportions by group with design-based SEs.

use std::cmp::Ordering;
use std::collections::HashMap;

use ndarray::{Array1, Array2, ArrayView1};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::{is_numeric_dtype, Dataset};
use crate::design::SurveyDesign;
use crate::error::{Result, SvyError};

/// Row restriction applied before estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    NotMissing { column: String },
    Equals { column: String, value: String },
    OneOf { column: String, values: Vec<String> },
}

impl Filter {
    pub fn not_missing(column: &str) -> Self {
        Filter::NotMissing { column: column.to_string() }
    }

    pub fn equals(column: &str, value: &str) -> Self {
        Filter::Equals { column: column.to_string(), value: value.to_string() }
    }

    pub fn one_of(column: &str, values: &[&str]) -> Self {
        Filter::OneOf {
            column: column.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::NotMissing { column } | Filter::Equals { column, .. } | Filter::OneOf { column, .. } => column,
        }
    }

    /// Values are compared with the labels crosstab keys are rendered with.
    pub(crate) fn mask(&self, ds: &Dataset) -> Result<Vec<bool>> {
        let keys = column_keys(ds, self.column())?;
        Ok(keys
            .iter()
            .map(|k| match (self, k) {
                (_, None) => false,
                (Filter::NotMissing { .. }, Some(_)) => true,
                (Filter::Equals { value, .. }, Some((v, _))) => v == value,
                (Filter::OneOf { values, .. }, Some((v, _))) => values.iter().any(|x| x == v),
            })
            .collect())
    }
}

// ============================================================================
// Group keys
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortKey {
    Level(usize),
    Number(f64),
    Text(String),
}

impl SortKey {
    fn compare(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Level(a), SortKey::Level(b)) => a.cmp(b),
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Per-row display label and sort key of a grouping column.
pub(crate) fn column_keys(ds: &Dataset, column: &str) -> Result<Vec<Option<(String, SortKey)>>> {
    if let Some(factor) = ds.factor(column) {
        let labels = ds.text(column)?;
        return Ok(labels
            .into_iter()
            .map(|l| {
                l.map(|l| {
                    let rank = factor.rank(&l).unwrap_or(factor.levels.len());
                    (l, SortKey::Level(rank))
                })
            })
            .collect());
    }
    let dtype = ds.column(column)?.dtype().clone();
    if is_numeric_dtype(&dtype) {
        let values = ds.numeric(column)?;
        return Ok(values
            .into_iter()
            .map(|v| v.map(|x| (format_number(x), SortKey::Number(x))))
            .collect());
    }
    let labels = ds.text(column)?;
    Ok(labels
        .into_iter()
        .map(|l| l.map(|l| (l.clone(), SortKey::Text(l))))
        .collect())
}

fn format_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{}", x)
    }
}

/// Ordered groups over `columns` for rows passing `mask`.
pub(crate) struct Grouping {
    /// Group index per row, `u32::MAX` outside the domain.
    pub ids: Vec<u32>,
    pub keys: Vec<Vec<String>>,
}

pub(crate) fn group_rows(ds: &Dataset, columns: &[&str], mask: &[bool]) -> Result<Grouping> {
    let per_column = columns
        .iter()
        .map(|c| column_keys(ds, c))
        .collect::<Result<Vec<_>>>()?;

    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut found: Vec<(Vec<String>, Vec<SortKey>)> = Vec::new();
    let mut raw_ids = vec![u32::MAX; ds.height()];

    'rows: for i in 0..ds.height() {
        if !mask[i] {
            continue;
        }
        let mut labels = Vec::with_capacity(columns.len());
        let mut sort = Vec::with_capacity(columns.len());
        for col in &per_column {
            match &col[i] {
                Some((l, k)) => {
                    labels.push(l.clone());
                    sort.push(k.clone());
                }
                None => continue 'rows,
            }
        }
        let next = found.len();
        let g = *index.entry(labels.clone()).or_insert_with(|| {
            found.push((labels, sort));
            next
        });
        raw_ids[i] = g as u32;
    }

    let mut order: Vec<usize> = (0..found.len()).collect();
    order.sort_by(|&a, &b| {
        found[a]
            .1
            .iter()
            .zip(found[b].1.iter())
            .map(|(x, y)| x.compare(y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    let mut remap = vec![0u32; found.len()];
    for (new, &old) in order.iter().enumerate() {
        remap[old] = new as u32;
    }
    let ids = raw_ids
        .into_iter()
        .map(|g| if g == u32::MAX { g } else { remap[g as usize] })
        .collect();
    let keys = order.into_iter().map(|g| found[g].0.clone()).collect();
    Ok(Grouping { ids, keys })
}

pub(crate) fn filter_mask(ds: &Dataset, filters: &[Filter]) -> Result<Vec<bool>> {
    let mut mask = vec![true; ds.height()];
    for f in filters {
        for (m, keep) in mask.iter_mut().zip(f.mask(ds)?) {
            *m &= keep;
        }
    }
    Ok(mask)
}

// ============================================================================
// Estimation
// ============================================================================

/// Group totals followed by group proportions.
pub(crate) fn totals_and_proportions(weights: ArrayView1<f64>, ids: &[u32], n_groups: usize) -> Array1<f64> {
    let mut out = Array1::zeros(2 * n_groups);
    for (i, &g) in ids.iter().enumerate() {
        if g != u32::MAX {
            out[g as usize] += weights[i];
        }
    }
    let total: f64 = out.iter().take(n_groups).sum();
    for g in 0..n_groups {
        out[n_groups + g] = if total > 0.0 { out[g] / total } else { f64::NAN };
    }
    out
}

/// Linearization scores matching [`totals_and_proportions`].
pub(crate) fn proportion_scores(weights: ArrayView1<f64>, ids: &[u32], n_groups: usize, theta: &Array1<f64>) -> Array2<f64> {
    let total: f64 = theta.iter().take(n_groups).sum();
    let mut scores = Array2::zeros((ids.len(), 2 * n_groups));
    for (i, &g) in ids.iter().enumerate() {
        if g == u32::MAX {
            continue;
        }
        let w = weights[i];
        scores[[i, g as usize]] = w;
        for k in 0..n_groups {
            let indicator = if k == g as usize { 1.0 } else { 0.0 };
            scores[[i, n_groups + k]] = w * (indicator - theta[n_groups + k]) / total;
        }
    }
    scores
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossTabRow {
    pub key: Vec<String>,
    pub n: usize,
    pub total: f64,
    pub se_total: f64,
    pub proportion: f64,
    pub se_proportion: f64,
}

#[derive(Debug, Clone)]
pub struct CrossTab {
    pub columns: Vec<String>,
    pub rows: Vec<CrossTabRow>,
    pub df: usize,
}

impl CrossTab {
    pub fn get(&self, key: &[&str]) -> Option<&CrossTabRow> {
        self.rows
            .iter()
            .find(|r| r.key.len() == key.len() && r.key.iter().zip(key).all(|(a, b)| a == b))
    }

    pub fn to_frame(&self) -> Result<DataFrame> {
        let mut cols: Vec<Column> = Vec::with_capacity(self.columns.len() + 5);
        for (j, name) in self.columns.iter().enumerate() {
            let values: Vec<&str> = self.rows.iter().map(|r| r.key[j].as_str()).collect();
            cols.push(Column::new(name.as_str().into(), values));
        }
        let n: Vec<u32> = self.rows.iter().map(|r| r.n as u32).collect();
        cols.push(Column::new("n".into(), n));
        cols.push(Column::new("total".into(), self.rows.iter().map(|r| r.total).collect::<Vec<_>>()));
        cols.push(Column::new("se_total".into(), self.rows.iter().map(|r| r.se_total).collect::<Vec<_>>()));
        cols.push(Column::new("proportion".into(), self.rows.iter().map(|r| r.proportion).collect::<Vec<_>>()));
        cols.push(Column::new(
            "se_proportion".into(),
            self.rows.iter().map(|r| r.se_proportion).collect::<Vec<_>>(),
        ));
        Ok(DataFrame::new(cols)?)
    }
}

pub fn weighted_crosstab(design: &SurveyDesign, group_columns: &[&str], filters: &[Filter]) -> Result<CrossTab> {
    if group_columns.is_empty() {
        return Err(SvyError::config("crosstab needs at least one grouping column"));
    }
    let ds = design.data();
    let mask = filter_mask(ds, filters)?;
    let grouping = group_rows(ds, group_columns, &mask)?;
    let k = grouping.keys.len();
    if k == 0 {
        return Err(SvyError::config(format!(
            "no rows remain for crosstab over {:?} after filtering",
            group_columns
        )));
    }

    let w = design.weights();
    let theta = totals_and_proportions(w, &grouping.ids, k);
    if !theta.iter().take(k).any(|&t| t > 0.0) {
        return Err(SvyError::config(format!("all weights are zero in the crosstab domain over {:?}", group_columns)));
    }
    let ids = &grouping.ids;
    let cov = design.covariance(
        theta.view(),
        |rw| Ok(totals_and_proportions(rw, ids, k)),
        || Ok(proportion_scores(w, ids, k, &theta)),
    )?;

    let mut counts = vec![0usize; k];
    for &g in ids.iter().filter(|&&g| g != u32::MAX) {
        counts[g as usize] += 1;
    }
    let zero = theta.iter().take(k).filter(|t| **t == 0.0).count();
    if zero > 0 {
        log::warn!("{} crosstab groups carry zero total weight", zero);
    }

    let rows = grouping
        .keys
        .into_iter()
        .enumerate()
        .map(|(g, key)| CrossTabRow {
            key,
            n: counts[g],
            total: theta[g],
            se_total: cov[[g, g]].max(0.0).sqrt(),
            proportion: theta[k + g],
            se_proportion: cov[[k + g, k + g]].max(0.0).sqrt(),
        })
        .collect();

    Ok(CrossTab {
        columns: group_columns.iter().map(|c| c.to_string()).collect(),
        rows,
        df: design.degrees_of_freedom(),
    })
}
