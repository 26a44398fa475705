// src/regression/model_matrix.rs
//! Design matrices from formulas: treatment-coded factors, numeric columns
//! as-is, intercept first.

use ndarray::{Array1, Array2};

use crate::dataset::{is_numeric_dtype, Dataset};
use crate::error::{Result, SvyError};
use crate::regression::formula::Formula;

/// How the response column must be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Any numeric column.
    Continuous,
    /// Numeric in [0, 1], or a two-level factor (1 = non-reference level).
    Binary,
}

/// Model matrix over all rows of a dataset. Rows with a missing response or
/// predictor keep zero entries and are flagged out by `included`.
#[derive(Debug, Clone)]
pub struct ModelFrame {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub names: Vec<String>,
    pub included: Vec<bool>,
}

impl ModelFrame {
    pub fn n_included(&self) -> usize {
        self.included.iter().filter(|&&b| b).count()
    }
}

enum Block {
    Numeric { name: String, values: Vec<Option<f64>> },
    Factor { name: String, levels: Vec<String>, labels: Vec<Option<String>> },
}

fn predictor(ds: &Dataset, term: &str) -> Result<Block> {
    if let Some(factor) = ds.factor(term) {
        return Ok(Block::Factor {
            name: term.to_string(),
            levels: factor.contrast_levels().to_vec(),
            labels: ds.text(term)?,
        });
    }
    let dtype = ds.column(term)?.dtype().clone();
    if is_numeric_dtype(&dtype) {
        return Ok(Block::Numeric { name: term.to_string(), values: ds.numeric(term)? });
    }
    Err(SvyError::config(format!(
        "predictor '{}' is a text column without factor levels; recode it first",
        term
    )))
}

fn response(ds: &Dataset, name: &str, kind: ResponseKind) -> Result<Vec<Option<f64>>> {
    if let Some(factor) = ds.factor(name) {
        if kind == ResponseKind::Continuous {
            return Err(SvyError::config(format!(
                "response '{}' is categorical; a gaussian model needs a numeric response",
                name
            )));
        }
        if factor.levels.len() != 2 {
            return Err(SvyError::config(format!(
                "binary response '{}' must have exactly two levels, found {:?}",
                name, factor.levels
            )));
        }
        let success = &factor.levels[1];
        return Ok(ds
            .text(name)?
            .into_iter()
            .map(|l| l.map(|l| if &l == success { 1.0 } else { 0.0 }))
            .collect());
    }
    let values = ds.numeric(name)?;
    if kind == ResponseKind::Binary {
        if let Some(v) = values.iter().flatten().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(SvyError::config(format!(
                "binary response '{}' has value {} outside [0, 1]",
                name, v
            )));
        }
    }
    Ok(values)
}

pub fn build(ds: &Dataset, formula: &Formula, kind: ResponseKind) -> Result<ModelFrame> {
    let response_name = formula
        .response
        .as_deref()
        .ok_or_else(|| SvyError::config(format!("model formula '{}' has no response", formula)))?;
    let y_raw = response(ds, response_name, kind)?;
    let blocks = formula
        .terms
        .iter()
        .map(|t| predictor(ds, t))
        .collect::<Result<Vec<_>>>()?;

    let mut names = Vec::new();
    if formula.intercept {
        names.push("(Intercept)".to_string());
    }
    for b in &blocks {
        match b {
            Block::Numeric { name, .. } => names.push(name.clone()),
            Block::Factor { name, levels, .. } => {
                names.extend(levels.iter().map(|l| format!("{}{}", name, l)));
            }
        }
    }

    let n = ds.height();
    let mut x = Array2::zeros((n, names.len()));
    let mut y = Array1::zeros(n);
    let mut included = vec![true; n];
    for i in 0..n {
        match y_raw[i] {
            Some(v) => y[i] = v,
            None => included[i] = false,
        }
        let mut col = 0;
        if formula.intercept {
            x[[i, 0]] = 1.0;
            col = 1;
        }
        for b in &blocks {
            match b {
                Block::Numeric { values, .. } => {
                    match values[i] {
                        Some(v) => x[[i, col]] = v,
                        None => included[i] = false,
                    }
                    col += 1;
                }
                Block::Factor { levels, labels, .. } => {
                    match &labels[i] {
                        Some(l) => {
                            if let Some(k) = levels.iter().position(|lv| lv == l) {
                                x[[i, col + k]] = 1.0;
                            }
                        }
                        None => included[i] = false,
                    }
                    col += levels.len();
                }
            }
        }
        if !included[i] {
            x.row_mut(i).fill(0.0);
            y[i] = 0.0;
        }
    }

    let frame = ModelFrame { x, y, names, included };
    log::debug!(
        "model frame for '{}': {} of {} rows, {} columns",
        formula,
        frame.n_included(),
        n,
        frame.names.len()
    );
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recode::RecodeRule;
    use polars::prelude::*;

    fn dataset() -> Dataset {
        let frame = df![
            "SeekCancerInfo" => [Some(1i32), Some(2), Some(1), None],
            "Education" => [Some(1i32), Some(3), Some(6), Some(3)],
            "age" => [Some(30.0f64), Some(45.0), None, Some(50.0)],
        ]
        .unwrap();
        let mut ds = Dataset::new(frame);
        RecodeRule::new("SeekCancerInfo", "seek", &[(1, "Yes"), (2, "No")], "No")
            .apply(&mut ds)
            .unwrap();
        RecodeRule::new(
            "Education",
            "edu",
            &[(1, "Less"), (3, "HS"), (6, "College")],
            "Less",
        )
        .apply(&mut ds)
        .unwrap();
        ds
    }

    #[test]
    fn test_treatment_coding_and_names() {
        let ds = dataset();
        let f: Formula = "seek ~ edu + age".parse().unwrap();
        let mf = build(&ds, &f, ResponseKind::Binary).unwrap();
        assert_eq!(mf.names, vec!["(Intercept)", "eduHS", "eduCollege", "age"]);
        // row 1: No, HS, 45
        assert_eq!(mf.y[1], 0.0);
        assert_eq!(mf.x.row(1).to_vec(), vec![1.0, 1.0, 0.0, 45.0]);
        // row 0: Yes, reference level
        assert_eq!(mf.y[0], 1.0);
        assert_eq!(mf.x.row(0).to_vec(), vec![1.0, 0.0, 0.0, 30.0]);
        // missing age and missing outcome drop out
        assert_eq!(mf.included, vec![true, true, false, false]);
    }

    #[test]
    fn test_response_checks() {
        let ds = dataset();
        let f: Formula = "seek ~ age".parse().unwrap();
        assert!(build(&ds, &f, ResponseKind::Continuous).is_err());
        let f: Formula = "edu ~ age".parse().unwrap();
        assert!(build(&ds, &f, ResponseKind::Binary).is_err());
        let f: Formula = "Education ~ age".parse().unwrap();
        assert!(build(&ds, &f, ResponseKind::Binary).is_err());
        assert!(build(&ds, &f, ResponseKind::Continuous).is_ok());
    }

    #[test]
    fn test_unknown_column() {
        let ds = dataset();
        let f: Formula = "seek ~ nosuch".parse().unwrap();
        assert!(matches!(build(&ds, &f, ResponseKind::Binary), Err(SvyError::Config(_))));
    }
}
