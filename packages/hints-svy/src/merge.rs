// src/merge.rs
//! Stacking two survey cycles into one dataset with a shared replicate-weight
//! layout.
//!
//! With cycle A carrying `R_A` replicates and cycle B carrying `R_B`, the
//! merged file has a base weight `{prefix}0` and replicates
//! `{prefix}1..{prefix}{R_A + R_B}`:
//!
//! | rows    | 1..R_A            | R_A+1..R_A+R_B    |
//! |---------|-------------------|-------------------|
//! | from A  | A's replicates    | A's base weight   |
//! | from B  | B's base weight   | B's replicates    |
//!
//! Each cycle's rows are constant across the other cycle's replicates, so a
//! jackknife over the merged columns restricted to one cycle reproduces that
//! cycle's own jackknife when the scales agree (HINTS: 98/100 = 49/50).
//!
//! The merged width follows the inputs: two HINTS cycles of 50 replicates
//! give the 100 columns the `merged` design preset expects, while unequal
//! counts give `R_A + R_B` columns that need a matching replicate spec.

use std::collections::HashMap;

use polars::prelude::*;

use crate::dataset::{is_numeric_dtype, Dataset};
use crate::error::{Result, SvyError};

/// One cycle entering a merge.
#[derive(Debug, Clone)]
pub struct CycleInput {
    pub dataset: Dataset,
    /// Value written to the provenance column for this cycle's rows.
    pub tag: String,
    pub weight: String,
    pub replicate_weights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    pub provenance_column: String,
    pub weight_prefix: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions { provenance_column: "survey".to_string(), weight_prefix: "nwgt".to_string() }
    }
}

impl MergeOptions {
    pub fn weight_column(&self) -> String {
        format!("{}0", self.weight_prefix)
    }

    pub fn replicate_columns(&self, n: usize) -> Vec<String> {
        (1..=n).map(|r| format!("{}{}", self.weight_prefix, r)).collect()
    }
}

fn complete_weights(cycle: &CycleInput, column: &str) -> Result<Vec<f64>> {
    cycle
        .dataset
        .numeric(column)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Some(w) if w >= 0.0 => Ok(w),
            _ => Err(SvyError::config(format!(
                "cycle '{}': weight '{}' is missing or negative at row {}",
                cycle.tag, column, i
            ))),
        })
        .collect()
}

/// Target dtype of a column present in one or both inputs.
fn unified_dtype(a: Option<&DataType>, b: Option<&DataType>) -> DataType {
    match (a, b) {
        (Some(a), Some(b)) if a == b => a.clone(),
        (Some(a), Some(b)) if is_numeric_dtype(a) && is_numeric_dtype(b) => DataType::Float64,
        (Some(_), Some(_)) => DataType::String,
        (Some(t), None) | (None, Some(t)) => t.clone(),
        (None, None) => DataType::Null,
    }
}

fn aligned(ds: &Dataset, name: &str, dtype: &DataType) -> Result<Column> {
    if ds.has_column(name) {
        let col = ds.column(name)?;
        if col.dtype() == dtype {
            Ok(col.clone())
        } else {
            Ok(col.cast(dtype)?)
        }
    } else {
        Ok(Column::full_null(name.into(), ds.height(), dtype))
    }
}

/// Stacks `a` then `b`, unions columns by name and appends the provenance
/// column and the harmonized weights.
pub fn merge_cycles(a: &CycleInput, b: &CycleInput, options: &MergeOptions) -> Result<Dataset> {
    if a.tag == b.tag {
        return Err(SvyError::config(format!("both cycles carry the tag '{}'", a.tag)));
    }
    let r_a = a.replicate_weights.len();
    let r_b = b.replicate_weights.len();
    let weight_name = options.weight_column();
    let rep_names = options.replicate_columns(r_a + r_b);

    let mut reserved: Vec<&str> = vec![options.provenance_column.as_str(), weight_name.as_str()];
    reserved.extend(rep_names.iter().map(String::as_str));
    for cycle in [a, b] {
        if let Some(clash) = reserved.iter().find(|n| cycle.dataset.has_column(n)) {
            return Err(SvyError::config(format!(
                "cycle '{}' already has a column named '{}'",
                cycle.tag, clash
            )));
        }
    }

    // Weights first, so missing columns surface before any data is copied.
    let base_a = complete_weights(a, &a.weight)?;
    let base_b = complete_weights(b, &b.weight)?;
    let reps_a = a
        .replicate_weights
        .iter()
        .map(|c| complete_weights(a, c))
        .collect::<Result<Vec<_>>>()?;
    let reps_b = b
        .replicate_weights
        .iter()
        .map(|c| complete_weights(b, c))
        .collect::<Result<Vec<_>>>()?;

    let mut names: Vec<String> = a.dataset.column_names();
    for n in b.dataset.column_names() {
        if !names.contains(&n) {
            names.push(n);
        }
    }

    let mut cols_a = Vec::with_capacity(names.len() + 2 + rep_names.len());
    let mut cols_b = Vec::with_capacity(names.len() + 2 + rep_names.len());
    for name in &names {
        let dt_a = a.dataset.has_column(name).then(|| a.dataset.column(name)).transpose()?.map(|c| c.dtype().clone());
        let dt_b = b.dataset.has_column(name).then(|| b.dataset.column(name)).transpose()?.map(|c| c.dtype().clone());
        let dtype = unified_dtype(dt_a.as_ref(), dt_b.as_ref());
        if dt_a.is_some() && dt_b.is_some() && dt_a != dt_b {
            log::warn!("column '{}' has types {:?} and {:?}; merged as {:?}", name, dt_a, dt_b, dtype);
        }
        cols_a.push(aligned(&a.dataset, name, &dtype)?);
        cols_b.push(aligned(&b.dataset, name, &dtype)?);
    }

    let n_a = a.dataset.height();
    let n_b = b.dataset.height();
    let prov = options.provenance_column.as_str();
    cols_a.push(Column::new(prov.into(), vec![a.tag.as_str(); n_a]));
    cols_b.push(Column::new(prov.into(), vec![b.tag.as_str(); n_b]));
    cols_a.push(Column::new(weight_name.as_str().into(), base_a.clone()));
    cols_b.push(Column::new(weight_name.as_str().into(), base_b.clone()));
    for (r, name) in rep_names.iter().enumerate() {
        let (va, vb) = if r < r_a {
            (reps_a[r].clone(), base_b.clone())
        } else {
            (base_a.clone(), reps_b[r - r_a].clone())
        };
        cols_a.push(Column::new(name.as_str().into(), va));
        cols_b.push(Column::new(name.as_str().into(), vb));
    }

    let mut frame = DataFrame::new(cols_a)?;
    frame.vstack_mut(&DataFrame::new(cols_b)?)?;

    let mut value_labels = b.dataset.all_value_labels().clone();
    value_labels.extend(a.dataset.all_value_labels().clone());
    let mut variable_labels: HashMap<String, String> = b.dataset.all_variable_labels().clone();
    variable_labels.extend(a.dataset.all_variable_labels().clone());
    variable_labels.insert(weight_name.clone(), "Merged final sample weight".to_string());
    for (r, name) in rep_names.iter().enumerate() {
        variable_labels.insert(name.clone(), format!("Merged replicate weight {}", r + 1));
    }
    variable_labels.insert(options.provenance_column.clone(), "Source survey cycle".to_string());

    let mut merged = Dataset::with_labels(frame, value_labels, variable_labels);
    for cycle in [b, a] {
        for name in &names {
            if let Some(f) = cycle.dataset.factor(name) {
                merged.set_factor(name, f.clone());
            }
        }
    }

    log::info!(
        "Merged '{}' ({} rows, {} replicates) and '{}' ({} rows, {} replicates): {} rows, {} columns",
        a.tag,
        n_a,
        r_a,
        b.tag,
        n_b,
        r_b,
        merged.height(),
        merged.column_names().len()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ValueLabels;

    fn cycle(tag: &str, wt: [f64; 2], r: [[f64; 2]; 2], extra: &str) -> CycleInput {
        let frame = df![
            "id" => [1i32, 2],
            "w" => wt,
            "r1" => r[0],
            "r2" => r[1],
            extra => ["x", "y"],
        ]
        .unwrap();
        CycleInput {
            dataset: Dataset::new(frame),
            tag: tag.to_string(),
            weight: "w".to_string(),
            replicate_weights: vec!["r1".to_string(), "r2".to_string()],
        }
    }

    #[test]
    fn test_weight_layout() {
        let a = cycle("A", [1.0, 2.0], [[10.0, 20.0], [11.0, 21.0]], "only_a");
        let b = cycle("B", [3.0, 4.0], [[30.0, 40.0], [31.0, 41.0]], "only_b");
        let m = merge_cycles(&a, &b, &MergeOptions::default()).unwrap();

        assert_eq!(m.height(), 4);
        let opts = MergeOptions::default();
        for name in opts.replicate_columns(4) {
            assert!(m.has_column(&name));
        }
        assert!(!m.has_column("nwgt5"));
        assert_eq!(m.numeric("nwgt0").unwrap(), vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
        assert_eq!(m.numeric("nwgt1").unwrap(), vec![Some(10.0), Some(20.0), Some(3.0), Some(4.0)]);
        assert_eq!(m.numeric("nwgt3").unwrap(), vec![Some(1.0), Some(2.0), Some(30.0), Some(40.0)]);
        assert_eq!(m.numeric("nwgt4").unwrap(), vec![Some(1.0), Some(2.0), Some(31.0), Some(41.0)]);

        let survey = m.text("survey").unwrap();
        assert_eq!(survey[0].as_deref(), Some("A"));
        assert_eq!(survey[3].as_deref(), Some("B"));
        let only_a = m.text("only_a").unwrap();
        assert_eq!(only_a[2], None);
        assert_eq!(m.text("only_b").unwrap()[0], None);
    }

    #[test]
    fn test_unequal_replicate_counts() {
        let a = cycle("A", [1.0, 2.0], [[10.0, 20.0], [11.0, 21.0]], "k");
        let mut b = cycle("B", [3.0, 4.0], [[30.0, 40.0], [31.0, 41.0]], "k");
        b.dataset.add_column(Series::new("r3".into(), [32.0f64, 42.0])).unwrap();
        b.replicate_weights.push("r3".to_string());
        let m = merge_cycles(&a, &b, &MergeOptions::default()).unwrap();

        assert!(m.has_column("nwgt5"));
        assert!(!m.has_column("nwgt6"));
        assert_eq!(m.numeric("nwgt2").unwrap(), vec![Some(11.0), Some(21.0), Some(3.0), Some(4.0)]);
        assert_eq!(m.numeric("nwgt5").unwrap(), vec![Some(1.0), Some(2.0), Some(32.0), Some(42.0)]);
    }

    #[test]
    fn test_dtype_widening() {
        let mut a = cycle("A", [1.0, 2.0], [[1.0, 1.0], [1.0, 1.0]], "k");
        let mut b = cycle("B", [1.0, 2.0], [[1.0, 1.0], [1.0, 1.0]], "k");
        a.dataset.add_column(Series::new("num".into(), [1i32, 2])).unwrap();
        b.dataset.add_column(Series::new("num".into(), [0.5f64, 1.5])).unwrap();
        a.dataset.add_column(Series::new("mixed".into(), [1i32, 2])).unwrap();
        b.dataset.add_column(Series::new("mixed".into(), ["p", "q"])).unwrap();
        let m = merge_cycles(&a, &b, &MergeOptions::default()).unwrap();
        assert_eq!(m.column("num").unwrap().dtype(), &DataType::Float64);
        assert_eq!(m.column("mixed").unwrap().dtype(), &DataType::String);
        assert_eq!(m.text("mixed").unwrap()[0].as_deref(), Some("1"));
    }

    #[test]
    fn test_collisions_and_missing_replicates() {
        let a = cycle("A", [1.0, 2.0], [[1.0, 1.0], [1.0, 1.0]], "nwgt3");
        let b = cycle("B", [1.0, 2.0], [[1.0, 1.0], [1.0, 1.0]], "k");
        assert!(matches!(merge_cycles(&a, &b, &MergeOptions::default()), Err(SvyError::Config(_))));

        let a = cycle("A", [1.0, 2.0], [[1.0, 1.0], [1.0, 1.0]], "k");
        let mut b2 = b.clone();
        b2.replicate_weights.push("r3".to_string());
        assert!(matches!(merge_cycles(&a, &b2, &MergeOptions::default()), Err(SvyError::Config(_))));
    }

    #[test]
    fn test_labels_prefer_first_cycle() {
        let mut a = cycle("A", [1.0, 2.0], [[1.0, 1.0], [1.0, 1.0]], "k");
        let mut b = cycle("B", [1.0, 2.0], [[1.0, 1.0], [1.0, 1.0]], "k");
        let mut la = ValueLabels::new();
        la.insert(1, "Yes".to_string());
        let mut lb = ValueLabels::new();
        lb.insert(1, "YES".to_string());
        a.dataset.set_value_labels("id", la);
        b.dataset.set_value_labels("id", lb.clone());
        b.dataset.set_value_labels("w", lb);
        let m = merge_cycles(&a, &b, &MergeOptions::default()).unwrap();
        assert_eq!(m.value_labels("id").unwrap()[&1], "Yes");
        assert!(m.value_labels("w").is_some());
    }
}
