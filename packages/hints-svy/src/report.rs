// src/report.rs
//! Console rendering of analysis results and dataset overviews.

use std::fmt;

use polars::prelude::*;

use crate::dataset::Dataset;
use crate::design::VarianceMethod;
use crate::error::Result;
use crate::estimation::chisq::ChisqTest;
use crate::estimation::crosstab::CrossTab;
use crate::regression::glm::GlmFit;

const MAX_LABELS_SHOWN: usize = 6;

#[derive(Debug, Clone)]
pub struct GlmReport {
    pub fit: GlmFit,
    pub level: f64,
    pub exponentiate: bool,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub n_rows: usize,
    pub n_columns: usize,
    pub design: String,
    pub design_df: usize,
    pub crosstabs: Vec<CrossTab>,
    pub chisq: Vec<ChisqTest>,
    pub glms: Vec<GlmReport>,
}

pub fn describe_design(method: &VarianceMethod) -> String {
    match method {
        VarianceMethod::ReplicateWeights(r) => format!(
            "replicate weights ({:?}, {} replicates, scale {:.4}, weight {}{})",
            r.rep_type,
            r.replicate_weights.len(),
            r.scale,
            r.weight,
            if r.mse { ", mse" } else { "" }
        ),
        VarianceMethod::Linearization(l) => format!(
            "linearization (cluster {}, stratum {}, weight {}{}, lonely PSU {:?})",
            l.cluster.as_deref().unwrap_or("-"),
            l.stratum.as_deref().unwrap_or("-"),
            l.weight,
            if l.nested { ", nested" } else { "" },
            l.lonely_psu
        ),
    }
}

fn write_frame(f: &mut fmt::Formatter<'_>, frame: Result<DataFrame>) -> fmt::Result {
    match frame {
        Ok(df) => writeln!(f, "{}", df),
        Err(e) => writeln!(f, "<table unavailable: {}>", e),
    }
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data: {} rows, {} columns", self.n_rows, self.n_columns)?;
        writeln!(f, "Design: {} ; design df = {}", self.design, self.design_df)?;

        for tab in &self.crosstabs {
            writeln!(f)?;
            writeln!(f, "== Weighted crosstab by {} ==", tab.columns.join(" x "))?;
            write_frame(f, tab.to_frame())?;
        }
        for test in &self.chisq {
            writeln!(f)?;
            writeln!(f, "== {} by {} ==", test.row, test.col)?;
            write_frame(f, test.table_frame())?;
            writeln!(f, "{}", test)?;
        }
        for glm in &self.glms {
            writeln!(f)?;
            write!(f, "== {}", glm.fit)?;
            write_frame(f, glm.fit.to_frame())?;
            let scale = if glm.exponentiate { " (exponentiated)" } else { "" };
            writeln!(f, "{:.0}% confidence intervals{}:", glm.level * 100.0, scale)?;
            write_frame(f, glm.fit.confint_frame(glm.level, glm.exponentiate))?;
        }
        Ok(())
    }
}

fn summarize_labels(ds: &Dataset, name: &str) -> Option<String> {
    let labels = ds.value_labels(name)?;
    let mut parts: Vec<String> = labels
        .iter()
        .take(MAX_LABELS_SHOWN)
        .map(|(code, label)| format!("{}={}", code, label))
        .collect();
    if labels.len() > MAX_LABELS_SHOWN {
        parts.push(format!("... ({} labels)", labels.len()));
    }
    Some(parts.join("; "))
}

/// One row per column: dtype, missing count, variable label, value labels.
pub fn dataset_overview(ds: &Dataset) -> Result<DataFrame> {
    let names = ds.column_names();
    let mut dtypes = Vec::with_capacity(names.len());
    let mut missing = Vec::with_capacity(names.len());
    let mut var_labels: Vec<Option<String>> = Vec::with_capacity(names.len());
    let mut val_labels: Vec<Option<String>> = Vec::with_capacity(names.len());
    for name in &names {
        let col = ds.column(name)?;
        dtypes.push(col.dtype().to_string());
        missing.push(col.null_count() as u32);
        var_labels.push(ds.variable_label(name).map(str::to_string));
        val_labels.push(summarize_labels(ds, name));
    }
    let frame = df![
        "column" => names,
        "dtype" => dtypes,
        "missing" => missing,
        "label" => var_labels,
        "value_labels" => val_labels,
    ]?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ValueLabels;
    use crate::hints;

    #[test]
    fn test_overview_lists_labels() {
        let frame = df!["BirthGender" => [Some(1i32), None], "w" => [1.0f64, 2.0]].unwrap();
        let mut ds = Dataset::new(frame);
        let mut labels = ValueLabels::new();
        labels.insert(1, "Male".to_string());
        labels.insert(2, "Female".to_string());
        ds.set_value_labels("BirthGender", labels);

        let overview = dataset_overview(&ds).unwrap();
        assert_eq!(overview.height(), 2);
        let missing = overview.column("missing").unwrap().u32().unwrap().get(0);
        assert_eq!(missing, Some(1));
        let vl = overview.column("value_labels").unwrap().str().unwrap().get(0);
        assert_eq!(vl, Some("1=Male; 2=Female"));
    }

    #[test]
    fn test_design_description() {
        let text = describe_design(&hints::replicate_design());
        assert!(text.contains("50 replicates"));
        let text = describe_design(&hints::linearization_design());
        assert!(text.contains("VAR_CLUSTER") && text.contains("nested"));
    }
}
