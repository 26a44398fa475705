// src/dataset.rs
//! In-memory respondent table plus the labelling metadata carried alongside it.
//!
//! The table itself is a polars `DataFrame`; nulls are the only missing-value
//! marker. Value labels come from the source file, factors from the recoder.

use std::collections::{BTreeMap, HashMap};

use polars::prelude::*;

use crate::error::{Result, SvyError};

/// Level set of a derived categorical column. `levels[0]` is the reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    pub levels: Vec<String>,
    pub reference: String,
}

impl Factor {
    pub fn new(levels: Vec<String>, reference: &str) -> Result<Self> {
        let pos = levels.iter().position(|l| l == reference).ok_or_else(|| {
            SvyError::config(format!(
                "reference level '{}' is not one of the levels {:?}",
                reference, levels
            ))
        })?;
        let mut ordered = levels;
        let r = ordered.remove(pos);
        ordered.insert(0, r);
        Ok(Factor { levels: ordered, reference: reference.to_string() })
    }

    pub fn rank(&self, label: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == label)
    }

    /// Levels that receive a treatment-contrast column in a model matrix.
    pub fn contrast_levels(&self) -> &[String] {
        &self.levels[1..]
    }
}

pub type ValueLabels = BTreeMap<i64, String>;

#[derive(Debug, Clone)]
pub struct Dataset {
    frame: DataFrame,
    value_labels: HashMap<String, ValueLabels>,
    variable_labels: HashMap<String, String>,
    factors: HashMap<String, Factor>,
}

pub(crate) fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Boolean
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Float32
            | DataType::Float64
    )
}

impl Dataset {
    pub fn new(frame: DataFrame) -> Self {
        Dataset {
            frame,
            value_labels: HashMap::new(),
            variable_labels: HashMap::new(),
            factors: HashMap::new(),
        }
    }

    pub fn with_labels(
        frame: DataFrame,
        value_labels: HashMap<String, ValueLabels>,
        variable_labels: HashMap<String, String>,
    ) -> Self {
        Dataset { frame, value_labels, variable_labels, factors: HashMap::new() }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.frame.get_column_names().iter().map(|s| s.to_string()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.get_column_names().iter().any(|c| c.as_str() == name)
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        if !self.has_column(name) {
            return Err(SvyError::config(format!("column '{}' not found in dataset", name)));
        }
        Ok(self.frame.column(name)?)
    }

    /// Column values as `f64`, with nulls (and NaN) as `None`.
    pub fn numeric(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let col = self.column(name)?;
        if !is_numeric_dtype(col.dtype()) {
            return Err(SvyError::config(format!(
                "column '{}' has type {:?}, expected a numeric column",
                name,
                col.dtype()
            )));
        }
        let casted = col.cast(&DataType::Float64)?;
        let values = casted.f64()?;
        Ok(values.iter().map(|v| v.filter(|x| !x.is_nan())).collect())
    }

    /// Integral codes. Non-integral numbers are treated as missing.
    pub fn codes(&self, name: &str) -> Result<Vec<Option<i64>>> {
        Ok(self
            .numeric(name)?
            .into_iter()
            .map(|v| v.filter(|x| x.fract() == 0.0).map(|x| x as i64))
            .collect())
    }

    /// Column values rendered as text (numbers use polars' string cast).
    pub fn text(&self, name: &str) -> Result<Vec<Option<String>>> {
        let col = self.column(name)?;
        let casted = col.cast(&DataType::String)?;
        let values = casted.str()?;
        Ok(values.iter().map(|v| v.map(str::to_string)).collect())
    }

    /// Appends a derived column. Existing columns are never replaced.
    pub fn add_column(&mut self, series: Series) -> Result<()> {
        if self.has_column(series.name().as_str()) {
            return Err(SvyError::config(format!(
                "column '{}' already exists; derived columns cannot overwrite source data",
                series.name()
            )));
        }
        if series.len() != self.height() {
            return Err(SvyError::config(format!(
                "derived column '{}' has {} rows, dataset has {}",
                series.name(),
                series.len(),
                self.height()
            )));
        }
        self.frame.with_column(series)?;
        Ok(())
    }

    pub fn value_labels(&self, name: &str) -> Option<&ValueLabels> {
        self.value_labels.get(name)
    }

    pub fn all_value_labels(&self) -> &HashMap<String, ValueLabels> {
        &self.value_labels
    }

    pub fn set_value_labels(&mut self, name: &str, labels: ValueLabels) {
        self.value_labels.insert(name.to_string(), labels);
    }

    pub fn variable_label(&self, name: &str) -> Option<&str> {
        self.variable_labels.get(name).map(String::as_str)
    }

    pub fn all_variable_labels(&self) -> &HashMap<String, String> {
        &self.variable_labels
    }

    pub fn factor(&self, name: &str) -> Option<&Factor> {
        self.factors.get(name)
    }

    pub fn set_factor(&mut self, name: &str, factor: Factor) {
        self.factors.insert(name.to_string(), factor);
    }
}
