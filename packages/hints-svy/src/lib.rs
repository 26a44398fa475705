// src/lib.rs
//! Design-based analysis of HINTS public-use files.
//!
//! Datasets are loaded from Stata `.dta` (or CSV), raw codes are recoded into
//! labelled factors, and a [`SurveyDesign`] binds the data to either
//! replicate-weight or Taylor-linearization variance metadata. Estimators
//! (crosstabs, Rao-Scott chi-square, survey GLMs) are read-only functions of
//! a design. Two cycles can be stacked with a harmonized replicate layout
//! via [`merge::merge_cycles`].

pub mod config;
pub mod dataset;
pub mod design;
pub mod distributions;
pub mod error;
pub mod estimation;
pub mod hints;
pub mod io;
pub mod linalg;
pub mod merge;
pub mod pipeline;
pub mod recode;
pub mod regression;
pub mod report;

pub use dataset::{Dataset, Factor, ValueLabels};
pub use design::{LinearizationSpec, ReplicateSpec, SurveyDesign, VarianceMethod};
pub use error::{Result, SvyError};
pub use estimation::{
    chisq_formula, chisq_test, weighted_crosstab, ChisqTest, CrossTab, CrossTabRow, Filter, RepMethod,
    SingletonMethod,
};
pub use merge::{merge_cycles, CycleInput, MergeOptions};
pub use recode::{apply_rules, RecodeRule};
pub use regression::{svyglm, Family, GlmFit, GlmOptions};
