// src/estimation/mod.rs
pub mod chisq;
pub mod crosstab;
pub mod replication;
pub mod taylor;

pub use chisq::{chisq_formula, chisq_test, ChisqTest};
pub use crosstab::{weighted_crosstab, CrossTab, CrossTabRow, Filter};
pub use replication::{RepMethod, VarianceCenter};
pub use taylor::{PsuLayout, SingletonMethod};
