// src/regression/mod.rs
pub mod formula;
pub mod glm;
pub mod model_matrix;

pub use formula::Formula;
pub use glm::{svyglm, ConfInt, Family, GlmFit, GlmOptions};
pub use model_matrix::{ModelFrame, ResponseKind};
