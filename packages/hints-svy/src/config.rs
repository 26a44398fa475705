// src/config.rs
//! TOML description of an analysis run.
//!
//! ```toml
//! standard_recodes = true
//!
//! [[datasets]]
//! path = "hints6.dta"
//! tag = "HINTS 6"
//!
//! [design]
//! preset = "replicate"
//!
//! [[crosstab]]
//! by = ["edu", "gender"]
//!
//! [[chisq]]
//! formula = "~ edu + gender"
//!
//! [[glm]]
//! formula = "seek_cancer_info ~ gender + edu"
//! family = "quasibinomial"
//! exponentiate = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::design::VarianceMethod;
use crate::error::{Result, SvyError};
use crate::estimation::crosstab::Filter;
use crate::merge::MergeOptions;
use crate::recode::RecodeRule;
use crate::regression::glm::{Family, GlmOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub tag: Option<String>,
    /// Base weight for merging; HINTS' `PERSON_FINWT0` when absent.
    #[serde(default)]
    pub weight: Option<String>,
    #[serde(default)]
    pub replicate_weights: Option<Vec<String>>,
}

impl DatasetConfig {
    pub fn tag(&self) -> String {
        self.tag.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "MergeConfig::default_provenance")]
    pub provenance_column: String,
    #[serde(default = "MergeConfig::default_prefix")]
    pub weight_prefix: String,
    /// Optional `.dta` file receiving the merged dataset.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl MergeConfig {
    fn default_provenance() -> String {
        MergeOptions::default().provenance_column
    }

    fn default_prefix() -> String {
        MergeOptions::default().weight_prefix
    }

    pub fn options(&self) -> MergeOptions {
        MergeOptions {
            provenance_column: self.provenance_column.clone(),
            weight_prefix: self.weight_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesignPreset {
    /// HINTS jackknife over `PERSON_FINWT1..50`.
    Replicate,
    /// HINTS `VAR_CLUSTER` within `VAR_STRATUM`.
    Linearization,
    /// Jackknife over the harmonized weights of a merged file.
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DesignConfig {
    Preset { preset: DesignPreset },
    Custom(VarianceMethod),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosstabRequest {
    pub by: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChisqRequest {
    pub formula: String,
}

fn default_level() -> f64 {
    0.95
}

fn default_max_iter() -> usize {
    GlmOptions::default().max_iter
}

fn default_tol() -> f64 {
    GlmOptions::default().tol
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlmRequest {
    pub formula: String,
    pub family: Family,
    #[serde(default = "default_level")]
    pub level: f64,
    #[serde(default)]
    pub exponentiate: bool,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(default)]
    pub start: Option<Vec<f64>>,
}

impl GlmRequest {
    pub fn options(&self) -> GlmOptions {
        GlmOptions { max_iter: self.max_iter, tol: self.tol, start: self.start.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub merge: Option<MergeConfig>,
    /// Apply the HINTS recodes for every standard source column present.
    #[serde(default)]
    pub standard_recodes: bool,
    #[serde(default)]
    pub recode: Vec<RecodeRule>,
    pub design: DesignConfig,
    #[serde(default)]
    pub crosstab: Vec<CrosstabRequest>,
    #[serde(default)]
    pub chisq: Vec<ChisqRequest>,
    #[serde(default)]
    pub glm: Vec<GlmRequest>,
}

impl AnalysisConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AnalysisConfig = toml::from_str(text).map_err(|e| SvyError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file. Relative data paths are resolved against the
    /// file's directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::from_toml(&text)
            .map_err(|e| SvyError::config(format!("{}: {}", path.display(), e)))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        log::debug!("Loaded analysis config from {}", path.display());
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for ds in &mut self.datasets {
            if ds.path.is_relative() {
                ds.path = base.join(&ds.path);
            }
        }
        if let Some(out) = self.merge.as_mut().and_then(|m| m.output.as_mut()) {
            if out.is_relative() {
                *out = base.join(&*out);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (self.datasets.len(), &self.merge) {
            (0, _) => return Err(SvyError::config("no datasets listed")),
            (1, None) | (2, Some(_)) => {}
            (1, Some(_)) => return Err(SvyError::config("a merge needs exactly two datasets, found one")),
            (n, _) => {
                return Err(SvyError::config(format!(
                    "{} datasets listed; more than one requires a [merge] block over exactly two",
                    n
                )))
            }
        }
        if matches!(self.design, DesignConfig::Preset { preset: DesignPreset::Merged }) && self.merge.is_none() {
            return Err(SvyError::config("the 'merged' design preset needs a [merge] block"));
        }
        for rule in &self.recode {
            rule.validate()?;
        }
        for req in &self.crosstab {
            if req.by.is_empty() {
                return Err(SvyError::config("crosstab request with an empty 'by' list"));
            }
        }
        for req in &self.glm {
            if !(req.level > 0.0 && req.level < 1.0) {
                return Err(SvyError::config(format!("glm '{}': level must be in (0, 1)", req.formula)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::ReplicateSpec;

    const EXAMPLE: &str = r#"
        [[datasets]]
        path = "data/hints6.dta"

        [[recode]]
        source = "BirthGender"
        target = "gender"
        reference = "Male"
        codes = [{ code = 1, label = "Male" }, { code = 2, label = "Female" }]

        [design]
        kind = "replicate"
        weight = "PERSON_FINWT0"
        replicate_weights = ["PERSON_FINWT1", "PERSON_FINWT2"]
        scale = 0.5
        rscales = [1.0, 1.0]

        [[crosstab]]
        by = ["gender"]
        filters = [{ op = "not_missing", column = "Education" }]

        [[glm]]
        formula = "y ~ gender"
        family = "gaussian"
    "#;

    #[test]
    fn test_parse_full_config() {
        let mut cfg = AnalysisConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(cfg.datasets[0].tag(), "hints6");
        assert_eq!(cfg.recode[0].codes.len(), 2);
        match &cfg.design {
            DesignConfig::Custom(VarianceMethod::ReplicateWeights(ReplicateSpec { scale, mse, .. })) => {
                assert_eq!(*scale, 0.5);
                assert!(*mse);
            }
            other => panic!("unexpected design {:?}", other),
        }
        assert_eq!(cfg.crosstab[0].filters[0], Filter::not_missing("Education"));
        assert_eq!(cfg.glm[0].level, 0.95);
        assert_eq!(cfg.glm[0].options().max_iter, 25);

        cfg.resolve_paths(Path::new("/srv/analysis"));
        assert_eq!(cfg.datasets[0].path, PathBuf::from("/srv/analysis/data/hints6.dta"));
    }

    #[test]
    fn test_preset_design() {
        let cfg = AnalysisConfig::from_toml(
            r#"
            datasets = [{ path = "a.dta" }]
            design = { preset = "linearization" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.design, DesignConfig::Preset { preset: DesignPreset::Linearization });
    }

    #[test]
    fn test_invalid_configs() {
        let merged_without_merge = r#"
            datasets = [{ path = "a.dta" }]
            design = { preset = "merged" }
        "#;
        assert!(matches!(AnalysisConfig::from_toml(merged_without_merge), Err(SvyError::Config(_))));

        let two_without_merge = r#"
            datasets = [{ path = "a.dta" }, { path = "b.dta" }]
            design = { preset = "replicate" }
        "#;
        assert!(AnalysisConfig::from_toml(two_without_merge).is_err());

        let err = AnalysisConfig::from_toml("datasets = 3").unwrap_err();
        assert!(matches!(err, SvyError::Config(_)));
    }
}
