// src/pipeline.rs
//! Executes an [`AnalysisConfig`]: load, merge, recode, build the design,
//! then run every requested estimate in order.

use std::collections::HashSet;

use crate::config::{AnalysisConfig, DatasetConfig, DesignConfig, DesignPreset, MergeConfig};
use crate::dataset::Dataset;
use crate::design::{SurveyDesign, VarianceMethod};
use crate::error::{Result, SvyError};
use crate::estimation::chisq::chisq_formula;
use crate::estimation::crosstab::weighted_crosstab;
use crate::hints;
use crate::io::{load_dataset, write_dta};
use crate::merge::{merge_cycles, CycleInput};
use crate::recode::{apply_rules, RecodeRule};
use crate::regression::glm::svyglm;
use crate::report::{describe_design, AnalysisReport, GlmReport};

fn cycle_input(cfg: &DatasetConfig, dataset: Dataset) -> CycleInput {
    let mut cycle = hints::cycle(dataset, &cfg.tag());
    if let Some(w) = &cfg.weight {
        cycle.weight = w.clone();
    }
    if let Some(r) = &cfg.replicate_weights {
        cycle.replicate_weights = r.clone();
    }
    cycle
}

fn load_and_merge(config: &AnalysisConfig) -> Result<Dataset> {
    let mut loaded = config
        .datasets
        .iter()
        .map(|d| {
            log::info!("Loading {}", d.path.display());
            load_dataset(&d.path)
        })
        .collect::<Result<Vec<_>>>()?;

    match &config.merge {
        None => loaded
            .pop()
            .ok_or_else(|| SvyError::config("no datasets listed")),
        Some(merge) => merge_pair(config, merge, loaded),
    }
}

fn merge_pair(config: &AnalysisConfig, merge: &MergeConfig, loaded: Vec<Dataset>) -> Result<Dataset> {
    let mut it = config.datasets.iter().zip(loaded);
    let (Some((cfg_a, ds_a)), Some((cfg_b, ds_b)), None) = (it.next(), it.next(), it.next()) else {
        return Err(SvyError::config("a merge needs exactly two datasets"));
    };
    let a = cycle_input(cfg_a, ds_a);
    let b = cycle_input(cfg_b, ds_b);
    let merged = merge_cycles(&a, &b, &merge.options())?;
    if let Some(out) = &merge.output {
        write_dta(&merged, out)?;
        log::info!("Wrote merged dataset to {}", out.display());
    }
    Ok(merged)
}

/// Standard HINTS recodes, minus any the config redefines, followed by the
/// config's own rules.
fn recode_rules(config: &AnalysisConfig, ds: &Dataset) -> Vec<RecodeRule> {
    let custom: HashSet<&str> = config.recode.iter().map(|r| r.target.as_str()).collect();
    let mut rules: Vec<RecodeRule> = if config.standard_recodes {
        hints::standard_rules(ds)
            .into_iter()
            .filter(|r| !custom.contains(r.target.as_str()))
            .collect()
    } else {
        Vec::new()
    };
    rules.extend(config.recode.iter().cloned());
    rules
}

pub fn resolve_design(config: &AnalysisConfig) -> Result<VarianceMethod> {
    match &config.design {
        DesignConfig::Custom(method) => Ok(method.clone()),
        DesignConfig::Preset { preset: DesignPreset::Replicate } => Ok(hints::replicate_design()),
        DesignConfig::Preset { preset: DesignPreset::Linearization } => Ok(hints::linearization_design()),
        DesignConfig::Preset { preset: DesignPreset::Merged } => {
            let merge = config
                .merge
                .as_ref()
                .ok_or_else(|| SvyError::config("the 'merged' design preset needs a [merge] block"))?;
            let a = config.datasets[0].replicate_weights.as_ref().map_or(hints::N_REPLICATES, Vec::len);
            let b = config.datasets[1].replicate_weights.as_ref().map_or(hints::N_REPLICATES, Vec::len);
            if a + b != 2 * hints::N_REPLICATES {
                return Err(SvyError::config(format!(
                    "the 'merged' preset assumes {} + {} replicates; describe a {}-replicate design explicitly",
                    hints::N_REPLICATES,
                    hints::N_REPLICATES,
                    a + b
                )));
            }
            Ok(hints::merged_replicate_design(&merge.options()))
        }
    }
}

pub fn run(config: &AnalysisConfig) -> Result<AnalysisReport> {
    config.validate()?;
    let mut dataset = load_and_merge(config)?;

    let rules = recode_rules(config, &dataset);
    apply_rules(&mut dataset, &rules)?;

    let method = resolve_design(config)?;
    let n_rows = dataset.height();
    let n_columns = dataset.column_names().len();
    let design = SurveyDesign::new(dataset, method)?;
    log::info!("Design: {}", describe_design(design.method()));

    let mut crosstabs = Vec::with_capacity(config.crosstab.len());
    for req in &config.crosstab {
        let by: Vec<&str> = req.by.iter().map(String::as_str).collect();
        log::info!("Crosstab by {:?}", by);
        crosstabs.push(weighted_crosstab(&design, &by, &req.filters)?);
    }

    let mut chisq = Vec::with_capacity(config.chisq.len());
    for req in &config.chisq {
        log::info!("Chi-square test {}", req.formula);
        chisq.push(chisq_formula(&design, &req.formula)?);
    }

    let mut glms = Vec::with_capacity(config.glm.len());
    for req in &config.glm {
        log::info!("GLM {} ({:?})", req.formula, req.family);
        let fit = svyglm(&design, &req.formula, req.family, &req.options())?;
        glms.push(GlmReport { fit, level: req.level, exponentiate: req.exponentiate });
    }

    Ok(AnalysisReport {
        n_rows,
        n_columns,
        design: describe_design(design.method()),
        design_df: design.degrees_of_freedom(),
        crosstabs,
        chisq,
        glms,
    })
}
