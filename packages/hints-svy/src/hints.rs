// src/hints.rs
//! HINTS public-use file conventions: column names, standard recodes and
//! the two published variance designs.

use crate::dataset::Dataset;
use crate::design::{LinearizationSpec, ReplicateSpec, VarianceMethod};
use crate::estimation::taylor::SingletonMethod;
use crate::merge::{CycleInput, MergeOptions};
use crate::recode::RecodeRule;

pub const FINAL_WEIGHT: &str = "PERSON_FINWT0";
pub const REPLICATE_PREFIX: &str = "PERSON_FINWT";
pub const N_REPLICATES: usize = 50;
pub const VAR_CLUSTER: &str = "VAR_CLUSTER";
pub const VAR_STRATUM: &str = "VAR_STRATUM";

/// JK1 scale of a single cycle: (R - 1) / R with R = 50.
pub const JACKKNIFE_SCALE: f64 = 49.0 / 50.0;
/// JK1 scale over the 100 merged replicates (equal to 49/50).
pub const MERGED_JACKKNIFE_SCALE: f64 = 98.0 / 100.0;

pub fn replicate_columns() -> Vec<String> {
    (1..=N_REPLICATES).map(|r| format!("{}{}", REPLICATE_PREFIX, r)).collect()
}

pub fn replicate_design() -> VarianceMethod {
    VarianceMethod::ReplicateWeights(ReplicateSpec::jackknife(
        FINAL_WEIGHT,
        REPLICATE_PREFIX,
        N_REPLICATES,
        JACKKNIFE_SCALE,
    ))
}

pub fn linearization_design() -> VarianceMethod {
    VarianceMethod::Linearization(LinearizationSpec {
        weight: FINAL_WEIGHT.to_string(),
        cluster: Some(VAR_CLUSTER.to_string()),
        stratum: Some(VAR_STRATUM.to_string()),
        nested: true,
        lonely_psu: SingletonMethod::Skip,
    })
}

/// Jackknife over the harmonized weights written by [`crate::merge::merge_cycles`].
pub fn merged_replicate_design(options: &MergeOptions) -> VarianceMethod {
    let n = 2 * N_REPLICATES;
    VarianceMethod::ReplicateWeights(ReplicateSpec::jackknife(
        &options.weight_column(),
        &options.weight_prefix,
        n,
        MERGED_JACKKNIFE_SCALE,
    ))
}

/// A HINTS cycle as merge input, using the standard weight columns.
pub fn cycle(dataset: Dataset, tag: &str) -> CycleInput {
    CycleInput {
        dataset,
        tag: tag.to_string(),
        weight: FINAL_WEIGHT.to_string(),
        replicate_weights: replicate_columns(),
    }
}

// ============================================================================
// Standard recodes
// ============================================================================

pub fn gender() -> RecodeRule {
    RecodeRule::new("BirthGender", "gender", &[(1, "Male"), (2, "Female")], "Male")
}

pub fn education() -> RecodeRule {
    RecodeRule::new(
        "Education",
        "edu",
        &[
            (1, "Less than high school"),
            (2, "Less than high school"),
            (3, "12 years or completed high school"),
            (4, "Some college"),
            (5, "Some college"),
            (6, "College graduate or higher"),
            (7, "College graduate or higher"),
        ],
        "Less than high school",
    )
}

/// Outcome of the seeking model: "Yes" is the modelled level.
pub fn seek_cancer_info() -> RecodeRule {
    RecodeRule::new("SeekCancerInfo", "seek_cancer_info", &[(1, "Yes"), (2, "No")], "No")
}

pub fn general_health() -> RecodeRule {
    RecodeRule::new(
        "GeneralHealth",
        "general_health",
        &[(1, "Excellent"), (2, "Very good"), (3, "Good"), (4, "Fair"), (5, "Poor")],
        "Excellent",
    )
}

pub fn chance_ask_questions() -> RecodeRule {
    RecodeRule::new(
        "ChanceAskQuestions",
        "chance_ask_questions",
        &[(1, "Always"), (2, "Usually"), (3, "Sometimes"), (4, "Never")],
        "Always",
    )
}

/// All standard rules whose source column exists in `ds`.
pub fn standard_rules(ds: &Dataset) -> Vec<RecodeRule> {
    [gender(), education(), seek_cancer_info(), general_health(), chance_ask_questions()]
        .into_iter()
        .filter(|r| ds.has_column(&r.source))
        .collect()
}
