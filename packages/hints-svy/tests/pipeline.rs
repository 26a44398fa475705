mod common;

use std::fs;

use hints_svy::config::AnalysisConfig;
use hints_svy::io::{load_dataset, write_dta};
use hints_svy::pipeline;

#[test]
fn merged_run_from_config() {
    let dir = tempfile::tempdir().unwrap();
    write_dta(&common::hints_like(300, 31), &dir.path().join("hints6.dta")).unwrap();
    write_dta(&common::hints_like(280, 32), &dir.path().join("hints5.dta")).unwrap();

    let config_path = dir.path().join("analysis.toml");
    fs::write(
        &config_path,
        r#"
standard_recodes = true

[[datasets]]
path = "hints6.dta"
tag = "HINTS 6"

[[datasets]]
path = "hints5.dta"
tag = "HINTS 5"

[merge]
output = "merged.dta"

[design]
preset = "merged"

[[crosstab]]
by = ["edu", "gender"]

[[crosstab]]
by = ["gender"]
filters = [{ op = "equals", column = "survey", value = "HINTS 5" }]

[[chisq]]
formula = "~ edu + gender"

[[glm]]
formula = "seek_cancer_info ~ gender + edu"
family = "quasibinomial"
exponentiate = true
"#,
    )
    .unwrap();

    let config = AnalysisConfig::from_path(&config_path).unwrap();
    let report = pipeline::run(&config).unwrap();

    assert_eq!(report.n_rows, 580);
    assert_eq!(report.design_df, 99);
    assert_eq!(report.crosstabs.len(), 2);
    assert_eq!(report.crosstabs[1].rows.iter().map(|r| r.n).sum::<usize>(), 280);
    assert_eq!(report.chisq.len(), 1);
    assert!((0.0..=1.0).contains(&report.chisq[0].p_value));
    assert_eq!(report.glms.len(), 1);
    assert_eq!(report.glms[0].fit.terms.len(), 5);

    let text = report.to_string();
    assert!(text.contains("genderFemale"));

    let merged = load_dataset(&dir.path().join("merged.dta")).unwrap();
    assert_eq!(merged.height(), 580);
    assert!(merged.has_column("nwgt100"));
    assert!(merged.has_column("survey"));
}

#[test]
fn single_cycle_linearization_run() {
    let dir = tempfile::tempdir().unwrap();
    write_dta(&common::hints_like(250, 9), &dir.path().join("hints6.dta")).unwrap();
    let config_path = dir.path().join("analysis.toml");
    fs::write(
        &config_path,
        r#"
standard_recodes = true

[[datasets]]
path = "hints6.dta"

[[recode]]
source = "GeneralHealth"
target = "general_health"
reference = "Good or better"
codes = [
    { code = 1, label = "Good or better" },
    { code = 2, label = "Good or better" },
    { code = 3, label = "Good or better" },
    { code = 4, label = "Fair or poor" },
    { code = 5, label = "Fair or poor" },
]

[design]
preset = "linearization"

[[crosstab]]
by = ["general_health"]
"#,
    )
    .unwrap();

    let report = pipeline::run(&AnalysisConfig::from_path(&config_path).unwrap()).unwrap();
    assert_eq!(report.design_df, 10);
    let keys: Vec<&str> = report.crosstabs[0].rows.iter().map(|r| r.key[0].as_str()).collect();
    assert_eq!(keys, vec!["Good or better", "Fair or poor"]);
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("analysis.toml");
    fs::write(
        &config_path,
        "[[datasets]]\npath = \"absent.dta\"\n\n[design]\npreset = \"replicate\"\n",
    )
    .unwrap();
    let config = AnalysisConfig::from_path(&config_path).unwrap();
    assert!(pipeline::run(&config).is_err());
}
