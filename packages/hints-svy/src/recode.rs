// src/recode.rs
//! Raw integer codes to labelled categorical columns.

use std::collections::{BTreeMap, HashSet};

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, Factor};
use crate::error::{Result, SvyError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeLabel {
    pub code: i64,
    pub label: String,
}

/// Maps codes of `source` to labels in a new column `target`.
/// Codes outside the mapping, and nulls, become missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecodeRule {
    pub source: String,
    pub target: String,
    pub codes: Vec<CodeLabel>,
    pub reference: String,
}

impl RecodeRule {
    pub fn new(source: &str, target: &str, codes: &[(i64, &str)], reference: &str) -> Self {
        RecodeRule {
            source: source.to_string(),
            target: target.to_string(),
            codes: codes
                .iter()
                .map(|&(code, label)| CodeLabel { code, label: label.to_string() })
                .collect(),
            reference: reference.to_string(),
        }
    }

    /// Builds a rule from the value labels embedded in the source file,
    /// keeping only non-negative codes (negative codes are survey missing codes).
    pub fn from_value_labels(ds: &Dataset, source: &str, target: &str, reference: &str) -> Result<Self> {
        let labels = ds.value_labels(source).ok_or_else(|| {
            SvyError::config(format!("column '{}' carries no value labels", source))
        })?;
        let codes = labels
            .iter()
            .filter(|(code, _)| **code >= 0)
            .map(|(&code, label)| CodeLabel { code, label: label.clone() })
            .collect();
        let rule = RecodeRule {
            source: source.to_string(),
            target: target.to_string(),
            codes,
            reference: reference.to_string(),
        };
        rule.validate()?;
        Ok(rule)
    }

    fn lookup(&self) -> Result<BTreeMap<i64, &str>> {
        let mut map = BTreeMap::new();
        for cl in &self.codes {
            if cl.label.is_empty() {
                return Err(SvyError::config(format!(
                    "rule '{}': code {} maps to an empty label",
                    self.target, cl.code
                )));
            }
            if let Some(prev) = map.insert(cl.code, cl.label.as_str()) {
                if prev != cl.label {
                    return Err(SvyError::config(format!(
                        "rule '{}': code {} maps to both '{}' and '{}'",
                        self.target, cl.code, prev, cl.label
                    )));
                }
            }
        }
        Ok(map)
    }

    /// Distinct labels ordered by their smallest code.
    pub fn levels(&self) -> Vec<String> {
        let mut by_code: Vec<&CodeLabel> = self.codes.iter().collect();
        by_code.sort_by_key(|cl| cl.code);
        let mut seen = HashSet::new();
        by_code
            .into_iter()
            .filter(|cl| seen.insert(cl.label.as_str()))
            .map(|cl| cl.label.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.codes.is_empty() {
            return Err(SvyError::config(format!("rule '{}' has an empty mapping", self.target)));
        }
        if self.target.is_empty() {
            return Err(SvyError::config(format!("rule on '{}' has no target column", self.source)));
        }
        self.lookup()?;
        if !self.codes.iter().any(|cl| cl.label == self.reference) {
            return Err(SvyError::config(format!(
                "rule '{}': reference level '{}' is not among the mapped labels {:?}",
                self.target,
                self.reference,
                self.levels()
            )));
        }
        Ok(())
    }

    fn derive(&self, ds: &Dataset) -> Result<(Series, Factor)> {
        self.validate()?;
        let map = self.lookup()?;
        let labels: Vec<Option<&str>> = ds
            .codes(&self.source)?
            .into_iter()
            .map(|code| code.and_then(|c| map.get(&c).copied()))
            .collect();
        let missing = labels.iter().filter(|l| l.is_none()).count();
        log::debug!(
            "recode {} -> {}: {} of {} rows missing",
            self.source,
            self.target,
            missing,
            labels.len()
        );
        let factor = Factor::new(self.levels(), &self.reference)?;
        Ok((Series::new(self.target.as_str().into(), labels), factor))
    }

    pub fn apply(&self, ds: &mut Dataset) -> Result<()> {
        let (series, factor) = self.derive(ds)?;
        ds.add_column(series)?;
        ds.set_factor(&self.target, factor);
        Ok(())
    }
}

/// Applies independent rules. Everything is validated before the dataset changes.
pub fn apply_rules(ds: &mut Dataset, rules: &[RecodeRule]) -> Result<()> {
    let targets: HashSet<&str> = rules.iter().map(|r| r.target.as_str()).collect();
    if targets.len() != rules.len() {
        return Err(SvyError::config("two recoding rules write the same target column"));
    }
    if let Some(r) = rules.iter().find(|r| targets.contains(r.source.as_str())) {
        return Err(SvyError::config(format!(
            "rule '{}' reads '{}', which is produced by another rule",
            r.target, r.source
        )));
    }

    let derived = rules.iter().map(|r| r.derive(ds)).collect::<Result<Vec<_>>>()?;
    for (rule, (series, factor)) in rules.iter().zip(derived) {
        ds.add_column(series)?;
        ds.set_factor(&rule.target, factor);
    }
    log::info!("Applied {} recoding rules", rules.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edu_rule() -> RecodeRule {
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

    #[test]
    fn test_unmapped_codes_become_missing() {
        let frame = df!["Education" => [Some(1i32), Some(-9), Some(6), None, Some(3)]].unwrap();
        let mut ds = Dataset::new(frame);
        edu_rule().apply(&mut ds).unwrap();

        let out = ds.text("edu").unwrap();
        assert_eq!(out[0].as_deref(), Some("Less than high school"));
        assert_eq!(out[1], None);
        assert_eq!(out[2].as_deref(), Some("College graduate or higher"));
        assert_eq!(out[3], None);
        // raw codes untouched
        assert_eq!(ds.codes("Education").unwrap()[1], Some(-9));

        let allowed: HashSet<String> = edu_rule().levels().into_iter().collect();
        assert!(out.iter().flatten().all(|l| allowed.contains(l)));
    }

    #[test]
    fn test_levels_deduplicate_and_reference_leads() {
        let frame = df!["Education" => [1i32]].unwrap();
        let mut ds = Dataset::new(frame);
        let mut rule = edu_rule();
        rule.reference = "Some college".to_string();
        rule.apply(&mut ds).unwrap();
        let f = ds.factor("edu").unwrap();
        assert_eq!(f.levels.len(), 4);
        assert_eq!(f.levels[0], "Some college");
        assert_eq!(f.levels[1], "Less than high school");
    }

    #[test]
    fn test_reference_must_be_a_mapped_label() {
        let mut rule = edu_rule();
        rule.reference = "Doctorate".to_string();
        assert!(matches!(rule.validate(), Err(SvyError::Config(_))));
    }

    #[test]
    fn test_conflicting_codes_rejected() {
        let rule = RecodeRule::new("BirthGender", "gender", &[(1, "Male"), (1, "Female")], "Male");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_apply_rules_is_all_or_nothing() {
        let frame = df!["BirthGender" => [1i32, 2]].unwrap();
        let mut ds = Dataset::new(frame);
        let good = RecodeRule::new("BirthGender", "gender", &[(1, "Male"), (2, "Female")], "Male");
        let bad = RecodeRule::new("NoSuchColumn", "x", &[(1, "a")], "a");
        assert!(apply_rules(&mut ds, &[good.clone(), bad]).is_err());
        assert!(!ds.has_column("gender"));
        apply_rules(&mut ds, &[good]).unwrap();
        assert!(ds.has_column("gender"));
    }

    #[test]
    fn test_rule_from_embedded_labels_skips_missing_codes() {
        let frame = df!["SeekCancerInfo" => [1i32, 2]].unwrap();
        let mut ds = Dataset::new(frame);
        let mut labels = BTreeMap::new();
        labels.insert(-9, "Missing data".to_string());
        labels.insert(1, "Yes".to_string());
        labels.insert(2, "No".to_string());
        ds.set_value_labels("SeekCancerInfo", labels);

        let rule = RecodeRule::from_value_labels(&ds, "SeekCancerInfo", "seek", "No").unwrap();
        assert_eq!(rule.levels(), vec!["Yes".to_string(), "No".to_string()]);
    }
}
