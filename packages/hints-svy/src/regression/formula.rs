// src/regression/formula.rs
//! Minimal model formulas: `y ~ a + b`, `~ a + b`, with `+ 0` / `- 1` to drop
//! the intercept.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SvyError};

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub response: Option<String>,
    pub terms: Vec<String>,
    pub intercept: bool,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl FromStr for Formula {
    type Err = SvyError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: &str| SvyError::config(format!("malformed formula '{}': {}", s, why));

        let (lhs, rhs) = s.split_once('~').ok_or_else(|| bad("missing '~'"))?;
        if rhs.contains('~') {
            return Err(bad("more than one '~'"));
        }
        let lhs = lhs.trim();
        let response = if lhs.is_empty() {
            None
        } else if is_identifier(lhs) {
            Some(lhs.to_string())
        } else {
            return Err(bad("response must be a single column name"));
        };

        // Split on '+' and '-' while remembering the sign of each term.
        let mut pieces: Vec<(bool, String)> = Vec::new();
        let mut sign = true;
        let mut current = String::new();
        for c in rhs.chars() {
            match c {
                '+' | '-' => {
                    pieces.push((sign, std::mem::take(&mut current)));
                    sign = c == '+';
                }
                _ => current.push(c),
            }
        }
        pieces.push((sign, current));

        let mut intercept = true;
        let mut terms: Vec<String> = Vec::new();
        for (i, (positive, raw)) in pieces.into_iter().enumerate() {
            let term = raw.trim();
            if term.is_empty() {
                // a leading sign ("~ -1") leaves an empty first piece
                if i == 0 {
                    continue;
                }
                return Err(bad("empty term"));
            }
            match (positive, term) {
                (true, "1") => intercept = true,
                (true, "0") | (false, "1") => intercept = false,
                (true, t) if is_identifier(t) => {
                    if !terms.iter().any(|x| x == t) {
                        terms.push(t.to_string());
                    }
                }
                (false, _) => return Err(bad("only '- 1' may be subtracted")),
                _ => return Err(bad(&format!("'{}' is not a column name", term))),
            }
        }
        if terms.is_empty() && !intercept {
            return Err(bad("model has no terms"));
        }
        if let Some(r) = &response {
            if terms.contains(r) {
                return Err(bad("response also appears as a predictor"));
            }
        }
        Ok(Formula { response, terms, intercept })
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(r) = &self.response {
            write!(f, "{} ", r)?;
        }
        write!(f, "~ ")?;
        let mut parts: Vec<&str> = self.terms.iter().map(String::as_str).collect();
        if !self.intercept {
            parts.push("0");
        } else if parts.is_empty() {
            parts.push("1");
        }
        write!(f, "{}", parts.join(" + "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_glm_formula() {
        let f: Formula = "seek ~ gender + edu".parse().unwrap();
        assert_eq!(f.response.as_deref(), Some("seek"));
        assert_eq!(f.terms, vec!["gender".to_string(), "edu".to_string()]);
        assert!(f.intercept);
        assert_eq!(f.to_string(), "seek ~ gender + edu");
    }

    #[test]
    fn test_one_sided_and_intercept_removal() {
        let f: Formula = "~a+b".parse().unwrap();
        assert!(f.response.is_none());
        let f: Formula = "y ~ x - 1".parse().unwrap();
        assert!(!f.intercept);
        let f: Formula = "y ~ 0 + x + x".parse().unwrap();
        assert!(!f.intercept);
        assert_eq!(f.terms.len(), 1);
    }

    #[test]
    fn test_malformed() {
        for bad in ["y = x", "y ~ x +", "y ~ x ~ z", "y ~ 3x", "y ~ 0", "y ~ - x", "y ~ y", "a b ~ c"] {
            assert!(
                matches!(bad.parse::<Formula>(), Err(SvyError::Config(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
