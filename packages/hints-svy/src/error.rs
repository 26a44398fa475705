// src/error.rs

use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SvyError {
    /// The input file is not a recognized table format, or it is truncated.
    #[error("Cannot read '{path}': {reason}")]
    Format { path: String, reason: String },

    /// Malformed recoding rule, design descriptor, formula, or analysis config.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Weighted likelihood did not converge after {iterations} iterations (last relative change {delta:.3e})")]
    Convergence { iterations: usize, delta: f64 },

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SvyError {
    pub(crate) fn format(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SvyError::Format { path: path.into(), reason: reason.into() }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SvyError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SvyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failure() {
        let e = SvyError::format("hints6.dta", "unexpected end of file");
        assert_eq!(e.to_string(), "Cannot read 'hints6.dta': unexpected end of file");

        let e = SvyError::Convergence { iterations: 25, delta: 0.5 };
        assert!(e.to_string().contains("25 iterations"));
    }
}
