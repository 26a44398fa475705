// src/io/loader.rs
//! Entry point for respondent files. The format is chosen from the file
//! extension; all paths are explicit, nothing depends on the working directory.

use std::fs::File;
use std::path::Path;

use polars::prelude::*;

use super::stata::read_dta;
use crate::dataset::Dataset;
use crate::error::{Result, SvyError};

pub fn load_dataset(path: &Path) -> Result<Dataset> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "dta" => read_dta(path),
        "csv" => read_csv(path),
        _ => Err(SvyError::format(
            path.display().to_string(),
            "unrecognized table format (expected .dta or .csv)",
        )),
    }
}

/// Header CSV. No value labels are available from this format.
pub fn read_csv(path: &Path) -> Result<Dataset> {
    let file = File::open(path)?;
    let frame = CsvReader::new(file)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()
        .map_err(|e| SvyError::format(path.display().to_string(), e.to_string()))?;
    log::info!(
        "Loaded {}: {} rows x {} columns",
        path.display(),
        frame.height(),
        frame.width()
    );
    Ok(Dataset::new(frame))
}
