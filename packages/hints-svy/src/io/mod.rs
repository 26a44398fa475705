// src/io/mod.rs
pub mod loader;
pub mod stata;

pub use loader::{load_dataset, read_csv};
pub use stata::{encode_dta, parse_dta, read_dta, write_dta};
