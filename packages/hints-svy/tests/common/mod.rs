#![allow(dead_code)]

use hints_svy::Dataset;
use polars::prelude::*;

pub const N_REPS: usize = 50;

/// Deterministic generator so fixtures are reproducible without extra crates.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    pub fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn below(&mut self, n: usize) -> usize {
        ((self.next_f64() * n as f64) as usize).min(n - 1)
    }
}

/// A HINTS-shaped respondent file: raw codes, JK1 replicate weights over 50
/// groups, and 10 strata with 2 clusters each (labels reused across strata).
pub fn hints_like(n: usize, seed: u64) -> Dataset {
    let mut rng = Lcg::new(seed);
    let mut gender = Vec::with_capacity(n);
    let mut education = Vec::with_capacity(n);
    let mut seek = Vec::with_capacity(n);
    let mut health = Vec::with_capacity(n);
    let mut weight = Vec::with_capacity(n);
    let mut stratum = Vec::with_capacity(n);
    let mut cluster = Vec::with_capacity(n);

    for i in 0..n {
        let g = 1 + rng.below(2) as i32;
        // a few survey missing codes
        let e = if rng.next_f64() < 0.05 { -9 } else { 1 + rng.below(7) as i32 };
        let mut p = if g == 2 { 0.6 } else { 0.4 };
        if e >= 6 {
            p += 0.15;
        }
        let s = if rng.next_f64() < p { 1 } else { 2 };
        let h = 1 + rng.below(5) as i32;
        gender.push(g);
        education.push(e);
        seek.push(s);
        health.push(h);
        weight.push(500.0 + 1000.0 * rng.next_f64());
        stratum.push((i % 10) as i32 + 1);
        cluster.push(((i / 10) % 2) as i32 + 1);
    }

    let mut columns = vec![
        Column::new("BirthGender".into(), gender),
        Column::new("Education".into(), education),
        Column::new("SeekCancerInfo".into(), seek),
        Column::new("GeneralHealth".into(), health),
        Column::new("VAR_STRATUM".into(), stratum),
        Column::new("VAR_CLUSTER".into(), cluster),
        Column::new("PERSON_FINWT0".into(), weight.clone()),
    ];
    let factor = N_REPS as f64 / (N_REPS as f64 - 1.0);
    for r in 0..N_REPS {
        let rep: Vec<f64> = weight
            .iter()
            .enumerate()
            .map(|(i, &w)| if i % N_REPS == r { 0.0 } else { w * factor })
            .collect();
        columns.push(Column::new(format!("PERSON_FINWT{}", r + 1).as_str().into(), rep));
    }
    Dataset::new(DataFrame::new(columns).unwrap())
}
