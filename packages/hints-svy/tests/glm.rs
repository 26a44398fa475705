mod common;

use approx::assert_abs_diff_eq;
use hints_svy::{apply_rules, hints, svyglm, Dataset, Family, GlmOptions, SurveyDesign, SvyError};

fn recoded(n: usize, seed: u64) -> Dataset {
    let mut ds = common::hints_like(n, seed);
    let rules = hints::standard_rules(&ds);
    apply_rules(&mut ds, &rules).unwrap();
    ds
}

fn weighted_mean(ds: &Dataset, column: &str, gender: &str) -> f64 {
    let y = ds.numeric(column).unwrap();
    let w = ds.numeric(hints::FINAL_WEIGHT).unwrap();
    let g = ds.text("gender").unwrap();
    let (mut num, mut den) = (0.0, 0.0);
    for i in 0..ds.height() {
        if g[i].as_deref() == Some(gender) {
            num += w[i].unwrap() * y[i].unwrap();
            den += w[i].unwrap();
        }
    }
    num / den
}

#[test]
fn gaussian_coefficients_are_weighted_means() {
    let ds = recoded(400, 8);
    let male = weighted_mean(&ds, "GeneralHealth", "Male");
    let female = weighted_mean(&ds, "GeneralHealth", "Female");
    let design = SurveyDesign::new(ds, hints::replicate_design()).unwrap();
    let fit = svyglm(&design, "GeneralHealth ~ gender", Family::Gaussian, &GlmOptions::default()).unwrap();
    assert_eq!(fit.terms, vec!["(Intercept)", "genderFemale"]);
    assert_abs_diff_eq!(fit.coefficients[0], male, epsilon = 1e-8);
    assert_abs_diff_eq!(fit.coefficients[1], female - male, epsilon = 1e-8);
    assert_eq!(fit.df_resid, 48.0);
}

#[test]
fn logit_under_both_designs() {
    let ds = recoded(600, 13);
    let formula = "seek_cancer_info ~ gender + edu";
    let rep = SurveyDesign::new(ds.clone(), hints::replicate_design()).unwrap();
    let lin = SurveyDesign::new(ds, hints::linearization_design()).unwrap();
    let a = svyglm(&rep, formula, Family::QuasiBinomial, &GlmOptions::default()).unwrap();
    let b = svyglm(&lin, formula, Family::QuasiBinomial, &GlmOptions::default()).unwrap();

    assert_eq!(a.terms.len(), 5);
    // point estimates depend only on the full-sample weights
    for k in 0..5 {
        assert_abs_diff_eq!(a.coefficients[k], b.coefficients[k], epsilon = 1e-8);
    }
    for se in a.std_errors().iter().chain(b.std_errors().iter()) {
        assert!(se.is_finite() && *se > 0.0);
    }
    assert!(a.p_values().iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(b.dispersion > 0.0);
    assert!(a.deviance < a.null_deviance);
}

#[test]
fn odds_ratio_intervals() {
    let ds = recoded(600, 17);
    let design = SurveyDesign::new(ds, hints::replicate_design()).unwrap();
    let fit = svyglm(&design, "seek_cancer_info ~ gender", Family::QuasiBinomial, &GlmOptions::default()).unwrap();
    let raw = fit.confint(0.95, false).unwrap();
    let odds = fit.confint(0.95, true).unwrap();
    for (r, o) in raw.iter().zip(odds.iter()) {
        assert_eq!(r.term, o.term);
        assert_abs_diff_eq!(o.estimate, r.estimate.exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(o.lower, r.lower.exp(), epsilon = 1e-12);
        assert!(o.lower < o.estimate && o.estimate < o.upper);
    }
    let narrow = fit.confint(0.5, false).unwrap();
    assert!(narrow[1].upper - narrow[1].lower < raw[1].upper - raw[1].lower);
}

#[test]
fn gaussian_ignores_exponentiate() {
    let ds = recoded(200, 4);
    let design = SurveyDesign::new(ds, hints::linearization_design()).unwrap();
    let fit = svyglm(&design, "GeneralHealth ~ gender", Family::Gaussian, &GlmOptions::default()).unwrap();
    assert_eq!(fit.confint(0.95, true).unwrap(), fit.confint(0.95, false).unwrap());
}

#[test]
fn iteration_budget_is_reported() {
    let ds = recoded(300, 6);
    let design = SurveyDesign::new(ds, hints::replicate_design()).unwrap();
    let opts = GlmOptions { max_iter: 1, ..GlmOptions::default() };
    let err = svyglm(&design, "seek_cancer_info ~ gender + edu", Family::QuasiBinomial, &opts).unwrap_err();
    assert!(matches!(err, SvyError::Convergence { iterations: 1, .. }));
}
