//! Pure QC evaluation.
//!
//! `evaluate` applies a rule set to one measurement and its value history
//! and returns the resulting flags. It has no side effects and no hidden
//! state, so the same inputs always produce the same flags and independent
//! measurement streams can be evaluated concurrently.
//!
//! Insufficient history is silence, not an error: the statistical rules
//! simply produce no flag until enough values exist.

use chrono::Utc;
use tracing::debug;

use super::rules::{OutlierMethod, Rule, RuleAction, RuleKind, RuleSet};
use crate::lifecycle::types::{FlagType, Measurement, QcFlag};

/// Minimum sample size (current value included) for outlier rules.
pub const MIN_OUTLIER_SAMPLES: usize = 4;

/// Minimum sample size (current value included) for trend rules.
pub const MIN_TREND_SAMPLES: usize = 5;

/// Evaluate one measurement against a rule set.
///
/// `history` holds the values recorded for the same measurement id in
/// recording order, with the current value as the last element. The caller
/// caps the history; evaluation cost is linear in its length.
pub fn evaluate(measurement: &Measurement, rule_set: &RuleSet, history: &[f64]) -> Vec<QcFlag> {
    let mut flags = Vec::new();
    for rule in rule_set.applicable_to(measurement) {
        if let Some(flag) = check_rule(rule, measurement, history) {
            flags.push(flag);
        }
    }
    flags
}

fn check_rule(rule: &Rule, measurement: &Measurement, history: &[f64]) -> Option<QcFlag> {
    let value = measurement.value;
    match &rule.kind {
        RuleKind::Range { min, max } => check_range(rule, value, *min, *max),
        RuleKind::Outlier { method, threshold } => match method {
            OutlierMethod::Iqr => check_iqr(rule, value, history, *threshold),
            OutlierMethod::ZScore => check_zscore(rule, value, history, *threshold),
        },
        RuleKind::Trend { threshold } => check_trend(rule, value, history, *threshold),
    }
}

fn action_flag_type(action: RuleAction) -> FlagType {
    match action {
        RuleAction::FlagWarning => FlagType::Warning,
        RuleAction::FlagError => FlagType::Error,
    }
}

fn make_flag(rule: &Rule, flag_type: FlagType, description: String, value: f64, threshold_repr: String) -> QcFlag {
    QcFlag {
        rule_id: rule.rule_id.clone(),
        flag_type,
        description,
        value,
        threshold_repr,
        flagged_at: Utc::now(),
    }
}

/// Boundary values are acceptable; only strictly outside `[min, max]` flags.
fn check_range(rule: &Rule, value: f64, min: Option<f64>, max: Option<f64>) -> Option<QcFlag> {
    let lo = min.unwrap_or(f64::NEG_INFINITY);
    let hi = max.unwrap_or(f64::INFINITY);
    if value < lo || value > hi {
        let repr = format!("[{}, {}]", fmt_bound(min), fmt_bound(max));
        return Some(make_flag(
            rule,
            action_flag_type(rule.action),
            format!("value {value} outside allowed range {repr}"),
            value,
            repr,
        ));
    }
    None
}

fn fmt_bound(bound: Option<f64>) -> String {
    match bound {
        Some(b) => format!("{b}"),
        None => "unbounded".to_string(),
    }
}

fn check_iqr(rule: &Rule, value: f64, history: &[f64], factor: f64) -> Option<QcFlag> {
    if history.len() < MIN_OUTLIER_SAMPLES {
        return None;
    }
    let mut sorted = history.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = percentile(&sorted, 25.0);
    let q3 = percentile(&sorted, 75.0);
    let iqr = q3 - q1;
    let lower = q1 - factor * iqr;
    let upper = q3 + factor * iqr;
    if value < lower || value > upper {
        return Some(make_flag(
            rule,
            action_flag_type(rule.action),
            format!(
                "value {value} is an IQR outlier over {} samples",
                history.len()
            ),
            value,
            format!("[{lower:.4}, {upper:.4}] (k={factor})"),
        ));
    }
    None
}

fn check_zscore(rule: &Rule, value: f64, history: &[f64], threshold: f64) -> Option<QcFlag> {
    if history.len() < MIN_OUTLIER_SAMPLES {
        return None;
    }
    let mean = mean(history);
    let stddev = population_std_dev(history, mean);
    // A constant series has no spread to deviate from
    if stddev == 0.0 {
        return None;
    }
    let z = (value - mean).abs() / stddev;
    if z > threshold {
        return Some(make_flag(
            rule,
            action_flag_type(rule.action),
            format!("value {value} deviates {z:.2} standard deviations from the sample mean"),
            value,
            format!("|z| > {threshold}"),
        ));
    }
    None
}

/// Trend flags are a leading indicator and never carry error severity: a
/// drifting series alone must not fail a test.
fn check_trend(rule: &Rule, value: f64, history: &[f64], threshold: f64) -> Option<QcFlag> {
    if history.len() < MIN_TREND_SAMPLES {
        return None;
    }
    let slope = ols_slope(history);
    if slope.abs() > threshold {
        if rule.action == RuleAction::FlagError {
            debug!(
                rule_id = %rule.rule_id,
                "Trend rule configured flag_error; emitting warning severity"
            );
        }
        return Some(make_flag(
            rule,
            FlagType::Warning,
            format!(
                "values trend at slope {slope:.4} per sample over {} samples",
                history.len()
            ),
            value,
            format!("|slope| > {threshold}"),
        ));
    }
    None
}

/// Linear-interpolation percentile over an already sorted sample.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std_dev(values: &[f64], mean: f64) -> f64 {
    let variance = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

/// Ordinary least-squares slope of value against sample index.
fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, v) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (v - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        return 0.0;
    }
    num / den
}
