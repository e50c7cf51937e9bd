// Quality-Control Module
//
// Data-driven rule definitions and the pure evaluator that applies them.
// Replaces per-protocol validator boilerplate with configuration.

pub mod evaluator;
pub mod rules;

pub use evaluator::{evaluate, MIN_OUTLIER_SAMPLES, MIN_TREND_SAMPLES};
pub use rules::{OutlierMethod, Rule, RuleAction, RuleKind, RuleSet};
