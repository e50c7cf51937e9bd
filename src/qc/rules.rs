//! QC rule definitions.
//!
//! Rules are plain data loaded from protocol configuration. A `RuleSet` is
//! immutable for the lifetime of an evaluation; malformed definitions are
//! skipped and logged at construction time so one bad rule cannot block the
//! rest of the set.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::lifecycle::types::Measurement;

/// What to emit when a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    FlagWarning,
    FlagError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    Iqr,
    ZScore,
}

fn default_outlier_threshold() -> f64 {
    1.5
}

/// The rule variants. Thresholds must be finite and positive; range rules
/// may leave either bound open but not both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleKind {
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Outlier {
        method: OutlierMethod,
        #[serde(default = "default_outlier_threshold")]
        threshold: f64,
    },
    Trend {
        threshold: f64,
    },
}

/// One QC rule, optionally scoped to a measurement id and/or phase id.
/// An unscoped rule applies to every measurement of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default)]
    pub measurement_id: Option<String>,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub action: RuleAction,
}

impl Rule {
    /// A rule applies when its scoping keys are absent or match.
    pub fn applies_to(&self, measurement: &Measurement) -> bool {
        if let Some(scope) = &self.measurement_id {
            if scope != &measurement.measurement_id {
                return false;
            }
        }
        if let Some(scope) = &self.phase_id {
            if measurement.phase_id.as_deref() != Some(scope.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Error)]
pub enum RuleValidationError {
    #[error("rule has an empty rule_id")]
    EmptyRuleId,
    #[error("range rule '{rule_id}' has neither min nor max")]
    UnboundedRange { rule_id: String },
    #[error("range rule '{rule_id}' has min {min} > max {max}")]
    InvertedRange { rule_id: String, min: f64, max: f64 },
    #[error("rule '{rule_id}' has a non-finite or non-positive threshold {threshold}")]
    BadThreshold { rule_id: String, threshold: f64 },
}

fn validate(rule: &Rule) -> Result<(), RuleValidationError> {
    if rule.rule_id.trim().is_empty() {
        return Err(RuleValidationError::EmptyRuleId);
    }
    match rule.kind {
        RuleKind::Range { min, max } => {
            if min.is_none() && max.is_none() {
                return Err(RuleValidationError::UnboundedRange {
                    rule_id: rule.rule_id.clone(),
                });
            }
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    return Err(RuleValidationError::InvertedRange {
                        rule_id: rule.rule_id.clone(),
                        min: lo,
                        max: hi,
                    });
                }
            }
            for bound in [min, max].into_iter().flatten() {
                if !bound.is_finite() {
                    return Err(RuleValidationError::BadThreshold {
                        rule_id: rule.rule_id.clone(),
                        threshold: bound,
                    });
                }
            }
        }
        RuleKind::Outlier { threshold, .. } | RuleKind::Trend { threshold } => {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(RuleValidationError::BadThreshold {
                    rule_id: rule.rule_id.clone(),
                    threshold,
                });
            }
        }
    }
    Ok(())
}

/// Immutable collection of validated rules for one protocol.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Build a rule set from typed definitions, dropping the malformed ones.
    pub fn from_definitions(definitions: Vec<Rule>) -> Self {
        let mut rules = Vec::with_capacity(definitions.len());
        for rule in definitions {
            match validate(&rule) {
                Ok(()) => rules.push(rule),
                Err(e) => warn!(error = %e, "Skipping malformed QC rule"),
            }
        }
        Self { rules }
    }

    /// Build a rule set from untyped definitions (e.g. parsed TOML/JSON
    /// tables). An unknown rule type or missing required field fails only
    /// that definition.
    pub fn from_raw(raw: Vec<serde_json::Value>) -> Self {
        let mut typed = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<Rule>(value) {
                Ok(rule) => typed.push(rule),
                Err(e) => warn!(error = %e, "Skipping unparseable QC rule definition"),
            }
        }
        Self::from_definitions(typed)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules whose scoping matches the given measurement.
    pub fn applicable_to<'a>(
        &'a self,
        measurement: &'a Measurement,
    ) -> impl Iterator<Item = &'a Rule> {
        self.rules.iter().filter(move |r| r.applies_to(measurement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn range_rule(id: &str, min: Option<f64>, max: Option<f64>) -> Rule {
        Rule {
            rule_id: id.to_string(),
            kind: RuleKind::Range { min, max },
            measurement_id: None,
            phase_id: None,
            action: RuleAction::FlagError,
        }
    }

    #[test]
    fn malformed_rules_are_skipped_not_fatal() {
        let set = RuleSet::from_definitions(vec![
            range_rule("ok", Some(0.0), Some(10.0)),
            range_rule("inverted", Some(10.0), Some(0.0)),
            range_rule("unbounded", None, None),
            Rule {
                rule_id: "bad-threshold".to_string(),
                kind: RuleKind::Outlier {
                    method: OutlierMethod::Iqr,
                    threshold: f64::NAN,
                },
                measurement_id: None,
                phase_id: None,
                action: RuleAction::FlagWarning,
            },
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules()[0].rule_id, "ok");
    }

    #[test]
    fn unknown_rule_type_is_skipped() {
        let set = RuleSet::from_raw(vec![
            json!({
                "rule_id": "range-pmax",
                "rule_type": "range",
                "min": 200.0,
                "measurement_id": "pmax"
            }),
            json!({
                "rule_id": "mystery",
                "rule_type": "fourier_drift",
                "threshold": 2.0
            }),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules()[0].rule_id, "range-pmax");
    }

    #[test]
    fn single_bound_range_is_valid() {
        let set = RuleSet::from_definitions(vec![range_rule("min-only", Some(0.95), None)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn scoping_matches_measurement_and_phase() {
        let rule = Rule {
            rule_id: "scoped".to_string(),
            kind: RuleKind::Range {
                min: Some(0.0),
                max: Some(1.0),
            },
            measurement_id: Some("pmax".to_string()),
            phase_id: Some("post_tc200".to_string()),
            action: RuleAction::FlagError,
        };

        let hit = Measurement::new("pmax", 0.5).with_phase("post_tc200");
        assert!(rule.applies_to(&hit));

        let wrong_phase = Measurement::new("pmax", 0.5).with_phase("initial");
        assert!(!rule.applies_to(&wrong_phase));

        let no_phase = Measurement::new("pmax", 0.5);
        assert!(!rule.applies_to(&no_phase));

        let wrong_measurement = Measurement::new("isc", 0.5).with_phase("post_tc200");
        assert!(!rule.applies_to(&wrong_measurement));
    }

    #[test]
    fn unscoped_rule_applies_to_everything() {
        let rule = range_rule("global", Some(0.0), Some(100.0));
        assert!(rule.applies_to(&Measurement::new("pmax", 1.0)));
        assert!(rule.applies_to(&Measurement::new("isc", 1.0).with_phase("anything")));
    }
}
