//! Protocol registry.
//!
//! Each qualification protocol is a data-driven descriptor: a code, a name,
//! the standard clause it implements and its QC rule definitions. The
//! registry is constructed explicitly and passed down; there is no global
//! registry state. It also serves as the coordinator's rule source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::qc::{OutlierMethod, Rule, RuleAction, RuleKind, RuleSet};
use crate::workflow::traits::{RuleSource, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub code: String,
    pub name: String,
    /// Standard clause the protocol implements, e.g. "IEC 61215-2 MQT 11"
    pub standard: Option<String>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, ProtocolDescriptor>,
}

/// File layout for user-defined protocols:
///
/// ```toml
/// [[protocol]]
/// code = "LID48"
/// name = "Light-induced degradation"
///
/// [[protocol.rules]]
/// rule_id = "lid-pmax-ratio"
/// rule_type = "range"
/// min = 0.98
/// measurement_id = "pmax_ratio"
/// action = "flag_error"
/// ```
#[derive(Debug, Deserialize)]
struct ProtocolFile {
    #[serde(default)]
    protocol: Vec<RawProtocolDef>,
}

#[derive(Debug, Deserialize)]
struct RawProtocolDef {
    code: String,
    name: String,
    #[serde(default)]
    standard: Option<String>,
    #[serde(default)]
    rules: Vec<toml::Value>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the standard qualification protocols.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin_protocols() {
            registry.register(descriptor);
        }
        registry
    }

    pub fn register(&mut self, descriptor: ProtocolDescriptor) {
        self.protocols.insert(descriptor.code.clone(), descriptor);
    }

    pub fn get(&self, code: &str) -> Option<&ProtocolDescriptor> {
        self.protocols.get(code)
    }

    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.protocols.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Merge protocol definitions from a TOML document. A rule definition
    /// that fails to parse skips only that rule; a protocol table that fails
    /// to parse fails the whole merge (partial protocol definitions must not
    /// be registered).
    pub fn merge_toml_str(&mut self, content: &str) -> Result<usize, toml::de::Error> {
        let file: ProtocolFile = toml::from_str(content)?;
        let count = file.protocol.len();
        for raw in file.protocol {
            let mut rules = Vec::with_capacity(raw.rules.len());
            for value in raw.rules {
                match value.try_into::<Rule>() {
                    Ok(rule) => rules.push(rule),
                    Err(e) => warn!(
                        protocol = %raw.code,
                        error = %e,
                        "Skipping unparseable rule definition"
                    ),
                }
            }
            self.register(ProtocolDescriptor {
                code: raw.code,
                name: raw.name,
                standard: raw.standard,
                rules,
            });
        }
        Ok(count)
    }
}

#[async_trait]
impl RuleSource for ProtocolRegistry {
    async fn load_rule_set(&self, protocol_code: &str) -> Result<RuleSet, StoreError> {
        let descriptor = self
            .protocols
            .get(protocol_code)
            .ok_or_else(|| StoreError::UnknownId(protocol_code.to_string()))?;
        Ok(RuleSet::from_definitions(descriptor.rules.clone()))
    }
}

fn range_rule(
    rule_id: &str,
    measurement_id: &str,
    min: Option<f64>,
    max: Option<f64>,
    action: RuleAction,
) -> Rule {
    Rule {
        rule_id: rule_id.to_string(),
        kind: RuleKind::Range { min, max },
        measurement_id: Some(measurement_id.to_string()),
        phase_id: None,
        action,
    }
}

fn outlier_rule(rule_id: &str, measurement_id: &str, method: OutlierMethod, threshold: f64) -> Rule {
    Rule {
        rule_id: rule_id.to_string(),
        kind: RuleKind::Outlier { method, threshold },
        measurement_id: Some(measurement_id.to_string()),
        phase_id: None,
        action: RuleAction::FlagWarning,
    }
}

fn trend_rule(rule_id: &str, measurement_id: &str, threshold: f64) -> Rule {
    Rule {
        rule_id: rule_id.to_string(),
        kind: RuleKind::Trend { threshold },
        measurement_id: Some(measurement_id.to_string()),
        phase_id: None,
        action: RuleAction::FlagWarning,
    }
}

/// Built-in qualification protocols. Power is tracked as `pmax_ratio`
/// (post-stress Pmax over initial), insulation resistance in MΩ·m².
fn builtin_protocols() -> Vec<ProtocolDescriptor> {
    vec![
        ProtocolDescriptor {
            code: "TC200".to_string(),
            name: "Thermal cycling, 200 cycles".to_string(),
            standard: Some("IEC 61215-2 MQT 11".to_string()),
            rules: vec![
                range_rule("tc200-pmax-ratio", "pmax_ratio", Some(0.95), None, RuleAction::FlagError),
                range_rule("tc200-insulation", "insulation_resistance", Some(40.0), None, RuleAction::FlagError),
                outlier_rule("tc200-pmax-outlier", "pmax", OutlierMethod::Iqr, 1.5),
                trend_rule("tc200-leakage-trend", "leakage_current", 0.05),
            ],
        },
        ProtocolDescriptor {
            code: "DH1000".to_string(),
            name: "Damp heat, 1000 h".to_string(),
            standard: Some("IEC 61215-2 MQT 13".to_string()),
            rules: vec![
                range_rule("dh1000-pmax-ratio", "pmax_ratio", Some(0.95), None, RuleAction::FlagError),
                range_rule("dh1000-wet-leakage", "wet_leakage_current", None, Some(0.25), RuleAction::FlagError),
                outlier_rule("dh1000-pmax-outlier", "pmax", OutlierMethod::ZScore, 3.0),
                trend_rule("dh1000-insulation-trend", "insulation_resistance", 0.5),
            ],
        },
        ProtocolDescriptor {
            code: "UV15".to_string(),
            name: "UV preconditioning, 15 kWh/m²".to_string(),
            standard: Some("IEC 61215-2 MQT 10".to_string()),
            rules: vec![
                range_rule("uv15-pmax-ratio", "pmax_ratio", Some(0.95), None, RuleAction::FlagError),
                outlier_rule("uv15-voc-outlier", "voc", OutlierMethod::Iqr, 1.5),
            ],
        },
        ProtocolDescriptor {
            code: "ML2400".to_string(),
            name: "Static mechanical load, 2400 Pa".to_string(),
            standard: Some("IEC 61215-2 MQT 16".to_string()),
            rules: vec![
                range_rule("ml2400-pmax-ratio", "pmax_ratio", Some(0.95), None, RuleAction::FlagError),
                range_rule("ml2400-deflection", "deflection", None, Some(30.0), RuleAction::FlagWarning),
            ],
        },
        ProtocolDescriptor {
            code: "HS10".to_string(),
            name: "Hot-spot endurance".to_string(),
            standard: Some("IEC 61215-2 MQT 09".to_string()),
            rules: vec![
                range_rule("hs10-cell-temp", "hot_spot_temperature", None, Some(150.0), RuleAction::FlagError),
                outlier_rule("hs10-temp-outlier", "hot_spot_temperature", OutlierMethod::ZScore, 3.0),
                trend_rule("hs10-temp-trend", "hot_spot_temperature", 2.0),
            ],
        },
    ]
}
