use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the lab core.
///
/// Loaded once at startup and passed down explicitly; there is no global
/// configuration accessor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabConfig {
    /// Laboratory identity
    pub lab: LabInfo,
    /// QC evaluation settings
    pub qc: QcConfig,
    /// Workflow state storage settings
    pub storage: StorageConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabInfo {
    /// Display name used in reports and logs
    pub name: String,
    /// Default operator recorded on requests when none is given
    pub operator: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QcConfig {
    /// Most recent values per measurement id considered by the statistical
    /// rules; 0 means unbounded
    pub history_cap: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Path to the workflow state snapshot
    pub state_file_path: String,
    /// Optional TOML file with additional protocol definitions
    pub protocols_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            lab: LabInfo {
                name: "pv-qualification-lab".to_string(),
                operator: None,
            },
            qc: QcConfig { history_cap: 200 },
            storage: StorageConfig {
                state_file_path: ".pvlab/state.json".to_string(),
                protocols_file: None,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
            },
        }
    }
}

impl LabConfig {
    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. Configuration file (pvlab.toml)
    /// 3. Environment variables (prefixed with PVLAB_)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&LabConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("pvlab.toml").exists() {
            builder = builder.add_source(File::with_name("pvlab"));
        }

        builder = builder.add_source(
            Environment::with_prefix("PVLAB")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = LabConfig::default();
        assert_eq!(config.qc.history_cap, 200);
        assert!(!config.storage.state_file_path.is_empty());
    }

    #[test]
    fn save_round_trips_through_toml() {
        let config = LabConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: LabConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.lab.name, config.lab.name);
        assert_eq!(parsed.qc.history_cap, config.qc.history_cap);
    }
}
