// Operator CLI - thin front-end over the workflow coordinator
//
// State is carried between invocations as a JSON snapshot; the snapshot
// path and extra protocol definitions come from LabConfig.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::Instrument;

use crate::config::LabConfig;
use crate::lifecycle::types::{ExecutionStatus, FlagType, Measurement};
use crate::protocols::ProtocolRegistry;
use crate::telemetry::{create_workflow_span, generate_correlation_id};
use crate::workflow::{InMemoryStore, InspectionInfo, RequestInfo, WorkflowCoordinator};

#[derive(Parser)]
#[command(name = "pvlab")]
#[command(about = "PV module qualification test management")]
#[command(
    long_about = "Tracks samples through qualification test protocols, evaluates every \
                  recorded measurement against the protocol's QC rules, and reports \
                  workflow progress. Start with 'pvlab create' to open a test request."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open a test request with an incoming inspection and one execution per protocol
    Create {
        /// Sample identifier, e.g. the module serial number
        #[arg(long)]
        sample: String,
        /// Module type under test
        #[arg(long, default_value = "crystalline-si")]
        module_type: String,
        /// Who requested the test (defaults to the configured operator)
        #[arg(long)]
        requested_by: Option<String>,
        /// Protocol code, repeatable
        #[arg(long = "protocol", required = true)]
        protocols: Vec<String>,
        /// Kind of incoming inspection to schedule
        #[arg(long, default_value = "visual")]
        inspection: String,
    },
    /// Record the incoming inspection of a request as completed
    Inspect {
        /// Request id
        request: String,
    },
    /// Record a measurement against an execution and show resulting QC flags
    Record {
        /// Execution id
        execution: String,
        /// What was measured, e.g. pmax or insulation_resistance
        #[arg(long)]
        measurement: String,
        #[arg(long)]
        value: f64,
        /// Optional test phase, e.g. post_tc200
        #[arg(long)]
        phase: Option<String>,
    },
    /// Advance an execution to a new lifecycle status
    Advance {
        /// Execution id
        execution: String,
        /// Target status: not_started, in_progress, paused, completed, failed, aborted
        #[arg(value_parser = parse_status)]
        status: ExecutionStatus,
    },
    /// Display workflow status for a request
    Status {
        /// Request id
        request: String,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List pending operator actions for a request
    Actions {
        /// Request id
        request: String,
    },
    /// List registered protocol codes
    Protocols,
}

fn parse_status(s: &str) -> Result<ExecutionStatus, String> {
    s.parse()
}

async fn build_registry(config: &LabConfig) -> Result<ProtocolRegistry> {
    let mut registry = ProtocolRegistry::with_builtin();
    if let Some(path) = &config.storage.protocols_file {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading protocol definitions from {path}"))?;
        let merged = registry
            .merge_toml_str(&content)
            .with_context(|| format!("parsing protocol definitions in {path}"))?;
        tracing::info!(path = %path, merged, "Merged protocol definitions");
    }
    Ok(registry)
}

pub async fn run(cli: Cli, config: &LabConfig) -> Result<()> {
    let registry = build_registry(config).await?;

    if let Commands::Protocols = cli.command {
        for code in registry.codes() {
            if let Some(descriptor) = registry.get(code) {
                let standard = descriptor.standard.as_deref().unwrap_or("-");
                println!("{code:<8} {standard:<22} {}", descriptor.name);
            }
        }
        return Ok(());
    }

    let state_path = &config.storage.state_file_path;
    let store = Arc::new(InMemoryStore::load_from_path(state_path).await?);
    let coordinator = WorkflowCoordinator::new(store.clone(), Arc::new(registry))
        .with_history_cap(config.qc.history_cap);
    let correlation_id = generate_correlation_id();

    match cli.command {
        Commands::Create {
            sample,
            module_type,
            requested_by,
            protocols,
            inspection,
        } => {
            let request_info = RequestInfo {
                sample_id: sample.clone(),
                module_type,
                requested_by: requested_by.or_else(|| config.lab.operator.clone()),
            };
            let span =
                create_workflow_span("create_workflow", None, None, Some(&correlation_id));
            let handle = coordinator
                .create_workflow(request_info, InspectionInfo { kind: inspection }, &protocols)
                .instrument(span)
                .await?;

            println!("📋 Created request {} for sample {sample}", handle.request_id);
            println!("   inspection: {}", handle.inspection_id);
            for execution in &handle.executions {
                println!("   {}  {}", execution.execution_id, execution.protocol_code);
            }
        }
        Commands::Inspect { request } => {
            let inspection = coordinator.record_inspection(&request).await?;
            println!(
                "✅ Inspection {} ({}) recorded as completed",
                inspection.inspection_id, inspection.kind
            );
        }
        Commands::Record {
            execution,
            measurement,
            value,
            phase,
        } => {
            let mut m = Measurement::new(measurement, value);
            if let Some(phase) = phase {
                m = m.with_phase(phase);
            }
            let span = create_workflow_span(
                "record_measurement",
                None,
                Some(&execution),
                Some(&correlation_id),
            );
            let flags = coordinator
                .record_measurement(&execution, m)
                .instrument(span)
                .await?;

            if flags.is_empty() {
                println!("Recorded. No QC flags.");
            } else {
                println!("Recorded with {} QC flag(s):", flags.len());
                for flag in &flags {
                    let marker = match flag.flag_type {
                        FlagType::Warning => "⚠",
                        FlagType::Error => "✖",
                    };
                    println!(
                        "  {marker} [{}] {} (threshold {})",
                        flag.rule_id, flag.description, flag.threshold_repr
                    );
                }
            }
        }
        Commands::Advance { execution, status } => {
            let span = create_workflow_span(
                "advance",
                None,
                Some(&execution),
                Some(&correlation_id),
            );
            let outcome = coordinator
                .advance(&execution, status)
                .instrument(span)
                .await?;

            println!(
                "Execution {}: {} -> {}",
                outcome.record.execution_id, outcome.record.from, outcome.record.to
            );
            if outcome.request_completed {
                println!("✅ All protocol executions completed — request is completed");
            }
        }
        Commands::Status { request, json } => {
            let status = coordinator.get_workflow_status(&request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "Request {} — sample {} ({})",
                    status.request_id, status.sample_id, status.module_type
                );
                println!(
                    "Status: {}  progress: {:.1}%  inspection: {}",
                    status.status,
                    status.progress_percent,
                    if status.inspection_completed {
                        "done"
                    } else {
                        "pending"
                    }
                );
                for execution in &status.executions {
                    println!(
                        "  {}  {:<8} {:<12} {} measurements, {} warnings, {} errors",
                        execution.execution_id,
                        execution.protocol_code,
                        execution.status.to_string(),
                        execution.measurement_count,
                        execution.warning_count,
                        execution.error_count
                    );
                }
            }
        }
        Commands::Actions { request } => {
            let actions = coordinator.next_actions(&request).await?;
            if actions.is_empty() {
                println!("Nothing pending.");
            } else {
                for (i, action) in actions.iter().enumerate() {
                    println!("{}. {action}", i + 1);
                }
            }
        }
        Commands::Protocols => unreachable!("handled above"),
    }

    store.save_to_path(state_path).await?;
    Ok(())
}
