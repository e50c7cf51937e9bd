use anyhow::Result;
use clap::Parser;

use pvlab::cli::{run, Cli};
use pvlab::config::LabConfig;
use pvlab::telemetry::init_telemetry;

fn main() -> Result<()> {
    LabConfig::load_env_file()?;
    let config = LabConfig::load()?;
    init_telemetry(&config.observability)?;

    let cli = Cli::parse();
    tokio::runtime::Runtime::new()?.block_on(run(cli, &config))
}
