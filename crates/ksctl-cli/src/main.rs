//! ksctl CLI
//!
//! Bootstraps self-managed Kubernetes clusters on machines reachable over SSH.

use clap::Parser;

use ksctl_cli::{Cli, Result};
use ksctl_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..TelemetryConfig::default()
    })?;

    cli.run().await
}
