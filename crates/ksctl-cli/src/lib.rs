//! ksctl CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand, ValueEnum};

use ksctl_common::telemetry::LogFormat;

/// ksctl - bootstrap self-managed Kubernetes over SSH
#[derive(Parser, Debug)]
#[command(name = "ksctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text, env = "KSCTL_LOG_FORMAT")]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate the cluster SSH keypair and print its public half
    Keygen(commands::keygen::KeygenArgs),
    /// Bring up load balancer, etcd and Kubernetes on provisioned machines
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Print the stored admin kubeconfig
    Kubeconfig(commands::kubeconfig::KubeconfigArgs),
}

/// `--log-format` values
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Keygen(args) => commands::keygen::run(args).await,
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
            Commands::Kubeconfig(args) => commands::kubeconfig::run(args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksctl_bootstrap::BootstrapProvider;

    #[test]
    fn bootstrap_arguments_parse() {
        let cli = Cli::try_parse_from([
            "ksctl",
            "--log-format",
            "json",
            "bootstrap",
            "--state",
            "/tmp/demo.json",
            "--cluster-name",
            "demo",
            "--region",
            "fra1",
            "--inventory",
            "/tmp/inventory.json",
            "--distribution",
            "kubeadm",
            "--k8s-version",
            "v1.31",
            "--cni",
            "cilium",
            "--fast",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormatArg::Json);
        let Commands::Bootstrap(args) = cli.command else {
            panic!("expected bootstrap");
        };
        assert_eq!(args.distribution, BootstrapProvider::Kubeadm);
        assert_eq!(args.k8s_version, "v1.31");
        assert_eq!(args.etcd_version, "");
        assert_eq!(args.cni, "cilium");
        assert!(args.fast);
        assert_eq!(args.cluster.cloud, "local");
    }

    #[test]
    fn unknown_distribution_is_rejected() {
        let parsed = Cli::try_parse_from([
            "ksctl",
            "bootstrap",
            "--state",
            "s.json",
            "--cluster-name",
            "demo",
            "--region",
            "fra1",
            "--inventory",
            "i.json",
            "--distribution",
            "microk8s",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn log_format_defaults_to_text() {
        let cli = Cli::try_parse_from(["ksctl", "kubeconfig", "--state", "s.json"]).unwrap();
        assert_eq!(cli.log_format, LogFormatArg::Text);
        assert_eq!(LogFormat::from(LogFormatArg::Json), LogFormat::Json);
    }
}
