use clap::{Parser, Subcommand};
use dagcargo::cron::Command;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dagcargo")]
#[command(about = "Batch jobs keeping DAG metadata, the IPFS node and the status cache in step", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $DAGCARGO_CONFIG or ./dagcargo.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pin and analyze DAGs locally
    PinDags(PinDagsArgs),
    /// Export status of individual DAGs to the KV store
    ExportStatus,
}

#[derive(clap::Args, Debug)]
pub struct PinDagsArgs {
    /// Only pin DAGs updated within this many days
    #[arg(long, value_name = "DAYS")]
    pub skip_dags_aged: Option<u32>,

    /// Override content_store.max_workers
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,
}

impl From<Commands> for Command {
    fn from(command: Commands) -> Self {
        match command {
            Commands::PinDags(args) => Command::PinDags {
                skip_dags_aged_days: args.skip_dags_aged,
                max_workers: args.max_workers,
            },
            Commands::ExportStatus => Command::ExportStatus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pin_dags() {
        let cli = Cli::parse_from([
            "dagcargo",
            "pin-dags",
            "--skip-dags-aged",
            "3",
            "--max-workers",
            "16",
            "--config",
            "/etc/dagcargo.toml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/dagcargo.toml")));
        assert_eq!(
            Command::from(cli.command),
            Command::PinDags {
                skip_dags_aged_days: Some(3),
                max_workers: Some(16),
            }
        );
    }

    #[test]
    fn test_parse_export_status() {
        let cli = Cli::parse_from(["dagcargo", "export-status"]);
        assert!(cli.config.is_none());
        assert_eq!(Command::from(cli.command), Command::ExportStatus);
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["dagcargo", "get-new-dags"]).is_err());
    }
}
