mod cli;

use clap::Parser;
use cli::Cli;
use dagcargo::config::{Config, default_path};
use dagcargo::{cron, observability};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    observability::init_tracing();

    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(default_path);
    let config = match Config::load_from_path(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Unable to load configuration");
            return ExitCode::FAILURE;
        }
    };

    cron::run(&config, cli.command.into()).await
}
