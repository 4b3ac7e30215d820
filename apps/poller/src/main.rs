use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use fping_poller::config::Config;
use fping_poller::orchestrator::Orchestrator;

/// Batched ICMP reachability poller driven by fping
#[derive(Parser, Debug)]
#[command(name = "fping-poller", version)]
struct Args {
    /// Roster file of `<address>,<cadenceSeconds>` lines (defaults to roster.path)
    #[arg(value_name = "ROSTER")]
    roster: Option<PathBuf>,

    /// Configuration file, created with defaults when missing
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::from_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            logger::init();
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    logger::init_with(&config.logging.level, logger::LogFormat::from_name(&config.logging.format));
    info!("{}", config);

    let roster_path = args.roster.unwrap_or_else(|| config.roster.path.clone());

    match Orchestrator::start(config, roster_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
