mod analysis;
mod cache;
mod cli;
mod collection;
mod driver;
mod dump;
mod entity;
mod error;
mod parquet;
mod reading;
mod report;
mod settings;
mod template;
mod time_window;

use anyhow::Result;
use clap::Parser;
use cli::{command, Cli, Commands};
use env_logger::Env;
use log::{error, info};

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Err(e) = dispatch(&cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run { args } => {
            let report = command::run(args)?;
            info!("Run finished: {}", report.summary());
        }
        Commands::Resolve { args, role } => {
            let count = command::resolve(args, role.as_deref())?;
            info!("{} paths resolved", count);
        }
        Commands::Clean { args } => {
            let removed = command::clean(args)?;
            info!("{} files removed", removed);
        }
    }

    Ok(())
}
