//! Command line interface.

pub mod command;

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(version, about, long_about = None)]
/// Contains the commands
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log every cell, not only the per-entity outcomes
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Settings file of the run
    #[arg(long, visible_alias = "settings_file")]
    pub settings_file: PathBuf,

    /// Reference time, e.g. "2024-10-01 11:00" (defaults to `time_now` or the clock)
    #[arg(long)]
    pub time: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Organize, analyze and dump every domain
    Run {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Print the resolved file paths without touching any data
    Resolve {
        #[command(flatten)]
        args: RunArgs,

        /// Only this role, e.g. `source/discharge`
        #[arg(long)]
        role: Option<String>,
    },
    /// Delete the ancillary and destination files of the reference time
    Clean {
        #[command(flatten)]
        args: RunArgs,
    },
}

/// Creates a spinner.
pub fn create_spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner().with_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));

    bar
}

/// Creates a progress bar.
pub fn create_progress_bar(size: u64, message: String) -> ProgressBar {
    let style = ProgressStyle::with_template("[{eta_precise}] {bar:40.cyan/blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

    ProgressBar::new(size).with_message(message).with_style(style)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn should_parse_run_with_time() {
        let cli = Cli::parse_from([
            "hat",
            "run",
            "--settings-file",
            "hat.json",
            "--time",
            "2024-10-01 11:00",
        ]);

        match cli.command {
            Commands::Run { args } => {
                assert_eq!(args.settings_file, PathBuf::from("hat.json"));
                assert_eq!(args.time.as_deref(), Some("2024-10-01 11:00"));
            }
            _ => panic!("expected run"),
        }
        assert!(!cli.verbose);
    }

    #[test]
    fn should_accept_underscore_alias_and_global_verbose() {
        let cli = Cli::parse_from(["hat", "resolve", "--settings_file", "hat.json", "--role", "source/q", "-v"]);

        match cli.command {
            Commands::Resolve { args, role } => {
                assert_eq!(args.settings_file, PathBuf::from("hat.json"));
                assert_eq!(role.as_deref(), Some("source/q"));
            }
            _ => panic!("expected resolve"),
        }
        assert!(cli.verbose);
    }

    #[test]
    fn should_require_settings_file() {
        assert!(Cli::try_parse_from(["hat", "clean"]).is_err());
    }
}
