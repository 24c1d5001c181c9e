//! Command-line interface for shutterd.
//!
//! This module provides the CLI structure and command handlers for the
//! `shutterd` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, RunCommand, StatusCommand};

/// shutterd - Headless camera control daemon
///
/// Drives an attached camera from single terminal keystrokes: photos,
/// video recording and live preview, with disk space supervision and
/// background uploads of completed media.
#[derive(Debug, Parser)]
#[command(name = "shutterd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the capture daemon in the foreground
    Run(RunCommand),

    /// Show storage and upload queue status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "shutterd");
    }

    #[test]
    fn test_verbosity_quiet() {
        let cli = Cli {
            config: None,
            verbose: 2,
            quiet: true,
            command: Command::Status(StatusCommand { json: false }),
        };
        assert_eq!(cli.verbosity(), crate::logging::Verbosity::Quiet);
    }

    #[test]
    fn test_verbosity_levels() {
        for (verbose, expected) in [
            (0, crate::logging::Verbosity::Normal),
            (1, crate::logging::Verbosity::Verbose),
            (2, crate::logging::Verbosity::Trace),
            (5, crate::logging::Verbosity::Trace),
        ] {
            let cli = Cli {
                config: None,
                verbose,
                quiet: false,
                command: Command::Status(StatusCommand { json: false }),
            };
            assert_eq!(cli.verbosity(), expected);
        }
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["shutterd", "run"]).unwrap();
        assert!(matches!(cli.command, Command::Run(_)));
    }

    #[test]
    fn test_parse_run_no_upload() {
        let cli = Cli::try_parse_from(["shutterd", "run", "--no-upload"]).unwrap();
        let Command::Run(run) = cli.command else {
            panic!("expected run command");
        };
        assert!(run.no_upload);
    }

    #[test]
    fn test_parse_status_json() {
        let cli = Cli::try_parse_from(["shutterd", "status", "--json"]).unwrap();
        let Command::Status(status) = cli.command else {
            panic!("expected status command");
        };
        assert!(status.json);
    }

    #[test]
    fn test_parse_config_validate() {
        let cli =
            Cli::try_parse_from(["shutterd", "config", "validate", "-f", "/tmp/c.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand::Validate { file: Some(_) })
        ));
    }

    #[test]
    fn test_parse_with_config() {
        let cli = Cli::try_parse_from(["shutterd", "-c", "/custom/config.toml", "status"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }
}
