//! `shutterd` - Headless camera control daemon
//!
//! This binary runs the capture daemon and provides offline status and
//! configuration inspection.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::process::ExitCode;

use clap::Parser;

use shutterd::cli::{Cli, Command, ConfigCommand, RunCommand, StatusCommand};
use shutterd::{init_logging, Config, Error, StatusSnapshot};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbosity());

    let config = match Config::load_from(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run(run_cmd) => handle_run(config, &run_cmd),
        Command::Status(status_cmd) => handle_status(&config, &status_cmd),
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn handle_run(mut config: Config, cmd: &RunCommand) -> anyhow::Result<()> {
    if cmd.no_upload {
        config.upload.enabled = false;
    }
    if let Some(dir) = &cmd.output_dir {
        config.storage.output_dir = Some(dir.clone());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(daemon_with_context(config))?;
    Ok(())
}

async fn daemon_with_context(config: Config) -> anyhow::Result<()> {
    match shutterd::daemon::run(config).await {
        Ok(()) => Ok(()),
        Err(err @ Error::HardwareUnavailable { .. }) => {
            Err(anyhow::Error::new(err).context("camera tooling missing; is this a camera host?"))
        }
        Err(err) => Err(err.into()),
    }
}

fn handle_status(config: &Config, cmd: &StatusCommand) -> anyhow::Result<()> {
    let snapshot = StatusSnapshot::gather(config)?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        // Offline report; cooked terminal, so strip the raw-mode endings.
        print!("{}", snapshot.render().replace("\r\n", "\n"));
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Camera]");
                println!("  Photo tool:      {}", config.camera.photo_tool);
                println!("  Video tool:      {}", config.camera.video_tool);
                println!(
                    "  Resolution:      {}x{}",
                    config.camera.width, config.camera.height
                );
                println!("  Photo quality:   {}", config.camera.photo_quality);
                println!("  Video bitrate:   {}", config.camera.video_bitrate);
                println!();
                println!("[Storage]");
                println!("  Output dir:      {}", config.output_dir().display());
                println!("  Low water (MB):  {}", config.storage.low_water_mb);
                println!("  Critical (MB):   {}", config.storage.critical_water_mb);
                println!("  Max photos:      {}", config.storage.max_photos);
                println!("  Max videos:      {}", config.storage.max_videos);
                println!();
                println!("[Upload]");
                println!("  Enabled:         {}", config.upload.enabled);
                println!("  Uploader tool:   {}", config.upload.uploader_tool);
                println!("  Remote folder:   {}", config.upload.remote_folder_id);
                println!("  Max attempts:    {}", config.upload.max_attempts);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
