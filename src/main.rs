use anyhow::Result;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::path::Path;
use tracing_subscriber::EnvFilter;
use voxlink::app::run_conversation;
use voxlink::audio::capture::list_devices;
use voxlink::cli::{Cli, Commands, ConfigAction};
use voxlink::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command {
        None => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(device) = cli.device {
                config.audio.device = Some(device);
            }
            if let Some(mode) = cli.mode {
                config.vad.mode = mode.into();
            }
            if cli.interrupt {
                config.playback.interrupt_on_new_recording = true;
            }
            if let Some(instructions) = cli.instructions {
                config.realtime.instructions = instructions;
            }
            config.validate()?;
            tracing::debug!(version = %voxlink::version_string(), "starting conversation");
            run_conversation(config, cli.quiet, cli.verbose).await?;
        }
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "voxlink",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// `-q` → warn, default → info, `-v` → debug, `-vv` → trace. `RUST_LOG` wins.
fn init_logging(quiet: bool, verbose: u8) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,voxlink={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

/// List available audio input devices.
fn list_audio_devices() -> Result<()> {
    let devices = list_devices()?;

    if devices.is_empty() {
        eprintln!("{}", "No audio input devices found".red());
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Path => {
            let marker = if config_path.exists() {
                "(exists)".green().to_string()
            } else {
                "(not created, defaults in use)".dimmed().to_string()
            };
            println!("{} {}", config_path.display(), marker);
        }
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", config.to_display_toml()?);
        }
    }

    Ok(())
}
