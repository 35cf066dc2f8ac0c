//! Command-line interface for voxlink
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::capture::ListeningMode;

/// Hands-free voice conversations with realtime speech APIs
#[derive(Parser, Debug)]
#[command(
    name = "voxlink",
    version,
    about = "Hands-free voice conversations with realtime speech APIs"
)]
pub struct Cli {
    /// Subcommand to execute (default: start a conversation)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device name (see `voxlink devices`)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Listening mode
    #[arg(long, value_enum, value_name = "MODE")]
    pub mode: Option<ModeArg>,

    /// Cut off the assistant's audio when a new recording starts
    #[arg(long)]
    pub interrupt: bool,

    /// Instructions sent with every response request
    #[arg(long, value_name = "TEXT")]
    pub instructions: Option<String>,
}

/// Listening mode as accepted on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    /// Push-to-talk: press Enter to start and stop recording
    Ptt,
    /// Voice activity detection: recording starts and stops automatically
    Vad,
}

impl From<ModeArg> for ListeningMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Ptt => ListeningMode::PushToTalk,
            ModeArg::Vad => ListeningMode::Vad,
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available audio input devices
    Devices,

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration (API key masked)
    Show,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_command() {
        let cli = Cli::try_parse_from(["voxlink"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.device.is_none());
        assert!(cli.mode.is_none());
        assert!(cli.instructions.is_none());
        assert!(!cli.interrupt);
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_verbose_double() {
        let cli = Cli::try_parse_from(["voxlink", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_verbose_repeated_flags() {
        let cli = Cli::try_parse_from(["voxlink", "-v", "-v"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_with_options() {
        let cli = Cli::try_parse_from([
            "voxlink",
            "--device",
            "pipewire",
            "--mode",
            "vad",
            "--interrupt",
            "--instructions",
            "Answer briefly.",
        ])
        .unwrap();

        assert_eq!(cli.device.as_deref(), Some("pipewire"));
        assert_eq!(cli.mode, Some(ModeArg::Vad));
        assert!(cli.interrupt);
        assert_eq!(cli.instructions.as_deref(), Some("Answer briefly."));
    }

    #[test]
    fn test_mode_maps_to_listening_mode() {
        assert_eq!(ListeningMode::from(ModeArg::Ptt), ListeningMode::PushToTalk);
        assert_eq!(ListeningMode::from(ModeArg::Vad), ListeningMode::Vad);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(Cli::try_parse_from(["voxlink", "--mode", "always"]).is_err());
    }

    #[test]
    fn test_parse_devices() {
        let cli = Cli::try_parse_from(["voxlink", "devices"]).unwrap();
        match cli.command {
            Some(Commands::Devices) => {}
            _ => panic!("Expected Devices command"),
        }
    }

    #[test]
    fn test_parse_config_show() {
        let cli = Cli::try_parse_from(["voxlink", "config", "show"]).unwrap();
        match cli.command {
            Some(Commands::Config {
                action: ConfigAction::Show,
            }) => {}
            _ => panic!("Expected Config Show command"),
        }
    }

    #[test]
    fn test_parse_global_config() {
        let cli = Cli::try_parse_from(["voxlink", "--config", "/path/to/config.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.toml")));
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_global_quiet_after_subcommand() {
        let cli = Cli::try_parse_from(["voxlink", "devices", "-q"]).unwrap();
        assert!(cli.quiet);
    }

    #[test]
    fn test_parse_completions() {
        let cli = Cli::try_parse_from(["voxlink", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Completions { shell: Shell::Bash })
        ));
    }

    #[test]
    fn test_invalid_command_returns_error() {
        assert!(Cli::try_parse_from(["voxlink", "transcribe"]).is_err());
    }
}
