use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::capture::ListeningMode;
use crate::defaults;
use crate::error::{Result, VoxlinkError};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub playback: PlaybackSettings,
    pub realtime: RealtimeConfig,
}

/// Microphone and analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub fft_size: usize,
    pub max_buffer_seconds: u32,
    /// Capture scheduler tick.
    pub poll_interval_ms: u64,
}

/// Utterance boundary detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadConfig {
    pub mode: ListeningMode,
    pub energy_threshold: f32,
    pub short_window_seconds: f32,
    pub silence_duration_seconds: f32,
    /// 0 disables the filter.
    pub high_pass_cutoff_hz: f32,
}

/// Response audio playback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackSettings {
    pub min_buffer_seconds: f32,
    pub max_chunk_samples: usize,
    pub drain_poll_ms: u64,
    /// Barge-in: cancel playback as soon as a new recording starts.
    pub interrupt_on_new_recording: bool,
}

/// Remote realtime service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub instructions: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            fft_size: defaults::FFT_SIZE,
            max_buffer_seconds: defaults::MAX_BUFFER_SECS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            mode: ListeningMode::PushToTalk,
            energy_threshold: defaults::VAD_ENERGY_THRESHOLD,
            short_window_seconds: defaults::VAD_SHORT_WINDOW_SECS,
            silence_duration_seconds: defaults::VAD_SILENCE_DURATION_SECS,
            high_pass_cutoff_hz: defaults::HIGH_PASS_CUTOFF_HZ,
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            min_buffer_seconds: defaults::MIN_PLAYBACK_BUFFER_SECS,
            max_chunk_samples: defaults::MAX_PLAYBACK_CHUNK_SAMPLES,
            drain_poll_ms: defaults::DRAIN_POLL_MS,
            interrupt_on_new_recording: false,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: defaults::REALTIME_URL.to_string(),
            api_key: None,
            instructions: defaults::RESPONSE_INSTRUCTIONS.to_string(),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> VoxlinkError {
    VoxlinkError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(VoxlinkError::from)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXLINK_API_KEY, then OPENAI_API_KEY → realtime.api_key
    /// - VOXLINK_AUDIO_DEVICE → audio.device
    /// - VOXLINK_REALTIME_URL → realtime.url
    pub fn with_env_overrides(mut self) -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|value| !value.is_empty());

        if let Some(key) = non_empty("VOXLINK_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.realtime.api_key = Some(key);
        }

        if let Some(device) = non_empty("VOXLINK_AUDIO_DEVICE") {
            self.audio.device = Some(device);
        }

        if let Some(url) = non_empty("VOXLINK_REALTIME_URL") {
            self.realtime.url = url;
        }

        self
    }

    /// Reject values the pipelines cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be greater than 0"));
        }
        if !self.audio.fft_size.is_power_of_two() {
            return Err(invalid(
                "audio.fft_size",
                format!("must be a power of two, got {}", self.audio.fft_size),
            ));
        }
        if self.audio.max_buffer_seconds == 0 {
            return Err(invalid("audio.max_buffer_seconds", "must be greater than 0"));
        }
        if self.audio.poll_interval_ms == 0 {
            return Err(invalid("audio.poll_interval_ms", "must be greater than 0"));
        }
        if !(self.vad.short_window_seconds > 0.0) {
            return Err(invalid("vad.short_window_seconds", "must be positive"));
        }
        if self.vad.short_window_seconds >= self.audio.max_buffer_seconds as f32 {
            return Err(invalid(
                "vad.short_window_seconds",
                "must be shorter than audio.max_buffer_seconds",
            ));
        }
        if !(self.vad.silence_duration_seconds > 0.0) {
            return Err(invalid("vad.silence_duration_seconds", "must be positive"));
        }
        if !(self.vad.energy_threshold >= 0.0) {
            return Err(invalid("vad.energy_threshold", "must not be negative"));
        }
        if !(self.vad.high_pass_cutoff_hz >= 0.0) {
            return Err(invalid("vad.high_pass_cutoff_hz", "must not be negative"));
        }
        if !(self.playback.min_buffer_seconds >= 0.0) {
            return Err(invalid("playback.min_buffer_seconds", "must not be negative"));
        }
        if self.playback.max_chunk_samples == 0 {
            return Err(invalid("playback.max_chunk_samples", "must be greater than 0"));
        }
        if !(self.realtime.url.starts_with("ws://") || self.realtime.url.starts_with("wss://")) {
            return Err(invalid(
                "realtime.url",
                format!("must be a ws:// or wss:// URL, got {}", self.realtime.url),
            ));
        }
        Ok(())
    }

    /// TOML rendering with the API key masked, for `config show`.
    pub fn to_display_toml(&self) -> anyhow::Result<String> {
        let mut shown = self.clone();
        if shown.realtime.api_key.is_some() {
            shown.realtime.api_key = Some("********".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxlink/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxlink")
            .join("config.toml")
    }
}
