//! voxlink - Hands-free voice conversations with realtime speech APIs
//!
//! Microphone capture with push-to-talk or energy-based voice activity
//! detection, a WebSocket protocol engine with barge-in cancellation, and
//! paced playback of streamed response audio.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod app;
pub mod audio;
pub mod capture;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod output;
pub mod playback;
pub mod realtime;

// Core traits (source → capture → engine → playback → sink)
pub use audio::source::AudioSource;
pub use playback::{OutputSink, PlaybackControl};
pub use realtime::transport::Connector;

// Pipelines
pub use app::Conversation;
pub use capture::{CaptureEvent, CapturePipeline, ListeningMode, Utterance};
pub use playback::PlaybackPipeline;
pub use realtime::{ConnectionState, EngineEvent, ProtocolEngine};

// Error handling
pub use error::{Result, VoxlinkError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
