//! Error types for voxlink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxlinkError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio playback failed: {message}")]
    AudioPlayback { message: String },

    // Connection errors
    #[error("Not connected to the realtime service")]
    NotConnected,

    #[error("Realtime connection failed: {message}")]
    ConnectionFailed { message: String },

    // Protocol errors
    #[error("Realtime protocol error: {message}")]
    Protocol { message: String },

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, VoxlinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoxlinkError::ConfigInvalidValue {
            key: "audio.fft_size".to_string(),
            message: "must be a power of two".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for audio.fft_size: must be a power of two"
        );
    }

    #[test]
    fn test_audio_device_not_found_display() {
        let error = VoxlinkError::AudioDeviceNotFound {
            device: "default".to_string(),
        };
        assert_eq!(error.to_string(), "Audio device not found: default");
    }

    #[test]
    fn test_audio_playback_display() {
        let error = VoxlinkError::AudioPlayback {
            message: "stream closed".to_string(),
        };
        assert_eq!(error.to_string(), "Audio playback failed: stream closed");
    }

    #[test]
    fn test_not_connected_display() {
        assert_eq!(
            VoxlinkError::NotConnected.to_string(),
            "Not connected to the realtime service"
        );
    }

    #[test]
    fn test_connection_failed_display() {
        let error = VoxlinkError::ConnectionFailed {
            message: "handshake refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Realtime connection failed: handshake refused"
        );
    }

    #[test]
    fn test_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: VoxlinkError = json_error.into();
        assert!(error.to_string().starts_with("JSON error"));
    }

    #[test]
    fn test_from_base64_error() {
        use base64::Engine;
        let decode_error = base64::engine::general_purpose::STANDARD
            .decode("***")
            .unwrap_err();
        let error: VoxlinkError = decode_error.into();
        assert!(error.to_string().contains("base64"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: VoxlinkError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: VoxlinkError = io_error.into();
        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VoxlinkError>();
        assert_sync::<VoxlinkError>();
    }
}
