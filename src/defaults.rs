//! Default configuration constants for voxlink.
//!
//! Shared by the config layer and the pipelines so both agree on the
//! same numbers.

/// Default audio sample rate in Hz.
///
/// Realtime speech APIs exchange 24kHz mono PCM16 in both directions.
pub const SAMPLE_RATE: u32 = 24000;

/// Default FFT window size for the visualization spectrum.
pub const FFT_SIZE: usize = 1024;

/// Default VAD energy ratio threshold.
///
/// Speech is detected when the mean amplitude of the most recent short window
/// exceeds this fraction of the mean amplitude over the whole rolling buffer.
pub const VAD_ENERGY_THRESHOLD: f32 = 0.5;

/// Default length of the recent window compared against the whole buffer.
pub const VAD_SHORT_WINDOW_SECS: f32 = 1.0;

/// Silence after speech before an utterance is considered finished.
pub const VAD_SILENCE_DURATION_SECS: f32 = 2.0;

/// High-pass cutoff applied before the VAD energy test. 0 disables the filter.
pub const HIGH_PASS_CUTOFF_HZ: f32 = 0.0;

/// Maximum length of the rolling capture buffer in seconds.
///
/// Also sizes the device ring buffer, so a push-to-talk recording is capped
/// at this length.
pub const MAX_BUFFER_SECS: u32 = 10;

/// Capture scheduler tick in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 20;

/// Minimum queued audio before a full-size slice is handed to the speaker.
pub const MIN_PLAYBACK_BUFFER_SECS: f32 = 0.1;

/// Largest slice handed to the speaker in one driver iteration (2s at 24kHz).
pub const MAX_PLAYBACK_CHUNK_SAMPLES: usize = 48000;

/// Wait before re-checking an empty playback queue.
pub const DRAIN_POLL_MS: u64 = 100;

/// Default realtime endpoint.
pub const REALTIME_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01";

/// Default instructions attached to every response request.
pub const RESPONSE_INSTRUCTIONS: &str = "Please provide a transcript.";

/// Value of the beta opt-in header sent on the handshake.
pub const REALTIME_BETA_HEADER: &str = "realtime=v1";

/// Frequency band edges (Hz) for the visualization bars; the last band ends
/// at Nyquist.
pub const VISUALIZATION_BAND_EDGES: &[f32] =
    &[85.0, 160.0, 255.0, 350.0, 500.0, 1000.0, 2000.0, 3000.0, 4000.0];
