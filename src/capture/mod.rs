//! Capture pipeline: turns the microphone stream into discrete utterances.
//!
//! Push-to-talk recordings are bounded by explicit start/stop calls. In VAD
//! mode the microphone runs continuously; every scheduler tick pulls the new
//! samples from the device ring into a rolling buffer and runs the
//! energy-ratio test over it. Speech onset marks the current buffer end as
//! the utterance start; enough accumulated silence closes the utterance.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::analyzer::{self, SpectrumAnalyzer, VadAnalysis, VadParams};
use crate::audio::codec;
use crate::audio::ring::{OverwritePolicy, RollingBuffer};
use crate::audio::source::AudioSource;
use crate::config::Config;
use crate::defaults;
use crate::error::Result;
use crate::events::{EventHub, Subscription, SubscriptionId};
use crate::playback::PlaybackControl;

/// How utterance boundaries are decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Boundaries come from explicit start/stop commands.
    #[default]
    PushToTalk,
    /// Boundaries come from the energy detector and silence timeout.
    Vad,
}

impl fmt::Display for ListeningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListeningMode::PushToTalk => write!(f, "push-to-talk"),
            ListeningMode::Vad => write!(f, "vad"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    #[default]
    Idle,
    Recording,
}

/// Notifications raised by the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    RecordingStarted,
    RecordingEnded,
}

/// One finished turn of user speech.
///
/// Immutable once built; the PCM16 encoding is computed up front.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    samples: Vec<f32>,
    sample_rate: u32,
    pcm: Vec<u8>,
}

impl Utterance {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let pcm = codec::encode_pcm16(&samples);
        Self {
            samples,
            sample_rate,
            pcm,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Little-endian PCM16 bytes.
    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    /// Base64 of the PCM16 bytes, as carried in `input_audio` content.
    pub fn to_base64(&self) -> String {
        codec::base64_encode(&self.pcm)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Capture tunables.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub mode: ListeningMode,
    pub fft_size: usize,
    pub max_buffer_seconds: u32,
    pub vad: VadParams,
    pub silence_duration: Duration,
    /// Cancel playback when a new recording starts.
    pub interrupt_on_new_recording: bool,
}

impl CaptureConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.vad.mode,
            fft_size: config.audio.fft_size,
            max_buffer_seconds: config.audio.max_buffer_seconds,
            vad: VadParams {
                sample_rate: config.audio.sample_rate,
                short_window_secs: config.vad.short_window_seconds,
                energy_threshold: config.vad.energy_threshold,
                high_pass_cutoff_hz: config.vad.high_pass_cutoff_hz,
            },
            silence_duration: Duration::from_secs_f32(
                config.vad.silence_duration_seconds.max(0.0),
            ),
            interrupt_on_new_recording: config.playback.interrupt_on_new_recording,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.vad.sample_rate
    }

    fn max_buffer_samples(&self) -> usize {
        self.sample_rate() as usize * self.max_buffer_seconds as usize
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: ListeningMode::default(),
            fft_size: defaults::FFT_SIZE,
            max_buffer_seconds: defaults::MAX_BUFFER_SECS,
            vad: VadParams {
                sample_rate: defaults::SAMPLE_RATE,
                short_window_secs: defaults::VAD_SHORT_WINDOW_SECS,
                energy_threshold: defaults::VAD_ENERGY_THRESHOLD,
                high_pass_cutoff_hz: defaults::HIGH_PASS_CUTOFF_HZ,
            },
            silence_duration: Duration::from_secs_f32(defaults::VAD_SILENCE_DURATION_SECS),
            interrupt_on_new_recording: false,
        }
    }
}

pub struct CapturePipeline {
    config: CaptureConfig,
    /// `None` when no input device is available; every operation is then a no-op.
    source: Option<Box<dyn AudioSource>>,
    playback: Arc<dyn PlaybackControl>,
    mode: ListeningMode,
    vad_state: VadState,
    manual_active: bool,
    /// Read cursor into the device ring.
    cursor: usize,
    rolling: RollingBuffer,
    vad_start: usize,
    silence: Duration,
    analyzer: SpectrumAnalyzer,
    spectrum: Option<Vec<f32>>,
    last_analysis: VadAnalysis,
    events: EventHub<CaptureEvent>,
}

impl CapturePipeline {
    /// Build the pipeline. In VAD mode monitoring starts immediately.
    pub fn new(
        config: CaptureConfig,
        source: Option<Box<dyn AudioSource>>,
        playback: Arc<dyn PlaybackControl>,
    ) -> Self {
        if source.is_none() {
            tracing::warn!("no input device available, capture is disabled");
        }

        let mut pipeline = Self {
            rolling: RollingBuffer::new(config.max_buffer_samples()),
            analyzer: SpectrumAnalyzer::new(config.fft_size),
            mode: config.mode,
            config,
            source,
            playback,
            vad_state: VadState::Idle,
            manual_active: false,
            cursor: 0,
            vad_start: 0,
            silence: Duration::ZERO,
            spectrum: None,
            last_analysis: VadAnalysis::default(),
            events: EventHub::new(),
        };

        if pipeline.mode == ListeningMode::Vad
            && let Err(e) = pipeline.start_continuous_monitoring()
        {
            tracing::warn!(error = %e, "failed to start continuous monitoring");
        }

        pipeline
    }

    pub fn subscribe(&self) -> Subscription<CaptureEvent> {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn mode(&self) -> ListeningMode {
        self.mode
    }

    pub fn vad_state(&self) -> VadState {
        self.vad_state
    }

    pub fn has_device(&self) -> bool {
        self.source.is_some()
    }

    /// Whether an utterance is being assembled in either mode.
    pub fn is_recording(&self) -> bool {
        self.manual_active || self.vad_state == VadState::Recording
    }

    pub fn is_manual_recording(&self) -> bool {
        self.manual_active
    }

    /// Begin a push-to-talk recording.
    ///
    /// A missing device or an already running recording is logged and ignored.
    pub fn start_manual_recording(&mut self) -> Result<()> {
        let Some(source) = self.source.as_mut() else {
            tracing::warn!("cannot start recording: no input device");
            return Ok(());
        };
        if self.mode != ListeningMode::PushToTalk {
            tracing::warn!(mode = %self.mode, "manual recording is only available in push-to-talk mode");
            return Ok(());
        }
        if self.manual_active {
            tracing::warn!("recording already in progress");
            return Ok(());
        }

        if self.config.interrupt_on_new_recording {
            self.playback.cancel_playback();
        }
        self.playback.reset_cancel_pending();

        source.start(OverwritePolicy::StopWhenFull)?;
        self.cursor = 0;
        self.manual_active = true;
        tracing::info!("recording started");
        self.events.emit(CaptureEvent::RecordingStarted);
        Ok(())
    }

    /// Finish a push-to-talk recording and return everything captured since
    /// the start. Nothing is returned for an empty recording.
    pub fn stop_manual_recording(&mut self) -> Option<Utterance> {
        if !self.manual_active {
            tracing::warn!("no active recording found");
            return None;
        }
        self.manual_active = false;
        self.spectrum = None;

        let source = self.source.as_mut()?;
        let samples = match source.ring().lock() {
            Ok(ring) => ring.recorded().to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read recording");
                Vec::new()
            }
        };
        if let Err(e) = source.stop() {
            tracing::warn!(error = %e, "failed to stop audio source");
        }

        self.events.emit(CaptureEvent::RecordingEnded);

        if samples.is_empty() {
            tracing::debug!("recording ended without samples");
            return None;
        }
        let utterance = Utterance::new(samples, source.sample_rate());
        tracing::info!(
            samples = utterance.len(),
            duration_ms = utterance.duration().as_millis() as u64,
            "recording ended"
        );
        Some(utterance)
    }

    /// Start the always-on microphone stream used by VAD mode.
    pub fn start_continuous_monitoring(&mut self) -> Result<()> {
        let Some(source) = self.source.as_mut() else {
            tracing::warn!("cannot start monitoring: no input device");
            return Ok(());
        };

        source.start(OverwritePolicy::Wrap)?;
        self.cursor = 0;
        self.rolling.clear();
        self.vad_start = 0;
        self.silence = Duration::ZERO;
        tracing::debug!("continuous monitoring started");
        Ok(())
    }

    /// Stop the microphone. An utterance in progress is discarded.
    pub fn stop_continuous_monitoring(&mut self) {
        if self.vad_state == VadState::Recording {
            tracing::debug!("discarding utterance in progress");
            self.vad_state = VadState::Idle;
            self.silence = Duration::ZERO;
            self.events.emit(CaptureEvent::RecordingEnded);
        }
        if let Some(source) = self.source.as_mut()
            && let Err(e) = source.stop()
        {
            tracing::warn!(error = %e, "failed to stop audio source");
        }
        self.spectrum = None;
        tracing::debug!("continuous monitoring stopped");
    }

    /// Switch listening mode, cleanly terminating anything in progress.
    pub fn set_mode(&mut self, mode: ListeningMode) -> Result<()> {
        if mode == self.mode {
            return Ok(());
        }

        match self.mode {
            ListeningMode::Vad => self.stop_continuous_monitoring(),
            ListeningMode::PushToTalk if self.manual_active => {
                tracing::debug!("discarding push-to-talk recording on mode switch");
                self.manual_active = false;
                if let Some(source) = self.source.as_mut()
                    && let Err(e) = source.stop()
                {
                    tracing::warn!(error = %e, "failed to stop audio source");
                }
                self.spectrum = None;
                self.events.emit(CaptureEvent::RecordingEnded);
            }
            ListeningMode::PushToTalk => {}
        }

        tracing::info!(from = %self.mode, to = %mode, "listening mode changed");
        self.mode = mode;

        if mode == ListeningMode::Vad {
            self.start_continuous_monitoring()?;
        }
        Ok(())
    }

    /// One scheduler tick. `elapsed` is the time since the previous tick and
    /// feeds the silence timer.
    ///
    /// Returns the utterance closed by this tick, if any.
    pub fn poll(&mut self, elapsed: Duration) -> Option<Utterance> {
        let capturing = self
            .source
            .as_ref()
            .is_some_and(|source| source.is_capturing());
        if !capturing {
            self.spectrum = None;
            return None;
        }

        let fresh = self.pull_new_samples();
        if !fresh.is_empty() {
            self.spectrum = Some(self.analyzer.compute(&fresh));
            let evicted = self.rolling.extend(&fresh);
            self.vad_start = self.vad_start.saturating_sub(evicted);
        }

        match self.mode {
            ListeningMode::Vad => self.run_vad(elapsed),
            ListeningMode::PushToTalk => None,
        }
    }

    fn pull_new_samples(&mut self) -> Vec<f32> {
        let Some(source) = self.source.as_ref() else {
            return Vec::new();
        };
        let ring = source.ring();
        let guard = match ring.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(error = %e, "device ring unavailable");
                return Vec::new();
            }
        };
        let (samples, cursor) = guard.read_since(self.cursor);
        self.cursor = cursor;
        samples
    }

    fn run_vad(&mut self, elapsed: Duration) -> Option<Utterance> {
        let analysis = analyzer::detect_voice_activity(self.rolling.as_slice(), &self.config.vad);
        self.last_analysis = analysis;

        if analysis.voice_detected {
            self.silence = Duration::ZERO;
            if self.vad_state == VadState::Idle {
                self.begin_vad_recording();
            }
            return None;
        }

        if self.vad_state == VadState::Recording {
            self.silence += elapsed;
            if self.silence >= self.config.silence_duration {
                return self.finish_vad_recording();
            }
        }
        None
    }

    fn begin_vad_recording(&mut self) {
        if self.config.interrupt_on_new_recording {
            self.playback.cancel_playback();
        }
        self.playback.reset_cancel_pending();

        self.vad_state = VadState::Recording;
        self.silence = Duration::ZERO;
        self.vad_start = self.rolling.len();
        tracing::debug!(
            start = self.vad_start,
            energy_last = self.last_analysis.energy_last,
            energy_all = self.last_analysis.energy_all,
            "speech detected"
        );
        self.events.emit(CaptureEvent::RecordingStarted);
    }

    fn finish_vad_recording(&mut self) -> Option<Utterance> {
        let samples = self.rolling.copy_from(self.vad_start);
        self.vad_state = VadState::Idle;
        self.silence = Duration::ZERO;
        self.events.emit(CaptureEvent::RecordingEnded);

        if samples.is_empty() {
            tracing::debug!("utterance ended without samples");
            return None;
        }
        let utterance = Utterance::new(samples, self.config.sample_rate());
        tracing::info!(
            samples = utterance.len(),
            duration_ms = utterance.duration().as_millis() as u64,
            "utterance detected"
        );
        Some(utterance)
    }

    /// Magnitude spectrum of the latest fresh samples; `None` while the
    /// microphone is not running.
    pub fn spectrum(&self) -> Option<&[f32]> {
        self.spectrum.as_deref()
    }

    /// Visualization band levels of the latest spectrum, empty when idle.
    pub fn band_levels(&self) -> Vec<f32> {
        match &self.spectrum {
            Some(spectrum) => analyzer::band_levels(
                spectrum,
                self.config.sample_rate(),
                self.analyzer.size(),
                defaults::VISUALIZATION_BAND_EDGES,
            ),
            None => Vec::new(),
        }
    }

    /// Recent-window energy of the latest VAD pass.
    pub fn energy_last(&self) -> f32 {
        self.last_analysis.energy_last
    }

    pub fn last_analysis(&self) -> VadAnalysis {
        self.last_analysis
    }

    pub fn buffered_len(&self) -> usize {
        self.rolling.len()
    }

    pub fn max_buffered_len(&self) -> usize {
        self.rolling.max_len()
    }

    /// Utterance start offset in the rolling buffer.
    pub fn vad_start(&self) -> usize {
        self.vad_start
    }
}
