//! Conversation composition root.
//!
//! Wires capture → engine → playback, runs the scheduler tick and maps
//! console commands onto the pipelines:
//! poll → utterance → (barge-in cancel) → send → render

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::audio::source::AudioSource;
use crate::capture::{CaptureConfig, CaptureEvent, CapturePipeline, ListeningMode, Utterance};
use crate::config::Config;
use crate::error::{Result, VoxlinkError};
use crate::events::Subscription;
use crate::output::Notification;
use crate::playback::{OutputSink, PlaybackConfig, PlaybackControl, PlaybackPipeline};
use crate::realtime::{Connector, EngineEvent, ProtocolEngine};

/// Commands typed on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Empty line: start or stop a push-to-talk recording.
    ToggleRecording,
    Mode(ListeningMode),
    Connect,
    Disconnect,
    Cancel,
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        match line.trim().to_lowercase().as_str() {
            "" => Ok(Self::ToggleRecording),
            "ptt" | "push-to-talk" => Ok(Self::Mode(ListeningMode::PushToTalk)),
            "vad" => Ok(Self::Mode(ListeningMode::Vad)),
            "connect" | "c" => Ok(Self::Connect),
            "disconnect" | "d" => Ok(Self::Disconnect),
            "cancel" | "x" => Ok(Self::Cancel),
            "status" | "s" => Ok(Self::Status),
            "help" | "h" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(format!("Unknown command '{}' (type 'help')", other)),
        }
    }
}

pub const HELP: &str = "\
Commands:
  <Enter>      start/stop recording (push-to-talk mode)
  ptt | vad    switch listening mode
  connect      open the connection
  disconnect   close the connection
  cancel       cancel the current response
  status       show connection and capture state
  quit         exit";

/// What the caller should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// The three pipelines of one conversation plus their notification streams.
pub struct Conversation {
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    engine: ProtocolEngine,
    capture_events: Subscription<CaptureEvent>,
    engine_events: Subscription<EngineEvent>,
}

impl Conversation {
    /// Build all pipelines from config. Must be called inside a tokio runtime.
    pub fn from_parts(
        config: &Config,
        source: Option<Box<dyn AudioSource>>,
        sink: Arc<dyn OutputSink>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let playback = PlaybackPipeline::new(PlaybackConfig::from_config(config), sink)?;
        let control: Arc<dyn PlaybackControl> = Arc::new(playback.clone());
        let engine = ProtocolEngine::new(
            connector,
            Arc::clone(&control),
            config.realtime.instructions.clone(),
        );
        let capture = CapturePipeline::new(CaptureConfig::from_config(config), source, control);
        Ok(Self::new(capture, playback, engine))
    }

    pub fn new(capture: CapturePipeline, playback: PlaybackPipeline, engine: ProtocolEngine) -> Self {
        let capture_events = capture.subscribe();
        let engine_events = engine.subscribe();
        Self {
            capture,
            playback,
            engine,
            capture_events,
            engine_events,
        }
    }

    pub fn capture(&self) -> &CapturePipeline {
        &self.capture
    }

    pub fn playback(&self) -> &PlaybackPipeline {
        &self.playback
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// One scheduler tick: poll capture and submit a finished utterance.
    pub async fn tick(&mut self, elapsed: Duration) -> Result<()> {
        match self.capture.poll(elapsed) {
            Some(utterance) => self.submit(utterance).await,
            None => Ok(()),
        }
    }

    /// Send an utterance. Audio of a response still in progress is flushed
    /// first and new chunks are accepted again before the send.
    ///
    /// # Errors
    /// `NotConnected` when the connection is not open; the utterance is
    /// dropped.
    pub async fn submit(&mut self, utterance: Utterance) -> Result<()> {
        if utterance.is_empty() {
            debug!("skipping empty utterance");
            return Ok(());
        }
        if self.engine.response_in_progress() {
            self.playback.cancel_playback();
        }
        self.playback.reset_cancel_pending();
        self.engine.send_utterance(&utterance).await
    }

    pub async fn handle_command(&mut self, command: ConsoleCommand) -> Result<Flow> {
        match command {
            ConsoleCommand::ToggleRecording => self.toggle_recording().await?,
            ConsoleCommand::Mode(mode) => {
                self.capture.set_mode(mode)?;
                info!(%mode, "listening mode changed");
            }
            ConsoleCommand::Connect => self.engine.connect().await?,
            ConsoleCommand::Disconnect => self.engine.disconnect().await?,
            ConsoleCommand::Cancel => {
                self.engine.cancel().await?;
                self.playback.cancel_playback();
            }
            ConsoleCommand::Status | ConsoleCommand::Help => {}
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn toggle_recording(&mut self) -> Result<()> {
        if self.capture.mode() != ListeningMode::PushToTalk {
            return Err(VoxlinkError::Other(
                "recording is automatic in VAD mode; type 'ptt' to switch".to_string(),
            ));
        }
        if self.capture.is_manual_recording() {
            if let Some(utterance) = self.capture.stop_manual_recording() {
                self.submit(utterance).await?;
            }
            Ok(())
        } else {
            self.capture.start_manual_recording()
        }
    }

    /// Notifications raised since the last call. Capture events come first.
    pub fn pending_notifications(&self) -> Vec<Notification> {
        let mut out: Vec<Notification> = self
            .capture_events
            .drain()
            .into_iter()
            .map(Notification::Capture)
            .collect();
        out.extend(self.engine_events.drain().into_iter().map(Notification::Engine));
        out
    }

    pub fn status_line(&self) -> String {
        format!(
            "connection: {:?} | mode: {} | recording: {} | response: {} | playing: {}",
            self.engine.state(),
            self.capture.mode(),
            self.capture.is_recording(),
            if self.engine.response_in_progress() {
                "in progress"
            } else {
                "idle"
            },
            self.playback.is_playing(),
        )
    }

    /// Stop capture, flush playback and close the connection.
    pub async fn shutdown(&mut self) {
        if self.capture.is_manual_recording() {
            self.capture.stop_manual_recording();
        }
        self.capture.stop_continuous_monitoring();
        self.playback.cancel_playback();
        if let Err(e) = self.engine.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
    }
}

/// Run an interactive conversation on the default audio devices until the
/// user quits or presses Ctrl+C.
#[cfg(feature = "cpal-audio")]
pub async fn run_conversation(config: Config, quiet: bool, verbosity: u8) -> anyhow::Result<()> {
    use crate::audio::capture::{CpalAudioSource, suppress_audio_warnings};
    use crate::audio::source::AudioSourceConfig;
    use crate::audio::speaker::CpalSpeaker;
    use crate::output::ConsoleRenderer;
    use crate::playback::NullSink;
    use crate::realtime::TungsteniteConnector;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::time::{Instant, MissedTickBehavior};

    // Suppress noisy JACK/ALSA warnings before audio init
    suppress_audio_warnings();

    let source_config = AudioSourceConfig {
        sample_rate: config.audio.sample_rate,
        ring_seconds: config.audio.max_buffer_seconds,
    };
    let source: Option<Box<dyn AudioSource>> =
        match CpalAudioSource::new(config.audio.device.as_deref(), &source_config) {
            Ok(source) => Some(Box::new(source)),
            Err(e) => {
                warn!(error = %e, "microphone unavailable");
                None
            }
        };
    let sink: Arc<dyn OutputSink> = match CpalSpeaker::new(config.audio.sample_rate) {
        Ok(speaker) => Arc::new(speaker),
        Err(e) => {
            warn!(error = %e, "speaker unavailable, responses will not be heard");
            Arc::new(NullSink)
        }
    };
    let connector = Arc::new(TungsteniteConnector::new(
        config.realtime.url.clone(),
        config.realtime.api_key.clone(),
    ));

    let mut conversation = Conversation::from_parts(&config, source, sink, connector)?;
    let mut renderer = ConsoleRenderer::stderr(quiet, verbosity);

    if config.realtime.api_key.is_none() {
        warn!("no API key configured (set VOXLINK_API_KEY or OPENAI_API_KEY)");
    }
    if let Err(e) = conversation.engine().connect().await {
        renderer.error(&format!("Could not connect: {} (type 'connect' to retry)", e))?;
    }
    renderer.status(&format!(
        "Ready ({} mode). Press Enter to talk, 'help' for commands.",
        conversation.capture().mode()
    ))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(config.audio.poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let elapsed = now - last_tick;
                last_tick = now;
                if let Err(e) = conversation.tick(elapsed).await {
                    renderer.error(&format!("Utterance dropped: {}", e))?;
                }
                for notification in conversation.pending_notifications() {
                    renderer.notification(&notification)?;
                }
                let capture = conversation.capture();
                renderer.meter(&capture.band_levels(), capture.energy_last())?;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Help) => renderer.status(HELP)?,
                    Ok(ConsoleCommand::Status) => renderer.status(&conversation.status_line())?,
                    Ok(command) => match conversation.handle_command(command).await {
                        Ok(Flow::Quit) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => renderer.error(&e.to_string())?,
                    },
                    Err(message) => renderer.error(&message)?,
                },
                Ok(None) => {
                    debug!("stdin closed, console commands disabled");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    conversation.shutdown().await;
    for notification in conversation.pending_notifications() {
        renderer.notification(&notification)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::{AudioSourceConfig, MockAudioSource, MockFeeder};
    use crate::playback::CollectingSink;
    use crate::realtime::MockConnector;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse(""), Ok(ConsoleCommand::ToggleRecording));
        assert_eq!(ConsoleCommand::parse("  \n"), Ok(ConsoleCommand::ToggleRecording));
        assert_eq!(
            ConsoleCommand::parse("VAD"),
            Ok(ConsoleCommand::Mode(ListeningMode::Vad))
        );
        assert_eq!(
            ConsoleCommand::parse("ptt"),
            Ok(ConsoleCommand::Mode(ListeningMode::PushToTalk))
        );
        assert_eq!(ConsoleCommand::parse("quit"), Ok(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse("x"), Ok(ConsoleCommand::Cancel));
        assert!(ConsoleCommand::parse("record").is_err());
    }

    fn conversation(mode: ListeningMode) -> (Conversation, MockFeeder, MockConnector) {
        let mut config = Config::default();
        config.audio.sample_rate = 1000;
        config.audio.fft_size = 64;
        config.vad.mode = mode;
        let source = MockAudioSource::with_config(&AudioSourceConfig {
            sample_rate: 1000,
            ring_seconds: config.audio.max_buffer_seconds,
        });
        let feeder = source.feeder();
        let connector = MockConnector::new();
        let conversation = Conversation::from_parts(
            &config,
            Some(Box::new(source)),
            Arc::new(CollectingSink::new()),
            Arc::new(connector.clone()),
        )
        .unwrap();
        (conversation, feeder, connector)
    }

    #[tokio::test]
    async fn test_push_to_talk_round_trip() {
        let (mut conversation, feeder, connector) = conversation(ListeningMode::PushToTalk);
        conversation
            .handle_command(ConsoleCommand::Connect)
            .await
            .unwrap();

        conversation
            .handle_command(ConsoleCommand::ToggleRecording)
            .await
            .unwrap();
        assert!(conversation.capture().is_manual_recording());
        feeder.push(&[0.3; 500]);
        conversation
            .handle_command(ConsoleCommand::ToggleRecording)
            .await
            .unwrap();

        assert!(!conversation.capture().is_manual_recording());
        assert_eq!(
            connector.sent_types(),
            vec!["conversation.item.create", "response.create"]
        );
        let notifications = conversation.pending_notifications();
        assert!(notifications.contains(&Notification::Capture(CaptureEvent::RecordingStarted)));
        assert!(notifications.contains(&Notification::Capture(CaptureEvent::RecordingEnded)));
        assert!(notifications.contains(&Notification::Engine(EngineEvent::Connected)));
    }

    #[tokio::test]
    async fn test_toggle_rejected_in_vad_mode() {
        let (mut conversation, _feeder, _connector) = conversation(ListeningMode::Vad);
        assert!(
            conversation
                .handle_command(ConsoleCommand::ToggleRecording)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_submit_while_disconnected_surfaces_error() {
        let (mut conversation, _feeder, connector) = conversation(ListeningMode::PushToTalk);
        let result = conversation
            .submit(Utterance::new(vec![0.1; 100], 1000))
            .await;
        assert!(matches!(result, Err(VoxlinkError::NotConnected)));
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn test_submit_during_response_flushes_playback() {
        let (mut conversation, _feeder, connector) = conversation(ListeningMode::PushToTalk);
        conversation.engine().connect().await.unwrap();
        let events = conversation.engine().subscribe();
        connector.push_text(r#"{"type":"response.created"}"#);
        for _ in 0..1000 {
            if events.drain().contains(&EngineEvent::ResponseCreated) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(conversation.engine().response_in_progress());
        conversation.playback().enqueue_samples(&[0.2; 5000]);

        conversation
            .submit(Utterance::new(vec![0.1; 100], 1000))
            .await
            .unwrap();

        assert_eq!(conversation.playback().queued_samples(), 0);
        assert!(!conversation.playback().is_cancel_pending());
        assert_eq!(
            connector.sent_types(),
            vec![
                "response.cancel",
                "conversation.item.create",
                "response.create"
            ]
        );
    }

    #[tokio::test]
    async fn test_mode_switch_and_quit() {
        let (mut conversation, _feeder, _connector) = conversation(ListeningMode::PushToTalk);
        conversation
            .handle_command(ConsoleCommand::Mode(ListeningMode::Vad))
            .await
            .unwrap();
        assert_eq!(conversation.capture().mode(), ListeningMode::Vad);
        assert!(conversation.status_line().contains("mode: vad"));
        assert_eq!(
            conversation
                .handle_command(ConsoleCommand::Quit)
                .await
                .unwrap(),
            Flow::Quit
        );
    }
}
