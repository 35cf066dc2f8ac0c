//! Protocol engine: owns the duplex connection, tracks the response lifecycle
//! and routes inbound events.
//!
//! Outbound sends hold the link lock for their whole sequence so the cancel,
//! item and response messages of one utterance go out back to back on the
//! connection that was live when the call started. The receive loop runs as
//! its own task and dispatches through a table keyed by event `type`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{
    ClientEvent, DeltaPayload, ErrorPayload, InboundMessage, MessageAssembler, WireFrame, kind,
};
use super::session::ResponseSession;
use super::transport::{Connector, WireReceiver, WireSender};
use crate::audio::codec;
use crate::capture::Utterance;
use crate::events::{EventHub, Subscription, SubscriptionId};
use crate::error::{Result, VoxlinkError};
use crate::playback::PlaybackControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Notifications raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected,
    Closed,
    ConnectionError(String),
    SessionCreated,
    ItemCreated,
    ResponseCreated,
    ResponseDone,
    ResponseCancelled,
    TranscriptDelta(String),
    AudioDone,
    TranscriptDone,
    ContentPartAdded,
    ContentPartDone,
    OutputItemAdded,
    OutputItemDone,
    RateLimitsUpdated,
    /// An `error` event from the service. The connection stays open.
    RemoteError(String),
}

type Handler = fn(&EngineInner, InboundMessage) -> Result<()>;

struct Link {
    id: u64,
    sender: Box<dyn WireSender>,
}

struct EngineInner {
    instructions: String,
    connector: Arc<dyn Connector>,
    playback: Arc<dyn PlaybackControl>,
    state: Mutex<ConnectionState>,
    session: Mutex<ResponseSession>,
    link: tokio::sync::Mutex<Option<Link>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    next_link_id: AtomicU64,
    events: EventHub<EngineEvent>,
    handlers: HashMap<&'static str, Handler>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn handler_table() -> HashMap<&'static str, Handler> {
    let mut table: HashMap<&'static str, Handler> = HashMap::new();
    table.insert(kind::AUDIO_DELTA, EngineInner::on_audio_delta);
    table.insert(kind::TRANSCRIPT_DELTA, EngineInner::on_transcript_delta);
    table.insert(kind::RESPONSE_CREATED, EngineInner::on_response_created);
    table.insert(kind::RESPONSE_DONE, EngineInner::on_response_done);
    table.insert(kind::ERROR, EngineInner::on_error);
    table.insert(kind::SESSION_CREATED, |inner, _| {
        inner.notify(EngineEvent::SessionCreated)
    });
    table.insert(kind::ITEM_CREATED, |inner, _| {
        inner.notify(EngineEvent::ItemCreated)
    });
    table.insert(kind::AUDIO_DONE, |inner, _| inner.notify(EngineEvent::AudioDone));
    table.insert(kind::TRANSCRIPT_DONE, |inner, _| {
        inner.notify(EngineEvent::TranscriptDone)
    });
    table.insert(kind::CONTENT_PART_ADDED, |inner, _| {
        inner.notify(EngineEvent::ContentPartAdded)
    });
    table.insert(kind::CONTENT_PART_DONE, |inner, _| {
        inner.notify(EngineEvent::ContentPartDone)
    });
    table.insert(kind::OUTPUT_ITEM_ADDED, |inner, _| {
        inner.notify(EngineEvent::OutputItemAdded)
    });
    table.insert(kind::OUTPUT_ITEM_DONE, |inner, _| {
        inner.notify(EngineEvent::OutputItemDone)
    });
    table.insert(kind::RATE_LIMITS_UPDATED, |inner, _| {
        inner.notify(EngineEvent::RateLimitsUpdated)
    });
    table
}

impl EngineInner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(from = ?*current, to = ?state, "connection state changed");
            *current = state;
        }
    }

    fn notify(&self, event: EngineEvent) -> Result<()> {
        self.events.emit(event);
        Ok(())
    }

    fn dispatch(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                return;
            }
        };
        let Some(handler) = self.handlers.get(message.kind.as_str()) else {
            debug!(kind = %message.kind, "ignoring unhandled event type");
            return;
        };
        let event_kind = message.kind.clone();
        if let Err(e) = handler(self, message) {
            warn!(kind = %event_kind, error = %e, "failed to handle event");
        }
    }

    fn on_audio_delta(&self, message: InboundMessage) -> Result<()> {
        let payload: DeltaPayload = message.payload()?;
        if payload.delta.is_empty() {
            return Ok(());
        }
        let pcm = codec::base64_decode(&payload.delta)?;
        self.playback.enqueue_chunk(&pcm);
        Ok(())
    }

    fn on_transcript_delta(&self, message: InboundMessage) -> Result<()> {
        let payload: DeltaPayload = message.payload()?;
        if payload.delta.is_empty() {
            return Ok(());
        }
        lock(&self.session).append_transcript(&payload.delta);
        self.notify(EngineEvent::TranscriptDelta(payload.delta))
    }

    fn on_response_created(&self, _message: InboundMessage) -> Result<()> {
        lock(&self.session).begin();
        self.notify(EngineEvent::ResponseCreated)
    }

    fn on_response_done(&self, _message: InboundMessage) -> Result<()> {
        {
            let mut session = lock(&self.session);
            if !session.is_in_progress() {
                debug!("response.done with no active response");
                return Ok(());
            }
            // Generation finished but audio may still be draining
            if !self.playback.is_playing() {
                session.finish();
            }
        }
        self.notify(EngineEvent::ResponseDone)
    }

    fn on_error(&self, message: InboundMessage) -> Result<()> {
        let payload: ErrorPayload = message.payload()?;
        let description = payload.error.describe();
        warn!(error = %description, "service error");
        self.notify(EngineEvent::RemoteError(description))
    }

    /// Called by the receive loop when its connection ends. A stale link id
    /// means the connection was already replaced or torn down.
    async fn link_closed(&self, link_id: u64) {
        let mut link = self.link.lock().await;
        if link.as_ref().map(|l| l.id) != Some(link_id) {
            return;
        }
        *link = None;
        drop(link);
        lock(&self.session).finish();
        lock(&self.receive_task).take();
        self.set_state(ConnectionState::Disconnected);
        info!("connection closed");
        self.events.emit(EngineEvent::Closed);
    }

    /// Tear down after a failed send. The caller holds the link lock.
    fn drop_link(&self, link: &mut Option<Link>, error: &VoxlinkError) {
        warn!(error = %error, "send failed, dropping connection");
        *link = None;
        if let Some(task) = lock(&self.receive_task).take() {
            task.abort();
        }
        lock(&self.session).finish();
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(EngineEvent::Closed);
    }
}

async fn send_event(link: &mut Link, event: &ClientEvent) -> Result<()> {
    let text = event.to_json()?;
    debug!(kind = event.kind(), "sending event");
    link.sender.send_text(text).await
}

async fn receive_loop(inner: Arc<EngineInner>, link_id: u64, mut receiver: Box<dyn WireReceiver>) {
    let mut assembler = MessageAssembler::new();
    loop {
        match receiver.next_frame().await {
            Some(Ok(WireFrame::Data { payload, fin })) => match assembler.push(&payload, fin) {
                Some(Ok(text)) => inner.dispatch(&text),
                Some(Err(e)) => warn!(error = %e, "dropping message"),
                None => {}
            },
            Some(Ok(WireFrame::Close)) => {
                info!("server closed the connection");
                break;
            }
            Some(Err(VoxlinkError::NotConnected)) => break,
            Some(Err(e)) => {
                warn!(error = %e, "receive failed");
                inner.events.emit(EngineEvent::ConnectionError(e.to_string()));
                break;
            }
            None => {
                debug!("receive stream ended");
                break;
            }
        }
    }
    inner.link_closed(link_id).await;
}

/// Cloneable handle to the protocol engine.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

impl ProtocolEngine {
    pub fn new(
        connector: Arc<dyn Connector>,
        playback: Arc<dyn PlaybackControl>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                instructions: instructions.into(),
                connector,
                playback,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(ResponseSession::new()),
                link: tokio::sync::Mutex::new(None),
                receive_task: Mutex::new(None),
                next_link_id: AtomicU64::new(1),
                events: EventHub::new(),
                handlers: handler_table(),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn response_in_progress(&self) -> bool {
        lock(&self.inner.session).is_in_progress()
    }

    /// Transcript of the current (or last) response.
    pub fn transcript(&self) -> String {
        lock(&self.inner.session).transcript().to_string()
    }

    /// Open the connection and start the receive loop. Does nothing unless
    /// disconnected. On failure the state returns to `Disconnected` and a
    /// `ConnectionError` is raised as well as returned.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != ConnectionState::Disconnected {
                warn!(state = ?*state, "connect ignored");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let (sender, receiver) = match self.inner.connector.connect().await {
            Ok(halves) => halves,
            Err(e) => {
                warn!(error = %e, "connection failed");
                self.inner.set_state(ConnectionState::Disconnected);
                self.inner
                    .events
                    .emit(EngineEvent::ConnectionError(e.to_string()));
                return Err(e);
            }
        };

        let id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed);
        *self.inner.link.lock().await = Some(Link { id, sender });
        lock(&self.inner.session).reset();
        self.inner.set_state(ConnectionState::Open);

        let task = tokio::spawn(receive_loop(Arc::clone(&self.inner), id, receiver));
        if let Some(previous) = lock(&self.inner.receive_task).replace(task) {
            previous.abort();
        }

        info!("connected");
        self.inner.events.emit(EngineEvent::Connected);
        Ok(())
    }

    /// Send a normal close to the peer, stop the receive loop and raise
    /// `Closed`. Does nothing when already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() != ConnectionState::Open {
            debug!(state = ?self.state(), "disconnect ignored");
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Closing);

        let link = self.inner.link.lock().await.take();
        let Some(mut link) = link else {
            // The receive loop got there first and already raised Closed
            self.inner.set_state(ConnectionState::Disconnected);
            return Ok(());
        };
        if let Err(e) = link.sender.close().await {
            warn!(error = %e, "close handshake failed");
        }
        if let Some(task) = lock(&self.inner.receive_task).take() {
            task.abort();
        }
        lock(&self.inner.session).finish();
        self.inner.set_state(ConnectionState::Disconnected);
        info!("disconnected");
        self.inner.events.emit(EngineEvent::Closed);
        Ok(())
    }

    /// Submit one utterance. An in-progress response is cancelled first and
    /// marked inactive without waiting for the server to acknowledge.
    ///
    /// # Errors
    /// `NotConnected` when the connection is not open; the utterance is
    /// dropped. A failed send tears the connection down and returns the
    /// send error.
    pub async fn send_utterance(&self, utterance: &Utterance) -> Result<()> {
        let mut guard = self.inner.link.lock().await;
        if self.state() != ConnectionState::Open {
            return Err(VoxlinkError::NotConnected);
        }
        let Some(link) = guard.as_mut() else {
            return Err(VoxlinkError::NotConnected);
        };

        let result = self.send_utterance_on(link, utterance).await;
        if let Err(e) = &result {
            self.inner.drop_link(&mut guard, e);
        }
        result
    }

    async fn send_utterance_on(&self, link: &mut Link, utterance: &Utterance) -> Result<()> {
        if self.response_in_progress() {
            send_event(link, &ClientEvent::ResponseCancel).await?;
            lock(&self.inner.session).cancel();
            info!("cancelled in-progress response");
            self.inner.events.emit(EngineEvent::ResponseCancelled);
        }
        send_event(link, &ClientEvent::input_audio(utterance.to_base64())).await?;
        send_event(link, &ClientEvent::response_create(&self.inner.instructions)).await?;
        info!(
            samples = utterance.len(),
            seconds = utterance.duration().as_secs_f32(),
            "sent utterance"
        );
        Ok(())
    }

    /// Cancel the current response if there is one and the connection is
    /// open. Returns whether a cancel was sent.
    pub async fn cancel(&self) -> Result<bool> {
        let mut guard = self.inner.link.lock().await;
        if self.state() != ConnectionState::Open || !self.response_in_progress() {
            return Ok(false);
        }
        let Some(link) = guard.as_mut() else {
            return Ok(false);
        };
        if let Err(e) = send_event(link, &ClientEvent::ResponseCancel).await {
            self.inner.drop_link(&mut guard, &e);
            return Err(e);
        }
        lock(&self.inner.session).cancel();
        self.inner.events.emit(EngineEvent::ResponseCancelled);
        Ok(true)
    }
}
