//! Playback pipeline: FIFO of decoded response audio drained in real time.
//!
//! Chunks arrive at irregular intervals from the receive loop. A single driver
//! task drains the queue in slices, hands each slice to an [`OutputSink`] and
//! sleeps for exactly the slice's duration before the next one. Cancellation is
//! flag-based: the flag is checked at the top of every driver iteration and
//! blocks further enqueues until [`PlaybackControl::reset_cancel_pending`].

pub mod sink;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::audio::codec;
use crate::config::Config;
use crate::defaults;
use crate::error::{Result, VoxlinkError};

pub use sink::{CollectingSink, NullSink, OutputSink, PlayedSlice};

/// Poll interval while the queue is empty but the sink is still audible.
const AUDIBLE_POLL: Duration = Duration::from_millis(10);

/// The playback surface other components depend on.
///
/// The protocol engine feeds chunks; the capture pipeline cancels on barge-in.
pub trait PlaybackControl: Send + Sync {
    /// Decode PCM16 bytes and append them to the queue. Dropped while a
    /// cancel is pending.
    fn enqueue_chunk(&self, pcm: &[u8]);

    /// Stop output, clear the queue and start dropping new chunks.
    fn cancel_playback(&self);

    /// Accept chunks again after a cancel.
    fn reset_cancel_pending(&self);

    /// Audio is audible or still queued.
    fn is_playing(&self) -> bool;
}

/// Tunables for the playback driver.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    /// Queue depth at which a full-size slice is taken.
    pub min_buffer: Duration,
    /// Upper bound on a single slice.
    pub max_chunk_samples: usize,
    /// Wait before re-checking an empty queue.
    pub drain_poll: Duration,
}

impl PlaybackConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            min_buffer: Duration::from_secs_f32(config.playback.min_buffer_seconds.max(0.0)),
            max_chunk_samples: config.playback.max_chunk_samples,
            drain_poll: Duration::from_millis(config.playback.drain_poll_ms),
        }
    }

    fn min_buffer_samples(&self) -> usize {
        (self.min_buffer.as_secs_f64() * self.sample_rate as f64) as usize
    }

    fn slice_duration(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(samples as f64 / self.sample_rate.max(1) as f64)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            min_buffer: Duration::from_secs_f32(defaults::MIN_PLAYBACK_BUFFER_SECS),
            max_chunk_samples: defaults::MAX_PLAYBACK_CHUNK_SAMPLES,
            drain_poll: Duration::from_millis(defaults::DRAIN_POLL_MS),
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<f32>,
    cancel_pending: bool,
    /// Bumped by every cancel; a driver from an older generation exits.
    generation: u64,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    config: PlaybackConfig,
    sink: Arc<dyn OutputSink>,
    runtime: Handle,
    state: Mutex<QueueState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cheaply cloneable handle to the playback queue and its driver.
#[derive(Clone)]
pub struct PlaybackPipeline {
    inner: Arc<Inner>,
}

impl PlaybackPipeline {
    /// Create a pipeline whose driver runs on the current tokio runtime.
    ///
    /// # Errors
    /// `AudioPlayback` when called outside a tokio runtime.
    pub fn new(config: PlaybackConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| VoxlinkError::AudioPlayback {
            message: format!("playback needs a tokio runtime: {}", e),
        })?;

        tracing::debug!(
            sink = sink.name(),
            sample_rate = config.sample_rate,
            min_buffer_ms = config.min_buffer.as_millis() as u64,
            max_chunk_samples = config.max_chunk_samples,
            "playback pipeline ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                sink,
                runtime,
                state: Mutex::new(QueueState::default()),
            }),
        })
    }

    /// Append already-decoded samples.
    pub fn enqueue_samples(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        let mut state = self.inner.lock();
        if state.cancel_pending {
            tracing::trace!(samples = samples.len(), "dropping audio while cancel is pending");
            return;
        }
        state.queue.extend(samples.iter().copied());

        let driver_running = state.driver.as_ref().is_some_and(|task| !task.is_finished());
        if !driver_running {
            let generation = state.generation;
            let inner = Arc::clone(&self.inner);
            state.driver = Some(self.inner.runtime.spawn(drive(inner, generation)));
        }
    }

    /// Samples waiting in the queue.
    pub fn queued_samples(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_cancel_pending(&self) -> bool {
        self.inner.lock().cancel_pending
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.config.sample_rate
    }
}

impl PlaybackControl for PlaybackPipeline {
    fn enqueue_chunk(&self, pcm: &[u8]) {
        self.enqueue_samples(&codec::decode_pcm16(pcm));
    }

    fn cancel_playback(&self) {
        let driver = {
            let mut state = self.inner.lock();
            state.cancel_pending = true;
            state.generation = state.generation.wrapping_add(1);
            state.queue.clear();
            state.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        self.inner.sink.stop();
        tracing::debug!("playback cancelled");
    }

    fn reset_cancel_pending(&self) {
        self.inner.lock().cancel_pending = false;
    }

    fn is_playing(&self) -> bool {
        self.inner.sink.is_active() || !self.inner.lock().queue.is_empty()
    }
}

enum Step {
    Play(Vec<f32>),
    Drained,
}

/// The driver loop. One instance per generation at most.
async fn drive(inner: Arc<Inner>, generation: u64) {
    let config = &inner.config;
    let min_samples = config.min_buffer_samples().max(1);
    let max_chunk = config.max_chunk_samples.max(1);

    loop {
        let step = {
            let mut state = inner.lock();
            if state.cancel_pending || state.generation != generation {
                return;
            }
            let queued = state.queue.len();
            if queued >= min_samples {
                Step::Play(state.queue.drain(..queued.min(max_chunk)).collect())
            } else if queued > 0 {
                Step::Play(state.queue.drain(..).collect())
            } else {
                Step::Drained
            }
        };

        match step {
            Step::Play(slice) => {
                let duration = config.slice_duration(slice.len());
                tracing::trace!(samples = slice.len(), ?duration, "playing slice");
                if let Err(e) = inner.sink.play(slice, config.sample_rate) {
                    tracing::warn!(error = %e, sink = inner.sink.name(), "output sink rejected slice");
                }
                tokio::time::sleep(duration).await;
            }
            Step::Drained if inner.sink.is_active() => {
                tokio::time::sleep(AUDIBLE_POLL).await;
            }
            Step::Drained => {
                // A chunk may land between the check and the wake-up
                tokio::time::sleep(config.drain_poll).await;
                let mut state = inner.lock();
                if state.generation != generation {
                    return;
                }
                if state.queue.is_empty() {
                    state.driver = None;
                    tracing::trace!("playback drained");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_with_collector() -> (PlaybackPipeline, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let pipeline = PlaybackPipeline::new(PlaybackConfig::default(), sink.clone()).unwrap();
        (pipeline, sink)
    }

    fn pcm_of(samples: usize, value: f32) -> Vec<u8> {
        codec::encode_pcm16(&vec![value; samples])
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = PlaybackPipeline::new(PlaybackConfig::default(), Arc::new(NullSink));
        assert!(matches!(result, Err(VoxlinkError::AudioPlayback { .. })));
    }

    #[test]
    fn test_min_buffer_samples_default() {
        assert_eq!(PlaybackConfig::default().min_buffer_samples(), 2400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_second_chunk_plays_as_one_slice() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.enqueue_chunk(&pcm_of(24000, 0.25));
        tokio::task::yield_now().await;

        assert!(pipeline.is_playing());
        tokio::time::sleep(Duration::from_millis(990)).await;
        assert!(pipeline.is_playing());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pipeline.is_playing());

        let slices = sink.slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].samples.len(), 24000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_queue_is_sliced_at_max_chunk() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.enqueue_samples(&vec![0.1; 60000]);

        tokio::time::sleep(Duration::from_secs(3)).await;

        let lengths: Vec<usize> = sink.slices().iter().map(|s| s.samples.len()).collect();
        assert_eq!(lengths, vec![48000, 12000]);
        // Second slice starts only once the first has finished
        let slices = sink.slices();
        let gap = slices[1].started_at - slices[0].started_at;
        assert!(gap >= Duration::from_secs(2), "gap was {:?}", gap);
        assert!(gap < Duration::from_millis(2010), "gap was {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_remainder_is_flushed() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.enqueue_samples(&vec![0.1; 500]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let slices = sink.slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].samples.len(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_arriving_during_playback_are_appended_in_order() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.enqueue_samples(&vec![0.1; 4800]);
        tokio::task::yield_now().await;
        pipeline.enqueue_samples(&vec![0.2; 4800]);

        tokio::time::sleep(Duration::from_secs(1)).await;

        let played = sink.played_samples();
        assert_eq!(played.len(), 9600);
        assert!(played[..4800].iter().all(|&s| s == 0.1));
        assert!(played[4800..].iter().all(|&s| s == 0.2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_queue_and_stops_output() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.enqueue_samples(&vec![0.1; 96000]);
        tokio::task::yield_now().await;
        assert_eq!(pipeline.queued_samples(), 48000);

        pipeline.cancel_playback();
        assert_eq!(pipeline.queued_samples(), 0);
        assert!(!pipeline.is_playing());
        assert_eq!(sink.stop_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.slices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (pipeline, _sink) = pipeline_with_collector();
        pipeline.cancel_playback();
        pipeline.cancel_playback();
        assert_eq!(pipeline.queued_samples(), 0);
        assert!(!pipeline.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_dropped_until_reset() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.cancel_playback();
        pipeline.enqueue_chunk(&pcm_of(2400, 0.3));
        assert_eq!(pipeline.queued_samples(), 0);
        assert!(pipeline.is_cancel_pending());

        pipeline.reset_cancel_pending();
        pipeline.enqueue_chunk(&pcm_of(2400, 0.3));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.played_samples().len(), 2400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_restarts_after_draining() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.enqueue_samples(&vec![0.1; 2400]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!pipeline.is_playing());

        pipeline.enqueue_samples(&vec![0.2; 2400]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.slices().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_enqueue_is_ignored() {
        let (pipeline, sink) = pipeline_with_collector();
        pipeline.enqueue_chunk(&[]);
        assert!(!pipeline.is_playing());
        assert!(sink.slices().is_empty());
    }
}
