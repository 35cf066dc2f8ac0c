//! Output sinks: where paced playback slices end up.
//!
//! The driver hands each slice to an [`OutputSink`] and then sleeps for the
//! slice's duration, so sinks only need to start playing and report whether
//! they are still audible.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Result;

/// Trait for audio outputs.
///
/// This trait allows swapping implementations (speaker vs silent vs test collector).
pub trait OutputSink: Send + Sync {
    /// Start playing one slice of mono samples.
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<()>;

    /// Stop immediately, discarding anything not yet audible.
    fn stop(&self);

    /// Whether previously submitted audio is still being played.
    fn is_active(&self) -> bool;

    /// Name for logs
    fn name(&self) -> &'static str {
        "output"
    }
}

/// Sink that discards audio, used when no output device is available.
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn play(&self, _samples: Vec<f32>, _sample_rate: u32) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn is_active(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// One slice handed to a [`CollectingSink`].
#[derive(Debug, Clone)]
pub struct PlayedSlice {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started_at: Instant,
}

impl PlayedSlice {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    slices: Vec<PlayedSlice>,
    audible_until: Option<Instant>,
    stop_count: usize,
}

/// Sink that records every slice and stays "active" for the slice's
/// real-time duration. Uses tokio's clock so paused-time tests stay exact.
#[derive(Debug, Default)]
pub struct CollectingSink {
    state: Mutex<CollectorState>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slices played so far, in order.
    pub fn slices(&self) -> Vec<PlayedSlice> {
        self.state
            .lock()
            .map(|state| state.slices.clone())
            .unwrap_or_default()
    }

    /// All played samples concatenated.
    pub fn played_samples(&self) -> Vec<f32> {
        self.slices()
            .into_iter()
            .flat_map(|slice| slice.samples)
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().map(|state| state.stop_count).unwrap_or(0)
    }
}

impl OutputSink for CollectingSink {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
        let slice = PlayedSlice {
            samples,
            sample_rate,
            started_at: Instant::now(),
        };
        if let Ok(mut state) = self.state.lock() {
            state.audible_until = Some(slice.started_at + slice.duration());
            state.slices.push(slice);
        }
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.audible_until = None;
            state.stop_count += 1;
        }
    }

    fn is_active(&self) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.audible_until)
            .is_some_and(|until| Instant::now() < until)
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}
