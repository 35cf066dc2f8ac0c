use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::audio::ring::{DeviceRing, OverwritePolicy, SharedRing};
use crate::defaults;
use crate::error::{Result, VoxlinkError};

/// Trait for microphone-like sources that write into a [`DeviceRing`].
///
/// This trait allows swapping implementations (real audio device vs mock).
/// The source owns the writing side; the capture pipeline reads the ring
/// through its own cursor.
pub trait AudioSource: Send {
    /// Rewind the ring to position 0 with `policy` and start writing into it.
    fn start(&mut self, policy: OverwritePolicy) -> Result<()>;

    /// Stop writing. The ring keeps its contents until the next start.
    fn stop(&mut self) -> Result<()>;

    /// Whether the source is currently writing into the ring.
    fn is_capturing(&self) -> bool;

    /// Ring the source writes into.
    fn ring(&self) -> SharedRing;

    /// Sample rate of the samples written into the ring.
    fn sample_rate(&self) -> u32;
}

/// Configuration for audio source initialization
#[derive(Debug, Clone)]
pub struct AudioSourceConfig {
    pub sample_rate: u32,
    /// Ring capacity in seconds.
    pub ring_seconds: u32,
}

impl AudioSourceConfig {
    pub fn ring_capacity(&self) -> usize {
        self.sample_rate as usize * self.ring_seconds as usize
    }
}

impl Default for AudioSourceConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            ring_seconds: defaults::MAX_BUFFER_SECS,
        }
    }
}

/// Mock audio source for testing.
///
/// Samples are fed with [`MockAudioSource::push`]; they only reach the ring
/// while the source is capturing, like a real device.
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    ring: SharedRing,
    sample_rate: u32,
    capturing: Arc<AtomicBool>,
    start_count: usize,
    should_fail_start: bool,
    should_fail_stop: bool,
    error_message: String,
}

impl MockAudioSource {
    /// Create a mock with the default ring size.
    pub fn new() -> Self {
        Self::with_config(&AudioSourceConfig::default())
    }

    pub fn with_config(config: &AudioSourceConfig) -> Self {
        Self {
            ring: DeviceRing::shared(config.ring_capacity(), OverwritePolicy::Wrap),
            sample_rate: config.sample_rate,
            capturing: Arc::new(AtomicBool::new(false)),
            start_count: 0,
            should_fail_start: false,
            should_fail_stop: false,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on stop
    pub fn with_stop_failure(mut self) -> Self {
        self.should_fail_stop = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Simulate the device delivering `samples`. Returns how many were stored.
    pub fn push(&self, samples: &[f32]) -> usize {
        self.feeder().push(samples)
    }

    /// Number of successful starts so far.
    pub fn start_count(&self) -> usize {
        self.start_count
    }

    /// Handle sharing this mock's ring, for feeding samples after the mock
    /// has been boxed into a pipeline.
    pub fn feeder(&self) -> MockFeeder {
        MockFeeder {
            ring: self.ring.clone(),
            capturing: Arc::clone(&self.capturing),
        }
    }

    fn failure(&self) -> VoxlinkError {
        VoxlinkError::AudioCapture {
            message: self.error_message.clone(),
        }
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self, policy: OverwritePolicy) -> Result<()> {
        if self.should_fail_start {
            return Err(self.failure());
        }
        self.ring
            .lock()
            .map_err(|e| VoxlinkError::AudioCapture {
                message: format!("Failed to lock ring buffer: {}", e),
            })?
            .reset(policy);
        self.capturing.store(true, Ordering::SeqCst);
        self.start_count += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.should_fail_stop {
            return Err(self.failure());
        }
        self.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn ring(&self) -> SharedRing {
        self.ring.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Writes into a mock's ring from outside the pipeline that owns the mock.
#[derive(Debug, Clone)]
pub struct MockFeeder {
    ring: SharedRing,
    capturing: Arc<AtomicBool>,
}

impl MockFeeder {
    /// Samples pushed while the source is stopped are dropped.
    pub fn push(&self, samples: &[f32]) -> usize {
        if !self.capturing.load(Ordering::SeqCst) {
            return 0;
        }
        match self.ring.lock() {
            Ok(mut ring) => ring.write(samples),
            Err(_) => 0,
        }
    }
}
