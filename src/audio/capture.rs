//! Microphone capture using CPAL (Cross-Platform Audio Library).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::convert;
use crate::audio::ring::{DeviceRing, OverwritePolicy, SharedRing};
use crate::audio::source::{AudioSource, AudioSourceConfig};
use crate::error::{Result, VoxlinkError};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Quiet JACK/ALSA/PipeWire chatter during backend probing.
///
/// # Safety
/// Modifies environment variables; call at startup before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: called from main before the tokio runtime starts
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for desktop PipeWire/PulseAudio setups.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for a voice conversation.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

/// How long to wait for the first callback before falling back to the
/// device's native format.
const FIRST_CALLBACK_GRACE: Duration = Duration::from_millis(200);

pub(crate) fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

pub(crate) fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List input devices, hiding unusable ones and marking preferred ones
/// with "\[recommended\]".
///
/// # Errors
/// Returns `VoxlinkError::AudioCapture` if device enumeration fails.
pub fn list_devices() -> Result<Vec<String>> {
    let (_host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let devices = devices.map_err(|e| VoxlinkError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Best default input device: PipeWire, then Pulse, then the system default.
fn best_default_input() -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }

        host.default_input_device()
            .ok_or_else(|| VoxlinkError::AudioDeviceNotFound {
                device: "default".to_string(),
            })
    })
}

fn find_input_device(name: &str) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoxlinkError::AudioCapture {
                message: format!("Failed to enumerate devices: {}", e),
            })?;

        for device in devices {
            if let Ok(device_name) = device.name()
                && device_name == name
            {
                return Ok(device);
            }
        }

        Err(VoxlinkError::AudioDeviceNotFound {
            device: name.to_string(),
        })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched from the owning `CpalAudioSource`,
/// which is moved between threads but never shared.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Writes callback data into the shared ring while capture is enabled.
#[derive(Clone)]
struct RingWriter {
    ring: SharedRing,
    enabled: Arc<AtomicBool>,
    callbacks: Arc<AtomicU64>,
}

impl RingWriter {
    fn write(&self, samples: &[f32]) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(mut ring) = self.ring.lock() {
            ring.write(samples);
        }
    }
}

/// Microphone capture writing mono f32 samples into a [`DeviceRing`].
///
/// Tries mono f32 at the target rate first, then falls back to the device's
/// default config with software channel mixing and resampling.
pub struct CpalAudioSource {
    device: cpal::Device,
    stream: Mutex<Option<SendableStream>>,
    writer: RingWriter,
    sample_rate: u32,
}

impl CpalAudioSource {
    /// Open `device_name`, or the best default input device when `None`.
    ///
    /// # Errors
    /// `AudioDeviceNotFound` if the device does not exist or no input device
    /// is available.
    pub fn new(device_name: Option<&str>, config: &AudioSourceConfig) -> Result<Self> {
        let device = match device_name {
            Some(name) => find_input_device(name)?,
            None => best_default_input()?,
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate,
            ring_seconds = config.ring_seconds,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            stream: Mutex::new(None),
            writer: RingWriter {
                ring: DeviceRing::shared(config.ring_capacity(), OverwritePolicy::Wrap),
                enabled: Arc::new(AtomicBool::new(false)),
                callbacks: Arc::new(AtomicU64::new(0)),
            },
            sample_rate: config.sample_rate,
        })
    }

    fn build_preferred_stream(&self) -> Result<cpal::Stream> {
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let writer = self.writer.clone();

        self.device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| writer.write(data),
                |err| tracing::error!(error = %err, "audio capture stream error"),
                None,
            )
            .map_err(|e| VoxlinkError::AudioCapture {
                message: format!("Failed to build mono f32 stream: {}", e),
            })
    }

    /// Stream at the device's native config, converting in software.
    fn build_native_stream(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| VoxlinkError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            channels,
            native_rate,
            format = ?default_config.sample_format(),
            "using native audio format, converting in software"
        );

        let err_callback = |err| tracing::error!(error = %err, "audio capture stream error");
        let writer = self.writer.clone();

        match default_config.sample_format() {
            SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = convert::mix_to_mono(data, channels);
                    writer.write(&convert::resample(&mono, native_rate, target_rate));
                },
                err_callback,
                None,
            ),
            SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> =
                        data.iter().map(|&s| s as f32 / 32768.0).collect();
                    let mono = convert::mix_to_mono(&floats, channels);
                    writer.write(&convert::resample(&mono, native_rate, target_rate));
                },
                err_callback,
                None,
            ),
            fmt => {
                return Err(VoxlinkError::AudioCapture {
                    message: format!(
                        "Unsupported native sample format: {:?}. \
                         Try specifying a device with --device.",
                        fmt
                    ),
                });
            }
        }
        .map_err(|e| VoxlinkError::AudioCapture {
            message: format!("Failed to build native stream: {}", e),
        })
    }

    /// Open and play a stream, falling back to the native format when the
    /// preferred one is rejected or never fires its callback.
    fn open_stream(&self) -> Result<cpal::Stream> {
        if let Ok(stream) = self.build_preferred_stream()
            && stream.play().is_ok()
        {
            std::thread::sleep(FIRST_CALLBACK_GRACE);
            if self.writer.callbacks.load(Ordering::Relaxed) > 0 {
                return Ok(stream);
            }
            tracing::debug!("preferred capture format delivered no data, retrying natively");
        }

        let stream = self.build_native_stream()?;
        stream.play().map_err(|e| VoxlinkError::AudioCapture {
            message: format!("Failed to start native audio stream: {}", e),
        })?;
        Ok(stream)
    }

    fn lock_stream(&self) -> Result<std::sync::MutexGuard<'_, Option<SendableStream>>> {
        self.stream.lock().map_err(|e| VoxlinkError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })
    }
}

/// Run blocking device work without stalling other tasks on a multi-thread
/// runtime. Current-thread runtimes cannot hand the worker off, so the
/// closure simply runs inline there.
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self, policy: OverwritePolicy) -> Result<()> {
        self.writer
            .ring
            .lock()
            .map_err(|e| VoxlinkError::AudioCapture {
                message: format!("Failed to lock ring buffer: {}", e),
            })?
            .reset(policy);

        // The stream stays open between recordings; only the gate toggles
        if self.lock_stream()?.is_none() {
            // Opening may sleep through the first-callback grace period
            let stream = run_blocking(|| self.open_stream())?;
            *self.lock_stream()? = Some(SendableStream(stream));
        }

        self.writer.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.writer.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.writer.enabled.load(Ordering::SeqCst)
    }

    fn ring(&self) -> SharedRing {
        Arc::clone(&self.writer.ring)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalAudioSource {
    fn drop(&mut self) {
        if let Ok(mut stream) = self.stream.lock()
            && let Some(stream) = stream.take()
            && let Err(e) = stream.0.pause()
        {
            tracing::debug!(error = %e, "failed to pause capture stream on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_blocking_outside_runtime() {
        assert_eq!(run_blocking(|| 7), 7);
    }

    #[tokio::test]
    async fn test_run_blocking_on_current_thread_runtime() {
        assert_eq!(run_blocking(|| 7), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_hands_off_multi_thread_worker() {
        let value = run_blocking(|| {
            std::thread::sleep(Duration::from_millis(10));
            7
        });
        assert_eq!(value, 7);
    }

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("HDMI Output"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("pulse"));
        assert!(!is_preferred_device("hw:0,0"));
        assert!(!is_preferred_device("default"));
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_devices_hides_filtered_names() {
        let devices = list_devices().expect("Failed to list devices");
        for device in &devices {
            assert!(!should_filter_device(device.trim_end_matches(" [recommended]")));
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_unknown_device_name_is_not_found() {
        match CpalAudioSource::new(Some("NonExistentDevice12345"), &AudioSourceConfig::default())
        {
            Err(VoxlinkError::AudioDeviceNotFound { device }) => {
                assert_eq!(device, "NonExistentDevice12345");
            }
            Err(other) => panic!("Expected AudioDeviceNotFound, got {}", other),
            Ok(_) => panic!("Expected AudioDeviceNotFound"),
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_capture_writes_into_ring() {
        let mut source = CpalAudioSource::new(None, &AudioSourceConfig::default())
            .expect("Failed to create audio source");
        source.start(OverwritePolicy::Wrap).expect("Failed to start");
        std::thread::sleep(Duration::from_millis(300));
        let position = source.ring().lock().map(|ring| ring.position()).unwrap_or(0);
        source.stop().expect("Failed to stop");
        assert!(position > 0, "Expected samples to arrive from the device");
    }
}
