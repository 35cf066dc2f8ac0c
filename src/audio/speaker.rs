//! Speaker output using CPAL.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};

use crate::audio::capture::with_suppressed_stderr;
use crate::audio::{codec, convert};
use crate::error::{Result, VoxlinkError};
use crate::playback::OutputSink;

/// Output formats tried in order when the device supports the target rate.
const OUTPUT_PREFERENCE: [(SampleFormat, u16); 4] = [
    (SampleFormat::F32, 1),
    (SampleFormat::F32, 2),
    (SampleFormat::I16, 1),
    (SampleFormat::I16, 2),
];

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Wrapper for cpal::Stream to make it Send + Sync.
///
/// SAFETY: the stream is created once, never touched again except on drop,
/// and all audio state lives behind the shared queue mutex.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}
unsafe impl Sync for SendableStream {}

/// Persistent output stream fed from an interleaved sample queue.
///
/// `play` appends to the queue; the device callback drains it and writes
/// silence once the queue runs dry.
pub struct CpalSpeaker {
    queue: SampleQueue,
    device_rate: u32,
    channels: usize,
    _stream: SendableStream,
}

impl CpalSpeaker {
    /// Open the default output device, preferring f32 then i16, mono then
    /// stereo, at `sample_rate`, falling back to the device default config.
    pub fn new(sample_rate: u32) -> Result<Self> {
        let device = with_suppressed_stderr(|| cpal::default_host().default_output_device())
            .ok_or_else(|| VoxlinkError::AudioDeviceNotFound {
                device: "default output".to_string(),
            })?;

        let (config, format) = Self::pick_config(&device, sample_rate)?;
        let channels = config.channels as usize;
        let device_rate = config.sample_rate.0;

        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let reader = Arc::clone(&queue);
        let err_callback = |err| tracing::error!(error = %err, "audio playback stream error");

        let stream = match format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    fill_output(&reader, data, |sample| sample)
                },
                err_callback,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    fill_output(&reader, data, codec::float_to_i16)
                },
                err_callback,
                None,
            ),
            fmt => {
                return Err(VoxlinkError::AudioPlayback {
                    message: format!("Unsupported output sample format: {:?}", fmt),
                });
            }
        }
        .map_err(|e| VoxlinkError::AudioPlayback {
            message: format!("Failed to build output stream: {}", e),
        })?;

        stream.play().map_err(|e| VoxlinkError::AudioPlayback {
            message: format!("Failed to start output stream: {}", e),
        })?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate,
            channels,
            format = ?format,
            "audio playback initialized"
        );

        Ok(Self {
            queue,
            device_rate,
            channels,
            _stream: SendableStream(stream),
        })
    }

    fn pick_config(device: &cpal::Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
        let rate = SampleRate(sample_rate);
        if let Ok(ranges) = device.supported_output_configs()
            && let Some(range) = select_output_range(ranges, rate)
        {
            let format = range.sample_format();
            return Ok((range.with_sample_rate(rate).config(), format));
        }

        device
            .default_output_config()
            .map(|config| (config.config(), config.sample_format()))
            .map_err(|e| VoxlinkError::AudioPlayback {
                message: format!("No suitable output config: {}", e),
            })
    }
}

/// First supported range covering `rate`, in `OUTPUT_PREFERENCE` order.
fn select_output_range(
    ranges: impl IntoIterator<Item = SupportedStreamConfigRange>,
    rate: SampleRate,
) -> Option<SupportedStreamConfigRange> {
    let ranges: Vec<_> = ranges
        .into_iter()
        .filter(|r| r.min_sample_rate() <= rate && r.max_sample_rate() >= rate)
        .collect();
    OUTPUT_PREFERENCE.iter().find_map(|&(format, channels)| {
        ranges
            .iter()
            .find(|r| r.sample_format() == format && r.channels() == channels)
            .cloned()
    })
}

/// Device callback body: drain interleaved samples, silence when dry.
fn fill_output<T>(queue: &Mutex<VecDeque<f32>>, data: &mut [T], convert: impl Fn(f32) -> T) {
    match queue.lock() {
        Ok(mut queue) => {
            for out in data.iter_mut() {
                *out = convert(queue.pop_front().unwrap_or(0.0));
            }
        }
        Err(_) => {
            for out in data.iter_mut() {
                *out = convert(0.0);
            }
        }
    }
}

impl OutputSink for CpalSpeaker {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
        let resampled = convert::resample(&samples, sample_rate, self.device_rate);
        let interleaved = convert::spread_to_channels(&resampled, self.channels);
        let mut queue = self.queue.lock().map_err(|e| VoxlinkError::AudioPlayback {
            message: format!("Failed to lock output queue: {}", e),
        })?;
        queue.extend(interleaved);
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn is_active(&self) -> bool {
        self.queue.lock().map(|queue| !queue.is_empty()).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "speaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;

    fn range(channels: u16, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(8000),
            SampleRate(48000),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_select_prefers_f32_over_i16_mono() {
        let ranges = vec![range(1, SampleFormat::I16), range(2, SampleFormat::F32)];
        let picked = select_output_range(ranges, SampleRate(24000)).unwrap();
        assert_eq!(picked.sample_format(), SampleFormat::F32);
        assert_eq!(picked.channels(), 2);
    }

    #[test]
    fn test_select_falls_back_to_i16_without_f32() {
        let ranges = vec![range(2, SampleFormat::I16), range(1, SampleFormat::U8)];
        let picked = select_output_range(ranges, SampleRate(24000)).unwrap();
        assert_eq!(picked.sample_format(), SampleFormat::I16);
        assert_eq!(picked.channels(), 2);
    }

    #[test]
    fn test_select_skips_unsupported_formats_and_rates() {
        let ranges = vec![range(1, SampleFormat::U8), range(6, SampleFormat::F32)];
        assert!(select_output_range(ranges, SampleRate(24000)).is_none());
        let ranges = vec![range(1, SampleFormat::F32)];
        assert!(select_output_range(ranges, SampleRate(96000)).is_none());
    }

    #[test]
    fn test_fill_output_converts_and_pads_with_silence() {
        let queue = Mutex::new(VecDeque::from(vec![1.0, -0.5, 0.25]));
        let mut data = [7i16; 5];
        fill_output(&queue, &mut data, codec::float_to_i16);
        assert_eq!(data, [i16::MAX, -16384, 8192, 0, 0]);
        assert!(queue.lock().unwrap().is_empty());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_speaker_plays_and_drains() {
        let speaker = CpalSpeaker::new(24000).expect("Failed to open speaker");
        speaker.play(vec![0.0; 2400], 24000).expect("play");
        assert!(speaker.is_active());
        std::thread::sleep(std::time::Duration::from_millis(400));
        assert!(!speaker.is_active());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_speaker_stop_clears_queue() {
        let speaker = CpalSpeaker::new(24000).expect("Failed to open speaker");
        speaker.play(vec![0.0; 48000], 24000).expect("play");
        speaker.stop();
        assert!(!speaker.is_active());
    }
}
