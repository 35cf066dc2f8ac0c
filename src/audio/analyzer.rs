//! Signal analysis: magnitude spectra for visualization and the short/long
//! window energy-ratio test used for voice activity detection.

use std::borrow::Cow;
use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Parameters of the energy-ratio VAD test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadParams {
    pub sample_rate: u32,
    /// Length of the recent window compared against the whole buffer.
    pub short_window_secs: f32,
    /// Recent energy must exceed this fraction of the overall energy.
    pub energy_threshold: f32,
    /// Single-pole high-pass cutoff; `<= 0` disables filtering.
    pub high_pass_cutoff_hz: f32,
}

/// Outcome of one VAD pass.
///
/// Energies are mean absolute amplitudes. Both are zero when the test failed
/// closed (window too short).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VadAnalysis {
    pub voice_detected: bool,
    pub energy_last: f32,
    pub energy_all: f32,
}

/// Reusable FFT plan for a fixed power-of-two window size.
pub struct SpectrumAnalyzer {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    /// Plans a forward FFT of `size` points.
    ///
    /// `size` must be a power of two. Config validation rejects anything else,
    /// so a violation here is a programming error.
    pub fn new(size: usize) -> Self {
        assert!(
            size.is_power_of_two(),
            "FFT size must be a power of two, got {}",
            size
        );
        let fft = FftPlanner::new().plan_fft_forward(size);
        Self {
            size,
            fft,
            buffer: vec![Complex::new(0.0, 0.0); size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Magnitude spectrum of the most recent `size` samples of `window`.
    ///
    /// Shorter windows are zero-padded at the end. Returns `size / 2` bins
    /// covering 0 Hz up to Nyquist, each `sqrt(re² + im²)`.
    pub fn compute(&mut self, window: &[f32]) -> Vec<f32> {
        let take = window.len().min(self.size);
        let recent = &window[window.len() - take..];

        for (slot, &sample) in self.buffer.iter_mut().zip(recent) {
            *slot = Complex::new(sample, 0.0);
        }
        for slot in self.buffer.iter_mut().skip(take) {
            *slot = Complex::new(0.0, 0.0);
        }

        self.fft.process(&mut self.buffer);

        self.buffer[..self.size / 2]
            .iter()
            .map(|bin| (bin.re * bin.re + bin.im * bin.im).sqrt())
            .collect()
    }
}

/// One-shot spectrum computation. Prefer [`SpectrumAnalyzer`] in loops.
pub fn compute_spectrum(window: &[f32], size: usize) -> Vec<f32> {
    SpectrumAnalyzer::new(size).compute(window)
}

/// Mean spectrum magnitude inside each frequency band.
///
/// Bands are `[0, edges[0])`, `[edges[0], edges[1])`, … and a final band up to
/// Nyquist. Bands narrower than one bin report 0.
pub fn band_levels(spectrum: &[f32], sample_rate: u32, fft_size: usize, edges: &[f32]) -> Vec<f32> {
    if fft_size == 0 {
        return vec![0.0; edges.len() + 1];
    }
    let bin_hz = sample_rate as f32 / fft_size as f32;
    let nyquist = sample_rate as f32 / 2.0;
    let to_bin = |hz: f32| ((hz / bin_hz).floor() as usize).min(spectrum.len());

    let mut lower = 0.0;
    edges
        .iter()
        .copied()
        .chain(std::iter::once(nyquist))
        .map(|upper| {
            let (start, end) = (to_bin(lower), to_bin(upper));
            lower = upper;
            if end <= start {
                return 0.0;
            }
            spectrum[start..end].iter().sum::<f32>() / (end - start) as f32
        })
        .collect()
}

/// Energy-ratio voice activity test over a sample window.
///
/// Compares the mean absolute amplitude of the last `short_window_secs` against
/// the whole window. Fails closed (no voice) when the short window is empty or
/// not strictly shorter than the window.
pub fn detect_voice_activity(window: &[f32], params: &VadParams) -> VadAnalysis {
    let total = window.len();
    let recent = (params.sample_rate as f32 * params.short_window_secs) as usize;
    if recent == 0 || recent >= total {
        return VadAnalysis::default();
    }

    let samples: Cow<'_, [f32]> = if params.high_pass_cutoff_hz > 0.0 {
        let mut filtered = window.to_vec();
        high_pass_filter(&mut filtered, params.high_pass_cutoff_hz, params.sample_rate);
        Cow::Owned(filtered)
    } else {
        Cow::Borrowed(window)
    };

    let split = total - recent;
    let energy_head: f32 = samples[..split].iter().map(|s| s.abs()).sum();
    let energy_tail: f32 = samples[split..].iter().map(|s| s.abs()).sum();

    let energy_all = (energy_head + energy_tail) / total as f32;
    let energy_last = energy_tail / recent as f32;

    VadAnalysis {
        voice_detected: energy_last > params.energy_threshold * energy_all,
        energy_last,
        energy_all,
    }
}

/// Single-pole IIR high-pass filter, in place.
///
/// `y[i] = a * (y[i-1] + x[i] - x[i-1])` with `a = rc / (rc + dt)`.
pub fn high_pass_filter(samples: &mut [f32], cutoff_hz: f32, sample_rate: u32) {
    if samples.is_empty() || cutoff_hz <= 0.0 || sample_rate == 0 {
        return;
    }
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    let dt = 1.0 / sample_rate as f32;
    let alpha = rc / (rc + dt);

    let mut previous_input = samples[0];
    let mut previous_output = samples[0];
    for sample in samples.iter_mut().skip(1) {
        let input = *sample;
        previous_output = alpha * (previous_output + input - previous_input);
        previous_input = input;
        *sample = previous_output;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(threshold: f32) -> VadParams {
        VadParams {
            sample_rate: 1000,
            short_window_secs: 0.1,
            energy_threshold: threshold,
            high_pass_cutoff_hz: 0.0,
        }
    }

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_spectrum_peak_at_tone_bin() {
        // 1024-point FFT at 1024 Hz sample rate: bin k == k Hz
        let tone = sine(64.0, 1024, 1024);
        let spectrum = compute_spectrum(&tone, 1024);

        assert_eq!(spectrum.len(), 512);
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 64);
        // A unit sine of N points peaks at N/2
        assert!((spectrum[64] - 512.0).abs() < 1.0);
    }

    #[test]
    fn test_spectrum_of_silence_is_zero() {
        let spectrum = compute_spectrum(&[0.0; 256], 256);
        assert!(spectrum.iter().all(|&m| m == 0.0));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_non_power_of_two_size_is_fatal() {
        SpectrumAnalyzer::new(1000);
    }

    #[test]
    fn test_spectrum_uses_most_recent_samples_and_zero_pads() {
        let mut analyzer = SpectrumAnalyzer::new(8);

        // Only the last 8 samples matter
        let mut long = vec![1.0; 100];
        long.extend_from_slice(&[0.0; 8]);
        assert!(analyzer.compute(&long).iter().all(|&m| m == 0.0));

        // A single impulse zero-padded to 8 points has a flat spectrum
        let flat = analyzer.compute(&[1.0]);
        assert_eq!(flat.len(), 4);
        assert!(flat.iter().all(|&m| (m - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_band_levels_average_bins() {
        // 8 bins of 100 Hz each at 1600 Hz / 16-point FFT
        let spectrum = vec![1.0, 1.0, 2.0, 2.0, 4.0, 4.0, 4.0, 4.0];
        let levels = band_levels(&spectrum, 1600, 16, &[200.0, 400.0]);
        assert_eq!(levels, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_band_levels_narrow_band_reports_zero() {
        let spectrum = vec![1.0; 8];
        let levels = band_levels(&spectrum, 1600, 16, &[50.0]);
        assert_eq!(levels[0], 0.0);
        assert_eq!(levels.len(), 2);
    }

    #[test]
    fn test_vad_detects_onset_after_silence() {
        let mut window = vec![0.0; 900];
        window.extend(vec![0.5; 100]);

        let result = detect_voice_activity(&window, &params(0.5));

        assert!(result.voice_detected);
        assert!((result.energy_last - 0.5).abs() < 1e-6);
        assert!((result.energy_all - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_vad_rejects_steady_noise() {
        let window = vec![0.25; 1000];
        // Equal energies: 0.25 > 1.0 * 0.25 is false
        assert!(!detect_voice_activity(&window, &params(1.0)).voice_detected);
    }

    #[test]
    fn test_vad_silence_is_not_voice() {
        let window = vec![0.0; 1000];
        assert!(!detect_voice_activity(&window, &params(0.5)).voice_detected);
    }

    #[test]
    fn test_vad_fails_closed_when_window_too_short() {
        // short window = 100 samples, whole window = 100 samples
        let window = vec![0.9; 100];
        let result = detect_voice_activity(&window, &params(0.0));
        assert_eq!(result, VadAnalysis::default());

        let result = detect_voice_activity(&[0.9; 50], &params(0.0));
        assert!(!result.voice_detected);
    }

    #[test]
    fn test_vad_fails_closed_with_empty_short_window() {
        let mut zero_window = params(0.0);
        zero_window.short_window_secs = 0.0;
        assert!(!detect_voice_activity(&[0.9; 100], &zero_window).voice_detected);
    }

    #[test]
    fn test_vad_raising_threshold_never_creates_detections() {
        let windows: Vec<Vec<f32>> = vec![
            [vec![0.0; 900], vec![0.3; 100]].concat(),
            [vec![0.1; 500], vec![0.2; 500]].concat(),
            vec![0.4; 1000],
            sine(13.0, 1000, 1000),
            [vec![0.5; 900], vec![0.01; 100]].concat(),
        ];

        for window in &windows {
            let mut previous = true;
            for step in 0..=40 {
                let threshold = step as f32 * 0.1;
                let detected = detect_voice_activity(window, &params(threshold)).voice_detected;
                assert!(
                    previous || !detected,
                    "detection reappeared at threshold {}",
                    threshold
                );
                previous = detected;
            }
        }
    }

    #[test]
    fn test_high_pass_removes_dc_offset() {
        let mut samples = vec![0.5; 2000];
        high_pass_filter(&mut samples, 50.0, 1000);
        assert!(samples[1999].abs() < 1e-3, "got {}", samples[1999]);
    }

    #[test]
    fn test_high_pass_keeps_high_frequencies() {
        let mut samples = sine(250.0, 1000, 1000);
        high_pass_filter(&mut samples, 10.0, 1000);
        let peak = samples[500..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.9, "peak {}", peak);
    }

    #[test]
    fn test_high_pass_disabled_for_zero_cutoff() {
        let mut samples = vec![0.5; 10];
        high_pass_filter(&mut samples, 0.0, 1000);
        assert_eq!(samples, vec![0.5; 10]);
    }

    #[test]
    fn test_vad_with_high_pass_attenuates_dc_step() {
        let mut window = vec![0.0; 900];
        window.extend(vec![0.5; 100]);
        let mut filtered = params(0.5);
        filtered.high_pass_cutoff_hz = 200.0;

        let raw = detect_voice_activity(&window, &params(0.5));
        let high_passed = detect_voice_activity(&window, &filtered);

        assert!(high_passed.energy_last < raw.energy_last / 10.0);
    }
}
