//! Audio primitives: codec, spectrum/VAD analysis, sample buffers and devices.

pub mod analyzer;
#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod codec;
pub mod convert;
pub mod ring;
pub mod source;
#[cfg(feature = "cpal-audio")]
pub mod speaker;

pub use analyzer::{SpectrumAnalyzer, VadAnalysis, VadParams};
pub use ring::{DeviceRing, OverwritePolicy, RollingBuffer, SharedRing};
pub use source::{AudioSource, AudioSourceConfig, MockAudioSource, MockFeeder};
