//! Audio device seams
//!
//! The pipeline never talks to a platform API directly. Capture, output and
//! the analysis taps are reached through the traits below so any native audio
//! facility (or the in-process [`crate::sim`] backend) can drive a session.

use crate::pcm::AudioFrame;
use async_trait::async_trait;
use std::sync::Arc;

/// Errors raised by capture and output devices
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("permission to use the audio device was denied")]
    PermissionDenied,

    #[error("audio device is closed")]
    Closed,

    #[error("failed to resume suspended output: {0}")]
    ResumeFailed(String),

    #[error("invalid playback buffer: {0}")]
    InvalidBuffer(String),
}

impl DeviceError {
    /// Whether the device is gone for the rest of the session.
    ///
    /// A bad buffer only affects the chunk it came from.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DeviceError::InvalidBuffer(_))
    }
}

/// Device-native buffer ready to be started on an output timeline.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl PlaybackBuffer {
    /// Wrap interleaved samples. Rejects a zero rate/channel count and sample
    /// counts that do not divide into whole frames.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self, DeviceError> {
        if sample_rate == 0 || channels == 0 {
            return Err(DeviceError::InvalidBuffer(format!(
                "rate {} Hz, {} channels",
                sample_rate, channels
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(DeviceError::InvalidBuffer(format!(
                "{} samples do not fill {} channels",
                samples.len(),
                channels
            )));
        }

        Ok(Self {
            samples: samples.into(),
            sample_rate,
            channels,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Fired once when a started buffer plays out to its end.
///
/// Devices invoke it from their own context, never from inside
/// [`OutputDevice::start`] or [`Voice::stop`].
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// A buffer that has been started on an output device.
pub trait Voice: Send + Sync {
    /// Stop immediately. Stopping a voice that already finished is a no-op.
    fn stop(&self);
}

/// Polling view over a frequency-domain analysis tap.
pub trait FrequencyAnalyser: Send + Sync {
    /// Current magnitude per bin, byte-scaled (0..=255).
    fn frequency_bins(&self) -> Vec<u8>;
}

/// Playback side of the device interface.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    /// Monotonic device clock in seconds.
    fn current_time(&self) -> f64;

    /// Whether the host has suspended output.
    fn is_suspended(&self) -> bool;

    /// Resume a suspended device; resolves once output runs again.
    async fn resume(&self) -> Result<(), DeviceError>;

    /// Allocate a device buffer at `sample_rate`/`channels` and copy samples in.
    async fn materialize(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<PlaybackBuffer, DeviceError>;

    /// Start `buffer` at device time `at`.
    fn start(
        &self,
        buffer: PlaybackBuffer,
        at: f64,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn Voice>, DeviceError>;

    /// Analysis tap wired after every started voice.
    fn analyser(&self) -> Arc<dyn FrequencyAnalyser>;

    /// Release the device. Later calls to `start` fail with [`DeviceError::Closed`].
    fn close(&self);
}

/// Live microphone stream delivering fixed-size frames in capture order.
#[async_trait]
pub trait CaptureSource: Send {
    /// Next captured frame; `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<AudioFrame>;

    /// Analysis tap on the raw input.
    fn analyser(&self) -> Arc<dyn FrequencyAnalyser>;
}

/// Opens the devices a session needs.
pub trait AudioBackend {
    fn open_capture(
        &self,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureSource>, DeviceError>;

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputDevice>, DeviceError>;
}
