//! In-process audio backend
//!
//! Stands in for a platform audio API: the output keeps a device clock on
//! tokio time, plays voices out to completion and feeds a spectrum tap with
//! whatever is audible; the capture side paces frames of a synthetic signal
//! at real-time speed.

use crate::device::{
    AudioBackend, CaptureSource, DeviceError, EndedCallback, FrequencyAnalyser, OutputDevice,
    PlaybackBuffer, Voice,
};
use crate::pcm::AudioFrame;
use crate::spectrum::{SpectrumTap, FFT_SIZE};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

struct ClockState {
    anchor: Instant,
    banked: f64,
    running: bool,
}

struct ActiveVoice {
    id: u64,
    buffer: PlaybackBuffer,
    start: f64,
}

/// Simulated output device.
pub struct SimulatedOutput {
    sample_rate: u32,
    clock: Mutex<ClockState>,
    voices: Mutex<Vec<ActiveVoice>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    tap: Arc<OutputTap>,
}

impl SimulatedOutput {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sample_rate,
            clock: Mutex::new(ClockState {
                anchor: Instant::now(),
                banked: 0.0,
                running: true,
            }),
            voices: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            tap: Arc::new(OutputTap {
                device: weak.clone(),
                spectrum: SpectrumTap::new(),
            }),
        })
    }

    /// Host-initiated suspension: the clock freezes until [`OutputDevice::resume`].
    pub fn suspend(&self) {
        let mut clock = self.clock.lock();
        if clock.running {
            clock.banked += clock.anchor.elapsed().as_secs_f64();
            clock.running = false;
            info!("Simulated output suspended at {:.3}s", clock.banked);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Voices started and neither finished nor stopped.
    pub fn active_voices(&self) -> usize {
        self.voices.lock().len()
    }

    fn remove_voice(&self, id: u64) -> bool {
        let mut voices = self.voices.lock();
        let before = voices.len();
        voices.retain(|v| v.id != id);
        voices.len() != before
    }

    /// Mix of every audible voice over the last [`FFT_SIZE`] output samples.
    fn render_recent(&self) -> Vec<f32> {
        let now = self.current_time();
        let rate = self.sample_rate as f64;
        let mut block = vec![0.0f32; FFT_SIZE];

        for voice in self.voices.lock().iter() {
            let samples = voice.buffer.samples();
            let channels = voice.buffer.channels() as usize;
            let voice_rate = voice.buffer.sample_rate() as f64;
            for (i, slot) in block.iter_mut().enumerate() {
                let t = now - (FFT_SIZE - i) as f64 / rate;
                let offset = t - voice.start;
                if offset < 0.0 {
                    continue;
                }
                let frame = (offset * voice_rate) as usize;
                if let Some(s) = samples.get(frame * channels) {
                    *slot += *s;
                }
            }
        }
        block
    }
}

#[async_trait]
impl OutputDevice for SimulatedOutput {
    fn current_time(&self) -> f64 {
        let clock = self.clock.lock();
        if clock.running {
            clock.banked + clock.anchor.elapsed().as_secs_f64()
        } else {
            clock.banked
        }
    }

    fn is_suspended(&self) -> bool {
        !self.clock.lock().running
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        let mut clock = self.clock.lock();
        if !clock.running {
            clock.anchor = Instant::now();
            clock.running = true;
            info!("Simulated output resumed at {:.3}s", clock.banked);
        }
        Ok(())
    }

    async fn materialize(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<PlaybackBuffer, DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        tokio::task::yield_now().await;
        PlaybackBuffer::new(samples, sample_rate, channels)
    }

    fn start(
        &self,
        buffer: PlaybackBuffer,
        at: f64,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn Voice>, DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let end = at + buffer.duration();
        self.voices.lock().push(ActiveVoice {
            id,
            buffer,
            start: at,
        });

        let stopped = Arc::new(AtomicBool::new(false));
        let device = self.tap.device.clone();
        let flag = stopped.clone();
        tokio::spawn(async move {
            loop {
                let Some(output) = device.upgrade() else { return };
                if flag.load(Ordering::SeqCst) || output.is_closed() {
                    return;
                }
                let remaining = end - output.current_time();
                if remaining <= 0.0 {
                    if output.remove_voice(id) {
                        drop(output);
                        on_ended();
                    }
                    return;
                }
                drop(output);
                tokio::time::sleep(Duration::from_secs_f64(remaining.max(0.001))).await;
            }
        });

        Ok(Box::new(SimVoice {
            id,
            stopped,
            device: self.tap.device.clone(),
        }))
    }

    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.tap.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let dropped = {
                let mut voices = self.voices.lock();
                let n = voices.len();
                voices.clear();
                n
            };
            info!("Simulated output closed ({} voices released)", dropped);
        }
    }
}

struct SimVoice {
    id: u64,
    stopped: Arc<AtomicBool>,
    device: Weak<SimulatedOutput>,
}

impl Voice for SimVoice {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            if let Some(device) = self.device.upgrade() {
                device.remove_voice(self.id);
            }
        }
    }
}

/// Spectrum of whatever the simulated output is currently playing.
struct OutputTap {
    device: Weak<SimulatedOutput>,
    spectrum: SpectrumTap,
}

impl FrequencyAnalyser for OutputTap {
    fn frequency_bins(&self) -> Vec<u8> {
        let block = match self.device.upgrade() {
            Some(device) => device.render_recent(),
            None => vec![0.0; FFT_SIZE],
        };
        self.spectrum.analyse(&block)
    }
}

/// Synthetic microphone signal
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Silence,
    Tone { frequency: f32, amplitude: f32 },
    /// Plays once, then silence
    Clip(Vec<f32>),
}

impl Signal {
    fn sample(&self, n: u64, sample_rate: u32) -> f32 {
        match self {
            Signal::Silence => 0.0,
            Signal::Tone {
                frequency,
                amplitude,
            } => amplitude * (2.0 * PI * frequency * n as f32 / sample_rate as f32).sin(),
            Signal::Clip(samples) => samples.get(n as usize).copied().unwrap_or(0.0),
        }
    }
}

/// Simulated microphone producing one frame per frame-duration of real time.
pub struct SimulatedCapture {
    signal: Signal,
    sample_rate: u32,
    frame_samples: usize,
    position: u64,
    remaining: Option<usize>,
    ticker: Option<Interval>,
    tap: Arc<SpectrumTap>,
}

impl SimulatedCapture {
    pub fn new(signal: Signal, sample_rate: u32, frame_samples: usize) -> Self {
        Self {
            signal,
            sample_rate,
            frame_samples,
            position: 0,
            remaining: None,
            ticker: None,
            tap: Arc::new(SpectrumTap::new()),
        }
    }

    /// End the stream after `frames` frames.
    pub fn with_frame_limit(mut self, frames: usize) -> Self {
        self.remaining = Some(frames);
        self
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.frame_samples as f64 / self.sample_rate as f64)
    }
}

#[async_trait]
impl CaptureSource for SimulatedCapture {
    async fn next_frame(&mut self) -> Option<AudioFrame> {
        match self.remaining.as_mut() {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }

        let period = self.frame_period();
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;

        let samples: Vec<f32> = (0..self.frame_samples as u64)
            .map(|i| self.signal.sample(self.position + i, self.sample_rate))
            .collect();
        self.position += self.frame_samples as u64;
        self.tap.push(&samples);

        Some(AudioFrame::new(samples, self.sample_rate))
    }

    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.tap.clone()
    }
}

/// Backend opening simulated devices.
#[derive(Debug, Clone)]
pub struct SimBackend {
    pub signal: Signal,
    pub frame_limit: Option<usize>,
    /// Refuse the microphone, as a user denying permission would
    pub deny_capture: bool,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self {
            signal: Signal::Silence,
            frame_limit: None,
            deny_capture: false,
        }
    }
}

impl AudioBackend for SimBackend {
    fn open_capture(
        &self,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureSource>, DeviceError> {
        if self.deny_capture {
            return Err(DeviceError::PermissionDenied);
        }
        debug!(
            "Opening simulated capture at {} Hz, {} samples per frame",
            sample_rate, frame_samples
        );
        let mut capture = SimulatedCapture::new(self.signal.clone(), sample_rate, frame_samples);
        if let Some(limit) = self.frame_limit {
            capture = capture.with_frame_limit(limit);
        }
        Ok(Box::new(capture))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputDevice>, DeviceError> {
        debug!("Opening simulated output at {} Hz", sample_rate);
        Ok(SimulatedOutput::new(sample_rate))
    }
}
