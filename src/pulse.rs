//! PulseAudio backend
//!
//! Capture and playback each run a blocking `Simple` stream on a dedicated OS
//! thread. Capture hands 16-bit frames to tokio over an mpsc channel. Playback
//! runs a small mixer: every started voice is summed into 20 ms blocks, and
//! the device clock is the number of frames written so far.

use crate::device::{
    AudioBackend, CaptureSource, DeviceError, EndedCallback, FrequencyAnalyser, OutputDevice,
    PlaybackBuffer, Voice,
};
use crate::pcm::{decode_pcm16, encode_pcm16, AudioFrame};
use crate::spectrum::SpectrumTap;
use async_trait::async_trait;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Mixer block length
const BLOCK_MS: u32 = 20;
/// Server-side playback buffer, kept short so written frames track what is audible
const PLAYBACK_LATENCY_MS: u32 = 60;
const CAPTURE_QUEUE: usize = 8;

/// Backend opening the default (or named) PulseAudio source and sink.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    source: Option<String>,
    sink: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            source: None,
            sink: None,
        }
    }

    /// Use specific PulseAudio source/sink names instead of the defaults.
    pub fn with_devices(mut self, source: Option<String>, sink: Option<String>) -> Self {
        self.source = source;
        self.sink = sink;
        self
    }
}

fn mono_spec(rate: u32) -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    }
}

fn bytes_for_ms(rate: u32, ms: u32) -> u32 {
    rate * ms / 1000 * 2
}

/// Wait for the device thread to report whether its stream opened.
fn await_ready(ready: std_mpsc::Receiver<Result<(), DeviceError>>) -> Result<(), DeviceError> {
    match ready.recv() {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Unavailable(
            "audio thread exited during setup".to_string(),
        )),
    }
}

impl AudioBackend for PulseBackend {
    fn open_capture(
        &self,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureSource>, DeviceError> {
        let (frames_tx, frames) = mpsc::channel(CAPTURE_QUEUE);
        let (ready_tx, ready) = std_mpsc::sync_channel(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let tap = Arc::new(SpectrumTap::new());

        let stream = CaptureStream {
            app_name: self.app_name.clone(),
            device: self.source.clone(),
            sample_rate,
            frame_samples,
            shutdown: shutdown.clone(),
            tap: tap.clone(),
        };
        std::thread::Builder::new()
            .name("pulse-capture".to_string())
            .spawn(move || stream.run(frames_tx, ready_tx))
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        await_ready(ready)?;

        info!(
            "PulseAudio capture open at {} Hz, {} samples per frame",
            sample_rate, frame_samples
        );
        Ok(Box::new(PulseCapture {
            frames,
            shutdown,
            tap,
        }))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputDevice>, DeviceError> {
        let (ready_tx, ready) = std_mpsc::sync_channel(1);
        let shared = Arc::new(OutputShared {
            sample_rate,
            frames_written: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
            voices: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            tap: Arc::new(SpectrumTap::new()),
        });

        let mixer = shared.clone();
        let app_name = self.app_name.clone();
        let device = self.sink.clone();
        std::thread::Builder::new()
            .name("pulse-playback".to_string())
            .spawn(move || run_mixer(mixer, app_name, device, ready_tx))
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        await_ready(ready)?;

        info!("PulseAudio playback open at {} Hz", sample_rate);
        Ok(Arc::new(PulseOutput { shared }))
    }
}

struct CaptureStream {
    app_name: String,
    device: Option<String>,
    sample_rate: u32,
    frame_samples: usize,
    shutdown: Arc<AtomicBool>,
    tap: Arc<SpectrumTap>,
}

impl CaptureStream {
    fn run(
        self,
        frames: mpsc::Sender<AudioFrame>,
        ready: std_mpsc::SyncSender<Result<(), DeviceError>>,
    ) {
        let frame_bytes = self.frame_samples * 2;
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: frame_bytes as u32,
        };
        let simple = match Simple::new(
            None,
            &self.app_name,
            Direction::Record,
            self.device.as_deref(),
            "microphone",
            &mono_spec(self.sample_rate),
            None,
            Some(&attr),
        ) {
            Ok(simple) => simple,
            Err(e) => {
                let _ = ready.send(Err(DeviceError::Unavailable(ToString::to_string(&e))));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let mut buffer = vec![0u8; frame_bytes];
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = simple.read(&mut buffer) {
                error!("PulseAudio capture read failed: {}", e);
                break;
            }
            let samples = match decode_pcm16(&buffer) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("Dropping capture frame: {}", e);
                    continue;
                }
            };
            self.tap.push(&samples);
            if frames
                .blocking_send(AudioFrame::new(samples, self.sample_rate))
                .is_err()
            {
                break;
            }
        }
        debug!("PulseAudio capture thread finished");
    }
}

/// Microphone stream from PulseAudio.
pub struct PulseCapture {
    frames: mpsc::Receiver<AudioFrame>,
    shutdown: Arc<AtomicBool>,
    tap: Arc<SpectrumTap>,
}

#[async_trait]
impl CaptureSource for PulseCapture {
    async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }

    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.tap.clone()
    }
}

impl Drop for PulseCapture {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

struct MixVoice {
    id: u64,
    buffer: PlaybackBuffer,
    start: f64,
    on_ended: EndedCallback,
}

impl MixVoice {
    fn end(&self) -> f64 {
        self.start + self.buffer.duration()
    }
}

struct OutputShared {
    sample_rate: u32,
    frames_written: AtomicU64,
    suspended: AtomicBool,
    closed: AtomicBool,
    failure: Mutex<Option<String>>,
    voices: Mutex<Vec<MixVoice>>,
    next_id: AtomicU64,
    tap: Arc<SpectrumTap>,
}

impl OutputShared {
    fn clock(&self) -> f64 {
        self.frames_written.load(Ordering::SeqCst) as f64 / self.sample_rate as f64
    }

    fn check_usable(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        if let Some(reason) = self.failure.lock().as_ref() {
            return Err(DeviceError::Unavailable(reason.clone()));
        }
        Ok(())
    }
}

/// Sum every voice audible in `[t0, t0 + frames / rate)` into one block.
///
/// Voices that finish inside the block are removed; their end callbacks are
/// returned so the caller can run them without holding the voice lock.
fn mix_block(
    voices: &mut Vec<MixVoice>,
    t0: f64,
    rate: u32,
    frames: usize,
) -> (Vec<f32>, Vec<EndedCallback>) {
    let rate = rate as f64;
    let mut block = vec![0.0f32; frames];

    for voice in voices.iter() {
        let samples = voice.buffer.samples();
        let channels = voice.buffer.channels() as usize;
        let voice_rate = voice.buffer.sample_rate() as f64;
        for (i, slot) in block.iter_mut().enumerate() {
            let offset = t0 + i as f64 / rate - voice.start;
            if offset < 0.0 {
                continue;
            }
            let frame = (offset * voice_rate) as usize;
            if let Some(s) = samples.get(frame * channels) {
                *slot += *s;
            }
        }
    }

    let block_end = t0 + frames as f64 / rate;
    let mut finished = Vec::new();
    let mut i = 0;
    while i < voices.len() {
        if voices[i].end() <= block_end {
            finished.push(voices.swap_remove(i).on_ended);
        } else {
            i += 1;
        }
    }

    (block, finished)
}

fn run_mixer(
    shared: Arc<OutputShared>,
    app_name: String,
    device: Option<String>,
    ready: std_mpsc::SyncSender<Result<(), DeviceError>>,
) {
    let rate = shared.sample_rate;
    let attr = BufferAttr {
        maxlength: u32::MAX,
        tlength: bytes_for_ms(rate, PLAYBACK_LATENCY_MS),
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    };
    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Playback,
        device.as_deref(),
        "companion voice",
        &mono_spec(rate),
        None,
        Some(&attr),
    ) {
        Ok(simple) => simple,
        Err(e) => {
            let _ = ready.send(Err(DeviceError::Unavailable(ToString::to_string(&e))));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let block_frames = (rate * BLOCK_MS / 1000) as usize;
    while !shared.closed.load(Ordering::SeqCst) {
        if shared.suspended.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(BLOCK_MS as u64));
            continue;
        }

        let t0 = shared.clock();
        let (block, finished) = mix_block(&mut shared.voices.lock(), t0, rate, block_frames);

        // Blocks until the server has room, which paces the loop in real time.
        if let Err(e) = simple.write(&encode_pcm16(&block)) {
            error!("PulseAudio playback write failed: {}", e);
            *shared.failure.lock() = Some(ToString::to_string(&e));
            shared.voices.lock().clear();
            break;
        }
        shared
            .frames_written
            .fetch_add(block_frames as u64, Ordering::SeqCst);
        shared.tap.push(&block);

        for on_ended in finished {
            on_ended();
        }
    }

    if let Err(e) = simple.drain() {
        debug!("PulseAudio drain on close failed: {}", e);
    }
    debug!("PulseAudio mixer thread finished");
}

/// Speaker output through PulseAudio.
pub struct PulseOutput {
    shared: Arc<OutputShared>,
}

impl PulseOutput {
    /// Pause the device clock and mixer, as a host power-saving policy would.
    pub fn suspend(&self) {
        if !self.shared.suspended.swap(true, Ordering::SeqCst) {
            info!("PulseAudio output suspended at {:.3}s", self.shared.clock());
        }
    }
}

#[async_trait]
impl OutputDevice for PulseOutput {
    fn current_time(&self) -> f64 {
        self.shared.clock()
    }

    fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.shared
            .check_usable()
            .map_err(|e| DeviceError::ResumeFailed(e.to_string()))?;
        if self.shared.suspended.swap(false, Ordering::SeqCst) {
            info!("PulseAudio output resumed at {:.3}s", self.shared.clock());
        }
        Ok(())
    }

    async fn materialize(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<PlaybackBuffer, DeviceError> {
        self.shared.check_usable()?;
        PlaybackBuffer::new(samples, sample_rate, channels)
    }

    fn start(
        &self,
        buffer: PlaybackBuffer,
        at: f64,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn Voice>, DeviceError> {
        self.shared.check_usable()?;
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.voices.lock().push(MixVoice {
            id,
            buffer,
            start: at,
            on_ended,
        });
        Ok(Box::new(PulseVoice {
            id,
            output: Arc::downgrade(&self.shared),
        }))
    }

    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.shared.tap.clone()
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.voices.lock().clear();
            info!("PulseAudio output closed");
        }
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

struct PulseVoice {
    id: u64,
    output: Weak<OutputShared>,
}

impl Voice for PulseVoice {
    fn stop(&self) {
        if let Some(output) = self.output.upgrade() {
            output.voices.lock().retain(|v| v.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // Power of two, so block and voice boundaries are exact in f64.
    const RATE: u32 = 1024;

    fn at(frames: u32) -> f64 {
        frames as f64 / RATE as f64
    }

    fn voice(id: u64, start: f64, samples: Vec<f32>, ended: &Arc<AtomicUsize>) -> MixVoice {
        let ended = ended.clone();
        MixVoice {
            id,
            buffer: PlaybackBuffer::new(samples, RATE, 1).unwrap(),
            start,
            on_ended: Box::new(move || {
                ended.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[test]
    fn test_back_to_back_voices_neither_gap_nor_overlap() {
        let ended = Arc::new(AtomicUsize::new(0));
        let mut voices = vec![
            voice(0, 0.0, vec![0.25; 16], &ended),
            voice(1, at(16), vec![0.5; 16], &ended),
        ];

        let (block, finished) = mix_block(&mut voices, 0.0, RATE, 32);
        assert!(block[..16].iter().all(|&s| s == 0.25));
        assert!(block[16..].iter().all(|&s| s == 0.5));
        assert_eq!(finished.len(), 2);
        assert!(voices.is_empty());
    }

    #[test]
    fn test_future_voice_is_silent_and_kept() {
        let ended = Arc::new(AtomicUsize::new(0));
        let mut voices = vec![voice(0, at(24), vec![1.0; 16], &ended)];

        let (block, finished) = mix_block(&mut voices, 0.0, RATE, 16);
        assert!(block.iter().all(|&s| s == 0.0));
        assert!(finished.is_empty());

        let (block, finished) = mix_block(&mut voices, at(16), RATE, 16);
        assert!(block[..8].iter().all(|&s| s == 0.0));
        assert!(block[8..].iter().all(|&s| s == 1.0));
        assert!(finished.is_empty());
        assert_eq!(voices.len(), 1);

        let (_, finished) = mix_block(&mut voices, at(32), RATE, 16);
        assert_eq!(finished.len(), 1);
    }

    #[test]
    fn test_end_callbacks_run_outside_the_mix() {
        let ended = Arc::new(AtomicUsize::new(0));
        let mut voices = vec![voice(0, 0.0, vec![0.1; 8], &ended)];

        let (_, finished) = mix_block(&mut voices, 0.0, RATE, 16);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        for on_ended in finished {
            on_ended();
        }
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_playback_buffer_sizing() {
        assert_eq!(bytes_for_ms(24_000, 60), 2_880);
        assert_eq!(bytes_for_ms(16_000, 256), 8_192);
    }
}
