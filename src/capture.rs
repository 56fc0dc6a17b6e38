//! Capture tap: mute gate, voice-activity heuristic and PCM encoding for
//! every microphone frame.

use crate::activity::ActivityClock;
use crate::device::{CaptureSource, DeviceError};
use crate::events::OutboundChannel;
use crate::pcm::{encode_pcm16, AudioFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

/// True when any sample rises above `threshold` in absolute value.
pub fn has_speech(samples: &[f32], threshold: f32) -> bool {
    samples.iter().any(|s| s.abs() > threshold)
}

pub struct CaptureTap {
    outbound: Arc<dyn OutboundChannel>,
    activity: Arc<ActivityClock>,
    muted: Arc<AtomicBool>,
    vad_threshold: f32,
}

impl CaptureTap {
    pub fn new(
        outbound: Arc<dyn OutboundChannel>,
        activity: Arc<ActivityClock>,
        muted: Arc<AtomicBool>,
        vad_threshold: f32,
    ) -> Self {
        Self {
            outbound,
            activity,
            muted,
            vad_threshold,
        }
    }

    /// Handle one captured frame. Returns whether it was sent.
    ///
    /// A muted frame is dropped before any work is done on it.
    pub fn process(&self, frame: &AudioFrame) -> bool {
        if self.muted.load(Ordering::SeqCst) {
            trace!("Muted, dropping {} captured samples", frame.len());
            return false;
        }

        if has_speech(frame.samples(), self.vad_threshold) {
            self.activity.touch();
        }

        let mime = format!("audio/pcm;rate={}", frame.sample_rate());
        self.outbound.send_audio(encode_pcm16(frame.samples()), &mime);
        true
    }
}

/// Pump frames from `source` through `tap` until the stream ends or the
/// returned task is aborted.
///
/// A stream that ends on its own means the microphone is gone; that is
/// reported on `faults`.
pub fn spawn_capture(
    mut source: Box<dyn CaptureSource>,
    tap: CaptureTap,
    faults: mpsc::UnboundedSender<DeviceError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Capture tap started");
        let mut sent = 0u64;
        while let Some(frame) = source.next_frame().await {
            if tap.process(&frame) {
                sent += 1;
            }
        }
        warn!("Capture stream ended after {} frames sent", sent);
        let _ = faults.send(DeviceError::Unavailable(
            "capture stream ended".to_string(),
        ));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FrequencyAnalyser;
    use crate::events::OutboundMessage;
    use crate::pcm::{decode_pcm16, CAPTURE_MIME, CAPTURE_SAMPLE_RATE};
    use crate::spectrum::SpectrumTap;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    fn tap(
        muted: bool,
    ) -> (
        CaptureTap,
        mpsc::UnboundedReceiver<OutboundMessage>,
        Arc<AtomicBool>,
        Arc<ActivityClock>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let muted = Arc::new(AtomicBool::new(muted));
        let activity = Arc::new(ActivityClock::new((30_000, 30_000), (30_000, 30_000)));
        let tap = CaptureTap::new(Arc::new(tx), activity.clone(), muted.clone(), 0.06);
        (tap, rx, muted, activity)
    }

    fn frame(level: f32) -> AudioFrame {
        AudioFrame::new(vec![level; 4096], CAPTURE_SAMPLE_RATE)
    }

    #[test]
    fn test_speech_threshold_is_strict() {
        assert!(!has_speech(&[0.06, -0.06, 0.01], 0.06));
        assert!(has_speech(&[0.0, -0.061], 0.06));
    }

    #[test]
    fn test_frame_is_encoded_and_tagged() {
        let (tap, mut rx, _, _) = tap(false);
        assert!(tap.process(&frame(0.5)));

        match rx.try_recv().unwrap() {
            OutboundMessage::Audio { data, mime_type } => {
                assert_eq!(mime_type, CAPTURE_MIME);
                assert_eq!(data.len(), 4096 * 2);
                let decoded = decode_pcm16(&data).unwrap();
                assert!((decoded[0] - 0.5).abs() < 1e-3);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_mute_leaks_nothing_and_unmute_resumes() {
        let (tap, mut rx, muted, _) = tap(true);

        for _ in 0..3 {
            assert!(!tap.process(&frame(0.9)));
        }
        assert!(rx.try_recv().is_err());

        muted.store(false, Ordering::SeqCst);
        assert!(tap.process(&frame(0.0)));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_marks_activity_but_noise_does_not() {
        let (tap, _rx, _, activity) = tap(false);
        let start = activity.last_activity();

        tokio::time::advance(Duration::from_secs(3)).await;
        tap.process(&frame(0.02));
        assert_eq!(activity.last_activity(), start);

        tap.process(&frame(0.3));
        assert_eq!(activity.last_activity(), start + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_speech_does_not_mark_activity() {
        let (tap, _rx, _, activity) = tap(true);
        let start = activity.last_activity();
        tokio::time::advance(Duration::from_secs(1)).await;
        tap.process(&frame(0.9));
        assert_eq!(activity.last_activity(), start);
    }

    struct ScriptedSource {
        frames: VecDeque<AudioFrame>,
        tap: Arc<SpectrumTap>,
    }

    #[async_trait]
    impl CaptureSource for ScriptedSource {
        async fn next_frame(&mut self) -> Option<AudioFrame> {
            self.frames.pop_front()
        }

        fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
            self.tap.clone()
        }
    }

    #[tokio::test]
    async fn test_spawned_pump_keeps_capture_order() {
        let (tap, mut rx, _, _) = tap(false);
        let source = ScriptedSource {
            frames: (1..=4).map(|i| frame(i as f32 / 10.0)).collect(),
            tap: Arc::new(SpectrumTap::new()),
        };

        let (fault_tx, mut faults) = mpsc::unbounded_channel();
        spawn_capture(Box::new(source), tap, fault_tx).await.unwrap();

        let mut firsts = Vec::new();
        while let Ok(OutboundMessage::Audio { data, .. }) = rx.try_recv() {
            firsts.push(decode_pcm16(&data).unwrap()[0]);
        }
        assert_eq!(firsts.len(), 4);
        assert!(firsts.windows(2).all(|w| w[0] < w[1]));
        assert!(matches!(faults.try_recv(), Ok(DeviceError::Unavailable(_))));
    }
}
