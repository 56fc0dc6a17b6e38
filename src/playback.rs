//! Playback scheduler
//!
//! Inbound speech chunks are decoded and placed back to back on the output
//! device's clock. A single worker drains a FIFO so chunks are scheduled in
//! arrival order no matter how long each one takes to decode or materialize.
//!
//! Interruption stops every live voice, clears the cursor and swaps in a
//! fresh queue. A worker that was mid-chunk when that happened finishes
//! against the reset timeline, never the stale one.

use crate::activity::ActivityClock;
use crate::device::{DeviceError, OutputDevice, Voice};
use crate::pcm::{decode_pcm16, DecodeError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Failure of a single chunk. Logged by the worker, never fatal to the queue.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("output device error: {0}")]
    Device(#[from] DeviceError),

    #[error("timeline already {ahead:.3}s ahead of the device clock")]
    Backlogged { ahead: f64 },

    #[error("scheduler is shut down")]
    Closed,
}

/// Scheduler tunables
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Lead added when the cursor has fallen behind the device clock (seconds)
    pub reanchor_lead: f64,
    /// Optional cap on how far the cursor may run ahead (seconds)
    pub max_playback_ahead: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::pcm::PLAYBACK_SAMPLE_RATE,
            channels: 1,
            reanchor_lead: 0.05,
            max_playback_ahead: None,
        }
    }
}

/// Timeline cursor plus the set of voices still playing on it.
struct Timeline {
    cursor: Option<f64>,
    live: HashMap<u64, Box<dyn Voice>>,
    next_id: u64,
    closed: bool,
}

impl Timeline {
    fn new() -> Self {
        Self {
            cursor: None,
            live: HashMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Reserve `duration` seconds and return the start time.
    ///
    /// An unset cursor, or one the device clock has already passed, is
    /// re-anchored to `now + lead`.
    fn reserve(&mut self, now: f64, duration: f64, lead: f64) -> f64 {
        let start = match self.cursor {
            Some(cursor) if cursor >= now => cursor,
            _ => now + lead,
        };
        self.cursor = Some(start + duration);
        start
    }

    fn clear(&mut self) -> usize {
        let stopped = self.live.len();
        for (_, voice) in self.live.drain() {
            voice.stop();
        }
        self.cursor = None;
        stopped
    }
}

struct Shared {
    device: Arc<dyn OutputDevice>,
    activity: Arc<ActivityClock>,
    config: SchedulerConfig,
    timeline: Mutex<Timeline>,
    faults: Option<mpsc::UnboundedSender<DeviceError>>,
}

/// Serial decode-and-schedule pipeline onto one output device.
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    queue: Option<mpsc::UnboundedSender<Vec<u8>>>,
    generation: u64,
}

impl PlaybackScheduler {
    /// Must be called inside a tokio runtime; the queue worker is spawned here.
    pub fn new(
        device: Arc<dyn OutputDevice>,
        activity: Arc<ActivityClock>,
        config: SchedulerConfig,
    ) -> Self {
        Self::build(device, activity, config, None)
    }

    /// Like [`PlaybackScheduler::new`], additionally reporting every fatal
    /// output-device error on `faults`.
    pub fn with_faults(
        device: Arc<dyn OutputDevice>,
        activity: Arc<ActivityClock>,
        config: SchedulerConfig,
        faults: mpsc::UnboundedSender<DeviceError>,
    ) -> Self {
        Self::build(device, activity, config, Some(faults))
    }

    fn build(
        device: Arc<dyn OutputDevice>,
        activity: Arc<ActivityClock>,
        config: SchedulerConfig,
        faults: Option<mpsc::UnboundedSender<DeviceError>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            device,
            activity,
            config,
            timeline: Mutex::new(Timeline::new()),
            faults,
        });
        let queue = Some(spawn_worker(shared.clone(), 0));

        Self {
            shared,
            queue,
            generation: 0,
        }
    }

    /// Queue one inbound chunk behind everything already queued.
    pub fn enqueue(&self, chunk: Vec<u8>) {
        match &self.queue {
            Some(queue) => {
                if queue.send(chunk).is_err() {
                    warn!("Playback queue {} is gone, chunk dropped", self.generation);
                }
            }
            None => debug!("Scheduler shut down, ignoring {} byte chunk", chunk.len()),
        }
    }

    /// Stop all playback and restart with an empty queue. Idempotent.
    pub fn interrupt(&mut self) {
        let stopped = self.shared.timeline.lock().clear();
        if self.queue.is_none() {
            return;
        }

        self.generation += 1;
        self.queue = Some(spawn_worker(self.shared.clone(), self.generation));
        info!(
            "Playback interrupted: stopped {} voices, queue generation {}",
            stopped, self.generation
        );
    }

    /// Interrupt, refuse further chunks and release the output device.
    pub fn shutdown(&mut self) {
        {
            let mut timeline = self.shared.timeline.lock();
            if timeline.closed {
                return;
            }
            let stopped = timeline.clear();
            timeline.closed = true;
            debug!("Scheduler shutdown stopped {} voices", stopped);
        }
        self.queue = None;
        self.shared.device.close();
        info!("Playback scheduler shut down");
    }

    /// Whether scheduled audio extends past the current device time.
    pub fn is_playing(&self) -> bool {
        let now = self.shared.device.current_time();
        self.shared
            .timeline
            .lock()
            .cursor
            .is_some_and(|cursor| cursor > now)
    }

    /// Number of voices started and not yet finished or stopped.
    pub fn live_count(&self) -> usize {
        self.shared.timeline.lock().live.len()
    }

    /// Device time at which the next chunk would start, if set.
    pub fn cursor(&self) -> Option<f64> {
        self.shared.timeline.lock().cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: Arc<Shared>, generation: u64) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let len = chunk.len();
            match play_chunk(&shared, chunk).await {
                Ok(start) => debug!("Queue {}: {} byte chunk starts at {:.3}s", generation, len, start),
                Err(ScheduleError::Closed) => {
                    debug!("Queue {}: scheduler closed, dropping {} byte chunk", generation, len)
                }
                Err(ScheduleError::Device(e)) if e.is_fatal() => {
                    error!("Queue {}: output device failed: {}", generation, e);
                    if let Some(faults) = &shared.faults {
                        let _ = faults.send(e);
                    }
                }
                Err(e) => warn!("Queue {}: dropping {} byte chunk: {}", generation, len, e),
            }
        }
        debug!("Playback queue {} drained", generation);
    });

    tx
}

async fn play_chunk(shared: &Arc<Shared>, chunk: Vec<u8>) -> Result<f64, ScheduleError> {
    let samples = decode_pcm16(&chunk)?;

    if shared.timeline.lock().closed {
        return Err(ScheduleError::Closed);
    }

    if shared.device.is_suspended() {
        info!("Output device suspended, resuming before playback");
        shared.device.resume().await?;
    }

    let config = shared.config;
    let buffer = shared
        .device
        .materialize(samples, config.sample_rate, config.channels)
        .await?;
    let duration = buffer.duration();

    let mut timeline = shared.timeline.lock();
    if timeline.closed {
        return Err(ScheduleError::Closed);
    }

    let now = shared.device.current_time();
    if let (Some(limit), Some(cursor)) = (config.max_playback_ahead, timeline.cursor) {
        let ahead = cursor - now;
        if ahead > limit {
            return Err(ScheduleError::Backlogged { ahead });
        }
    }

    let previous = timeline.cursor;
    let start = timeline.reserve(now, duration, config.reanchor_lead);
    let id = timeline.next_id;
    timeline.next_id += 1;

    match shared.device.start(buffer, start, ended_hook(Arc::downgrade(shared), id)) {
        Ok(voice) => {
            timeline.live.insert(id, voice);
        }
        Err(e) => {
            timeline.cursor = previous;
            return Err(e.into());
        }
    }
    drop(timeline);

    shared.activity.touch();
    Ok(start)
}

fn ended_hook(shared: Weak<Shared>, id: u64) -> crate::device::EndedCallback {
    Box::new(move || {
        if let Some(shared) = shared.upgrade() {
            shared.timeline.lock().live.remove(&id);
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::{EndedCallback, FrequencyAnalyser, PlaybackBuffer};
    use crate::pcm::encode_pcm16;
    use crate::spectrum::SpectrumTap;
    use async_trait::async_trait;
    use rand::Rng;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Per-call behaviour of [`ManualOutput::materialize`]
    pub(crate) enum Step {
        Delay(Duration),
        Gate(oneshot::Receiver<()>),
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Started {
        pub at: f64,
        pub duration: f64,
        pub frames: usize,
    }

    pub(crate) struct ManualVoice {
        stopped: Arc<AtomicBool>,
    }

    impl Voice for ManualVoice {
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Output device whose clock only moves when the test says so.
    pub(crate) struct ManualOutput {
        now: Mutex<f64>,
        suspended: AtomicBool,
        closed: AtomicBool,
        resumes: AtomicUsize,
        steps: Mutex<VecDeque<Step>>,
        pub started: Mutex<Vec<Started>>,
        voices: Mutex<Vec<Arc<AtomicBool>>>,
        ends: Mutex<Vec<EndedCallback>>,
        tap: Arc<SpectrumTap>,
    }

    impl ManualOutput {
        pub(crate) fn new(now: f64) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(now),
                suspended: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                resumes: AtomicUsize::new(0),
                steps: Mutex::new(VecDeque::new()),
                started: Mutex::new(Vec::new()),
                voices: Mutex::new(Vec::new()),
                ends: Mutex::new(Vec::new()),
                tap: Arc::new(SpectrumTap::new()),
            })
        }

        pub(crate) fn set_time(&self, now: f64) {
            *self.now.lock() = now;
        }

        pub(crate) fn push_step(&self, step: Step) {
            self.steps.lock().push_back(step);
        }

        pub(crate) fn starts(&self) -> Vec<f64> {
            self.started.lock().iter().map(|s| s.at).collect()
        }

        pub(crate) fn stopped_count(&self) -> usize {
            self.voices
                .lock()
                .iter()
                .filter(|v| v.load(Ordering::SeqCst))
                .count()
        }

        pub(crate) fn finish_all(&self) {
            let ends: Vec<EndedCallback> = self.ends.lock().drain(..).collect();
            for end in ends {
                end();
            }
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OutputDevice for ManualOutput {
        fn current_time(&self) -> f64 {
            *self.now.lock()
        }

        fn is_suspended(&self) -> bool {
            self.suspended.load(Ordering::SeqCst)
        }

        async fn resume(&self) -> Result<(), DeviceError> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            self.suspended.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn materialize(
            &self,
            samples: Vec<f32>,
            sample_rate: u32,
            channels: u16,
        ) -> Result<PlaybackBuffer, DeviceError> {
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Delay(d)) => tokio::time::sleep(d).await,
                Some(Step::Gate(rx)) => {
                    let _ = rx.await;
                }
                None => {}
            }
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
            self.started.lock().push(Started {
                at,
                duration: buffer.duration(),
                frames: buffer.frames(),
            });
            let stopped = Arc::new(AtomicBool::new(false));
            self.voices.lock().push(stopped.clone());
            self.ends.lock().push(on_ended);
            Ok(Box::new(ManualVoice { stopped }))
        }

        fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
            self.tap.clone()
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn chunk(samples: usize) -> Vec<u8> {
        encode_pcm16(&vec![0.25; samples])
    }

    /// Let the worker drain: paused time auto-advances through any delays.
    pub(crate) async fn settle() {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    fn scheduler(device: &Arc<ManualOutput>) -> PlaybackScheduler {
        let activity = Arc::new(ActivityClock::new((30_000, 30_000), (30_000, 30_000)));
        PlaybackScheduler::new(device.clone(), activity, SchedulerConfig::default())
    }

    const SR: f64 = 24_000.0;

    #[tokio::test(start_paused = true)]
    async fn test_slow_first_chunk_still_plays_first() {
        let device = ManualOutput::new(10.0);
        let scheduler = scheduler(&device);

        device.push_step(Step::Delay(Duration::from_millis(80)));
        device.push_step(Step::Delay(Duration::from_millis(1)));
        scheduler.enqueue(chunk(100));
        scheduler.enqueue(chunk(200));
        settle().await;

        let started = device.started.lock().clone();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].frames, 100);
        assert_eq!(started[1].frames, 200);
        assert!((started[0].at - 10.05).abs() < 1e-9);
        assert!((started[1].at - (started[0].at + 100.0 / SR)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cursor_is_reanchored_ahead_of_now() {
        let device = ManualOutput::new(9.0);
        let scheduler = scheduler(&device);

        scheduler.enqueue(chunk(12_000));
        settle().await;
        assert!((scheduler.cursor().unwrap() - 9.55).abs() < 1e-9);

        device.set_time(10.0);
        assert!(!scheduler.is_playing());
        scheduler.enqueue(chunk(2_400));
        settle().await;

        let starts = device.starts();
        assert!((starts[1] - 10.05).abs() < 1e-9);
        assert!((scheduler.cursor().unwrap() - 10.15).abs() < 1e-9);
        assert!(scheduler.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_decode_latency_keeps_arrival_order_without_gaps() {
        let device = ManualOutput::new(1.0);
        let scheduler = scheduler(&device);
        let mut rng = rand::rng();

        let sizes: Vec<usize> = (0..20).map(|_| rng.random_range(1..4000)).collect();
        for &size in &sizes {
            device.push_step(Step::Delay(Duration::from_millis(rng.random_range(0..200))));
            scheduler.enqueue(chunk(size));
        }
        settle().await;
        settle().await;

        let started = device.started.lock().clone();
        assert_eq!(started.len(), sizes.len());
        for (s, &size) in started.iter().zip(&sizes) {
            assert_eq!(s.frames, size);
        }
        for pair in started.windows(2) {
            assert!(pair[1].at >= pair[0].at);
            assert!((pair[1].at - (pair[0].at + pair[0].duration)).abs() < 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_resets_state_for_in_flight_chunk() {
        let device = ManualOutput::new(2.0);
        let mut scheduler = scheduler(&device);

        scheduler.enqueue(chunk(24_000));
        settle().await;
        assert_eq!(scheduler.live_count(), 1);
        assert!((scheduler.cursor().unwrap() - 3.05).abs() < 1e-9);

        let (release, gate) = oneshot::channel();
        device.push_step(Step::Gate(gate));
        scheduler.enqueue(chunk(2_400));
        settle().await;
        assert_eq!(device.starts().len(), 1);

        scheduler.interrupt();
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.cursor(), None);
        assert_eq!(device.stopped_count(), 1);

        // A chunk arriving after the interruption does not wait behind the
        // gated one.
        device.set_time(2.5);
        scheduler.enqueue(chunk(1_200));
        settle().await;
        let starts = device.starts();
        assert_eq!(starts.len(), 2);
        assert!((starts[1] - 2.55).abs() < 1e-9);

        release.send(()).unwrap();
        settle().await;
        let starts = device.starts();
        assert_eq!(starts.len(), 3);
        // Scheduled after the post-interruption chunk, never at the old 3.05 cursor.
        assert!((starts[2] - (2.55 + 0.05)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_is_idempotent() {
        let device = ManualOutput::new(0.0);
        let mut scheduler = scheduler(&device);

        scheduler.interrupt();
        scheduler.interrupt();
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.generation(), 2);

        scheduler.enqueue(chunk(240));
        settle().await;
        assert_eq!(device.starts(), vec![0.05]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_natural_completion_releases_handles() {
        let device = ManualOutput::new(0.0);
        let scheduler = scheduler(&device);

        scheduler.enqueue(chunk(240));
        scheduler.enqueue(chunk(240));
        settle().await;
        assert_eq!(scheduler.live_count(), 2);

        device.finish_all();
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(device.stopped_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_output_is_resumed_not_dropped() {
        let device = ManualOutput::new(0.0);
        device.suspended.store(true, Ordering::SeqCst);
        let scheduler = scheduler(&device);

        scheduler.enqueue(chunk(240));
        settle().await;

        assert_eq!(device.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(device.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_chunk_does_not_stall_queue() {
        let device = ManualOutput::new(0.0);
        let scheduler = scheduler(&device);

        scheduler.enqueue(vec![1, 2, 3]);
        scheduler.enqueue(chunk(480));
        settle().await;

        let started = device.started.lock().clone();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].frames, 480);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watermark_drops_chunks_when_far_ahead() {
        let device = ManualOutput::new(0.0);
        let activity = Arc::new(ActivityClock::new((30_000, 30_000), (30_000, 30_000)));
        let config = SchedulerConfig {
            max_playback_ahead: Some(1.2),
            ..Default::default()
        };
        let scheduler = PlaybackScheduler::new(device.clone(), activity, config);

        for _ in 0..4 {
            scheduler.enqueue(chunk(12_000));
        }
        settle().await;

        // Three half-second chunks leave the cursor 1.55 s ahead of the clock.
        assert_eq!(device.starts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduling_marks_activity() {
        let device = ManualOutput::new(0.0);
        let activity = Arc::new(ActivityClock::new((30_000, 30_000), (30_000, 30_000)));
        let scheduler =
            PlaybackScheduler::new(device.clone(), activity.clone(), SchedulerConfig::default());
        let before = activity.last_activity();

        tokio::time::advance(Duration::from_secs(2)).await;
        scheduler.enqueue(chunk(240));
        settle().await;

        assert!(activity.last_activity() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_device_and_ignores_new_chunks() {
        let device = ManualOutput::new(0.0);
        let mut scheduler = scheduler(&device);

        scheduler.enqueue(chunk(240));
        settle().await;
        scheduler.shutdown();

        assert!(device.is_closed());
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(device.stopped_count(), 1);

        scheduler.enqueue(chunk(240));
        settle().await;
        assert_eq!(device.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_output_is_reported_but_bad_chunks_are_not() {
        let device = ManualOutput::new(0.0);
        let activity = Arc::new(ActivityClock::new((30_000, 30_000), (30_000, 30_000)));
        let (tx, mut faults) = mpsc::unbounded_channel();
        let scheduler =
            PlaybackScheduler::with_faults(device.clone(), activity, SchedulerConfig::default(), tx);

        scheduler.enqueue(vec![9]);
        settle().await;
        assert!(faults.try_recv().is_err());

        device.close();
        scheduler.enqueue(chunk(240));
        settle().await;
        assert!(matches!(faults.try_recv(), Ok(DeviceError::Closed)));
        assert_eq!(scheduler.cursor(), None);
    }
}
