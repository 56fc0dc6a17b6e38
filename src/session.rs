//! Session lifecycle
//!
//! One [`Session`] owns every per-connection component: the playback
//! scheduler, the capture pump, the loudness monitor, the visual sampler and
//! the activity clock. It moves `Idle -> Connecting -> Live -> Idle` and tears
//! everything down synchronously on the way back to `Idle`.

use crate::activity::ActivityClock;
use crate::capture::{spawn_capture, CaptureTap};
use crate::config::CompanionConfig;
use crate::device::{AudioBackend, CaptureSource, DeviceError, OutputDevice};
use crate::events::{
    InboundEvent, Loudness, OutboundChannel, SessionCommand, SessionNotice, TranscriptEvent,
};
use crate::loudness::LoudnessMonitor;
use crate::playback::{PlaybackScheduler, SchedulerConfig};
use crate::visual::{spawn_sampler, FrameGrabber};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Sent to the model when the user wipes the conversation.
const MEMORY_RESET_TEXT: &str = "[SYSTEM: User cleared your memory. Forget everything.]";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("session is {0:?}, operation not allowed")]
    InvalidState(SessionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Live,
}

/// Receiving ends of everything a session reports outwards.
pub struct SessionOutputs {
    pub notices: mpsc::UnboundedReceiver<SessionNotice>,
    pub transcript: mpsc::UnboundedReceiver<TranscriptEvent>,
    pub loudness: watch::Receiver<Loudness>,
}

pub struct Session {
    config: CompanionConfig,
    state: SessionState,
    outbound: Arc<dyn OutboundChannel>,
    muted: Arc<AtomicBool>,
    streaming_visual: bool,
    activity: Arc<ActivityClock>,
    scheduler: Option<PlaybackScheduler>,
    pending_capture: Option<Box<dyn CaptureSource>>,
    capture_task: Option<JoinHandle<()>>,
    frames: Option<Arc<dyn FrameGrabber>>,
    visual_task: Option<JoinHandle<()>>,
    monitor: Option<LoudnessMonitor>,
    fault_tx: Option<mpsc::UnboundedSender<DeviceError>>,
    fault_rx: Option<mpsc::UnboundedReceiver<DeviceError>>,
    loudness_tx: watch::Sender<Loudness>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    transcript_tx: mpsc::UnboundedSender<TranscriptEvent>,
}

impl Session {
    pub fn new(config: CompanionConfig, outbound: Arc<dyn OutboundChannel>) -> (Self, SessionOutputs) {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (transcript_tx, transcript) = mpsc::unbounded_channel();
        let (loudness_tx, loudness) = watch::channel(Loudness::default());
        let activity = Arc::new(ActivityClock::new(
            config.first_nudge_threshold_ms,
            config.nudge_threshold_ms,
        ));

        let session = Self {
            config,
            state: SessionState::Idle,
            outbound,
            muted: Arc::new(AtomicBool::new(false)),
            streaming_visual: false,
            activity,
            scheduler: None,
            pending_capture: None,
            capture_task: None,
            frames: None,
            visual_task: None,
            monitor: None,
            fault_tx: None,
            fault_rx: None,
            loudness_tx,
            notice_tx,
            transcript_tx,
        };
        let outputs = SessionOutputs {
            notices,
            transcript,
            loudness,
        };
        (session, outputs)
    }

    /// Attach the frame source used by [`SessionCommand::StartVisual`].
    pub fn with_frames(mut self, frames: Arc<dyn FrameGrabber>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_streaming_visual(&self) -> bool {
        self.streaming_visual
    }

    pub fn activity(&self) -> &Arc<ActivityClock> {
        &self.activity
    }

    pub fn scheduler(&self) -> Option<&PlaybackScheduler> {
        self.scheduler.as_ref()
    }

    /// Acquire both devices and wait in `Connecting` for the transport.
    ///
    /// A device failure sends the session straight back to `Idle` with an
    /// init-error notice; nothing is retried.
    pub fn open(&mut self, backend: &dyn AudioBackend) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state));
        }
        self.state = SessionState::Connecting;
        info!("Session connecting");

        match self.acquire_devices(backend) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to open audio devices: {}", e);
                self.state = SessionState::Idle;
                self.notify(SessionNotice::InitError(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn acquire_devices(&mut self, backend: &dyn AudioBackend) -> Result<(), DeviceError> {
        let output = backend.open_output(self.config.playback_sample_rate)?;
        let capture = match backend
            .open_capture(self.config.capture_sample_rate, self.config.capture_frame_samples)
        {
            Ok(capture) => capture,
            Err(e) => {
                output.close();
                return Err(e);
            }
        };

        self.activity = Arc::new(ActivityClock::new(
            self.config.first_nudge_threshold_ms,
            self.config.nudge_threshold_ms,
        ));
        self.monitor = Some(LoudnessMonitor::new(
            output.analyser(),
            capture.analyser(),
            self.config.loudness_divisor,
        ));
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        self.scheduler = Some(PlaybackScheduler::with_faults(
            output,
            self.activity.clone(),
            self.scheduler_config(),
            fault_tx.clone(),
        ));
        self.pending_capture = Some(capture);
        self.fault_tx = Some(fault_tx);
        self.fault_rx = Some(fault_rx);
        Ok(())
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sample_rate: self.config.playback_sample_rate,
            channels: 1,
            reanchor_lead: self.config.reanchor_lead,
            max_playback_ahead: self.config.max_playback_ahead,
        }
    }

    fn go_live(&mut self) {
        let (Some(source), Some(faults)) = (self.pending_capture.take(), self.fault_tx.clone())
        else {
            warn!("Connection opened without a capture source");
            return;
        };

        self.state = SessionState::Live;
        self.activity.touch();

        let tap = CaptureTap::new(
            self.outbound.clone(),
            self.activity.clone(),
            self.muted.clone(),
            self.config.vad_threshold,
        );
        self.capture_task = Some(spawn_capture(source, tap, faults));

        info!("Session live");
        self.notify(SessionNotice::LinkEstablished);
    }

    /// React to one transport event.
    pub fn handle_event(&mut self, event: InboundEvent) {
        if self.state == SessionState::Idle {
            debug!("Session idle, ignoring {:?}", event_kind(&event));
            return;
        }
        self.activity.touch();

        match event {
            InboundEvent::ConnectionOpened => {
                if self.state == SessionState::Connecting {
                    self.go_live();
                } else {
                    warn!("Duplicate connection-opened event ignored");
                }
            }
            InboundEvent::AudioChunk(data) => match &self.scheduler {
                Some(scheduler) => scheduler.enqueue(data),
                None => debug!("No scheduler, dropping {} byte chunk", data.len()),
            },
            InboundEvent::Interrupted => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.interrupt();
                }
            }
            InboundEvent::OutputTranscriptionDelta(text) => {
                self.forward(TranscriptEvent::Model(text));
            }
            InboundEvent::InputTranscriptionDelta(text) => {
                self.forward(TranscriptEvent::User(text));
            }
            InboundEvent::TurnComplete => self.forward(TranscriptEvent::TurnComplete),
            InboundEvent::ConnectionClosed => {
                info!("Transport closed");
                self.close();
            }
            InboundEvent::Error(e) => {
                error!("Transport error: {}", e);
                self.notify(SessionNotice::LinkError(e));
                self.close();
            }
        }
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetMuted(muted) => self.set_muted(muted),
            SessionCommand::ToggleMute => self.set_muted(!self.is_muted()),
            SessionCommand::StartVisual => self.start_visual(),
            SessionCommand::StopVisual => self.stop_visual(),
            SessionCommand::ClearMemory => self.clear_memory(),
            SessionCommand::Disconnect => {
                info!("Disconnect requested");
                self.close();
            }
        }
    }

    /// React to an audio device dying underneath a running session.
    ///
    /// Fatal device errors end the session with one `DeviceLost` notice.
    pub fn handle_device_fault(&mut self, error: DeviceError) {
        if self.state == SessionState::Idle {
            debug!("Session idle, ignoring device fault: {}", error);
            return;
        }
        error!("Audio device lost: {}", error);
        self.notify(SessionNotice::DeviceLost(error.to_string()));
        self.close();
    }

    fn clear_memory(&self) {
        self.forward(TranscriptEvent::Cleared);
        if self.state != SessionState::Live {
            debug!("Not live, memory reset not sent");
            return;
        }
        info!("Asking the model to forget the conversation");
        self.outbound.send_text(MEMORY_RESET_TEXT.to_string());
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    fn start_visual(&mut self) {
        if self.state != SessionState::Live || self.streaming_visual {
            debug!("Visual start ignored in {:?}", self.state);
            return;
        }
        let Some(frames) = self.frames.clone() else {
            warn!("No frame source attached, visual streaming unavailable");
            return;
        };
        self.visual_task = Some(spawn_sampler(
            frames,
            self.outbound.clone(),
            self.config.visual_interval,
        ));
        self.streaming_visual = true;
    }

    fn stop_visual(&mut self) {
        if let Some(task) = self.visual_task.take() {
            task.abort();
            info!("Visual streaming stopped");
        }
        self.streaming_visual = false;
    }

    /// Run the idle-nudge check. Returns whether a nudge was sent.
    pub fn check_idle(&self, now: Instant) -> bool {
        if self.state != SessionState::Live {
            return false;
        }
        let playing = self
            .scheduler
            .as_ref()
            .is_some_and(|scheduler| scheduler.is_playing());
        let quiet = self.activity.quiet_for(now);
        if !self.activity.check_nudge(now, playing) {
            return false;
        }

        info!("Prolonged silence ({:?}), nudging the model", quiet);
        self.outbound
            .send_text(self.config.language.nudge_text().to_string());
        true
    }

    /// Sample both taps and publish the result.
    pub fn tick_loudness(&self) -> Loudness {
        let loudness = match (&self.monitor, self.state) {
            (Some(monitor), SessionState::Live) => monitor.sample(true, self.is_muted()),
            _ => Loudness::default(),
        };
        self.loudness_tx.send_replace(loudness);
        loudness
    }

    /// Tear everything down and return to `Idle`. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }
        self.pending_capture = None;
        self.fault_tx = None;
        self.fault_rx = None;
        self.stop_visual();
        self.monitor = None;
        self.loudness_tx.send_replace(Loudness::default());

        self.state = SessionState::Idle;
        info!("Session closed");
        self.notify(SessionNotice::LinkOffline);
    }

    /// Drive the session until it returns to `Idle`.
    ///
    /// Interleaves transport events, user commands, device faults, the
    /// idle-nudge check and the loudness tick. The two timers start when the
    /// session goes live. A closed inbound stream counts as a closed
    /// connection.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        let Some(mut faults) = self.fault_rx.take() else {
            warn!("Session not opened, nothing to run");
            return;
        };
        let mut nudge = interval(self.config.nudge_check_interval);
        nudge.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut meter = interval(self.config.loudness_tick);
        meter.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;
        let mut timers_armed = false;

        while self.state != SessionState::Idle {
            let live = self.state == SessionState::Live;
            if live && !timers_armed {
                nudge.reset();
                meter.reset();
                timers_armed = true;
            }

            tokio::select! {
                event = inbound.recv() => {
                    self.handle_event(event.unwrap_or(InboundEvent::ConnectionClosed));
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                Some(fault) = faults.recv() => {
                    self.handle_device_fault(fault);
                }
                _ = nudge.tick(), if live => {
                    self.check_idle(Instant::now());
                }
                _ = meter.tick(), if live => {
                    self.tick_loudness();
                }
            }
        }
        debug!("Session loop finished");
    }

    fn notify(&self, notice: SessionNotice) {
        if self.notice_tx.send(notice).is_err() {
            debug!("Notice receiver dropped");
        }
    }

    fn forward(&self, event: TranscriptEvent) {
        if self.transcript_tx.send(event).is_err() {
            debug!("Transcript receiver dropped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn event_kind(event: &InboundEvent) -> &'static str {
    match event {
        InboundEvent::OutputTranscriptionDelta(_) => "output transcription",
        InboundEvent::InputTranscriptionDelta(_) => "input transcription",
        InboundEvent::TurnComplete => "turn complete",
        InboundEvent::AudioChunk(_) => "audio chunk",
        InboundEvent::Interrupted => "interrupted",
        InboundEvent::ConnectionOpened => "connection opened",
        InboundEvent::ConnectionClosed => "connection closed",
        InboundEvent::Error(_) => "error",
    }
}
