//! D-mon Live - real-time voice companion audio pipeline
//!
//! Streams microphone PCM to a Gemini Live session and plays streamed
//! speech back gap-free on the output device clock, with interruption,
//! loudness metering and an idle nudge.

#![forbid(unsafe_code)]

pub mod activity;
pub mod capture;
pub mod config;
pub mod device;
pub mod events;
pub mod loudness;
pub mod pcm;
pub mod playback;
#[cfg(feature = "pulse")]
pub mod pulse;
pub mod session;
pub mod sim;
pub mod spectrum;
pub mod transport;
pub mod visual;

pub use config::CompanionConfig;
pub use events::{InboundEvent, Loudness, OutboundMessage, SessionCommand, SessionNotice};
pub use playback::PlaybackScheduler;
pub use session::{Session, SessionError, SessionState};
