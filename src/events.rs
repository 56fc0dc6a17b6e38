//! Messages crossing the session boundary

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// Events delivered by the transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Incremental transcription of the model's speech
    OutputTranscriptionDelta(String),
    /// Incremental transcription of the user's speech
    InputTranscriptionDelta(String),
    /// The model finished its turn
    TurnComplete,
    /// One chunk of 24 kHz PCM16 speech
    AudioChunk(Vec<u8>),
    /// The user spoke over the model; drop everything queued for playback
    Interrupted,
    /// Handshake succeeded
    ConnectionOpened,
    /// Transport closed (normally or not)
    ConnectionClosed,
    /// Transport-level failure
    Error(String),
}

/// Messages handed to the transport, already in wire-ready form.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Raw PCM16 bytes with their mime descriptor
    Audio { data: Vec<u8>, mime_type: String },
    /// Base64 encoded image with its mime descriptor
    Image { data: String, mime_type: String },
    /// Realtime text instruction
    Text(String),
}

/// Ordered, fire-and-forget, best-effort send path to the remote endpoint.
pub trait OutboundChannel: Send + Sync {
    fn send_audio(&self, data: Vec<u8>, mime_type: &str);
    fn send_image(&self, data: String, mime_type: &str);
    fn send_text(&self, text: String);
}

impl OutboundChannel for UnboundedSender<OutboundMessage> {
    fn send_audio(&self, data: Vec<u8>, mime_type: &str) {
        forward(
            self,
            OutboundMessage::Audio {
                data,
                mime_type: mime_type.to_string(),
            },
        );
    }

    fn send_image(&self, data: String, mime_type: &str) {
        forward(
            self,
            OutboundMessage::Image {
                data,
                mime_type: mime_type.to_string(),
            },
        );
    }

    fn send_text(&self, text: String) {
        forward(self, OutboundMessage::Text(text));
    }
}

fn forward(tx: &UnboundedSender<OutboundMessage>, msg: OutboundMessage) {
    if tx.send(msg).is_err() {
        warn!("Outbound channel closed, message dropped");
    }
}

/// User actions accepted by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    SetMuted(bool),
    ToggleMute,
    StartVisual,
    StopVisual,
    /// Wipe the companion's conversational memory
    ClearMemory,
    Disconnect,
}

/// Transcription traffic forwarded untouched to the transcript layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Model(String),
    User(String),
    TurnComplete,
    /// The user wiped the conversation; drop the local history
    Cleared,
}

/// One-line status messages for the user-facing log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    LinkEstablished,
    LinkOffline,
    LinkError(String),
    InitError(String),
    /// An audio device failed after the link was up
    DeviceLost(String),
}

impl std::fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionNotice::LinkEstablished => write!(f, "Neural Link Established."),
            SessionNotice::LinkOffline => write!(f, "Neural Link Offline."),
            SessionNotice::LinkError(e) => write!(f, "Link Error: {}", e),
            SessionNotice::InitError(e) => write!(f, "Init Error: {}", e),
            SessionNotice::DeviceLost(e) => write!(f, "Audio Device Lost: {}", e),
        }
    }
}

/// Normalised intensity of both directions, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Loudness {
    pub ai: f32,
    pub user: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_channel_preserves_send_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send_audio(vec![1, 2], "audio/pcm;rate=16000");
        tx.send_image("aGk=".to_string(), "image/jpeg");
        tx.send_text("hello".to_string());

        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage::Audio {
                data: vec![1, 2],
                mime_type: "audio/pcm;rate=16000".to_string()
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), OutboundMessage::Image { .. }));
        assert_eq!(rx.try_recv().unwrap(), OutboundMessage::Text("hello".to_string()));
    }

    #[test]
    fn test_send_on_closed_channel_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel::<OutboundMessage>();
        drop(rx);
        tx.send_text("lost".to_string());
    }
}
