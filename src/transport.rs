//! Gemini Live websocket transport
//!
//! Opens the socket, performs the setup handshake and then splits into a
//! reader task producing [`InboundEvent`]s and a writer task serialising
//! [`OutboundMessage`]s as `realtimeInput` frames.

use crate::config::CompanionConfig;
use crate::events::{InboundEvent, OutboundMessage};
use crate::pcm::DecodeError;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const SETUP_MAX_MESSAGES: usize = 10;
const INBOUND_CAPACITY: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Timeout")]
    Timeout,

    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice {
    voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct Empty {}

/// Session setup message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    data: String,
    mime_type: String,
}

/// A chunk of realtime input (audio/video/text)
#[derive(Debug, Default, Serialize)]
struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

/// Server -> client messages
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        #[allow(dead_code)]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}

fn setup_message(config: &CompanionConfig) -> SetupMessage {
    SetupMessage {
        setup: Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: config.system_instruction(),
                }],
            },
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        },
    }
}

/// Wire form of one outbound message.
fn encode_outbound(msg: OutboundMessage) -> Result<String, TransportError> {
    let realtime_input = match msg {
        OutboundMessage::Audio { data, mime_type } => RealtimeInput {
            audio: Some(Blob {
                data: general_purpose::STANDARD.encode(&data),
                mime_type,
            }),
            ..Default::default()
        },
        OutboundMessage::Image { data, mime_type } => RealtimeInput {
            video: Some(Blob { data, mime_type }),
            ..Default::default()
        },
        OutboundMessage::Text(text) => RealtimeInput {
            text: Some(text),
            ..Default::default()
        },
    };
    Ok(serde_json::to_string(&RealtimeInputMessage { realtime_input })?)
}

/// Map one server frame onto inbound events, in the order the session
/// should see them.
fn decode_server_message(text: &str) -> Result<Vec<InboundEvent>, TransportError> {
    let events = match serde_json::from_str::<ServerMessage>(text)? {
        ServerMessage::SetupComplete { .. } => {
            debug!("Late setupComplete ignored");
            Vec::new()
        }
        ServerMessage::ServerContent { server_content } => handle_server_content(&server_content),
        ServerMessage::GoAway { go_away } => {
            let left = go_away
                .get("timeLeft")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown");
            warn!("Server going away, time left {}", left);
            vec![InboundEvent::Error(format!("server going away ({})", left))]
        }
    };
    Ok(events)
}

fn handle_server_content(content: &serde_json::Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    if let Some(text) = content
        .get("outputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        events.push(InboundEvent::OutputTranscriptionDelta(text.to_string()));
    }

    if let Some(text) = content
        .get("inputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        events.push(InboundEvent::InputTranscriptionDelta(text.to_string()));
    }

    if content.get("turnComplete").and_then(|t| t.as_bool()) == Some(true) {
        events.push(InboundEvent::TurnComplete);
    }

    if let Some(parts) = content
        .get("modelTurn")
        .and_then(|m| m.get("parts"))
        .and_then(|p| p.as_array())
    {
        for data in parts
            .iter()
            .filter_map(|part| part.get("inlineData"))
            .filter_map(|inline| inline.get("data"))
            .filter_map(|d| d.as_str())
        {
            match general_purpose::STANDARD.decode(data) {
                Ok(bytes) => events.push(InboundEvent::AudioChunk(bytes)),
                Err(e) => warn!("{}", DecodeError::InvalidBase64(e.to_string())),
            }
        }
    }

    if content.get("interrupted").and_then(|i| i.as_bool()) == Some(true) {
        events.push(InboundEvent::Interrupted);
    }

    events
}

fn frame_text(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

/// Gemini Live connection factory.
pub struct GeminiTransport;

impl GeminiTransport {
    /// Connect, complete the setup handshake and start the reader and writer
    /// tasks.
    ///
    /// The first inbound event is always [`InboundEvent::ConnectionOpened`].
    /// Dropping every clone of the returned sender closes the socket.
    pub async fn connect(
        config: &CompanionConfig,
    ) -> Result<(mpsc::UnboundedSender<OutboundMessage>, mpsc::Receiver<InboundEvent>), TransportError>
    {
        if config.api_key.is_none() {
            return Err(TransportError::MissingApiKey);
        }

        info!("Connecting to Gemini Live at {}", config.url);
        let (ws, _resp) = connect_async(config.endpoint()).await?;
        let (mut write, mut read) = ws.split();
        info!("Connected, sending setup for {}", config.model);

        let setup = serde_json::to_string(&setup_message(config))?;
        debug!("Sending setup: {}", setup);
        write.send(Message::text(setup)).await?;

        tokio::time::timeout(SETUP_TIMEOUT, await_setup_complete(&mut read))
            .await
            .map_err(|_| TransportError::Timeout)??;
        info!("Gemini session setup complete");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        if inbound_tx.send(InboundEvent::ConnectionOpened).await.is_err() {
            return Err(TransportError::ConnectionClosed);
        }
        tokio::spawn(run_reader(read, inbound_tx.clone()));
        tokio::spawn(run_writer(write, outbound_rx, inbound_tx));

        Ok((outbound_tx, inbound_rx))
    }
}

async fn await_setup_complete(read: &mut WsRead) -> Result<(), TransportError> {
    let mut seen = 0;
    while let Some(frame) = read.next().await {
        let frame = frame?;
        if let Message::Close(close) = &frame {
            info!("WebSocket closed during setup: {:?}", close);
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(text) = frame_text(&frame) {
            if let Ok(ServerMessage::SetupComplete { .. }) = serde_json::from_str(text) {
                return Ok(());
            }
            debug!("Ignoring pre-setup message: {}", text);
            seen += 1;
            if seen >= SETUP_MAX_MESSAGES {
                error!("Failed to complete Gemini session setup");
                return Err(TransportError::SetupNotComplete);
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

async fn run_reader(mut read: WsRead, inbound: mpsc::Sender<InboundEvent>) {
    loop {
        let event = match read.next().await {
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                let _ = inbound.send(InboundEvent::ConnectionClosed).await;
                break;
            }
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                error!("WebSocket read failed: {}", e);
                let _ = inbound.send(InboundEvent::Error(e.to_string())).await;
                break;
            }
            None => {
                let _ = inbound.send(InboundEvent::ConnectionClosed).await;
                break;
            }
        };

        let Some(text) = frame_text(&event) else {
            continue;
        };
        match decode_server_message(text) {
            Ok(events) => {
                for ev in events {
                    if inbound.send(ev).await.is_err() {
                        debug!("Inbound receiver dropped, reader exiting");
                        return;
                    }
                }
            }
            Err(e) => debug!("Unhandled server message ({}): {}", e, text),
        }
    }
    debug!("WebSocket reader finished");
}

async fn run_writer(
    mut write: WsWrite,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::Sender<InboundEvent>,
) {
    info!("WebSocket writer task started");
    while let Some(msg) = outbound.recv().await {
        let json = match encode_outbound(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!("Dropping unserialisable message: {}", e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::text(json)).await {
            error!("Failed to send to websocket: {}", e);
            let _ = inbound.send(InboundEvent::Error(e.to_string())).await;
            return;
        }
    }

    info!("Outbound channel closed, closing websocket");
    if let Err(e) = write.close().await {
        debug!("WebSocket close failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Persona;

    #[test]
    fn test_setup_serialization() {
        let config = CompanionConfig {
            ai_name: "D-mon".to_string(),
            user_name: "Ana".to_string(),
            persona: Persona::Zen,
            ..Default::default()
        };
        let json = serde_json::to_value(setup_message(&config)).unwrap();
        let setup = &json["setup"];

        assert_eq!(setup["model"], config.model.as_str());
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        let instruction = setup["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(instruction.starts_with("Identity: D-mon. User: Ana."));
        assert!(setup["inputAudioTranscription"].is_object());
        assert!(setup["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_outbound_serialization() {
        let audio = encode_outbound(OutboundMessage::Audio {
            data: vec![1, 2, 3],
            mime_type: "audio/pcm;rate=16000".to_string(),
        })
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&audio).unwrap();
        assert_eq!(parsed["realtimeInput"]["audio"]["data"], "AQID");
        assert_eq!(parsed["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert!(parsed["realtimeInput"].get("video").is_none());

        let image = encode_outbound(OutboundMessage::Image {
            data: "anBn".to_string(),
            mime_type: "image/jpeg".to_string(),
        })
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&image).unwrap();
        assert_eq!(parsed["realtimeInput"]["video"]["data"], "anBn");
        assert_eq!(parsed["realtimeInput"]["video"]["mimeType"], "image/jpeg");

        let text = encode_outbound(OutboundMessage::Text("hi".to_string())).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["realtimeInput"]["text"], "hi");
    }

    #[test]
    fn test_server_content_mapping() {
        let data = general_purpose::STANDARD.encode([1u8, 0, 2, 0]);
        let msg = serde_json::json!({
            "serverContent": {
                "outputTranscription": {"text": "Hola"},
                "inputTranscription": {"text": "hey"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}},
                    {"inlineData": {"data": "!!not base64!!"}}
                ]},
                "turnComplete": true
            },
            "usageMetadata": {"totalTokenCount": 12}
        })
        .to_string();

        assert_eq!(
            decode_server_message(&msg).unwrap(),
            vec![
                InboundEvent::OutputTranscriptionDelta("Hola".to_string()),
                InboundEvent::InputTranscriptionDelta("hey".to_string()),
                InboundEvent::TurnComplete,
                InboundEvent::AudioChunk(vec![1, 0, 2, 0]),
            ]
        );
    }

    #[test]
    fn test_interruption_and_go_away() {
        let msg = serde_json::json!({"serverContent": {"interrupted": true}}).to_string();
        assert_eq!(
            decode_server_message(&msg).unwrap(),
            vec![InboundEvent::Interrupted]
        );

        let msg = serde_json::json!({"goAway": {"timeLeft": "5s"}}).to_string();
        assert!(matches!(
            decode_server_message(&msg).unwrap().as_slice(),
            [InboundEvent::Error(_)]
        ));

        let msg = serde_json::json!({"setupComplete": {}}).to_string();
        assert!(decode_server_message(&msg).unwrap().is_empty());

        assert!(decode_server_message(r#"{"usageMetadata": {}}"#).is_err());
    }

    #[test]
    fn test_binary_frames_carry_json() {
        let msg = Message::Binary(br#"{"setupComplete":{}}"#.to_vec().into());
        assert_eq!(frame_text(&msg), Some(r#"{"setupComplete":{}}"#));
        assert_eq!(frame_text(&Message::Ping(Vec::new().into())), None);
    }

    #[tokio::test]
    async fn test_connect_requires_api_key() {
        let config = CompanionConfig::default();
        assert!(matches!(
            GeminiTransport::connect(&config).await,
            Err(TransportError::MissingApiKey)
        ));
    }
}
