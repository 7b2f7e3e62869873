//! Speech session adapter.
//!
//! Client for the cloud real-time conversational speech API over WebSockets.
//! Sends the session configuration, streams base64 PCM append events, and
//! parses the server's response-lifecycle events into [`SessionEvent`]s for
//! the turn state machine. 16-bit PCM at 24 kHz on both legs.

use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Sample rate the session speaks on both legs.
pub const SESSION_RATE_HZ: u32 = 24_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Error type for speech session operations
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("timed out waiting for session")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, SpeechError>;

/// Server-side voice activity detection parameters sent in the session
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerVadConfig {
    /// Activation sensitivity, 0.0..1.0.
    pub threshold: f32,
    /// Audio kept from before speech onset.
    pub prefix_padding_ms: u32,
    /// Trailing silence that ends an utterance.
    pub silence_duration_ms: u32,
}

impl Default for ServerVadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Configuration for one speech session.
#[derive(Debug, Clone)]
pub struct SpeechSessionConfig {
    pub url: String,
    pub api_key: String,
    /// Behavioral instruction payload: the conversational persona and goal.
    pub instructions: String,
    pub voice: String,
    pub vad: ServerVadConfig,
    pub transcription_model: String,
}

impl SpeechSessionConfig {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            instructions: String::new(),
            voice: "alloy".to_string(),
            vad: ServerVadConfig::default(),
            transcription_model: "whisper-1".to_string(),
        }
    }
}

/// Parsed server events, reduced to what the bridge cares about.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session accepted our configuration; audio may flow.
    Ready,
    ResponseCreated { response_id: String },
    /// Base64-decoded reply audio bytes (PCM16 little-endian).
    ResponseAudio { bytes: Vec<u8> },
    ResponseAudioDone,
    /// Full text of the reply.
    ResponseText { text: String },
    ResponseCompleted { response_id: String },
    ResponseCancelled,
    /// Finalized transcript of caller speech.
    TranscriptCompleted { text: String },
    TranscriptFailed { rate_limited: bool },
    /// Server-reported error that is not benign.
    Error { message: String, fatal: bool },
}

/// Connection state of the session client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connected,
    Ready,
}

/// Async speech-session client with streaming support.
///
/// The read half runs in a background task feeding `event_rx`; the write
/// half stays with the client so sends are direct.
pub struct SpeechSessionClient {
    config: SpeechSessionConfig,
    writer: Option<SplitSink<WsStream, Message>>,
    state: ConnectionState,
    event_tx: mpsc::Sender<Result<SessionEvent>>,
    event_rx: mpsc::Receiver<Result<SessionEvent>>,
}

impl SpeechSessionClient {
    pub fn new(config: SpeechSessionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);
        Self {
            config,
            writer: None,
            state: ConnectionState::Disconnected,
            event_tx,
            event_rx,
        }
    }

    /// Connect, send the session configuration, and wait for the session to
    /// come up. Fatal on failure; the caller closes the telephony leg.
    pub async fn connect_and_configure(&mut self) -> Result<()> {
        self.connect().await?;
        self.send_configuration().await?;
        self.wait_until_ready().await
    }

    /// Connect and send the configuration without consuming the ready
    /// event, for callers that watch the event stream themselves.
    pub async fn connect_and_send_configuration(&mut self) -> Result<()> {
        self.connect().await?;
        self.send_configuration().await
    }

    async fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Ok(());
        }
        info!(url = self.config.url, "connecting to speech session");

        let mut request = self
            .config
            .url
            .clone()
            .into_client_request()
            .map_err(|e| SpeechError::Handshake(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|e| SpeechError::Handshake(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _resp) = connect_async(request).await?;
        let (writer, reader) = ws.split();
        self.writer = Some(writer);
        self.state = ConnectionState::Connected;
        info!("speech session connected");

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            Self::read_loop(reader, event_tx).await;
        });
        Ok(())
    }

    async fn send_configuration(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            return Err(SpeechError::ConnectionClosed);
        }

        let update = json!({
            "type": "session.update",
            "session": {
                "modalities": ["audio", "text"],
                "instructions": self.config.instructions,
                "voice": self.config.voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": { "model": self.config.transcription_model },
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": self.config.vad.threshold,
                    "prefix_padding_ms": self.config.vad.prefix_padding_ms,
                    "silence_duration_ms": self.config.vad.silence_duration_ms,
                    "create_response": false,
                },
            },
        });
        self.send_text(update.to_string()).await
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        if self.state == ConnectionState::Ready {
            return Ok(());
        }
        // The first Ready from the read loop means configuration took.
        let waited = tokio::time::timeout(Duration::from_secs(10), self.wait_for_ready())
            .await
            .map_err(|_| SpeechError::Timeout)?;
        if waited {
            self.state = ConnectionState::Ready;
            info!("speech session configured");
            Ok(())
        } else {
            error!("speech session never became ready");
            Err(SpeechError::ConnectionClosed)
        }
    }

    async fn wait_for_ready(&mut self) -> bool {
        while let Some(event) = self.event_rx.recv().await {
            match event {
                Ok(SessionEvent::Ready) => return true,
                Ok(other) => debug!(?other, "event before ready"),
                Err(e) => {
                    error!("error before ready: {e}");
                    return false;
                }
            }
        }
        false
    }

    /// Append caller audio (PCM16 little-endian bytes at the session rate).
    pub async fn send_audio(&mut self, pcm_bytes: &[u8]) -> Result<()> {
        let event = json!({
            "type": "input_audio_buffer.append",
            "audio": general_purpose::STANDARD.encode(pcm_bytes),
        });
        self.send_text(event.to_string()).await
    }

    /// Explicit commit. Optional: server VAD commits on its own.
    pub async fn commit_audio(&mut self) -> Result<()> {
        self.send_text(json!({"type": "input_audio_buffer.commit"}).to_string())
            .await
    }

    /// Ask for a reply to everything committed so far.
    pub async fn request_response(&mut self) -> Result<()> {
        let event = json!({
            "type": "response.create",
            "response": { "modalities": ["audio", "text"] },
        });
        self.send_text(event.to_string()).await
    }

    /// Cancel the in-flight reply. Best effort; the benign "nothing to
    /// cancel" answer is filtered in the read loop.
    pub async fn cancel_response(&mut self) -> Result<()> {
        self.send_text(json!({"type": "response.cancel"}).to_string())
            .await
    }

    /// Receive the next session event.
    pub async fn next_event(&mut self) -> Option<Result<SessionEvent>> {
        self.event_rx.recv().await
    }

    /// Move the event receiver out so a task can own it.
    pub fn take_events(&mut self) -> mpsc::Receiver<Result<SessionEvent>> {
        let (tx, rx) = mpsc::channel(100);
        self.event_tx = tx;
        std::mem::replace(&mut self.event_rx, rx)
    }

    pub async fn close(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.send(Message::Close(None)).await;
        }
        self.writer = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        match &mut self.writer {
            Some(writer) => {
                writer.send(Message::text(text)).await?;
                Ok(())
            }
            None => Err(SpeechError::ConnectionClosed),
        }
    }

    async fn read_loop(
        mut reader: SplitStream<WsStream>,
        event_tx: mpsc::Sender<Result<SessionEvent>>,
    ) {
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = Self::handle_text_message(text.as_str(), &event_tx).await {
                        error!("error handling session message: {e}");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("speech session closed: {frame:?}");
                    let _ = event_tx.send(Err(SpeechError::ConnectionClosed)).await;
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/pong and binary frames carry nothing for us.
                }
                Some(Err(e)) => {
                    let _ = event_tx.send(Err(SpeechError::WebSocket(e))).await;
                    break;
                }
                None => {
                    let _ = event_tx.send(Err(SpeechError::ConnectionClosed)).await;
                    break;
                }
            }
        }
    }

    /// Parse one server event. Separated from the socket for testability.
    async fn handle_text_message(
        text: &str,
        event_tx: &mpsc::Sender<Result<SessionEvent>>,
    ) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        let event = match kind {
            "session.created" | "session.updated" => Some(SessionEvent::Ready),

            "response.created" => Some(SessionEvent::ResponseCreated {
                response_id: response_id(&value),
            }),

            "response.audio.delta" => {
                let b64 = value
                    .get("delta")
                    .and_then(|d| d.as_str())
                    .or_else(|| value.get("audio").and_then(|d| d.as_str()))
                    .unwrap_or("");
                match general_purpose::STANDARD.decode(b64) {
                    Ok(bytes) => Some(SessionEvent::ResponseAudio { bytes }),
                    Err(e) => {
                        // Skip the frame; a corrupt chunk must not kill the call.
                        warn!("undecodable audio delta: {e}");
                        None
                    }
                }
            }

            "response.audio.done" => Some(SessionEvent::ResponseAudioDone),

            "response.audio_transcript.done" => value
                .get("transcript")
                .and_then(|t| t.as_str())
                .map(|text| SessionEvent::ResponseText {
                    text: text.to_string(),
                }),

            "response.done" => {
                let status = value
                    .pointer("/response/status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("completed");
                if status == "cancelled" {
                    Some(SessionEvent::ResponseCancelled)
                } else {
                    Some(SessionEvent::ResponseCompleted {
                        response_id: response_id(&value),
                    })
                }
            }

            "response.cancelled" => Some(SessionEvent::ResponseCancelled),

            "conversation.item.input_audio_transcription.completed" => value
                .get("transcript")
                .and_then(|t| t.as_str())
                .map(|text| SessionEvent::TranscriptCompleted {
                    text: text.trim().to_string(),
                }),

            "conversation.item.input_audio_transcription.failed" => {
                let message = value
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("");
                let rate_limited = message.to_lowercase().contains("rate limit")
                    || value.pointer("/error/code").and_then(|c| c.as_str())
                        == Some("rate_limit_exceeded");
                Some(SessionEvent::TranscriptFailed { rate_limited })
            }

            "error" => {
                let code = value
                    .pointer("/error/code")
                    .and_then(|c| c.as_str())
                    .unwrap_or("");
                let message = value
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                if code == "response_cancel_not_active"
                    || message.contains("no active response")
                {
                    // Expected race: the reply finished before our cancel
                    // landed. Not an error.
                    debug!("cancel raced response completion");
                    None
                } else {
                    let fatal = code == "session_expired" || code == "invalid_api_key";
                    Some(SessionEvent::Error { message, fatal })
                }
            }

            other => {
                debug!(kind = other, "ignoring session event");
                None
            }
        };

        if let Some(event) = event {
            event_tx
                .send(Ok(event))
                .await
                .map_err(|_| SpeechError::ChannelClosed)?;
        }
        Ok(())
    }
}

fn response_id(value: &serde_json::Value) -> String {
    value
        .pointer("/response/id")
        .and_then(|i| i.as_str())
        .unwrap_or("unknown")
        .to_string()
}
