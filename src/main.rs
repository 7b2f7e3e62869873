//! linebridge - real-time telephony to speech-session bridge
//!
//! Accepts telephony media-stream connections (framed JSON with base64
//! mu-law audio at 8 kHz), pairs each call with a cloud real-time speech
//! session (JSON events with base64 PCM at 24 kHz), and runs the
//! turn-taking state machine that decides when the assistant speaks, when
//! the caller has interrupted it, and which transcripts to trust.

#![forbid(unsafe_code)]

/// Audio codec: mu-law companding, resampling, loudness normalization
pub mod codec;
/// Internal event and command types
pub mod events;
/// Per-call session runner and external collaborator interfaces
pub mod session;
/// Speech-session protocol adapter
pub mod speech;
/// Telephony media-stream protocol adapter
pub mod telephony;
/// Transcript validation and deduplication
pub mod transcript;
/// Turn-taking state machine
pub mod turn;
/// Client-side speech activity detection
pub mod vad;

use anyhow::Context;
use events::Role;
use session::{CallDirectory, CallRecord, SessionContext, TranscriptSink};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{error, info, warn};

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
struct BridgeConfig {
    bind_addr: String,
    speech_url: String,
    api_key: String,
    voice: String,
    instructions: String,
    transcript_path: PathBuf,
}

impl BridgeConfig {
    fn from_env() -> anyhow::Result<Self> {
        let api_key =
            std::env::var("SPEECH_API_KEY").context("SPEECH_API_KEY must be set")?;
        Ok(Self {
            bind_addr: env_or("LINEBRIDGE_BIND", "0.0.0.0:8080"),
            speech_url: env_or(
                "SPEECH_SESSION_URL",
                "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview",
            ),
            api_key,
            voice: env_or("SPEECH_VOICE", "alloy"),
            instructions: env_or(
                "CALL_INSTRUCTIONS",
                "You are a friendly phone assistant. Keep replies brief and conversational.",
            ),
            transcript_path: PathBuf::from(env_or("TRANSCRIPT_LOG", "transcripts.jsonl")),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Call directory backed by the process configuration: every call gets the
/// same persona and voice. The external call-control layer replaces this
/// with its real per-call store.
struct StaticCallDirectory {
    instructions: String,
    voice: String,
}

impl CallDirectory for StaticCallDirectory {
    fn lookup(&self, _call_id: &str) -> Option<CallRecord> {
        Some(CallRecord {
            destination: None,
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
        })
    }
}

/// Append-only JSONL transcript log. Write failures are logged and
/// swallowed; the audio pipeline never stops for a full disk.
struct JsonlTranscriptSink {
    path: PathBuf,
}

impl TranscriptSink for JsonlTranscriptSink {
    fn append(&self, call_id: &str, role: Role, text: &str, at: SystemTime) {
        let at_ms = at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let line = serde_json::json!({
            "callId": call_id,
            "role": role.as_str(),
            "text": text,
            "at": at_ms,
        });
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = written {
            warn!("transcript append failed: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = BridgeConfig::from_env()?;
    info!("starting linebridge on {}", config.bind_addr);

    let ctx = SessionContext {
        speech_url: config.speech_url.clone(),
        api_key: config.api_key.clone(),
        directory: Arc::new(StaticCallDirectory {
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
        }),
        transcripts: Arc::new(JsonlTranscriptSink {
            path: config.transcript_path.clone(),
        }),
        turn: turn::TurnConfig::default(),
        vad: vad::VadConfig::default(),
    };

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "telephony connection");
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                error!("session failed: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, ctx: SessionContext) -> anyhow::Result<()> {
    // The call id may arrive as a connection parameter instead of in the
    // start frame; capture it during the upgrade.
    let mut connection_call_id: Option<String> = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        connection_call_id = req.uri().query().and_then(call_id_from_query);
        Ok(resp)
    })
    .await
    .context("websocket upgrade failed")?;

    session::run_call(ws, connection_call_id, ctx).await?;
    Ok(())
}

fn call_id_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|kv| kv.strip_prefix("callId=").or_else(|| kv.strip_prefix("call_id=")))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_query_extraction() {
        assert_eq!(
            call_id_from_query("callId=CA123&foo=bar").as_deref(),
            Some("CA123")
        );
        assert_eq!(
            call_id_from_query("foo=bar&call_id=abc").as_deref(),
            Some("abc")
        );
        assert_eq!(call_id_from_query("foo=bar"), None);
        assert_eq!(call_id_from_query("callId="), None);
    }

    #[test]
    fn static_directory_answers_every_call() {
        let dir = StaticCallDirectory {
            instructions: "persona".into(),
            voice: "verse".into(),
        };
        let record = dir.lookup("anything").unwrap();
        assert_eq!(record.voice, "verse");
        assert_eq!(record.instructions, "persona");
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = std::env::temp_dir().join(format!("linebridge-test-{}", std::process::id()));
        let sink = JsonlTranscriptSink { path: dir.clone() };
        sink.append("call-1", Role::Caller, "hello", SystemTime::now());
        sink.append("call-1", Role::Assistant, "hi", SystemTime::now());
        let contents = std::fs::read_to_string(&dir).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["role"], "caller");
        assert_eq!(first["text"], "hello");
        std::fs::remove_file(&dir).ok();
    }
}
