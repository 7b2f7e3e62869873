//! Telephony media-stream protocol adapter.
//!
//! The telephony provider speaks JSON frames over a persistent WebSocket:
//! `connected`, `start` (stream and call identifiers), `media` (base64
//! mu-law at 8 kHz), `stop`. We answer with `media` frames in the same
//! envelope, plus `clear` to flush the provider's jitter buffer when the
//! caller interrupts, and `mark` checkpoints. This module only (de)serializes
//! the envelope; turn policy and codec work happen elsewhere.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// Sample rate of the companded telephony leg.
pub const TELEPHONY_RATE_HZ: u32 = 8_000;

#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("malformed stream frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("undecodable media payload: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("no call identifier in start frame or connection parameters")]
    MissingCallId,
}

pub type Result<T> = std::result::Result<T, TelephonyError>;

/// One frame of the telephony stream, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamFrame {
    Connected {
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        start: StartMeta,
    },
    Media {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },
    Clear {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },
    Stop {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },
    /// Anything this build doesn't know; logged and skipped upstream.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub stream_sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_parameters: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
}

impl StartMeta {
    /// The call identifier may ride in the start payload, in the custom
    /// parameters, or only in the connection URL; callers pass the last of
    /// those as the fallback.
    pub fn call_id(&self, connection_param: Option<&str>) -> Result<String> {
        self.call_sid
            .clone()
            .or_else(|| {
                self.custom_parameters
                    .as_ref()
                    .and_then(|p| p.get("callId").cloned())
            })
            .or_else(|| connection_param.map(str::to_string))
            .ok_or(TelephonyError::MissingCallId)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Base64 mu-law audio.
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<StreamFrame> {
    Ok(serde_json::from_str(text)?)
}

/// Decode the mu-law bytes out of a media payload.
pub fn decode_media(media: &MediaPayload) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(&media.payload)?)
}

/// Outbound media frame carrying companded audio to the caller.
pub fn media_frame(stream_sid: &str, mulaw: &[u8]) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": {
            "payload": base64::engine::general_purpose::STANDARD.encode(mulaw),
        },
    })
    .to_string()
}

/// Tell the provider to drop any audio it has buffered for playback.
pub fn clear_frame(stream_sid: &str) -> String {
    json!({
        "event": "clear",
        "streamSid": stream_sid,
    })
    .to_string()
}

/// Playback checkpoint; the provider echoes it back once audio before it
/// has been played out.
pub fn mark_frame(stream_sid: &str, name: &str) -> String {
    json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connected_and_start() {
        let frame = parse_frame(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#)
            .unwrap();
        assert!(matches!(frame, StreamFrame::Connected { .. }));

        let frame = parse_frame(
            r#"{
                "event": "start",
                "sequenceNumber": "1",
                "streamSid": "MZ123",
                "start": {
                    "streamSid": "MZ123",
                    "accountSid": "AC42",
                    "callSid": "CA99",
                    "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
                }
            }"#,
        )
        .unwrap();
        match frame {
            StreamFrame::Start { start, stream_sid } => {
                assert_eq!(stream_sid.as_deref(), Some("MZ123"));
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.call_id(None).unwrap(), "CA99");
                let fmt = start.media_format.unwrap();
                assert_eq!(fmt.sample_rate, TELEPHONY_RATE_HZ);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn call_id_falls_back_to_custom_parameters_then_connection() {
        let start: StartMeta = serde_json::from_str(
            r#"{"streamSid": "MZ1", "customParameters": {"callId": "call-7"}}"#,
        )
        .unwrap();
        assert_eq!(start.call_id(None).unwrap(), "call-7");

        let bare: StartMeta = serde_json::from_str(r#"{"streamSid": "MZ2"}"#).unwrap();
        assert_eq!(bare.call_id(Some("call-8")).unwrap(), "call-8");
        assert!(matches!(
            bare.call_id(None),
            Err(TelephonyError::MissingCallId)
        ));
    }

    #[test]
    fn media_round_trip() {
        let mulaw = vec![0xFFu8, 0x7F, 0x00, 0x80, 0x55];
        let text = media_frame("MZ123", &mulaw);
        match parse_frame(&text).unwrap() {
            StreamFrame::Media { stream_sid, media } => {
                assert_eq!(stream_sid.as_deref(), Some("MZ123"));
                assert_eq!(decode_media(&media).unwrap(), mulaw);
            }
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn parses_inbound_media_with_track_fields() {
        let frame = parse_frame(
            r#"{
                "event": "media",
                "streamSid": "MZ123",
                "media": {"track": "inbound", "chunk": "2", "timestamp": "40", "payload": "AAAA"}
            }"#,
        )
        .unwrap();
        match frame {
            StreamFrame::Media { media, .. } => {
                assert_eq!(media.track.as_deref(), Some("inbound"));
                assert_eq!(decode_media(&media).unwrap(), vec![0, 0, 0]);
            }
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_payload_is_an_error_not_a_panic() {
        let media = MediaPayload {
            track: None,
            chunk: None,
            timestamp: None,
            payload: "not base64 !!!".into(),
        };
        assert!(decode_media(&media).is_err());
    }

    #[test]
    fn unknown_events_parse_to_unknown() {
        let frame = parse_frame(r#"{"event":"dtmf","dtmf":{"digit":"5"}}"#).unwrap();
        assert!(matches!(frame, StreamFrame::Unknown));
    }

    #[test]
    fn clear_and_mark_frames_serialize() {
        let clear: serde_json::Value = serde_json::from_str(&clear_frame("MZ9")).unwrap();
        assert_eq!(clear["event"], "clear");
        assert_eq!(clear["streamSid"], "MZ9");

        let mark: serde_json::Value = serde_json::from_str(&mark_frame("MZ9", "eot")).unwrap();
        assert_eq!(mark["event"], "mark");
        assert_eq!(mark["mark"]["name"], "eot");
    }

    #[test]
    fn stop_frame_parses() {
        let frame = parse_frame(r#"{"event":"stop","streamSid":"MZ123"}"#).unwrap();
        assert!(matches!(frame, StreamFrame::Stop { .. }));
    }
}
