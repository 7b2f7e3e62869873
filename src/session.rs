//! Per-call session runner.
//!
//! One call = one [`Session`] value with a bounded lifetime. Both protocol
//! adapters and the deferred-reply timer feed a single ordered queue, and a
//! single consumer loop owns every piece of mutable per-call state — the
//! state machine, the detector, the pre-ready audio buffer. That one-logical-
//! thread model is what makes the turn-taking rules race-free without locks.

use crate::codec;
use crate::events::{AudioFrame, BridgeEvent, Command, Direction, Role};
use crate::speech::{
    SessionEvent, SpeechError, SpeechSessionClient, SpeechSessionConfig, SESSION_RATE_HZ,
};
use crate::telephony::{self, StreamFrame, TelephonyError, TELEPHONY_RATE_HZ};
use crate::turn::{TurnConfig, TurnStateMachine};
use crate::vad::{SpeechActivityDetector, VadConfig};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Frames held while the speech session is still coming up: ~8 seconds of
/// 20ms telephony frames. The caller's opening words must not be dropped.
const PENDING_AUDIO_CAP: usize = 400;

/// How long the telephony side gets to send its start frame, and the speech
/// side to accept our configuration.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Call metadata the external call-control layer stores per call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub destination: Option<String>,
    /// Conversational persona and goal for the session instructions.
    pub instructions: String,
    pub voice: String,
}

/// Narrow interface to the call-record store. A missing record is fatal for
/// the session.
pub trait CallDirectory: Send + Sync {
    fn lookup(&self, call_id: &str) -> Option<CallRecord>;
}

/// Append-only transcript sink. Implementations log failures themselves;
/// nothing here may take the audio pipeline down.
pub trait TranscriptSink: Send + Sync {
    fn append(&self, call_id: &str, role: Role, text: &str, at: SystemTime);
}

/// The pairing of a telephony call and its speech session. At most one
/// active speech connection per identity.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub call_id: String,
    pub stream_sid: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("telephony protocol error: {0}")]
    Telephony(#[from] TelephonyError),

    #[error("speech session error: {0}")]
    Speech(#[from] SpeechError),

    #[error("telephony transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no call record for {0}")]
    UnknownCall(String),

    #[error("telephony stream never started")]
    StreamNeverStarted,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything a session needs from the process around it.
#[derive(Clone)]
pub struct SessionContext {
    pub speech_url: String,
    pub api_key: String,
    pub directory: Arc<dyn CallDirectory>,
    pub transcripts: Arc<dyn TranscriptSink>,
    pub turn: TurnConfig,
    pub vad: VadConfig,
}

/// Events funnelled into the one consumer queue.
#[derive(Debug)]
enum QueueEvent {
    Telephony(StreamFrame),
    TelephonyClosed,
    Speech(SessionEvent),
    SpeechFailed(SpeechError),
    DeferredDue(u64),
    HandshakeTimeout,
}

/// Translate a parsed speech-session event into a state-machine event.
fn map_speech_event(event: SessionEvent, now: Instant) -> Option<BridgeEvent> {
    match event {
        // Readiness is the runner's concern, not the state machine's.
        SessionEvent::Ready => None,
        SessionEvent::ResponseCreated { response_id } => {
            Some(BridgeEvent::ResponseCreated { response_id })
        }
        SessionEvent::ResponseAudio { bytes } => Some(BridgeEvent::ResponseAudio {
            pcm: codec::bytes_to_pcm(&bytes),
        }),
        SessionEvent::ResponseAudioDone => Some(BridgeEvent::ResponseAudioDone),
        SessionEvent::ResponseText { text } => Some(BridgeEvent::ResponseText { text }),
        SessionEvent::ResponseCompleted { response_id } => {
            Some(BridgeEvent::ResponseCompleted { response_id })
        }
        SessionEvent::ResponseCancelled => Some(BridgeEvent::ResponseCancelled),
        SessionEvent::TranscriptCompleted { text } => {
            Some(BridgeEvent::TranscriptCompleted { text, at: now })
        }
        SessionEvent::TranscriptFailed { rate_limited } => {
            Some(BridgeEvent::TranscriptFailed { rate_limited })
        }
        SessionEvent::Error { message, fatal } => {
            Some(BridgeEvent::SessionFailure { message, fatal })
        }
    }
}

/// Push a frame into the bounded pre-ready buffer, dropping the oldest on
/// overflow. Returns how many frames were shed.
fn buffer_pending(queue: &mut VecDeque<Vec<u8>>, bytes: Vec<u8>, cap: usize) -> usize {
    queue.push_back(bytes);
    let mut shed = 0;
    while queue.len() > cap {
        queue.pop_front();
        shed += 1;
    }
    shed
}

/// Drive one call end to end: wait for the telephony start frame, look up
/// the call record, bring up the speech session, then run the consumer loop
/// until either side ends the call.
pub async fn run_call(
    telephony_ws: WebSocketStream<TcpStream>,
    connection_call_id: Option<String>,
    ctx: SessionContext,
) -> Result<()> {
    let (tel_tx, mut tel_rx) = telephony_ws.split();

    // The start frame names the stream and (usually) the call.
    let (identity, _format) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(msg) = tel_rx.next().await {
            let msg = msg?;
            let Message::Text(text) = msg else { continue };
            match telephony::parse_frame(text.as_str())? {
                StreamFrame::Connected { .. } => debug!("telephony stream connected"),
                StreamFrame::Start { start, stream_sid } => {
                    let call_id = start.call_id(connection_call_id.as_deref())?;
                    let stream_sid = stream_sid.unwrap_or_else(|| start.stream_sid.clone());
                    return Ok((
                        SessionIdentity {
                            call_id,
                            stream_sid,
                        },
                        start.media_format,
                    ));
                }
                other => debug!(?other, "frame before stream start"),
            }
        }
        Err(SessionError::StreamNeverStarted)
    })
    .await
    .map_err(|_| SessionError::StreamNeverStarted)??;

    info!(
        call_id = identity.call_id,
        stream_sid = identity.stream_sid,
        "telephony stream started"
    );

    let record = ctx
        .directory
        .lookup(&identity.call_id)
        .ok_or_else(|| SessionError::UnknownCall(identity.call_id.clone()))?;

    let mut speech_cfg = SpeechSessionConfig::new(&ctx.speech_url, &ctx.api_key);
    speech_cfg.instructions = record.instructions.clone();
    speech_cfg.voice = record.voice.clone();
    let mut client = SpeechSessionClient::new(speech_cfg);
    client.connect_and_send_configuration().await?;
    let mut speech_events = client.take_events();

    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<QueueEvent>();

    // Telephony reader task.
    let tel_queue = queue_tx.clone();
    let telephony_reader = tokio::spawn(async move {
        while let Some(msg) = tel_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => match telephony::parse_frame(text.as_str()) {
                    Ok(frame) => {
                        if tel_queue.send(QueueEvent::Telephony(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("skipping malformed telephony frame: {e}"),
                },
                Ok(Message::Close(_)) => {
                    let _ = tel_queue.send(QueueEvent::TelephonyClosed);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("telephony transport error: {e}");
                    let _ = tel_queue.send(QueueEvent::TelephonyClosed);
                    break;
                }
            }
        }
        let _ = tel_queue.send(QueueEvent::TelephonyClosed);
    });

    // Speech event pump.
    let speech_queue = queue_tx.clone();
    let speech_pump = tokio::spawn(async move {
        while let Some(event) = speech_events.recv().await {
            let queued = match event {
                Ok(e) => speech_queue.send(QueueEvent::Speech(e)),
                Err(e) => {
                    let _ = speech_queue.send(QueueEvent::SpeechFailed(e));
                    break;
                }
            };
            if queued.is_err() {
                break;
            }
        }
    });

    // Speech handshake watchdog.
    let watchdog_queue = queue_tx.clone();
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
        let _ = watchdog_queue.send(QueueEvent::HandshakeTimeout);
    });

    let mut session = Session {
        identity,
        fsm: TurnStateMachine::new(ctx.turn.clone()),
        vad: SpeechActivityDetector::new(ctx.vad.clone()),
        client,
        tel_tx,
        queue_tx,
        transcripts: ctx.transcripts.clone(),
        pending_audio: VecDeque::new(),
        speech_ready: false,
        deferred_timer: None,
        finished: false,
    };

    // The single consumer. Every event is processed to completion before
    // the next one is looked at.
    while let Some(event) = queue_rx.recv().await {
        session.on_queue_event(event).await;
        if session.finished {
            break;
        }
    }
    if !session.finished {
        session.teardown("event queue drained").await;
    }

    telephony_reader.abort();
    speech_pump.abort();
    watchdog.abort();
    info!(call_id = session.identity.call_id, "session ended");
    Ok(())
}

struct Session {
    identity: SessionIdentity,
    fsm: TurnStateMachine,
    vad: SpeechActivityDetector,
    client: SpeechSessionClient,
    tel_tx: SplitSink<WebSocketStream<TcpStream>, Message>,
    queue_tx: mpsc::UnboundedSender<QueueEvent>,
    transcripts: Arc<dyn TranscriptSink>,
    /// Caller audio waiting for the speech session to come up.
    pending_audio: VecDeque<Vec<u8>>,
    speech_ready: bool,
    deferred_timer: Option<JoinHandle<()>>,
    finished: bool,
}

impl Session {
    async fn on_queue_event(&mut self, event: QueueEvent) {
        let now = Instant::now();
        match event {
            QueueEvent::Telephony(frame) => self.on_telephony_frame(frame, now).await,

            QueueEvent::TelephonyClosed => {
                self.dispatch(BridgeEvent::CallerHangup, now).await;
            }

            QueueEvent::Speech(SessionEvent::Ready) => {
                if !self.speech_ready {
                    self.speech_ready = true;
                    info!(
                        buffered = self.pending_audio.len(),
                        "speech session ready, flushing buffered caller audio"
                    );
                    while let Some(bytes) = self.pending_audio.pop_front() {
                        if self.client.send_audio(&bytes).await.is_err() {
                            warn!("speech session dropped while flushing");
                            self.teardown("speech send failed").await;
                            return;
                        }
                    }
                }
            }

            QueueEvent::Speech(event) => {
                if let Some(bridge_event) = map_speech_event(event, now) {
                    self.dispatch(bridge_event, now).await;
                }
            }

            QueueEvent::SpeechFailed(e) => {
                self.dispatch(
                    BridgeEvent::SessionClosed {
                        reason: e.to_string(),
                    },
                    now,
                )
                .await;
            }

            QueueEvent::DeferredDue(serial) => {
                self.dispatch(BridgeEvent::DeferredReplyDue { serial }, now).await;
            }

            QueueEvent::HandshakeTimeout => {
                if !self.speech_ready {
                    error!("speech session never became ready");
                    self.teardown("speech handshake timed out").await;
                }
            }
        }
    }

    async fn on_telephony_frame(&mut self, frame: StreamFrame, now: Instant) {
        match frame {
            StreamFrame::Media { media, .. } => {
                let mulaw = match telephony::decode_media(&media) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // Skip the frame; one corrupt payload must not end
                        // the call.
                        debug!("skipping undecodable media frame: {e}");
                        return;
                    }
                };
                let pcm = codec::resample(
                    &codec::decode_mulaw(&mulaw),
                    TELEPHONY_RATE_HZ,
                    SESSION_RATE_HZ,
                );
                let suspected = self.vad.assess(&pcm, self.fsm.assistant_speaking());
                let frame = AudioFrame {
                    samples: pcm,
                    sample_rate: SESSION_RATE_HZ,
                    direction: Direction::InboundFromCaller,
                    received_at: now,
                };
                self.dispatch(
                    BridgeEvent::CallerAudio {
                        frame,
                        suspected_speech: suspected,
                    },
                    now,
                )
                .await;
            }
            StreamFrame::Stop { .. } => {
                info!("telephony stream stopped");
                self.dispatch(BridgeEvent::CallerHangup, now).await;
            }
            StreamFrame::Start { .. } => warn!("duplicate start frame ignored"),
            StreamFrame::Connected { .. }
            | StreamFrame::Mark { .. }
            | StreamFrame::Clear { .. } => {}
            StreamFrame::Unknown => debug!("unknown telephony event"),
        }
    }

    async fn dispatch(&mut self, event: BridgeEvent, now: Instant) {
        let commands = self.fsm.handle(event, now);
        for command in commands {
            self.apply(command).await;
            if self.finished {
                return;
            }
        }
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::ForwardAudio { pcm } => {
                let bytes = codec::pcm_to_bytes(&pcm);
                if self.speech_ready && self.client.is_open() {
                    if self.client.send_audio(&bytes).await.is_err() {
                        warn!("failed to forward caller audio");
                        self.teardown("speech send failed").await;
                    }
                } else {
                    let shed = buffer_pending(&mut self.pending_audio, bytes, PENDING_AUDIO_CAP);
                    if shed > 0 {
                        warn!(shed, "pre-ready audio buffer overflow");
                    }
                }
            }

            Command::PlayToCaller { pcm } => {
                let telephony_pcm = codec::normalize(&codec::resample(
                    &pcm,
                    SESSION_RATE_HZ,
                    TELEPHONY_RATE_HZ,
                ));
                let frame = telephony::media_frame(
                    &self.identity.stream_sid,
                    &codec::encode_mulaw(&telephony_pcm),
                );
                if self.tel_tx.send(Message::text(frame)).await.is_err() {
                    // Caller leg is gone; a hangup event is on its way from
                    // the reader, but don't wait to stop speaking.
                    debug!("dropping outbound audio, telephony socket closed");
                }
            }

            Command::RequestReply => {
                if self.client.request_response().await.is_err() {
                    warn!("failed to request reply");
                    self.teardown("speech send failed").await;
                }
            }

            Command::CancelReply => {
                // Best effort: "nothing to cancel" is filtered by the
                // client, transport errors surface through the pump.
                if let Err(e) = self.client.cancel_response().await {
                    debug!("cancel not delivered: {e}");
                }
            }

            Command::ScheduleDeferredReply { serial, delay } => {
                if let Some(old) = self.deferred_timer.take() {
                    old.abort();
                }
                let queue = self.queue_tx.clone();
                self.deferred_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = queue.send(QueueEvent::DeferredDue(serial));
                }));
            }

            Command::CancelDeferredReply => {
                if let Some(timer) = self.deferred_timer.take() {
                    timer.abort();
                }
            }

            Command::FlushCallerAudio => {
                let frame = telephony::clear_frame(&self.identity.stream_sid);
                if self.tel_tx.send(Message::text(frame)).await.is_err() {
                    debug!("telephony socket closed, flush skipped");
                }
            }

            Command::AppendTranscript { role, text } => {
                self.transcripts
                    .append(&self.identity.call_id, role, &text, SystemTime::now());
            }

            Command::FlagSuspectPair { transcript, reply } => {
                // Diagnostic only. The session's contextual understanding
                // can outrun its live transcription; operators watch for
                // this marker.
                warn!(
                    call_id = self.identity.call_id,
                    transcript, reply, "transcription accuracy suspect"
                );
            }

            Command::Teardown { reason } => {
                self.teardown(&reason).await;
            }
        }
    }

    /// Full teardown, idempotent. Both legs close together; a half-closed
    /// session is a resource leak.
    async fn teardown(&mut self, reason: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!(call_id = self.identity.call_id, reason, "closing session");

        if let Some(timer) = self.deferred_timer.take() {
            timer.abort();
        }
        if self.client.is_open() {
            let _ = self.client.cancel_response().await;
            self.client.close().await;
        }
        let _ = self.tel_tx.send(Message::Close(None)).await;
        self.pending_audio.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MapDirectory(std::collections::HashMap<String, CallRecord>);

    impl CallDirectory for MapDirectory {
        fn lookup(&self, call_id: &str) -> Option<CallRecord> {
            self.0.get(call_id).cloned()
        }
    }

    #[derive(Default)]
    struct MemorySink {
        lines: Mutex<Vec<(String, Role, String)>>,
    }

    impl TranscriptSink for MemorySink {
        fn append(&self, call_id: &str, role: Role, text: &str, _at: SystemTime) {
            self.lines
                .lock()
                .unwrap()
                .push((call_id.to_string(), role, text.to_string()));
        }
    }

    #[test]
    fn directory_lookup_misses_are_none() {
        let mut records = std::collections::HashMap::new();
        records.insert(
            "call-1".to_string(),
            CallRecord {
                destination: Some("+15550100".into()),
                instructions: "You are a scheduling assistant.".into(),
                voice: "alloy".into(),
            },
        );
        let dir = MapDirectory(records);
        assert!(dir.lookup("call-1").is_some());
        assert!(dir.lookup("call-2").is_none());
    }

    #[test]
    fn transcript_sink_appends_in_order() {
        let sink = MemorySink::default();
        sink.append("call-1", Role::Caller, "hello", SystemTime::now());
        sink.append("call-1", Role::Assistant, "hi there", SystemTime::now());
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1, Role::Caller);
        assert_eq!(lines[1].2, "hi there");
    }

    #[test]
    fn pending_buffer_is_bounded_and_drops_oldest() {
        let mut queue = VecDeque::new();
        for i in 0..5u8 {
            let shed = buffer_pending(&mut queue, vec![i], 3);
            if i < 3 {
                assert_eq!(shed, 0);
            } else {
                assert_eq!(shed, 1);
            }
        }
        assert_eq!(queue.len(), 3);
        // Oldest went first; the caller's most recent words survive.
        assert_eq!(queue.front().unwrap()[0], 2);
        assert_eq!(queue.back().unwrap()[0], 4);
    }

    #[test]
    fn speech_events_map_onto_bridge_events() {
        let now = Instant::now();
        assert!(map_speech_event(SessionEvent::Ready, now).is_none());

        let mapped = map_speech_event(
            SessionEvent::ResponseAudio {
                bytes: vec![0x34, 0x12],
            },
            now,
        );
        match mapped {
            Some(BridgeEvent::ResponseAudio { pcm }) => assert_eq!(pcm, vec![0x1234]),
            other => panic!("unexpected: {other:?}"),
        }

        let mapped = map_speech_event(
            SessionEvent::TranscriptCompleted {
                text: "hello there".into(),
            },
            now,
        );
        match mapped {
            Some(BridgeEvent::TranscriptCompleted { text, at }) => {
                assert_eq!(text, "hello there");
                assert_eq!(at, now);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mapped = map_speech_event(
            SessionEvent::Error {
                message: "boom".into(),
                fatal: true,
            },
            now,
        );
        assert!(matches!(
            mapped,
            Some(BridgeEvent::SessionFailure { fatal: true, .. })
        ));
    }
}
