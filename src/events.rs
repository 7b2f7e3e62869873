use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Direction a frame is travelling through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller audio arriving from the telephony stream.
    InboundFromCaller,
    /// Synthesized audio heading back to the caller.
    OutboundToCaller,
}

/// A buffer of linear PCM samples at a known rate.
///
/// Frames are created by an adapter on receipt and consumed immediately;
/// ownership moves along the pipeline, nothing holds two references.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub direction: Direction,
    pub received_at: Instant,
}

/// Who said a line that goes into the transcript sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Assistant => "assistant",
        }
    }
}

/// Everything the turn state machine can react to, from either adapter,
/// the speech detector, or a timer firing back into the queue.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A decoded, session-rate caller audio frame, tagged by the detector.
    CallerAudio {
        frame: AudioFrame,
        suspected_speech: bool,
    },
    /// The telephony stream ended (stop frame or socket close).
    CallerHangup,
    /// A finalized transcript of caller speech.
    TranscriptCompleted { text: String, at: Instant },
    /// The speech session could not transcribe an utterance.
    TranscriptFailed { rate_limited: bool },
    /// The remote session began generating a reply.
    ResponseCreated { response_id: String },
    /// A chunk of reply audio at the session sample rate.
    ResponseAudio { pcm: Vec<i16> },
    /// Reply audio finished streaming.
    ResponseAudioDone,
    /// The text of the reply, once fully known.
    ResponseText { text: String },
    /// The reply finished end to end.
    ResponseCompleted { response_id: String },
    /// A cancellation we (or the server) issued took effect.
    ResponseCancelled,
    /// The speech session connection closed.
    SessionClosed { reason: String },
    /// A session-level error; fatal ones force teardown.
    SessionFailure { message: String, fatal: bool },
    /// A previously scheduled deferred reply timer fired.
    DeferredReplyDue { serial: u64 },
}

/// What the state machine wants done. The session runner owns the
/// transports and timers and is the only thing that executes these.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Push caller audio (session-rate PCM) to the speech session.
    ForwardAudio { pcm: Vec<i16> },
    /// Play reply audio (session-rate PCM) out to the caller.
    PlayToCaller { pcm: Vec<i16> },
    /// Ask the speech session to generate a reply now.
    RequestReply,
    /// Cancel the in-flight reply, best effort.
    CancelReply,
    /// Arm the one deferred-reply timer.
    ScheduleDeferredReply { serial: u64, delay: Duration },
    /// Disarm the deferred-reply timer if it is still pending.
    CancelDeferredReply,
    /// Tell the telephony side to drop any audio it has queued.
    FlushCallerAudio,
    /// Record a line in the transcript sink.
    AppendTranscript { role: Role, text: String },
    /// A (transcript, reply) pair the validator judged inconsistent.
    FlagSuspectPair { transcript: String, reply: String },
    /// Tear the whole session down.
    Teardown { reason: String },
}

/// Handling one event rarely produces more than a couple of commands.
pub type Commands = SmallVec<[Command; 4]>;
