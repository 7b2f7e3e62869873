//! Turn-taking state machine.
//!
//! Everything that decides who is speaking lives here, in one `handle`
//! function over one state enum. The machine consumes events from both
//! protocol adapters (already decoded into [`BridgeEvent`]s) plus its own
//! deferred timer, and emits [`Command`]s for the session runner to execute.
//! It owns no I/O and no clock of its own — the caller passes `now` — which
//! keeps every timing rule unit-testable.
//!
//! The rules it enforces:
//! - a reply is cancelled by an explicit interruption phrase and nothing
//!   else; the assistant gets to finish its sentence otherwise
//! - transcripts landing just after the reply starts, or just after it
//!   ends, are presumed to be our own echo unless they are a greeting or an
//!   interruption
//! - each caller utterance gets at most one reply, ever
//! - a newer utterance silently supersedes an older one that was still
//!   waiting for its reply

use crate::events::{BridgeEvent, Command, Commands, Role};
use crate::transcript::{self, TranscriptValidator, ValidatorConfig};
use smallvec::smallvec;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Session turn state. `Responding` is only ever entered from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Waiting for the caller.
    Idle,
    /// A reply is being generated and streamed out.
    Responding,
    /// The caller cut the reply off; cleared once their full utterance has
    /// been transcribed.
    Interrupted,
    /// Teardown has begun; nothing is forwarded any more.
    Closing,
}

/// Timing facts the transitions consult. Kept together so the state is one
/// enum plus one struct instead of a pile of loose flags.
#[derive(Debug, Default)]
struct Timing {
    response_started_at: Option<Instant>,
    response_ended_at: Option<Instant>,
    last_suspected_speech: Option<Instant>,
    latest_transcript_at: Option<Instant>,
}

/// A validated caller utterance waiting for its reply.
#[derive(Debug, Clone)]
struct PendingTranscript {
    text: String,
    at: Instant,
}

#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Transcripts this soon after response start are presumed echo.
    pub pre_response_echo_window: Duration,
    /// Transcripts this soon after response end are checked against the
    /// reply text; deferred replies also wait this long.
    pub post_response_echo_window: Duration,
    /// How recent a suspected-speech flag must be to corroborate a
    /// transcript that arrives while the assistant is speaking.
    pub speech_confirm_window: Duration,
    /// Bound on the replied-to fingerprint set.
    pub max_responded_entries: usize,
    pub validator: ValidatorConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            pre_response_echo_window: Duration::from_millis(1_200),
            post_response_echo_window: Duration::from_millis(2_500),
            speech_confirm_window: Duration::from_secs(2),
            max_responded_entries: 128,
            validator: ValidatorConfig::default(),
        }
    }
}

pub struct TurnStateMachine {
    cfg: TurnConfig,
    state: ResponseState,
    timing: Timing,
    validator: TranscriptValidator,

    /// Latest validated utterance still owed a reply.
    pending: Option<PendingTranscript>,
    /// Fingerprints of utterances we already replied to, insertion-ordered
    /// so the set stays bounded.
    responded: HashSet<String>,
    responded_order: VecDeque<String>,

    /// The utterance the in-flight reply is answering, for the cross-check.
    answering: Option<String>,
    /// Set when a reply appears that we never asked for.
    blind_response: bool,
    reply_requested: bool,

    /// Within-response mute (duplicate-introduction tail). Reset whenever
    /// `Responding` is left.
    suppress_outbound: bool,
    /// Caller said an interruption phrase; cleared by their next full
    /// transcript.
    awaiting_interrupt_transcript: bool,
    /// Courtesy goodbye heard. Informational only; the human or the
    /// call-control layer ends the call.
    goodbye_heard: bool,

    current_response_id: Option<String>,
    deferred_serial: u64,
    active_deferred: Option<u64>,
}

impl TurnStateMachine {
    pub fn new(cfg: TurnConfig) -> Self {
        let validator = TranscriptValidator::new(cfg.validator.clone());
        Self {
            cfg,
            state: ResponseState::Idle,
            timing: Timing::default(),
            validator,
            pending: None,
            responded: HashSet::new(),
            responded_order: VecDeque::new(),
            answering: None,
            blind_response: false,
            reply_requested: false,
            suppress_outbound: false,
            awaiting_interrupt_transcript: false,
            goodbye_heard: false,
            current_response_id: None,
            deferred_serial: 0,
            active_deferred: None,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Whether the assistant is currently producing audio; the detector
    /// uses this to pick its echo-adjusted threshold.
    pub fn assistant_speaking(&self) -> bool {
        self.state == ResponseState::Responding
    }

    pub fn goodbye_heard(&self) -> bool {
        self.goodbye_heard
    }

    pub fn validator(&self) -> &TranscriptValidator {
        &self.validator
    }

    /// Process one event to completion. Single-consumer ordering is the
    /// concurrency model: nothing else mutates this state.
    pub fn handle(&mut self, event: BridgeEvent, now: Instant) -> Commands {
        if self.state == ResponseState::Closing {
            // Only hangup-style events matter once teardown has begun.
            return smallvec![];
        }
        match event {
            BridgeEvent::CallerAudio {
                frame,
                suspected_speech,
            } => {
                if suspected_speech {
                    self.timing.last_suspected_speech = Some(now);
                }
                smallvec![Command::ForwardAudio { pcm: frame.samples }]
            }

            BridgeEvent::TranscriptCompleted { text, at } => self.on_transcript(text, at, now),

            BridgeEvent::TranscriptFailed { rate_limited } => {
                if rate_limited {
                    warn!("transcription throttled upstream");
                } else {
                    debug!("transcription failed");
                }
                if self.state == ResponseState::Responding && self.blind_response {
                    // The reply in flight has no transcript behind it; don't
                    // let it speak blindly.
                    info!("cancelling untranscribed reply");
                    smallvec![Command::CancelReply]
                } else {
                    smallvec![]
                }
            }

            BridgeEvent::ResponseCreated { response_id } => self.on_response_created(response_id, now),

            BridgeEvent::ResponseAudio { pcm } => {
                if self.state == ResponseState::Responding && !self.suppress_outbound {
                    smallvec![Command::PlayToCaller { pcm }]
                } else {
                    debug!(state = ?self.state, "dropping reply audio");
                    smallvec![]
                }
            }

            BridgeEvent::ResponseAudioDone => smallvec![],

            BridgeEvent::ResponseText { text } => self.on_response_text(text, now),

            BridgeEvent::ResponseCompleted { response_id } => {
                self.on_response_completed(&response_id, now)
            }

            BridgeEvent::ResponseCancelled => {
                info!(state = ?self.state, "reply cancelled");
                if self.state == ResponseState::Responding {
                    self.leave_responding(ResponseState::Idle, now);
                } else {
                    self.timing.response_ended_at = Some(now);
                }
                self.current_response_id = None;
                smallvec![]
            }

            BridgeEvent::DeferredReplyDue { serial } => self.on_deferred_due(serial, now),

            BridgeEvent::CallerHangup => self.teardown("caller hung up"),

            BridgeEvent::SessionClosed { reason } => {
                self.teardown(&format!("speech session closed: {reason}"))
            }

            BridgeEvent::SessionFailure { message, fatal } => {
                if fatal {
                    self.teardown(&format!("speech session error: {message}"))
                } else {
                    warn!(message, "non-fatal session error");
                    smallvec![]
                }
            }
        }
    }

    fn on_transcript(&mut self, text: String, at: Instant, now: Instant) -> Commands {
        self.timing.latest_transcript_at = Some(at);

        let was_interrupt_wait = self.awaiting_interrupt_transcript;
        if self.state == ResponseState::Interrupted && was_interrupt_wait {
            // The interrupting utterance has now fully arrived.
            info!("interruption transcript received, resuming turn-taking");
            self.awaiting_interrupt_transcript = false;
            self.state = ResponseState::Idle;
        }

        // Explicit interruption of a reply that has actually started. The
        // same phrase before any audio is just the caller talking.
        if transcript::is_interruption_phrase(&text)
            && self.state == ResponseState::Responding
            && self.timing.response_started_at.is_some()
        {
            info!(text, "interruption phrase, cancelling reply");
            self.leave_responding(ResponseState::Interrupted, now);
            self.awaiting_interrupt_transcript = true;
            self.pending = None;
            let mut cmds: Commands = smallvec![
                Command::CancelReply,
                Command::FlushCallerAudio,
                Command::AppendTranscript {
                    role: Role::Caller,
                    text,
                },
            ];
            if self.active_deferred.take().is_some() {
                cmds.push(Command::CancelDeferredReply);
            }
            return cmds;
        }

        if let Err(reason) = self
            .validator
            .check_caller_transcript(&text, self.state == ResponseState::Responding)
        {
            debug!(text, ?reason, "transcript rejected");
            return smallvec![];
        }

        let bypass_echo_checks =
            transcript::is_greeting_phrase(&text) || transcript::is_interruption_phrase(&text);

        // Echo window around the start of our own reply.
        if self.state == ResponseState::Responding && !bypass_echo_checks {
            if let Some(started) = self.timing.response_started_at {
                if now.duration_since(started) <= self.cfg.pre_response_echo_window {
                    debug!(text, "discarding transcript inside pre-response echo window");
                    return smallvec![];
                }
            }
            // Beyond the window, demand acoustic corroboration: the detector
            // must have suspected live speech recently, otherwise the
            // recognizer most likely heard our own audio.
            let corroborated = self
                .timing
                .last_suspected_speech
                .is_some_and(|t| now.duration_since(t) <= self.cfg.speech_confirm_window);
            if !corroborated {
                debug!(text, "discarding uncorroborated transcript during response");
                return smallvec![];
            }
        }

        // Echo window after our reply finished.
        if self.state == ResponseState::Idle && !bypass_echo_checks {
            if let Some(ended) = self.timing.response_ended_at {
                if now.duration_since(ended) <= self.cfg.post_response_echo_window {
                    if let Some(reason) = self.validator.is_probable_reply_echo(&text) {
                        debug!(text, ?reason, "discarding post-response echo");
                        return smallvec![];
                    }
                }
            }
        }

        let fp = transcript::fingerprint(&text);
        if self.responded.contains(&fp) {
            debug!(text, "already replied to this utterance");
            return smallvec![];
        }

        if transcript::is_closing_phrase(&text) {
            info!(text, "caller is wrapping up");
            self.goodbye_heard = true;
        }

        let mut cmds: Commands = smallvec![Command::AppendTranscript {
            role: Role::Caller,
            text: text.clone(),
        }];

        // A newer utterance supersedes whatever was still waiting.
        if self.active_deferred.take().is_some() {
            cmds.push(Command::CancelDeferredReply);
        }
        self.pending = Some(PendingTranscript { text, at });

        match self.state {
            ResponseState::Idle => {
                cmds.extend(self.request_pending_reply(now));
            }
            ResponseState::Responding => {
                // Not an interruption: the assistant finishes its sentence
                // and the reply is requested after completion.
                info!("queueing transcript behind in-flight reply");
            }
            ResponseState::Interrupted | ResponseState::Closing => {}
        }
        cmds
    }

    fn on_response_created(&mut self, response_id: String, now: Instant) -> Commands {
        match self.state {
            ResponseState::Idle => {
                info!(response_id, "response started");
                self.state = ResponseState::Responding;
                self.timing.response_started_at = Some(now);
                self.suppress_outbound = false;
                self.awaiting_interrupt_transcript = false;
                self.blind_response = !self.reply_requested;
                self.reply_requested = false;
                self.current_response_id = Some(response_id);
                smallvec![]
            }
            ResponseState::Interrupted => {
                // Raced our cancel; kill this one too.
                info!(response_id, "response created after interruption, cancelling");
                self.current_response_id = Some(response_id);
                smallvec![Command::CancelReply]
            }
            ResponseState::Responding => {
                warn!(response_id, "response created while already responding");
                smallvec![]
            }
            ResponseState::Closing => smallvec![],
        }
    }

    fn on_response_text(&mut self, text: String, now: Instant) -> Commands {
        if self.validator.is_duplicate_reply(&text) {
            // A repeated self-introduction; mute whatever tail audio is
            // still streaming and keep it out of the transcript.
            warn!("duplicate reply detected, muting remainder");
            self.suppress_outbound = true;
            self.answering = None;
            return smallvec![];
        }

        let mut cmds: Commands = smallvec![Command::AppendTranscript {
            role: Role::Assistant,
            text: text.clone(),
        }];
        if let Some(answered) = self.answering.take() {
            if self.validator.resolve_reply(&answered, &text, now) {
                cmds.push(Command::FlagSuspectPair {
                    transcript: answered,
                    reply: text,
                });
            }
        } else {
            self.validator.record_reply(&text);
        }
        cmds
    }

    fn on_response_completed(&mut self, response_id: &str, now: Instant) -> Commands {
        info!(response_id, "response complete");
        if self.state == ResponseState::Responding {
            self.leave_responding(ResponseState::Idle, now);
        } else {
            self.timing.response_ended_at = Some(now);
        }
        self.current_response_id = None;

        if self.state == ResponseState::Idle && self.pending.is_some() {
            // Exactly one deferred reply, after the echo window has passed.
            self.deferred_serial += 1;
            let serial = self.deferred_serial;
            self.active_deferred = Some(serial);
            debug!(serial, "scheduling deferred reply");
            return smallvec![Command::ScheduleDeferredReply {
                serial,
                delay: self.cfg.post_response_echo_window,
            }];
        }
        smallvec![]
    }

    fn on_deferred_due(&mut self, serial: u64, now: Instant) -> Commands {
        if self.active_deferred != Some(serial) {
            debug!(serial, "stale deferred reply timer");
            return smallvec![];
        }
        self.active_deferred = None;
        if self.state != ResponseState::Idle {
            debug!(serial, state = ?self.state, "deferred reply no longer applicable");
            return smallvec![];
        }
        self.request_pending_reply(now)
    }

    /// Consume the pending transcript and ask for a reply — at most once
    /// per utterance, and only for the newest one.
    fn request_pending_reply(&mut self, _now: Instant) -> Commands {
        let Some(pending) = self.pending.take() else {
            return smallvec![];
        };

        if let Some(latest) = self.timing.latest_transcript_at {
            if latest > pending.at {
                // Superseded while it waited; drop silently.
                debug!("stale pending transcript dropped");
                return smallvec![];
            }
        }

        let fp = transcript::fingerprint(&pending.text);
        if !self.responded.insert(fp.clone()) {
            debug!("refusing second reply for the same utterance");
            return smallvec![];
        }
        self.responded_order.push_back(fp);
        while self.responded_order.len() > self.cfg.max_responded_entries {
            if let Some(old) = self.responded_order.pop_front() {
                self.responded.remove(&old);
            }
        }

        info!(text = pending.text, "requesting reply");
        self.answering = Some(pending.text);
        self.reply_requested = true;
        smallvec![Command::RequestReply]
    }

    fn leave_responding(&mut self, to: ResponseState, now: Instant) {
        debug_assert!(matches!(to, ResponseState::Idle | ResponseState::Interrupted));
        self.state = to;
        self.timing.response_ended_at = Some(now);
        // Invariant: leaving `Responding` always clears the mute; the
        // `Interrupted` state suppresses audio by itself.
        self.suppress_outbound = false;
        self.blind_response = false;
    }

    fn teardown(&mut self, reason: &str) -> Commands {
        info!(reason, "tearing down session");
        let was_responding = self.state == ResponseState::Responding;
        self.state = ResponseState::Closing;
        self.pending = None;
        let mut cmds: Commands = smallvec![];
        if was_responding {
            cmds.push(Command::CancelReply);
        }
        if self.active_deferred.take().is_some() {
            cmds.push(Command::CancelDeferredReply);
        }
        cmds.push(Command::Teardown {
            reason: reason.to_string(),
        });
        cmds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AudioFrame, Direction};

    fn frame(at: Instant) -> AudioFrame {
        AudioFrame {
            samples: vec![0i16; 480],
            sample_rate: 24_000,
            direction: Direction::InboundFromCaller,
            received_at: at,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn transcript_event(text: &str, at: Instant) -> BridgeEvent {
        BridgeEvent::TranscriptCompleted {
            text: text.to_string(),
            at,
        }
    }

    fn has_reply_request(cmds: &Commands) -> bool {
        cmds.iter().any(|c| matches!(c, Command::RequestReply))
    }

    fn has_cancel(cmds: &Commands) -> bool {
        cmds.iter().any(|c| matches!(c, Command::CancelReply))
    }

    /// Drive the machine into `Responding` with a reply for `text`.
    fn start_response(fsm: &mut TurnStateMachine, text: &str, t: Instant) {
        let cmds = fsm.handle(transcript_event(text, t), t);
        assert!(has_reply_request(&cmds), "expected a reply request");
        fsm.handle(
            BridgeEvent::ResponseCreated {
                response_id: "resp-1".into(),
            },
            t + ms(50),
        );
        assert_eq!(fsm.state(), ResponseState::Responding);
    }

    #[test]
    fn idle_transcript_gets_immediate_reply() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        let cmds = fsm.handle(transcript_event("I need to change my delivery address", t0), t0);
        assert!(has_reply_request(&cmds));
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::AppendTranscript { role: Role::Caller, .. }
        )));
    }

    #[test]
    fn interruption_before_response_start_cancels_nothing() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        let cmds = fsm.handle(transcript_event("wait", t0), t0);
        assert!(!has_cancel(&cmds));
        // Treated as ordinary speech: it gets a reply.
        assert!(has_reply_request(&cmds));
        assert_eq!(fsm.state(), ResponseState::Idle);
    }

    #[test]
    fn interruption_during_response_cancels_and_suppresses() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "tell me about my order", t0);

        let cmds = fsm.handle(transcript_event("stop", t0 + ms(2_000)), t0 + ms(2_000));
        assert!(has_cancel(&cmds));
        assert!(cmds.iter().any(|c| matches!(c, Command::FlushCallerAudio)));
        assert_eq!(fsm.state(), ResponseState::Interrupted);

        // Audio arriving after the cancel is dropped.
        let cmds = fsm.handle(
            BridgeEvent::ResponseAudio { pcm: vec![1, 2, 3] },
            t0 + ms(2_100),
        );
        assert!(cmds.is_empty());
    }

    #[test]
    fn interrupted_clears_on_next_transcript() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "tell me about my order", t0);
        fsm.handle(transcript_event("hold on", t0 + ms(2_000)), t0 + ms(2_000));
        assert_eq!(fsm.state(), ResponseState::Interrupted);

        // Remainder of the interrupting utterance arrives; turn-taking
        // resumes and the new question gets a reply.
        let t1 = t0 + ms(4_000);
        let cmds = fsm.handle(
            transcript_event("actually I want to cancel the order entirely", t1),
            t1,
        );
        assert_eq!(fsm.state(), ResponseState::Idle);
        assert!(has_reply_request(&cmds));
    }

    #[test]
    fn non_interruption_during_response_defers_exactly_one_reply() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "what are your opening hours", t0);

        // Mark live speech so the mid-response transcript is corroborated.
        fsm.handle(
            BridgeEvent::CallerAudio {
                frame: frame(t0 + ms(1_400)),
                suspected_speech: true,
            },
            t0 + ms(1_400),
        );

        // Six words, not an interruption, 1.5s into the reply.
        let cmds = fsm.handle(
            transcript_event("also what about the weekend hours", t0 + ms(1_500)),
            t0 + ms(1_500),
        );
        assert!(!has_cancel(&cmds), "the assistant finishes its sentence");
        assert!(!has_reply_request(&cmds));
        assert_eq!(fsm.state(), ResponseState::Responding);

        // Reply completes; a deferred request is scheduled.
        let t_done = t0 + ms(3_000);
        let cmds = fsm.handle(
            BridgeEvent::ResponseCompleted {
                response_id: "resp-1".into(),
            },
            t_done,
        );
        let serial = cmds
            .iter()
            .find_map(|c| match c {
                Command::ScheduleDeferredReply { serial, delay } => {
                    assert_eq!(*delay, TurnConfig::default().post_response_echo_window);
                    Some(*serial)
                }
                _ => None,
            })
            .expect("deferred reply scheduled");

        // Timer fires: exactly one request.
        let t_fire = t_done + ms(2_500);
        let cmds = fsm.handle(BridgeEvent::DeferredReplyDue { serial }, t_fire);
        assert!(has_reply_request(&cmds));

        // A duplicate firing produces nothing.
        let cmds = fsm.handle(BridgeEvent::DeferredReplyDue { serial }, t_fire + ms(10));
        assert!(cmds.is_empty());
    }

    #[test]
    fn no_second_reply_for_the_same_transcript() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        let cmds = fsm.handle(transcript_event("what is my account balance", t0), t0);
        assert!(has_reply_request(&cmds));

        // Same utterance again, long after any echo window.
        let t1 = t0 + Duration::from_secs(30);
        let cmds = fsm.handle(transcript_event("what is my account balance", t1), t1);
        assert!(!has_reply_request(&cmds));
    }

    #[test]
    fn greeting_bypasses_pre_response_echo_window() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "please connect me to support", t0);

        // 300ms into the reply: well inside the echo window, but greetings
        // are time-critical and unambiguous.
        let t1 = t0 + ms(350);
        let cmds = fsm.handle(transcript_event("Hello, how can I help you", t1), t1);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::AppendTranscript { role: Role::Caller, .. }
        )));
        assert!(!has_cancel(&cmds));
    }

    #[test]
    fn ordinary_transcript_inside_pre_response_window_is_echo() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "please connect me to support", t0);

        let t1 = t0 + ms(900);
        let cmds = fsm.handle(
            transcript_event("thanks for calling let me look into that", t1),
            t1,
        );
        assert!(cmds.is_empty());
    }

    #[test]
    fn uncorroborated_transcript_during_response_is_echo() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "what are your opening hours", t0);

        // No suspected-speech flag anywhere near this transcript.
        let t1 = t0 + ms(5_000);
        let cmds = fsm.handle(
            transcript_event("we are open from nine to five daily", t1),
            t1,
        );
        assert!(cmds.is_empty());
    }

    #[test]
    fn post_response_echo_window_discards_own_reply_text() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "where is my package right now", t0);

        let reply = "Your package is out for delivery and should arrive by five";
        fsm.handle(
            BridgeEvent::ResponseText {
                text: reply.to_string(),
            },
            t0 + ms(2_000),
        );
        fsm.handle(
            BridgeEvent::ResponseCompleted {
                response_id: "resp-1".into(),
            },
            t0 + ms(2_500),
        );
        assert_eq!(fsm.state(), ResponseState::Idle);

        // Our own words come back one second later: discard.
        let t1 = t0 + ms(3_500);
        let cmds = fsm.handle(
            transcript_event("your package is out for delivery and should arrive by five", t1),
            t1,
        );
        assert!(cmds.is_empty());

        // An unrelated transcript in the same window is accepted.
        let t2 = t0 + ms(4_000);
        let cmds = fsm.handle(
            transcript_event("can you repeat the tracking number please", t2),
            t2,
        );
        assert!(has_reply_request(&cmds));
    }

    #[test]
    fn short_fragment_during_response_is_dropped() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "what are your opening hours", t0);

        let t1 = t0 + ms(2_000);
        let cmds = fsm.handle(transcript_event("oh I see", t1), t1);
        assert!(cmds.is_empty());
    }

    #[test]
    fn voicemail_transcript_never_gets_a_reply() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        let cmds = fsm.handle(
            transcript_event(
                "The person you are trying to reach is not available, please leave a message \
                 after the tone",
                t0,
            ),
            t0,
        );
        assert!(cmds.is_empty());
    }

    #[test]
    fn newer_transcript_supersedes_pending_one() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "what are your opening hours", t0);

        fsm.handle(
            BridgeEvent::CallerAudio {
                frame: frame(t0 + ms(1_900)),
                suspected_speech: true,
            },
            t0 + ms(1_900),
        );
        fsm.handle(
            transcript_event("also tell me about weekend hours", t0 + ms(2_000)),
            t0 + ms(2_000),
        );
        fsm.handle(
            BridgeEvent::CallerAudio {
                frame: frame(t0 + ms(2_800)),
                suspected_speech: true,
            },
            t0 + ms(2_800),
        );
        // A second utterance replaces the first while still responding.
        fsm.handle(
            transcript_event("actually never mind about that question", t0 + ms(3_000)),
            t0 + ms(3_000),
        );

        let cmds = fsm.handle(
            BridgeEvent::ResponseCompleted {
                response_id: "resp-1".into(),
            },
            t0 + ms(4_000),
        );
        let serial = cmds
            .iter()
            .find_map(|c| match c {
                Command::ScheduleDeferredReply { serial, .. } => Some(*serial),
                _ => None,
            })
            .expect("deferred reply scheduled");

        // The fired reply answers the newest utterance only.
        let cmds = fsm.handle(BridgeEvent::DeferredReplyDue { serial }, t0 + ms(6_500));
        assert!(has_reply_request(&cmds));
        // One utterance, one reply: nothing is owed to the superseded text.
        assert!(fsm.pending.is_none());
    }

    #[test]
    fn blind_reply_is_cancelled_on_transcription_failure() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        // A response appears that we never requested (server-initiated).
        fsm.handle(
            BridgeEvent::ResponseCreated {
                response_id: "resp-9".into(),
            },
            t0,
        );
        assert_eq!(fsm.state(), ResponseState::Responding);

        let cmds = fsm.handle(BridgeEvent::TranscriptFailed { rate_limited: true }, t0 + ms(400));
        assert!(has_cancel(&cmds));
    }

    #[test]
    fn requested_reply_survives_transcription_failure() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "what is the status of my claim", t0);
        let cmds = fsm.handle(BridgeEvent::TranscriptFailed { rate_limited: true }, t0 + ms(400));
        assert!(!has_cancel(&cmds));
    }

    #[test]
    fn duplicate_reply_text_mutes_tail_audio() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        let intro = "Hi this is Morgan calling from Lakeside Dental about your appointment";

        start_response(&mut fsm, "hello", t0);
        fsm.handle(
            BridgeEvent::ResponseText {
                text: intro.to_string(),
            },
            t0 + ms(1_000),
        );
        fsm.handle(
            BridgeEvent::ResponseCompleted {
                response_id: "resp-1".into(),
            },
            t0 + ms(1_500),
        );

        // Second introduction with the same opening: muted, not logged.
        let t1 = t0 + ms(6_000);
        let cmds = fsm.handle(transcript_event("sorry what was that", t1), t1);
        assert!(has_reply_request(&cmds));
        fsm.handle(
            BridgeEvent::ResponseCreated {
                response_id: "resp-2".into(),
            },
            t1 + ms(100),
        );
        let cmds = fsm.handle(
            BridgeEvent::ResponseText {
                text: format!("{intro} tomorrow"),
            },
            t1 + ms(1_000),
        );
        assert!(cmds.is_empty());

        let cmds = fsm.handle(
            BridgeEvent::ResponseAudio { pcm: vec![5, 5, 5] },
            t1 + ms(1_100),
        );
        assert!(cmds.is_empty(), "tail audio muted after duplicate");
    }

    #[test]
    fn cross_check_flag_is_surfaced() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "purple monkey dishwasher elephant banana", t0);
        let cmds = fsm.handle(
            BridgeEvent::ResponseText {
                text: "Your refund request was approved this morning".into(),
            },
            t0 + ms(1_000),
        );
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::FlagSuspectPair { .. })));
        assert_eq!(
            fsm.validator().resolved_pairs().filter(|p| p.flagged).count(),
            1
        );
    }

    #[test]
    fn goodbye_sets_flag_without_ending_session() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        let cmds = fsm.handle(transcript_event("okay thank you goodbye", t0), t0);
        assert!(fsm.goodbye_heard());
        assert!(has_reply_request(&cmds));
        assert_ne!(fsm.state(), ResponseState::Closing);
    }

    #[test]
    fn hangup_tears_down_and_cancels_in_flight_reply() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "tell me a long story", t0);

        let cmds = fsm.handle(BridgeEvent::CallerHangup, t0 + ms(1_000));
        assert!(has_cancel(&cmds));
        assert!(cmds.iter().any(|c| matches!(c, Command::Teardown { .. })));
        assert_eq!(fsm.state(), ResponseState::Closing);

        // Everything after teardown is inert.
        let cmds = fsm.handle(
            BridgeEvent::ResponseAudio { pcm: vec![1] },
            t0 + ms(1_100),
        );
        assert!(cmds.is_empty());
    }

    #[test]
    fn audio_frames_are_forwarded_and_speech_marks_recorded() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        let cmds = fsm.handle(
            BridgeEvent::CallerAudio {
                frame: frame(t0),
                suspected_speech: false,
            },
            t0,
        );
        assert!(matches!(cmds.as_slice(), [Command::ForwardAudio { .. }]));
    }

    #[test]
    fn cancelled_event_returns_to_idle_from_responding() {
        let mut fsm = TurnStateMachine::new(TurnConfig::default());
        let t0 = Instant::now();
        start_response(&mut fsm, "read me the terms and conditions", t0);
        fsm.handle(BridgeEvent::ResponseCancelled, t0 + ms(500));
        assert_eq!(fsm.state(), ResponseState::Idle);
    }
}
