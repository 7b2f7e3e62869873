//! Transcript validation and deduplication.
//!
//! Live transcription over a phone line is noisy in ways that matter for
//! turn-taking: the recognizer hears our own replies leaking back, voicemail
//! systems masquerade as callers, and the same self-introduction can be
//! generated twice. This module scores and filters transcripts so the state
//! machine only ever acts on text that plausibly came from the live caller.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Phrases that cancel an in-flight reply when the assistant is speaking.
const INTERRUPTION_PHRASES: &[&str] = &[
    "wait",
    "stop",
    "hold on",
    "hang on",
    "excuse me",
    "one moment",
    "one second",
    "pardon",
    "shut up",
];

/// Phrases a human answering a phone opens with. Time-critical, so they
/// bypass echo suppression.
const GREETING_PHRASES: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "good morning",
    "good afternoon",
    "good evening",
    "speaking",
    "this is",
    "who is this",
    "who's this",
];

/// Short courtesy fragments the recognizer often produces from our own
/// trailing audio.
const POLITE_FRAGMENTS: &[&str] = &[
    "thank you",
    "thanks",
    "okay",
    "ok",
    "alright",
    "all right",
    "sure",
    "great",
    "yes",
    "no problem",
    "you're welcome",
];

/// Phrases that signal the caller is wrapping up.
const CLOSING_PHRASES: &[&str] = &[
    "goodbye",
    "good bye",
    "bye",
    "bye bye",
    "talk to you later",
    "have a good day",
    "have a nice day",
    "take care",
];

/// Patterns that mark a transcript as a voicemail or system prompt rather
/// than the live participant.
const VOICEMAIL_PATTERNS: &[&str] = &[
    "please leave a message",
    "leave a message after",
    "after the tone",
    "after the beep",
    "at the tone",
    "is not available",
    "is unavailable",
    "has a voice mailbox",
    "voice mail",
    "voicemail",
    "mailbox is full",
    "press pound",
    "to leave a callback number",
    "your call has been forwarded",
    "the person you are trying to reach",
    "record your message",
];

/// Small words that carry no semantic content for the cross-check.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "to", "of",
    "in", "on", "at", "for", "with", "that", "this", "it", "its", "i", "you", "we", "they", "he",
    "she", "me", "my", "your", "our", "do", "does", "did", "have", "has", "had", "will", "would",
    "can", "could", "so", "just", "like", "what", "how", "about", "not", "yes", "no", "okay",
];

/// Why a transcript was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Voicemail,
    TooShortDuringResponse,
    DuplicateOfReply,
    PoliteEchoFragment,
}

/// A (caller transcript, assistant reply) pair kept around briefly for the
/// accuracy cross-check and duplicate detection, then pruned.
#[derive(Debug, Clone)]
pub struct ResolvedTranscriptPair {
    pub transcript: String,
    pub reply: String,
    pub flagged: bool,
    resolved_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Blended similarity above this marks a duplicate.
    pub duplicate_threshold: f64,
    /// How long resolved pairs are kept for inspection.
    pub pair_ttl: Duration,
    /// Transcripts shorter than this are suspect while the assistant speaks.
    pub min_words_during_response: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.6,
            pair_ttl: Duration::from_secs(30),
            min_words_during_response: 4,
        }
    }
}

pub struct TranscriptValidator {
    cfg: ValidatorConfig,
    last_reply: Option<String>,
    pairs: VecDeque<ResolvedTranscriptPair>,
}

impl TranscriptValidator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        Self {
            cfg,
            last_reply: None,
            pairs: VecDeque::new(),
        }
    }

    /// Blended similarity of two utterances: word-set Jaccard weighted 70%,
    /// length ratio 30%.
    pub fn similarity(a: &str, b: &str) -> f64 {
        let wa = word_set(a);
        let wb = word_set(b);
        if wa.is_empty() && wb.is_empty() {
            return 1.0;
        }
        if wa.is_empty() || wb.is_empty() {
            return 0.0;
        }
        let intersection = wa.iter().filter(|w| wb.contains(*w)).count() as f64;
        let union = (wa.len() + wb.len()) as f64 - intersection;
        let jaccard = intersection / union;

        let (shorter, longer) = if wa.len() <= wb.len() {
            (wa.len() as f64, wb.len() as f64)
        } else {
            (wb.len() as f64, wa.len() as f64)
        };
        let length_ratio = shorter / longer;

        0.7 * jaccard + 0.3 * length_ratio
    }

    /// Whether a new assistant utterance repeats the previous one — the
    /// classic doubled self-introduction. Triggers on blended similarity or
    /// an identical opening ten words.
    pub fn is_duplicate_reply(&self, text: &str) -> bool {
        let Some(prev) = &self.last_reply else {
            return false;
        };
        if Self::similarity(prev, text) > self.cfg.duplicate_threshold {
            return true;
        }
        let head_prev: Vec<String> = words(prev).take(10).collect();
        let head_new: Vec<String> = words(text).take(10).collect();
        head_prev.len() == 10 && head_prev == head_new
    }

    /// Record the latest assistant reply and resolve it against the caller
    /// transcript it answered, running the accuracy cross-check.
    ///
    /// Returns true when the pair was flagged as semantically inconsistent.
    /// The flag never changes behavior; live transcription is known to lag
    /// the session's own understanding, and operators need to see when.
    pub fn resolve_reply(&mut self, transcript: &str, reply: &str, now: Instant) -> bool {
        let flagged = Self::cross_check(transcript, reply);
        if flagged {
            warn!(
                transcript,
                reply, "reply shares no key terms with the transcript it answered"
            );
        }
        self.pairs.push_back(ResolvedTranscriptPair {
            transcript: transcript.to_string(),
            reply: reply.to_string(),
            flagged,
            resolved_at: now,
        });
        self.last_reply = Some(reply.to_string());
        self.prune(now);
        flagged
    }

    /// Record a reply that answered no particular transcript (e.g. the
    /// opening introduction).
    pub fn record_reply(&mut self, reply: &str) {
        self.last_reply = Some(reply.to_string());
    }

    /// Validate a finalized caller transcript against everything that does
    /// not depend on turn timing. `assistant_responding` enables the
    /// short-fragment rejection.
    pub fn check_caller_transcript(
        &self,
        text: &str,
        assistant_responding: bool,
    ) -> Result<(), RejectReason> {
        if is_voicemail_prompt(text) {
            return Err(RejectReason::Voicemail);
        }
        if assistant_responding
            && words(text).count() < self.cfg.min_words_during_response
            && !is_interruption_phrase(text)
        {
            return Err(RejectReason::TooShortDuringResponse);
        }
        Ok(())
    }

    /// Post-response echo test: is this transcript our own reply heard back,
    /// or a generic courtesy fragment of the kind tail audio produces?
    pub fn is_probable_reply_echo(&self, text: &str) -> Option<RejectReason> {
        if let Some(reply) = &self.last_reply {
            if Self::similarity(reply, text) > self.cfg.duplicate_threshold {
                return Some(RejectReason::DuplicateOfReply);
            }
        }
        if words(text).count() <= 3 && is_polite_fragment(text) {
            return Some(RejectReason::PoliteEchoFragment);
        }
        None
    }

    /// Pairs still inside the TTL, for diagnostics and tests.
    pub fn resolved_pairs(&self) -> impl Iterator<Item = &ResolvedTranscriptPair> {
        self.pairs.iter()
    }

    pub fn last_reply(&self) -> Option<&str> {
        self.last_reply.as_deref()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.pairs.front() {
            if now.duration_since(front.resolved_at) > self.cfg.pair_ttl {
                self.pairs.pop_front();
            } else {
                break;
            }
        }
    }

    /// Content-word overlap test. A substantive transcript whose reply
    /// shares none of its key terms is suspicious.
    fn cross_check(transcript: &str, reply: &str) -> bool {
        let transcript_terms: Vec<String> = content_words(transcript).collect();
        if transcript_terms.len() < 3 {
            // Too little signal to judge.
            return false;
        }
        let reply_terms: Vec<String> = content_words(reply).collect();
        if reply_terms.is_empty() {
            return false;
        }
        let overlap = transcript_terms
            .iter()
            .filter(|t| reply_terms.contains(t))
            .count();
        debug!(overlap, total = transcript_terms.len(), "cross-check overlap");
        overlap == 0
    }
}

/// Lowercased alphanumeric words of an utterance.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().filter_map(|w| {
        let cleaned: String = w
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '\'')
            .collect::<String>()
            .to_lowercase();
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    })
}

fn word_set(text: &str) -> Vec<String> {
    let mut v: Vec<String> = words(text).collect();
    v.sort();
    v.dedup();
    v
}

fn content_words(text: &str) -> impl Iterator<Item = String> + '_ {
    words(text).filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
}

/// A stable fingerprint for "have we already replied to this utterance".
pub fn fingerprint(text: &str) -> String {
    words(text).collect::<Vec<_>>().join(" ")
}

fn matches_phrase_list(text: &str, phrases: &[&str]) -> bool {
    let normalized = fingerprint(text);
    phrases.iter().any(|p| {
        normalized == *p
            || normalized.starts_with(&format!("{p} "))
            || normalized.ends_with(&format!(" {p}"))
            || normalized.contains(&format!(" {p} "))
    })
}

/// Explicit interruption phrase ("wait", "stop", "hold on", ...).
pub fn is_interruption_phrase(text: &str) -> bool {
    let normalized = fingerprint(text);
    if normalized.split(' ').count() > 6 {
        // A long sentence containing "stop" is content, not an interjection.
        return false;
    }
    matches_phrase_list(text, INTERRUPTION_PHRASES)
}

/// A human answering the phone.
pub fn is_greeting_phrase(text: &str) -> bool {
    matches_phrase_list(text, GREETING_PHRASES)
}

/// Short generic courtesy fragment.
pub fn is_polite_fragment(text: &str) -> bool {
    matches_phrase_list(text, POLITE_FRAGMENTS)
}

/// Caller signalling the end of the conversation.
pub fn is_closing_phrase(text: &str) -> bool {
    matches_phrase_list(text, CLOSING_PHRASES)
}

/// Voicemail greeting or carrier system prompt.
pub fn is_voicemail_prompt(text: &str) -> bool {
    let lower = text.to_lowercase();
    VOICEMAIL_PATTERNS.iter().any(|p| lower.contains(p))
}
