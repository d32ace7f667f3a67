//! Platform speech recognition capability
//!
//! The session manager never talks to a concrete recognizer. It asks an
//! `EngineFactory` for a `RecognitionEngine` handle and receives everything
//! the engine reports through the `EngineEventSink` it handed out. Each
//! handle gets its own generation number so events from a released handle
//! can be told apart from the live one.

use flume::{Receiver, Sender};
use std::fmt;

pub use crate::error::EngineError;

/// One emitted recognition event
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptResult {
    pub text: String,
    pub is_final: bool,
    /// 0.0..=1.0, zero when the engine does not report it
    pub confidence: f32,
    /// Ranked alternatives, best first
    pub alternatives: Vec<String>,
}

impl TranscriptResult {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: 0.0,
            alternatives: Vec::new(),
        }
    }

    pub fn final_text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence,
            alternatives: Vec::new(),
        }
    }

    pub fn with_alternatives(mut self, alternatives: Vec<String>) -> Self {
        self.alternatives = alternatives;
        self
    }

    /// Best usable transcript: `text`, or the first non-blank alternative
    pub fn best_text(&self) -> Option<&str> {
        let text = self.text.trim();
        if !text.is_empty() {
            return Some(text);
        }
        self.alternatives
            .iter()
            .map(|a| a.trim())
            .find(|a| !a.is_empty())
    }
}

/// Error codes reported by the recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    Aborted,
    Network,
    NotAllowed,
    ServiceNotAllowed,
    AudioCapture,
    Unknown(String),
}

impl RecognitionErrorKind {
    /// Parse the recognizer's error code (`no-speech`, `network`, ...)
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_lowercase().as_str() {
            "no-speech" => Self::NoSpeech,
            "aborted" => Self::Aborted,
            "network" => Self::Network,
            "not-allowed" => Self::NotAllowed,
            "service-not-allowed" => Self::ServiceNotAllowed,
            "audio-capture" => Self::AudioCapture,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoSpeech | Self::Aborted => ErrorClass::Transient,
            Self::Network => ErrorClass::SlowRecoverable,
            Self::NotAllowed | Self::ServiceNotAllowed => ErrorClass::Permission,
            Self::AudioCapture => ErrorClass::Hardware,
            Self::Unknown(_) => ErrorClass::Unknown,
        }
    }
}

impl fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpeech => write!(f, "no-speech"),
            Self::Aborted => write!(f, "aborted"),
            Self::Network => write!(f, "network"),
            Self::NotAllowed => write!(f, "not-allowed"),
            Self::ServiceNotAllowed => write!(f, "service-not-allowed"),
            Self::AudioCapture => write!(f, "audio-capture"),
            Self::Unknown(code) => write!(f, "{}", code),
        }
    }
}

/// How the session manager reacts to an error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with the normal backoff
    Transient,
    /// Retry with a doubled base delay
    SlowRecoverable,
    /// Stop, ask the user to grant microphone access
    Permission,
    /// Stop, ask the user to check the microphone
    Hardware,
    /// One retry, then give up
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started,
    Result(TranscriptResult),
    Error(RecognitionErrorKind),
    Ended,
}

/// An event stamped with the generation of the handle that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMessage {
    pub generation: u64,
    pub event: EngineEvent,
}

/// Where an engine handle reports its events
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    generation: u64,
    tx: Sender<EngineMessage>,
}

impl EngineEventSink {
    pub fn new(generation: u64, tx: Sender<EngineMessage>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(EngineMessage {
            generation: self.generation,
            event,
        });
    }

    pub fn started(&self) {
        self.emit(EngineEvent::Started);
    }

    pub fn result(&self, result: TranscriptResult) {
        self.emit(EngineEvent::Result(result));
    }

    pub fn error(&self, kind: RecognitionErrorKind) {
        self.emit(EngineEvent::Error(kind));
    }

    pub fn ended(&self) {
        self.emit(EngineEvent::Ended);
    }
}

pub fn event_channel() -> (Sender<EngineMessage>, Receiver<EngineMessage>) {
    flume::unbounded()
}

/// A live recognizer handle
pub trait RecognitionEngine: Send {
    /// Begin capturing. Fails with `InvalidState` when already running.
    fn start(&mut self) -> Result<(), EngineError>;

    /// Stop capturing, letting the engine finalize what it heard
    fn stop(&mut self);

    /// Stop capturing immediately and discard pending audio
    fn abort(&mut self);
}

/// Creates engine handles for the session manager
pub trait EngineFactory: Send {
    /// Whether the platform has a recognizer at all
    fn is_supported(&self) -> bool;

    fn create(&mut self, sink: EngineEventSink) -> Result<Box<dyn RecognitionEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RecognitionErrorKind::from_code("no-speech"), RecognitionErrorKind::NoSpeech);
        assert_eq!(RecognitionErrorKind::from_code("NETWORK"), RecognitionErrorKind::Network);
        assert_eq!(
            RecognitionErrorKind::from_code("bad-grammar"),
            RecognitionErrorKind::Unknown("bad-grammar".to_string())
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(RecognitionErrorKind::Aborted.class(), ErrorClass::Transient);
        assert_eq!(RecognitionErrorKind::Network.class(), ErrorClass::SlowRecoverable);
        assert_eq!(RecognitionErrorKind::ServiceNotAllowed.class(), ErrorClass::Permission);
        assert_eq!(RecognitionErrorKind::AudioCapture.class(), ErrorClass::Hardware);
        assert_eq!(
            RecognitionErrorKind::Unknown("x".into()).class(),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_best_text_falls_back_to_alternatives() {
        let result = TranscriptResult::final_text("  ", 0.4)
            .with_alternatives(vec!["".into(), "next step".into()]);
        assert_eq!(result.best_text(), Some("next step"));

        let empty = TranscriptResult::final_text("", 0.0);
        assert_eq!(empty.best_text(), None);
    }

    #[test]
    fn test_sink_stamps_generation() {
        let (tx, rx) = event_channel();
        let sink = EngineEventSink::new(7, tx);
        sink.started();
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.generation, 7);
        assert_eq!(msg.event, EngineEvent::Started);
    }
}
