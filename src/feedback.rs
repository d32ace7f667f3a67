//! User-facing feedback hooks
//!
//! Toasts, tones and haptics are fire-and-forget side calls into the host.
//! None of them can fail from the caller's point of view.

use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Success => write!(f, "success"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Short audio cues played on state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Start,
    Stop,
    Success,
    Failure,
}

pub trait Feedback: Send + Sync {
    /// Show a message to the user (toast, status line)
    fn notify(&self, message: &str, severity: Severity);

    fn tone(&self, _tone: Tone) {}

    fn haptic(&self) {}

    /// Cancel any text-to-speech in progress
    fn cancel_speech(&self) {}
}

pub type SharedFeedback = Arc<dyn Feedback>;

/// Routes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFeedback;

impl Feedback for LogFeedback {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Error => log::error!("[feedback] {}", message),
            Severity::Warning => log::warn!("[feedback] {}", message),
            Severity::Info | Severity::Success => log::info!("[feedback] {}", message),
        }
    }

    fn tone(&self, tone: Tone) {
        log::trace!("[feedback] tone {:?}", tone);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackRecord {
    Notice(String, Severity),
    Tone(Tone),
    Haptic,
    SpeechCancelled,
}

/// Keeps every feedback call, for tests and scripted hosts
#[derive(Debug, Default, Clone)]
pub struct RecordingFeedback {
    records: Arc<Mutex<Vec<FeedbackRecord>>>,
}

impl RecordingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn notices(&self) -> Vec<(String, Severity)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                FeedbackRecord::Notice(message, severity) => Some((message, severity)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }

    fn push(&self, record: FeedbackRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

impl Feedback for RecordingFeedback {
    fn notify(&self, message: &str, severity: Severity) {
        self.push(FeedbackRecord::Notice(message.to_string(), severity));
    }

    fn tone(&self, tone: Tone) {
        self.push(FeedbackRecord::Tone(tone));
    }

    fn haptic(&self) {
        self.push(FeedbackRecord::Haptic);
    }

    fn cancel_speech(&self) {
        self.push(FeedbackRecord::SpeechCancelled);
    }
}
