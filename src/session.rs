//! Recognition session manager
//!
//! Sole owner of the recognizer handle. It decides when to start, stop,
//! restart and give up, and turns everything the engine reports into one
//! of five statuses. All transitions are plain method calls:
//!
//! - host requests: `start_listening`, `stop_listening`, `stop_all`,
//!   `on_visibility_change`, `on_unload`
//! - engine events: `handle_message` (or `process_pending_events` to drain
//!   the engine channel)
//! - timers: `poll_timers`, with `next_deadline` telling the driver when
//!   to call it
//!
//! Nothing here blocks or sleeps. The driver (see `service`) owns the
//! manager and feeds it messages one at a time.

use flume::{Receiver, Sender};
use rand::Rng;
use std::fmt;
use std::time::{Duration, Instant};

use crate::clock::SharedClock;
use crate::config::RecognitionConfig;
use crate::engine::{
    EngineEvent, EngineEventSink, EngineFactory, EngineMessage, ErrorClass, RecognitionEngine,
    RecognitionErrorKind, TranscriptResult,
};
use crate::error::EngineError;
use crate::feedback::{Severity, SharedFeedback, Tone};

/// Receives each finalized transcript. Returns whether the text was used
/// successfully, which decides between `Success` and `Error` status.
pub type ResultCallback = Box<dyn FnMut(&str) -> bool + Send>;

const MSG_UNSUPPORTED: &str =
    "Speech recognition is not supported here. Try a recent version of Chrome, Edge or Safari.";
const MSG_PERMISSION: &str =
    "Microphone access was denied. Allow microphone access in your browser settings and try again.";
const MSG_HARDWARE: &str =
    "No working microphone was found. Check that a microphone is connected and try again.";
const MSG_RETRIES_EXHAUSTED: &str =
    "Speech recognition keeps failing. Press the microphone button to try again.";
const MSG_UNKNOWN: &str = "Speech recognition stopped unexpectedly. Please try again.";
const MSG_MALFORMED: &str = "Something went wrong while processing speech. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Listening,
    Processing,
    Success,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Listening => write!(f, "listening"),
            SessionStatus::Processing => write!(f, "processing"),
            SessionStatus::Success => write!(f, "success"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    MaxDuration,
    Silence,
    Ended,
    Fatal,
    Teardown,
}

/// Published to subscribers on every observable change
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status {
        status: SessionStatus,
        target: Option<String>,
    },
    Interim {
        target: String,
        text: String,
    },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: RecognitionErrorKind,
    },
    Stopped {
        target: String,
        reason: StopReason,
    },
}

/// One listening episode
pub struct RecognitionSession {
    target: String,
    started_at: Instant,
    retry_count: u32,
    backoff_factor: f64,
    continuous: bool,
    unknown_retry_used: bool,
    /// Latest interim text not yet superseded by a final result
    pending_transcript: Option<String>,
    on_result: ResultCallback,
}

impl RecognitionSession {
    fn new(target: &str, started_at: Instant, continuous: bool, on_result: ResultCallback) -> Self {
        Self {
            target: target.to_string(),
            started_at,
            retry_count: 0,
            backoff_factor: 1.0,
            continuous,
            unknown_retry_used: false,
            pending_transcript: None,
            on_result,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn continuous(&self) -> bool {
        self.continuous
    }

    fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.backoff_factor = 1.0;
        self.unknown_retry_used = false;
    }
}

impl fmt::Debug for RecognitionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionSession")
            .field("target", &self.target)
            .field("retry_count", &self.retry_count)
            .field("backoff_factor", &self.backoff_factor)
            .field("continuous", &self.continuous)
            .field("pending_transcript", &self.pending_transcript)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    MaxDuration,
    Silence,
    Retry,
}

/// Pending deadlines. Cancelling removes the entry outright.
#[derive(Debug, Default)]
struct Timers {
    entries: Vec<(TimerKind, Instant)>,
}

impl Timers {
    fn set(&mut self, kind: TimerKind, at: Instant) {
        self.cancel(kind);
        self.entries.push((kind, at));
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.entries.retain(|(k, _)| *k != kind);
    }

    fn cancel_all(&mut self) {
        self.entries.clear();
    }

    fn is_set(&self, kind: TimerKind) -> bool {
        self.entries.iter().any(|(k, _)| *k == kind)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(_, at)| *at).min()
    }

    /// Remove and return the earliest timer due at `now`
    fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        let (index, _) = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, (_, at))| *at <= now)
            .min_by_key(|(_, (_, at))| *at)?;
        Some(self.entries.remove(index).0)
    }
}

/// Delay before retry number `retry_count + 1`, without jitter
pub fn retry_delay(config: &RecognitionConfig, retry_count: u32, class: ErrorClass) -> Duration {
    let class_multiplier = match class {
        ErrorClass::SlowRecoverable => 2.0,
        _ => 1.0,
    };
    let factor = config.backoff_multiplier.powi(retry_count as i32);
    let ms = config.base_retry_delay().as_millis() as f64 * class_multiplier * factor;
    Duration::from_millis(ms.round() as u64)
}

pub struct SessionManager {
    config: RecognitionConfig,
    factory: Box<dyn EngineFactory>,
    feedback: SharedFeedback,
    clock: SharedClock,
    engine: Option<Box<dyn RecognitionEngine>>,
    /// Generation of the current engine handle
    generation: u64,
    events_tx: Sender<EngineMessage>,
    events_rx: Receiver<EngineMessage>,
    session: Option<RecognitionSession>,
    status: SessionStatus,
    timers: Timers,
    subscribers: Vec<Sender<SessionEvent>>,
}

impl SessionManager {
    pub fn new(
        config: RecognitionConfig,
        factory: Box<dyn EngineFactory>,
        feedback: SharedFeedback,
        clock: SharedClock,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            config,
            factory,
            feedback,
            clock,
            engine: None,
            generation: 0,
            events_tx,
            events_rx,
            session: None,
            status: SessionStatus::Idle,
            timers: Timers::default(),
            subscribers: Vec::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn session(&self) -> Option<&RecognitionSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn active_target(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.target.as_str())
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    /// Whether an engine handle is currently held
    pub fn holds_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub fn set_continuous(&mut self, continuous: bool) {
        self.config.continuous = continuous;
        if let Some(session) = self.session.as_mut() {
            session.continuous = continuous;
        }
    }

    /// Observe status changes instead of polling
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Receiver side of the engine event channel, for async drivers
    pub fn engine_events(&self) -> Receiver<EngineMessage> {
        self.events_rx.clone()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn retry_scheduled(&self) -> bool {
        self.timers.is_set(TimerKind::Retry)
    }

    // ========================================================================
    // Host requests
    // ========================================================================

    pub fn start_listening(&mut self, target: &str, on_result: ResultCallback) -> bool {
        if !self.factory.is_supported() {
            log::warn!("[session] no speech recognition capability");
            self.feedback.notify(MSG_UNSUPPORTED, Severity::Error);
            self.set_status(SessionStatus::Error);
            return false;
        }

        if let Some(active) = self.active_target() {
            if active == target {
                log::debug!("[session] already listening for {}", target);
                return true;
            }
            log::info!("[session] switching from {} to {}", active, target);
            self.stop_listening();
        }

        if let Err(err) = self.start_engine() {
            log::error!("[session] failed to start recognition: {}", err);
            self.release_engine(false);
            let message = match err {
                EngineError::Unsupported => MSG_UNSUPPORTED,
                _ => MSG_UNKNOWN,
            };
            self.feedback.notify(message, Severity::Error);
            self.set_status(SessionStatus::Error);
            return false;
        }

        let now = self.clock.now();
        self.session = Some(RecognitionSession::new(
            target,
            now,
            self.config.continuous,
            on_result,
        ));
        self.timers
            .set(TimerKind::MaxDuration, now + self.config.max_listening());
        self.timers
            .set(TimerKind::Silence, now + self.config.max_silence());

        log::info!("[session] listening for {}", target);
        self.set_status(SessionStatus::Listening);
        self.feedback.tone(Tone::Start);
        true
    }

    /// Stop the active session. A no-op success when idle.
    pub fn stop_listening(&mut self) -> bool {
        if self.session.is_none() {
            self.timers.cancel_all();
            return true;
        }
        self.finish_session(StopReason::Requested, SessionStatus::Idle);
        self.feedback.tone(Tone::Stop);
        true
    }

    /// Release everything: speech output, timers, and the engine handle,
    /// even when the manager believes it already did.
    pub fn stop_all(&mut self) {
        self.feedback.cancel_speech();
        if self.session.is_some() {
            self.finish_session(StopReason::Teardown, SessionStatus::Idle);
        } else {
            self.timers.cancel_all();
        }
        self.release_engine(true);
        log::debug!("[session] all recognition resources released");
    }

    /// The page or window became hidden (or visible again)
    pub fn on_visibility_change(&mut self, hidden: bool) {
        if hidden {
            log::info!("[session] hidden, releasing microphone");
            self.stop_all();
        }
    }

    pub fn on_unload(&mut self) {
        self.stop_all();
    }

    // ========================================================================
    // Engine events
    // ========================================================================

    /// Handle everything queued on the engine channel
    pub fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.events_rx.try_recv() {
            self.handle_message(msg);
            handled += 1;
        }
        handled
    }

    pub fn handle_message(&mut self, msg: EngineMessage) {
        if self.engine.is_none() || msg.generation != self.generation || self.session.is_none() {
            log::debug!(
                "[session] dropping {:?} from engine generation {}",
                msg.event,
                msg.generation
            );
            return;
        }
        match msg.event {
            EngineEvent::Started => self.on_start(),
            EngineEvent::Result(result) => self.on_result(result),
            EngineEvent::Error(kind) => self.on_error(kind),
            EngineEvent::Ended => self.on_end(),
        }
    }

    fn on_start(&mut self) {
        log::debug!("[session] engine started");
        self.touch();
        self.set_status(SessionStatus::Listening);
    }

    fn on_result(&mut self, result: TranscriptResult) {
        if !result.confidence.is_finite() || !(0.0..=1.0).contains(&result.confidence) {
            self.malformed(&format!("confidence {} out of range", result.confidence));
            return;
        }
        self.touch();

        let Some(text) = result.best_text().map(str::to_string) else {
            if result.is_final {
                self.malformed("final result without text");
            }
            return;
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };

        if !result.is_final {
            session.pending_transcript = Some(text.clone());
            let target = session.target.clone();
            self.emit(SessionEvent::Interim { target, text });
            return;
        }

        session.pending_transcript = None;
        session.reset_retries();
        log::debug!(
            "[session] final transcript {:?} (confidence {:.2})",
            text,
            result.confidence
        );
        self.deliver(&text);
    }

    fn on_error(&mut self, kind: RecognitionErrorKind) {
        log::warn!("[session] engine error: {}", kind);
        match kind.class() {
            ErrorClass::Permission => self.fatal(&kind, MSG_PERMISSION),
            ErrorClass::Hardware => self.fatal(&kind, MSG_HARDWARE),
            class @ (ErrorClass::Transient | ErrorClass::SlowRecoverable) => {
                self.schedule_retry(kind, class)
            }
            ErrorClass::Unknown => {
                let used = match self.session.as_mut() {
                    Some(session) => std::mem::replace(&mut session.unknown_retry_used, true),
                    None => return,
                };
                if used {
                    self.fatal(&kind, MSG_UNKNOWN);
                } else {
                    self.schedule_retry(kind, ErrorClass::Unknown);
                }
            }
        }
    }

    fn on_end(&mut self) {
        if self.timers.is_set(TimerKind::Retry) {
            log::debug!("[session] engine ended, retry pending");
            return;
        }
        let continuous = self.session.as_ref().map(|s| s.continuous).unwrap_or(false);
        if continuous {
            log::debug!("[session] engine ended, restarting (continuous)");
            match self.start_engine() {
                Ok(()) => self.set_status(SessionStatus::Listening),
                Err(err) => {
                    log::error!("[session] restart failed: {}", err);
                    self.fatal(&RecognitionErrorKind::Unknown(err.to_string()), MSG_UNKNOWN);
                }
            }
            return;
        }
        // Fatal paths finish the session themselves, so an end here is
        // never sticky: a failed command or bad result settles to idle
        self.finish_session(StopReason::Ended, SessionStatus::Idle);
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Fire every timer that is due. Returns how many fired.
    pub fn poll_timers(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        while let Some(kind) = self.timers.pop_due(now) {
            fired += 1;
            match kind {
                TimerKind::MaxDuration => {
                    log::info!("[session] listening time limit reached");
                    self.feedback.notify(
                        &format!(
                            "Stopped listening after {} seconds.",
                            self.config.max_listening_ms / 1000
                        ),
                        Severity::Info,
                    );
                    self.finish_session(StopReason::MaxDuration, SessionStatus::Idle);
                    self.feedback.tone(Tone::Stop);
                }
                TimerKind::Silence => {
                    log::info!("[session] silence limit reached");
                    self.feedback
                        .notify("Stopped listening: no speech detected.", Severity::Info);
                    self.finish_session(StopReason::Silence, SessionStatus::Idle);
                    self.feedback.tone(Tone::Stop);
                }
                TimerKind::Retry => self.retry_now(),
            }
        }
        fired
    }

    fn touch(&mut self) {
        if self.session.is_some() {
            let at = self.clock.now() + self.config.max_silence();
            self.timers.set(TimerKind::Silence, at);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn schedule_retry(&mut self, kind: RecognitionErrorKind, class: ErrorClass) {
        let max_retries = self.config.max_retries;
        let jitter = self.jitter();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let attempt = session.retry_count + 1;
        if attempt > max_retries {
            log::error!("[session] giving up after {} retries", session.retry_count);
            self.fatal(&kind, MSG_RETRIES_EXHAUSTED);
            return;
        }

        let delay = retry_delay(&self.config, session.retry_count, class) + jitter;
        session.retry_count = attempt;
        session.backoff_factor *= self.config.backoff_multiplier;

        let at = self.clock.now() + delay;
        self.timers.set(TimerKind::Retry, at);
        log::info!(
            "[session] retry {} of {} in {}ms after {}",
            attempt,
            max_retries,
            delay.as_millis(),
            kind
        );

        if class == ErrorClass::SlowRecoverable {
            self.feedback
                .notify("Network problem, trying to reconnect…", Severity::Warning);
        }
        self.emit(SessionEvent::RetryScheduled {
            attempt,
            delay,
            error: kind,
        });
        self.set_status(SessionStatus::Listening);
    }

    fn retry_now(&mut self) {
        if self.session.is_none() {
            return;
        }
        match self.start_engine() {
            Ok(()) => log::debug!("[session] engine restarted"),
            Err(err) => {
                log::error!("[session] retry failed: {}", err);
                self.fatal(&RecognitionErrorKind::Unknown(err.to_string()), MSG_UNKNOWN);
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.retry_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Start the current handle, recreating it when its real state has
    /// drifted from ours
    fn start_engine(&mut self) -> Result<(), EngineError> {
        if self.engine.is_none() {
            self.create_engine()?;
        }
        let first = match self.engine.as_mut() {
            Some(engine) => engine.start(),
            None => return Err(EngineError::Unsupported),
        };
        match first {
            Err(EngineError::InvalidState) => {
                log::warn!("[session] engine was still running, recreating handle");
                self.release_engine(true);
                self.create_engine()?;
                match self.engine.as_mut() {
                    Some(engine) => engine.start(),
                    None => Err(EngineError::Unsupported),
                }
            }
            other => other,
        }
    }

    fn create_engine(&mut self) -> Result<(), EngineError> {
        self.generation += 1;
        let sink = EngineEventSink::new(self.generation, self.events_tx.clone());
        let engine = self.factory.create(sink)?;
        log::debug!("[session] created engine generation {}", self.generation);
        self.engine = Some(engine);
        Ok(())
    }

    /// Drop the handle. Events it emits afterwards are stale.
    fn release_engine(&mut self, abort: bool) {
        if let Some(mut engine) = self.engine.take() {
            if abort {
                engine.abort();
            } else {
                engine.stop();
            }
        }
    }

    /// Tear down the session: timers first, then the engine, then flush
    /// the undelivered transcript exactly once.
    fn finish_session(&mut self, reason: StopReason, final_status: SessionStatus) {
        self.timers.cancel_all();
        self.release_engine(reason == StopReason::Teardown || reason == StopReason::Fatal);

        let Some(mut session) = self.session.take() else {
            self.set_status(final_status);
            return;
        };

        if let Some(text) = session.pending_transcript.take() {
            log::debug!("[session] flushing pending transcript {:?}", text);
            self.set_status(SessionStatus::Processing);
            let ok = (session.on_result)(&text);
            log::debug!("[session] flushed transcript handled: {}", ok);
        }

        log::info!("[session] stopped {} ({:?})", session.target, reason);
        self.emit(SessionEvent::Stopped {
            target: session.target,
            reason,
        });
        self.set_status(final_status);
    }

    fn deliver(&mut self, text: &str) {
        self.set_status(SessionStatus::Processing);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let ok = (session.on_result)(text);
        let continuous = session.continuous;

        if ok {
            self.set_status(SessionStatus::Success);
            self.feedback.tone(Tone::Success);
            self.feedback.haptic();
        } else {
            self.set_status(SessionStatus::Error);
            self.feedback.tone(Tone::Failure);
        }

        if continuous {
            self.set_status(SessionStatus::Listening);
        } else {
            self.finish_session(StopReason::Ended, SessionStatus::Idle);
        }
    }

    fn fatal(&mut self, kind: &RecognitionErrorKind, message: &str) {
        log::error!("[session] stopping after {}", kind);
        self.feedback.notify(message, Severity::Error);
        self.feedback.tone(Tone::Failure);
        self.finish_session(StopReason::Fatal, SessionStatus::Error);
    }

    fn malformed(&mut self, reason: &str) {
        log::warn!("[session] malformed recognition result: {}", reason);
        self.feedback.notify(MSG_MALFORMED, Severity::Warning);
        self.set_status(SessionStatus::Error);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        log::debug!("[session] {} -> {}", self.status, status);
        self.status = status;
        let target = self.session.as_ref().map(|s| s.target.clone());
        self.emit(SessionEvent::Status { status, target });
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::feedback::{FeedbackRecord, RecordingFeedback};
    use crate::sim::{SimController, SimEngineFactory};
    use std::sync::{Arc, Mutex};

    fn quiet_config() -> RecognitionConfig {
        RecognitionConfig {
            retry_jitter_ms: 0,
            ..RecognitionConfig::default()
        }
    }

    fn manager_with(
        config: RecognitionConfig,
    ) -> (SessionManager, SimController, ManualClock, RecordingFeedback) {
        let (factory, controller) = SimEngineFactory::new();
        let clock = ManualClock::new();
        let feedback = RecordingFeedback::new();
        let manager = SessionManager::new(
            config,
            Box::new(factory),
            Arc::new(feedback.clone()),
            Arc::new(clock.clone()),
        );
        (manager, controller, clock, feedback)
    }

    fn collector() -> (Arc<Mutex<Vec<String>>>, ResultCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ResultCallback = Box::new(move |text: &str| {
            sink.lock().unwrap().push(text.to_string());
            true
        });
        (seen, callback)
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let (mut manager, controller, _, feedback) = manager_with(quiet_config());
        assert!(manager.stop_listening());
        assert_eq!(manager.status(), SessionStatus::Idle);
        assert_eq!(controller.stops(), 0);
        assert!(feedback.notices().is_empty());
    }

    #[test]
    fn test_unsupported_platform_rejects_start() {
        let (factory, _controller) = SimEngineFactory::unsupported();
        let feedback = RecordingFeedback::new();
        let mut manager = SessionManager::new(
            quiet_config(),
            Box::new(factory),
            Arc::new(feedback.clone()),
            Arc::new(ManualClock::new()),
        );
        let (_, callback) = collector();

        assert!(!manager.start_listening("step", callback));
        assert_eq!(manager.status(), SessionStatus::Error);
        assert_eq!(feedback.notices()[0].1, Severity::Error);
    }

    #[test]
    fn test_same_target_twice_starts_once() {
        let (mut manager, controller, _, _) = manager_with(quiet_config());
        let (_, first) = collector();
        let (_, second) = collector();

        assert!(manager.start_listening("command", first));
        assert!(manager.start_listening("command", second));
        assert_eq!(controller.starts(), 1);
        assert_eq!(controller.created(), 1);
    }

    #[test]
    fn test_new_target_stops_previous_first() {
        let (mut manager, controller, _, _) = manager_with(quiet_config());
        let (_, first) = collector();
        let (_, second) = collector();
        let events = manager.subscribe();

        manager.start_listening("title", first);
        manager.start_listening("step", second);

        assert_eq!(manager.active_target(), Some("step"));
        assert_eq!(controller.stops(), 1);
        let stopped: Vec<_> = events
            .drain()
            .filter(|e| matches!(e, SessionEvent::Stopped { .. }))
            .collect();
        assert_eq!(
            stopped,
            vec![SessionEvent::Stopped {
                target: "title".to_string(),
                reason: StopReason::Requested
            }]
        );
    }

    #[test]
    fn test_final_result_reaches_callback() {
        let (mut manager, controller, clock, _) = manager_with(quiet_config());
        let (seen, callback) = collector();
        let events = manager.subscribe();
        manager.start_listening("command", callback);
        manager.process_pending_events();
        let session = manager.session().unwrap();
        assert_eq!(session.target(), "command");
        assert_eq!(session.started_at(), clock.now());
        assert!(!session.continuous());

        controller.say("next step");
        manager.process_pending_events();
        assert_eq!(*seen.lock().unwrap(), vec!["next step".to_string()]);

        let statuses: Vec<_> = events
            .drain()
            .filter_map(|e| match e {
                SessionEvent::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert!(statuses.ends_with(&[
            SessionStatus::Processing,
            SessionStatus::Success,
            SessionStatus::Idle
        ]));
    }

    #[test]
    fn test_single_utterance_session_ends() {
        let (mut manager, controller, _, feedback) = manager_with(quiet_config());
        let (seen, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        assert!(controller.say("next step"));
        manager.process_pending_events();

        assert_eq!(manager.status(), SessionStatus::Idle);
        assert!(!manager.is_active());
        assert!(!manager.holds_engine());
        assert!(!controller.is_running());
        assert!(!controller.say("previous step"));
        manager.process_pending_events();
        assert_eq!(seen.lock().unwrap().len(), 1);
        let tones: Vec<_> = feedback
            .records()
            .into_iter()
            .filter(|r| matches!(r, FeedbackRecord::Tone(_)))
            .collect();
        assert_eq!(
            tones,
            vec![FeedbackRecord::Tone(Tone::Start), FeedbackRecord::Tone(Tone::Success)]
        );
    }

    #[test]
    fn test_failed_command_settles_to_idle() {
        let (mut manager, controller, _, feedback) = manager_with(quiet_config());
        let callback: ResultCallback = Box::new(|_: &str| false);
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.say("st materail flor");
        manager.process_pending_events();

        assert_eq!(manager.status(), SessionStatus::Idle);
        assert!(!manager.is_active());
        assert!(feedback.records().contains(&FeedbackRecord::Tone(Tone::Failure)));
    }

    #[test]
    fn test_stop_flushes_pending_interim_once() {
        let (mut manager, controller, _, _) = manager_with(quiet_config());
        let (seen, callback) = collector();
        manager.start_listening("step", callback);
        manager.process_pending_events();

        controller.emit_result(TranscriptResult::interim("mix the"));
        manager.process_pending_events();
        assert!(manager.stop_listening());
        assert!(manager.stop_listening());
        manager.process_pending_events();

        assert_eq!(*seen.lock().unwrap(), vec!["mix the".to_string()]);
    }

    #[test]
    fn test_no_speech_retry_delay_grows_then_gives_up() {
        let (mut manager, controller, clock, _) = manager_with(quiet_config());
        let events = manager.subscribe();
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        let mut delays = Vec::new();
        for _ in 0..5 {
            controller.fail(RecognitionErrorKind::NoSpeech);
            manager.process_pending_events();
            assert!(manager.retry_scheduled());
            let session = manager.session().unwrap();
            let attempt = delays.len() as u32 + 1;
            assert_eq!(session.retry_count(), attempt);
            assert!((session.backoff_factor() - 1.5f64.powi(attempt as i32)).abs() < 1e-9);
            for event in events.drain() {
                if let SessionEvent::RetryScheduled { delay, .. } = event {
                    delays.push(delay);
                }
            }
            let wait = manager.next_deadline().unwrap() - clock.now();
            clock.advance(wait);
            manager.poll_timers();
            manager.process_pending_events();
        }

        assert_eq!(delays.len(), 5);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(delays[0], Duration::from_millis(1500));

        controller.fail(RecognitionErrorKind::NoSpeech);
        manager.process_pending_events();
        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(!manager.retry_scheduled());
        assert!(!manager.is_active());
        assert_eq!(controller.starts(), 6);
    }

    #[test]
    fn test_network_retry_uses_doubled_base() {
        let config = quiet_config();
        assert_eq!(
            retry_delay(&config, 0, ErrorClass::SlowRecoverable),
            Duration::from_millis(3000)
        );
        assert_eq!(
            retry_delay(&config, 1, ErrorClass::Transient),
            Duration::from_millis(2250)
        );
    }

    #[test]
    fn test_permission_error_is_fatal() {
        let (mut manager, controller, _, feedback) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.fail(RecognitionErrorKind::NotAllowed);
        manager.process_pending_events();

        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(!manager.retry_scheduled());
        assert!(!manager.holds_engine());
        assert!(feedback
            .notices()
            .iter()
            .any(|(m, s)| m.contains("Microphone access") && *s == Severity::Error));
    }

    #[test]
    fn test_unknown_error_retries_once() {
        let (mut manager, controller, clock, _) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.fail(RecognitionErrorKind::Unknown("bad-grammar".into()));
        manager.process_pending_events();
        assert!(manager.retry_scheduled());

        clock.advance_ms(2_000);
        manager.poll_timers();
        manager.process_pending_events();
        assert!(controller.is_running());

        controller.fail(RecognitionErrorKind::Unknown("bad-grammar".into()));
        manager.process_pending_events();
        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(!manager.retry_scheduled());
    }

    #[test]
    fn test_retry_recreates_desynced_engine() {
        let (mut manager, controller, clock, _) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.fail(RecognitionErrorKind::Aborted);
        manager.process_pending_events();
        controller.desync_running();

        clock.advance_ms(1_500);
        manager.poll_timers();
        manager.process_pending_events();

        assert_eq!(controller.created(), 2);
        assert!(controller.is_running());
        assert_eq!(manager.status(), SessionStatus::Listening);
    }

    #[test]
    fn test_stop_cancels_scheduled_retry() {
        let (mut manager, controller, clock, _) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.fail(RecognitionErrorKind::NoSpeech);
        manager.process_pending_events();
        assert!(manager.retry_scheduled());

        manager.stop_listening();
        assert!(manager.next_deadline().is_none());
        clock.advance_ms(60_000);
        assert_eq!(manager.poll_timers(), 0);
        assert!(!controller.is_running());
        assert_eq!(controller.starts(), 1);
    }

    #[test]
    fn test_silence_timer_stops_session() {
        let (mut manager, controller, clock, _) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        clock.advance_ms(9_000);
        controller.emit_result(TranscriptResult::interim("add"));
        manager.process_pending_events();
        clock.advance_ms(9_000);
        assert_eq!(manager.poll_timers(), 0);

        clock.advance_ms(1_000);
        assert_eq!(manager.poll_timers(), 1);
        assert!(!manager.is_active());
        assert!(!controller.is_running());
    }

    #[test]
    fn test_max_duration_stops_despite_activity() {
        let mut config = quiet_config();
        config.continuous = true;
        let (mut manager, controller, clock, _) = manager_with(config);
        let (_, callback) = collector();
        manager.start_listening("step", callback);
        manager.process_pending_events();

        for _ in 0..12 {
            clock.advance_ms(5_000);
            controller.say("keep going");
            manager.process_pending_events();
            manager.poll_timers();
        }
        assert!(!manager.is_active());
        assert_eq!(manager.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_continuous_mode_restarts_after_end() {
        let mut config = quiet_config();
        config.continuous = true;
        let (mut manager, controller, _, _) = manager_with(config);
        let (seen, callback) = collector();
        manager.start_listening("step", callback);
        manager.process_pending_events();

        controller.say("first");
        controller.end();
        manager.process_pending_events();
        assert!(controller.is_running());
        assert_eq!(manager.status(), SessionStatus::Listening);

        controller.say("second");
        manager.process_pending_events();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_stop_all_releases_engine_even_when_idle() {
        let (mut manager, controller, _, feedback) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        manager.on_visibility_change(true);
        assert!(!manager.holds_engine());
        assert!(!controller.is_running());
        assert_eq!(controller.aborts(), 1);

        manager.stop_all();
        assert_eq!(manager.status(), SessionStatus::Idle);
        assert!(feedback
            .records()
            .contains(&FeedbackRecord::SpeechCancelled));
    }

    #[test]
    fn test_stale_events_are_dropped() {
        let (mut manager, controller, _, _) = manager_with(quiet_config());
        let (seen, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();
        let old_generation = manager.generation;

        manager.stop_listening();
        manager.handle_message(EngineMessage {
            generation: old_generation,
            event: EngineEvent::Result(TranscriptResult::final_text("ghost", 0.9)),
        });
        assert!(seen.lock().unwrap().is_empty());
        assert!(!controller.is_running());
    }

    #[test]
    fn test_malformed_confidence_becomes_error_status() {
        let (mut manager, controller, _, _) = manager_with(quiet_config());
        let (seen, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.emit_result(TranscriptResult::final_text("next step", f32::NAN));
        manager.process_pending_events();
        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(seen.lock().unwrap().is_empty());
        assert!(manager.is_active());

        // Natural end after a bad result is not a fatal stop
        controller.end();
        manager.process_pending_events();
        assert_eq!(manager.status(), SessionStatus::Idle);
        assert!(!manager.is_active());
    }

    #[test]
    fn test_start_failure_reports_error() {
        let (mut manager, controller, _, feedback) = manager_with(quiet_config());
        let (_, callback) = collector();
        controller.fail_next_start(EngineError::Failed("device busy".into()));

        assert!(!manager.start_listening("command", callback));
        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(!manager.is_active());
        assert!(!manager.holds_engine());
        assert_eq!(
            feedback.notices(),
            vec![(MSG_UNKNOWN.to_string(), Severity::Error)]
        );
    }

    #[test]
    fn test_failed_retry_start_is_fatal() {
        let (mut manager, controller, clock, feedback) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.fail(RecognitionErrorKind::NoSpeech);
        manager.process_pending_events();
        assert!(manager.retry_scheduled());
        feedback.clear();

        controller.fail_next_start(EngineError::Failed("device busy".into()));
        clock.advance_ms(1_500);
        assert_eq!(manager.poll_timers(), 1);

        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(!manager.is_active());
        assert!(!manager.retry_scheduled());
        assert!(!manager.holds_engine());
        assert_eq!(feedback.notices()[0], (MSG_UNKNOWN.to_string(), Severity::Error));
    }

    #[test]
    fn test_failed_continuous_restart_is_fatal() {
        let mut config = quiet_config();
        config.continuous = true;
        let (mut manager, controller, _, feedback) = manager_with(config);
        let (seen, callback) = collector();
        manager.start_listening("step", callback);
        manager.process_pending_events();

        controller.say("first");
        manager.process_pending_events();
        controller.fail_next_start(EngineError::Failed("device busy".into()));
        controller.end();
        manager.process_pending_events();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(!manager.is_active());
        assert!(!controller.is_running());
        assert!(feedback
            .notices()
            .contains(&(MSG_UNKNOWN.to_string(), Severity::Error)));
    }

    #[test]
    fn test_audio_capture_error_reports_hardware() {
        let (mut manager, controller, _, feedback) = manager_with(quiet_config());
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.fail(RecognitionErrorKind::AudioCapture);
        manager.process_pending_events();

        assert_eq!(manager.status(), SessionStatus::Error);
        assert!(!manager.retry_scheduled());
        assert!(!manager.holds_engine());
        assert_eq!(
            feedback.notices(),
            vec![(MSG_HARDWARE.to_string(), Severity::Error)]
        );
    }

    #[test]
    fn test_network_error_retries_with_warning() {
        let (mut manager, controller, clock, feedback) = manager_with(quiet_config());
        let events = manager.subscribe();
        let (_, callback) = collector();
        manager.start_listening("command", callback);
        manager.process_pending_events();

        controller.fail(RecognitionErrorKind::Network);
        manager.process_pending_events();

        let delays: Vec<_> = events
            .drain()
            .filter_map(|e| match e {
                SessionEvent::RetryScheduled { delay, .. } => Some(delay),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![Duration::from_millis(3000)]);
        assert_eq!(manager.next_deadline(), Some(clock.now() + Duration::from_millis(3000)));
        assert!(feedback
            .notices()
            .iter()
            .any(|(m, s)| m.starts_with("Network problem") && *s == Severity::Warning));
        assert_eq!(manager.status(), SessionStatus::Listening);
        assert!(manager.is_active());
    }
}
