//! Simulated recognizer
//!
//! Behaves like a browser recognizer as far as the session manager can
//! tell: it refuses a second `start` while running, reports `Ended` after
//! every stop or error, and emits interim results word by word before the
//! final one. A `SimController` plays the part of the speaker.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::{
    EngineEventSink, EngineFactory, RecognitionEngine, RecognitionErrorKind, TranscriptResult,
};
use crate::error::EngineError;

#[derive(Debug, Default)]
struct SimShared {
    sink: Option<EngineEventSink>,
    running: bool,
    created: usize,
    starts: usize,
    stops: usize,
    aborts: usize,
    fail_next_start: Option<EngineError>,
}

fn lock(shared: &Mutex<SimShared>) -> MutexGuard<'_, SimShared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct SimEngineFactory {
    shared: Arc<Mutex<SimShared>>,
    supported: bool,
}

impl SimEngineFactory {
    pub fn new() -> (Self, SimController) {
        let shared = Arc::new(Mutex::new(SimShared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
                supported: true,
            },
            SimController { shared },
        )
    }

    /// A platform without speech recognition
    pub fn unsupported() -> (Self, SimController) {
        let (mut factory, controller) = Self::new();
        factory.supported = false;
        (factory, controller)
    }
}

impl EngineFactory for SimEngineFactory {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn create(&mut self, sink: EngineEventSink) -> Result<Box<dyn RecognitionEngine>, EngineError> {
        if !self.supported {
            return Err(EngineError::Unsupported);
        }
        let mut shared = lock(&self.shared);
        shared.created += 1;
        shared.running = false;
        let generation = sink.generation();
        shared.sink = Some(sink);
        Ok(Box::new(SimEngine {
            shared: Arc::clone(&self.shared),
            generation,
        }))
    }
}

struct SimEngine {
    shared: Arc<Mutex<SimShared>>,
    generation: u64,
}

impl SimEngine {
    /// Only the most recently created handle drives the shared device
    fn is_current(&self, shared: &SimShared) -> bool {
        shared
            .sink
            .as_ref()
            .map(|s| s.generation() == self.generation)
            .unwrap_or(false)
    }
}

impl RecognitionEngine for SimEngine {
    fn start(&mut self) -> Result<(), EngineError> {
        let mut shared = lock(&self.shared);
        if let Some(err) = shared.fail_next_start.take() {
            return Err(err);
        }
        if !self.is_current(&shared) {
            return Err(EngineError::Failed("stale engine handle".to_string()));
        }
        if shared.running {
            return Err(EngineError::InvalidState);
        }
        shared.running = true;
        shared.starts += 1;
        if let Some(sink) = &shared.sink {
            sink.started();
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.stops += 1;
        if self.is_current(&shared) && shared.running {
            shared.running = false;
            if let Some(sink) = &shared.sink {
                sink.ended();
            }
        }
    }

    fn abort(&mut self) {
        let mut shared = lock(&self.shared);
        shared.aborts += 1;
        if self.is_current(&shared) && shared.running {
            shared.running = false;
            if let Some(sink) = &shared.sink {
                sink.ended();
            }
        }
    }
}

/// Drives the simulated recognizer from the speaker's side
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Mutex<SimShared>>,
}

impl SimController {
    /// Speak an utterance: interim prefixes, then the final transcript.
    /// Returns false when the engine is not listening.
    pub fn say(&self, text: &str) -> bool {
        self.say_with_confidence(text, 0.9)
    }

    pub fn say_with_confidence(&self, text: &str, confidence: f32) -> bool {
        let shared = lock(&self.shared);
        let Some(sink) = shared.sink.as_ref().filter(|_| shared.running) else {
            return false;
        };
        let words: Vec<&str> = text.split_whitespace().collect();
        for n in 1..words.len() {
            sink.result(TranscriptResult::interim(words[..n].join(" ")));
        }
        sink.result(TranscriptResult::final_text(text, confidence));
        true
    }

    /// Emit a raw result as-is
    pub fn emit_result(&self, result: TranscriptResult) -> bool {
        let shared = lock(&self.shared);
        match shared.sink.as_ref().filter(|_| shared.running) {
            Some(sink) => {
                sink.result(result);
                true
            }
            None => false,
        }
    }

    /// Report an error; the engine ends right after, like a browser does
    pub fn fail(&self, kind: RecognitionErrorKind) {
        let mut shared = lock(&self.shared);
        if !shared.running {
            return;
        }
        shared.running = false;
        if let Some(sink) = &shared.sink {
            sink.error(kind);
            sink.ended();
        }
    }

    /// The engine ends on its own (end of speech, platform timeout)
    pub fn end(&self) {
        let mut shared = lock(&self.shared);
        if !shared.running {
            return;
        }
        shared.running = false;
        if let Some(sink) = &shared.sink {
            sink.ended();
        }
    }

    /// Make the next `start` call fail with `err`
    pub fn fail_next_start(&self, err: EngineError) {
        lock(&self.shared).fail_next_start = Some(err);
    }

    /// Pretend the engine kept running although it was told to stop
    pub fn desync_running(&self) {
        lock(&self.shared).running = true;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    pub fn created(&self) -> usize {
        lock(&self.shared).created
    }

    pub fn starts(&self) -> usize {
        lock(&self.shared).starts
    }

    pub fn stops(&self) -> usize {
        lock(&self.shared).stops
    }

    pub fn aborts(&self) -> usize {
        lock(&self.shared).aborts
    }
}
