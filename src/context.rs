//! Pause/continuation context
//!
//! People pause mid-command ("add step" ... "rinse the beaker"). The
//! previous utterance is kept for a short window so the next one can be
//! glued onto it.

use std::time::{Duration, Instant};

use crate::clock::SharedClock;

pub struct PauseContext {
    last_command: Option<String>,
    last_timestamp: Option<Instant>,
    timeout: Duration,
    clock: SharedClock,
}

impl PauseContext {
    pub fn new(timeout: Duration, clock: SharedClock) -> Self {
        Self {
            last_command: None,
            last_timestamp: None,
            timeout,
            clock,
        }
    }

    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    /// Whether a previous command exists and is still inside the window
    fn within_window(&self) -> bool {
        match (&self.last_command, self.last_timestamp) {
            (Some(_), Some(at)) => self.clock.now().saturating_duration_since(at) < self.timeout,
            _ => false,
        }
    }

    /// Record `command` as the latest utterance. Returns true when it
    /// continues a previous one.
    pub fn update_context(&mut self, command: &str) -> bool {
        let continues = self.within_window();
        self.last_command = Some(command.to_string());
        self.last_timestamp = Some(self.clock.now());
        continues
    }

    /// `previous + " " + current` inside the window, else `current`
    pub fn get_combined_command(&self, current: &str) -> String {
        match &self.last_command {
            Some(previous) if self.within_window() => format!("{} {}", previous, current),
            _ => current.to_string(),
        }
    }

    pub fn reset_context(&mut self) {
        self.last_command = None;
        self.last_timestamp = None;
    }
}
