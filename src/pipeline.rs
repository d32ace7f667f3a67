//! Final transcript -> command pipeline
//!
//! normalize -> merge with pause context -> dispatch -> feedback.
//! Only notices are raised here; tones belong to the session that
//! delivered the transcript. A combined utterance that fails is retried as the current utterance
//! alone, so a stale half-command cannot swallow a complete one.

use crate::clock::SharedClock;
use crate::command::{CommandRegistry, DispatchOutcome};
use crate::config::Config;
use crate::context::PauseContext;
use crate::feedback::{Severity, SharedFeedback};
use crate::normalize::Normalizer;

/// What one utterance turned into
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// The normalized current utterance
    pub normalized: String,
    /// The text that produced `outcome`
    pub dispatched: String,
    pub outcome: DispatchOutcome,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

pub struct CommandPipeline {
    normalizer: Normalizer,
    context: PauseContext,
    registry: CommandRegistry,
    feedback: SharedFeedback,
}

impl CommandPipeline {
    pub fn new(
        config: &Config,
        registry: CommandRegistry,
        feedback: SharedFeedback,
        clock: SharedClock,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(&config.normalizer.corrections),
            context: PauseContext::new(config.commands.pause_timeout(), clock),
            registry,
            feedback,
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn context(&self) -> &PauseContext {
        &self.context
    }

    /// Run one final transcript. Returns `None` when nothing is left
    /// after normalization.
    pub fn process(&mut self, raw: &str) -> Option<PipelineOutcome> {
        let normalized = self.normalizer.normalize(raw);
        if normalized.is_empty() {
            log::debug!("[pipeline] empty transcript ignored");
            return None;
        }

        let combined = self.context.get_combined_command(&normalized);
        if self.context.update_context(&combined) {
            log::debug!("[pipeline] continuing previous command: {:?}", combined);
        }

        let mut dispatched = combined.clone();
        let mut outcome = self.registry.dispatch(&combined);
        if !outcome.is_success() && combined != normalized {
            log::debug!("[pipeline] retrying without context: {:?}", normalized);
            dispatched = normalized.clone();
            outcome = self.registry.dispatch(&normalized);
        }

        if outcome.is_success() {
            self.context.reset_context();
        }
        self.report(&dispatched, &outcome);

        Some(PipelineOutcome {
            normalized,
            dispatched,
            outcome,
        })
    }

    fn report(&self, text: &str, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled { success: true, .. } => {}
            DispatchOutcome::Handled {
                name,
                success: false,
                ..
            } => {
                self.feedback
                    .notify(&format!("Could not {}: \"{}\"", name, text), Severity::Error);
            }
            DispatchOutcome::Unrecognized {
                suggestion: Some(suggestion),
            } => {
                self.feedback
                    .notify(&format!("Did you mean '{}'?", suggestion), Severity::Warning);
            }
            DispatchOutcome::Unrecognized { suggestion: None } => {
                self.feedback.notify(
                    &format!("Command not recognized: \"{}\"", text),
                    Severity::Warning,
                );
            }
        }
    }
}
