//! Voice command recognition for SOP authoring
//!
//! Speech engine events go through the `session` manager, final
//! transcripts through the command `pipeline`: normalize, merge with a
//! paused utterance, then dispatch against the command registry.

pub mod clock;
pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod fuzzy;
pub mod normalize;
pub mod pipeline;
pub mod service;
pub mod session;
pub mod sim;
pub mod sop;

pub use command::{CommandDefinition, CommandRegistry, DispatchOutcome, MatchKind};
pub use config::Config;
pub use pipeline::{CommandPipeline, PipelineOutcome};
pub use session::{SessionEvent, SessionManager, SessionStatus};
