//! Command registry and dispatcher
//!
//! Normalized utterances are resolved in two phases:
//! 1. Exact - each command's primary pattern, then its alternatives, in
//!    registration order. The first match runs the handler with captures.
//! 2. Fuzzy - only when nothing matched exactly. The first command whose
//!    keyword score reaches the threshold runs, without captures.
//!
//! When neither phase matches, the input is checked against a table of
//! known mishearings to offer a "did you mean" suggestion.

use regex::{Regex, RegexBuilder};

use crate::config::CommandsConfig;
use crate::fuzzy::keyword_score;

/// Canonical command -> phrases people say (or get heard saying) instead
const SUGGESTIONS: &[(&str, &[&str])] = &[
    ("add step", &["new step", "insert step", "another step", "create step"]),
    (
        "add material",
        &["new material", "insert material", "another material", "need material"],
    ),
    ("delete step", &["erase step", "drop step", "cancel step"]),
    ("delete material", &["erase material", "drop material", "cancel material"]),
    ("previous step", &["last step", "back step", "step back"]),
    ("next step", &["following step", "skip step", "forward step"]),
    ("set title", &["change title", "rename", "call it"]),
    ("save sop", &["save it", "store", "keep it"]),
];

/// Spoken ordinals and number words accepted as item positions
const ORDINALS: &[(&str, usize)] = &[
    ("first", 1),
    ("second", 2),
    ("third", 3),
    ("fourth", 4),
    ("fifth", 5),
    ("sixth", 6),
    ("seventh", 7),
    ("eighth", 8),
    ("ninth", 9),
    ("tenth", 10),
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
];

/// Match data handed to a handler on an exact match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMatch {
    /// The whole matched text
    pub full: String,
    /// Capture groups 1.., `None` for groups that did not participate
    pub groups: Vec<Option<String>>,
}

impl CommandMatch {
    fn from_captures(caps: &regex::Captures<'_>) -> Self {
        Self {
            full: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
            groups: caps
                .iter()
                .skip(1)
                .map(|g| g.map(|m| m.as_str().trim().to_string()))
                .collect(),
        }
    }

    /// Capture group by regex number (1-based)
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|g| g.as_deref())
    }
}

/// Handler invoked with the utterance and, on exact matches, the captures.
/// Returns whether the command succeeded.
pub type CommandHandler = Box<dyn FnMut(&str, Option<&CommandMatch>) -> bool + Send>;

pub struct CommandDefinition {
    name: String,
    primary: Regex,
    alternatives: Vec<Regex>,
    keywords: Vec<String>,
    examples: Vec<String>,
    description: String,
    handler: CommandHandler,
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            primary: compile(pattern)?,
            alternatives: Vec::new(),
            keywords: Vec::new(),
            examples: Vec::new(),
            description: String::new(),
            handler: Box::new(|_, _| true),
        })
    }

    pub fn alternative(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.alternatives.push(compile(pattern)?);
        Ok(self)
    }

    pub fn keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_lowercase()).collect();
        self
    }

    pub fn example(mut self, example: impl Into<String>) -> Self {
        self.examples.push(example.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, Option<&CommandMatch>) -> bool + Send + 'static,
    {
        self.handler = Box::new(handler);
        self
    }

    fn exact_match(&self, text: &str) -> Option<CommandMatch> {
        std::iter::once(&self.primary)
            .chain(self.alternatives.iter())
            .find_map(|pattern| pattern.captures(text))
            .map(|caps| CommandMatch::from_captures(&caps))
    }
}

impl std::fmt::Debug for CommandDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDefinition")
            .field("name", &self.name)
            .field("primary", &self.primary.as_str())
            .field("alternatives", &self.alternatives.len())
            .field("keywords", &self.keywords)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

/// Result of dispatching one utterance
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A command matched; `success` is what its handler returned
    Handled {
        name: String,
        kind: MatchKind,
        success: bool,
    },
    /// Nothing matched
    Unrecognized { suggestion: Option<String> },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Handled { success: true, .. })
    }
}

pub struct CommandRegistry {
    commands: Vec<CommandDefinition>,
    fuzzy_threshold: f32,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::from_config(&CommandsConfig::default())
    }
}

impl CommandRegistry {
    pub fn new(fuzzy_threshold: f32) -> Self {
        Self {
            commands: Vec::new(),
            fuzzy_threshold,
        }
    }

    pub fn from_config(config: &CommandsConfig) -> Self {
        Self::new(config.fuzzy_threshold)
    }

    /// Append a command. Earlier registrations win ties in both phases.
    pub fn register(&mut self, command: CommandDefinition) {
        log::debug!("[command] registered {}", command.name);
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn dispatch(&mut self, text: &str) -> DispatchOutcome {
        let text = text.trim();
        if text.is_empty() {
            return DispatchOutcome::Unrecognized { suggestion: None };
        }

        for command in self.commands.iter_mut() {
            if let Some(m) = command.exact_match(text) {
                let success = (command.handler)(text, Some(&m));
                log::info!("[command] {} (exact) -> {}", command.name, success);
                return DispatchOutcome::Handled {
                    name: command.name.clone(),
                    kind: MatchKind::Exact,
                    success,
                };
            }
        }

        let threshold = self.fuzzy_threshold;
        for command in self.commands.iter_mut() {
            if command.keywords.is_empty() {
                continue;
            }
            let score = keyword_score(text, &command.keywords);
            if score >= threshold {
                let success = (command.handler)(text, None);
                log::info!(
                    "[command] {} (fuzzy {:.2}) -> {}",
                    command.name,
                    score,
                    success
                );
                return DispatchOutcome::Handled {
                    name: command.name.clone(),
                    kind: MatchKind::Fuzzy,
                    success,
                };
            }
        }

        let suggestion = suggest(text);
        log::info!("[command] unrecognized {:?} (suggestion: {:?})", text, suggestion);
        DispatchOutcome::Unrecognized { suggestion }
    }

    /// One line per command: name, description and examples
    pub fn help_lines(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| {
                let mut line = c.name.clone();
                if !c.description.is_empty() {
                    line.push_str(" - ");
                    line.push_str(&c.description);
                }
                if !c.examples.is_empty() {
                    let quoted: Vec<String> =
                        c.examples.iter().map(|e| format!("\"{}\"", e)).collect();
                    line.push_str(&format!(" (e.g. {})", quoted.join(", ")));
                }
                line
            })
            .collect()
    }
}

/// Canonical command for a failed utterance containing a known variant
pub fn suggest(text: &str) -> Option<String> {
    let text = text.to_lowercase();
    SUGGESTIONS
        .iter()
        .find(|(_, variants)| variants.iter().any(|v| text.contains(v)))
        .map(|(canonical, _)| canonical.to_string())
}

/// Resolve a spoken item reference to a 0-based index.
///
/// Accepts `last`, 1-based numbers (digits, ordinals or number words)
/// and otherwise the first item whose name contains `arg`.
pub fn resolve_item_index<S: AsRef<str>>(arg: &str, items: &[S]) -> Option<usize> {
    let arg = arg.trim().to_lowercase();
    if arg.is_empty() || items.is_empty() {
        return None;
    }

    if arg == "last" || arg == "the last one" || arg == "last one" {
        return Some(items.len() - 1);
    }

    let position = arg.parse::<usize>().ok().or_else(|| {
        ORDINALS
            .iter()
            .find(|(word, _)| *word == arg)
            .map(|(_, n)| *n)
    });
    if let Some(n) = position {
        return (1..=items.len()).contains(&n).then(|| n - 1);
    }

    items
        .iter()
        .position(|item| item.as_ref().to_lowercase().contains(&arg))
}
