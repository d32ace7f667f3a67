//! Transcript normalization
//!
//! Turns what the recognizer heard into the canonical command string the
//! dispatcher matches against. Passes run in a fixed order, each assuming
//! the previous ones already ran:
//!
//! 1. lowercase, trim, collapse whitespace, drop trailing punctuation
//! 2. spelled-out acronyms ("s.o.p", "ess oh pee") become spaced letters
//! 3. common mishearings are corrected ("ad step" -> "add step")
//! 4. variants of the product acronym fold to `sop`
//!
//! Normalization never fails. Text nothing applies to passes through.

use regex::{NoExpand, Regex};

use crate::config::Correction;

/// Phonetic letter names accepted when an utterance spells letters out
const LETTER_NAMES: &[(&str, char)] = &[
    ("ay", 'a'),
    ("bee", 'b'),
    ("cee", 'c'),
    ("dee", 'd'),
    ("ef", 'f'),
    ("eff", 'f'),
    ("gee", 'g'),
    ("aitch", 'h'),
    ("jay", 'j'),
    ("kay", 'k'),
    ("el", 'l'),
    ("ell", 'l'),
    ("em", 'm'),
    ("en", 'n'),
    ("oh", 'o'),
    ("pee", 'p'),
    ("cue", 'q'),
    ("ar", 'r'),
    ("ess", 's'),
    ("es", 's'),
    ("tee", 't'),
    ("vee", 'v'),
    ("ex", 'x'),
    ("zee", 'z'),
    ("zed", 'z'),
];

/// Misheard phrase -> intended phrase, applied in this order
const MISHEARINGS: &[(&str, &str)] = &[
    ("ad step", "add step"),
    ("at step", "add step"),
    ("had step", "add step"),
    ("and step", "add step"),
    ("add stop", "add step"),
    ("add steps", "add step"),
    ("ad material", "add material"),
    ("at material", "add material"),
    ("had material", "add material"),
    ("and material", "add material"),
    ("add materials", "add material"),
    ("add a material", "add material"),
    ("add a step", "add step"),
    ("the lead step", "delete step"),
    ("delete stop", "delete step"),
    ("remove stop", "remove step"),
    ("the lead material", "delete material"),
    ("delete materials", "delete material"),
    ("remove materials", "remove material"),
    ("next stop", "next step"),
    ("previous stop", "previous step"),
    ("go back", "previous"),
    ("go forward", "next"),
    ("set tidal", "set title"),
    ("set tittle", "set title"),
    ("said title", "set title"),
];

/// Spellings of the product acronym, longest first
const DOMAIN_TERMS: &[(&str, &str)] = &[
    ("standard operating procedures", "sops"),
    ("standard operating procedure", "sop"),
    ("standard operation procedure", "sop"),
    ("s o p", "sop"),
    ("s op", "sop"),
    ("so p", "sop"),
    ("sahp", "sop"),
    ("sawp", "sop"),
];

/// Spoken punctuation for dictation, longest first
const SPOKEN_PUNCTUATION: &[(&str, &str)] = &[
    ("exclamation point", "!"),
    ("exclamation mark", "!"),
    ("question mark", "?"),
    ("new paragraph", "\n\n"),
    ("full stop", "."),
    ("semicolon", ";"),
    ("new line", "\n"),
    ("period", "."),
    ("comma", ","),
    ("colon", ":"),
];

struct Rule {
    pattern: Regex,
    replacement: String,
}

fn word_rule(phrase: &str, replacement: &str) -> Option<Rule> {
    let source = format!(r"\b{}\b", regex::escape(phrase));
    match Regex::new(&source) {
        Ok(pattern) => Some(Rule {
            pattern,
            replacement: replacement.to_string(),
        }),
        Err(e) => {
            log::warn!("[normalize] skipping rule {:?}: {}", phrase, e);
            None
        }
    }
}

pub struct Normalizer {
    corrections: Vec<Rule>,
    domain_terms: Vec<Rule>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Normalizer {
    /// Built-in tables plus `extra` corrections, which run after them
    pub fn new(extra: &[Correction]) -> Self {
        let corrections = MISHEARINGS
            .iter()
            .map(|(heard, meant)| (heard.to_string(), meant.to_string()))
            .chain(
                extra
                    .iter()
                    .map(|c| (clean(&c.heard), clean(&c.meant))),
            )
            .filter_map(|(heard, meant)| word_rule(&heard, &meant))
            .collect();
        let domain_terms = DOMAIN_TERMS
            .iter()
            .filter_map(|(variant, canonical)| word_rule(variant, canonical))
            .collect();
        Self {
            corrections,
            domain_terms,
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        let text = clean(raw);
        if text.is_empty() {
            return text;
        }

        let text = spell_acronym(&text).unwrap_or(text);
        let text = apply_rules(&self.corrections, text);
        apply_rules(&self.domain_terms, text)
    }
}

/// Pass 1: lowercase, single spaces, no trailing sentence punctuation
fn clean(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let collapsed = lower.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', '!', '?', ','])
        .trim()
        .to_string()
}

/// Pass 2: only when the whole utterance is letters separated by periods
/// or spaces. Returns the letters joined by single spaces.
fn spell_acronym(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text
        .split(|c: char| c == '.' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() < 2 {
        return None;
    }

    let letters = tokens
        .iter()
        .map(|token| letter_for(token))
        .collect::<Option<Vec<char>>>()?;

    let spelled: Vec<String> = letters.iter().map(|c| c.to_string()).collect();
    Some(spelled.join(" "))
}

fn letter_for(token: &str) -> Option<char> {
    let mut chars = token.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return c.is_ascii_alphabetic().then_some(c);
    }
    LETTER_NAMES
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, letter)| *letter)
}

/// Each rule replaces all non-overlapping matches; text a rule inserted
/// is not rescanned by that same rule.
fn apply_rules(rules: &[Rule], text: String) -> String {
    rules.iter().fold(text, |acc, rule| {
        rule.pattern
            .replace_all(&acc, NoExpand(&rule.replacement))
            .into_owned()
    })
}

/// Replace spoken punctuation words in dictated text with symbols.
/// "mix well comma then stir period" -> "mix well, then stir."
pub fn apply_spoken_punctuation(text: &str) -> String {
    let mut result = text.split_whitespace().collect::<Vec<_>>().join(" ");

    for (phrase, symbol) in SPOKEN_PUNCTUATION {
        let source = format!(r"(?i)\s*\b{}\b", regex::escape(phrase));
        let Ok(pattern) = Regex::new(&source) else {
            continue;
        };
        result = pattern.replace_all(&result, NoExpand(symbol)).into_owned();
    }

    // Line breaks swallow the spaces around them
    result = result
        .split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");

    result.trim().to_string()
}
