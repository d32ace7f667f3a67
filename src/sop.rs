//! Built-in SOP editing commands
//!
//! The draft is a plain in-memory document. Persisting it is the host's
//! business; `save` only raises a flag the host polls.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{resolve_item_index, CommandDefinition, CommandMatch};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SopDraft {
    pub title: Option<String>,
    pub steps: Vec<String>,
    pub materials: Vec<String>,
    /// Index of the step being edited
    pub current_step: usize,
    pub save_requested: bool,
}

pub type SharedDraft = Arc<Mutex<SopDraft>>;

pub fn shared_draft() -> SharedDraft {
    Arc::new(Mutex::new(SopDraft::default()))
}

fn lock(draft: &SharedDraft) -> MutexGuard<'_, SopDraft> {
    match draft.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SopDraft {
    pub fn add_step(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.steps.push(text.to_string());
        self.current_step = self.steps.len() - 1;
        true
    }

    pub fn add_material(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        self.materials.push(name.to_string());
        true
    }

    pub fn remove_step(&mut self, reference: &str) -> Option<String> {
        let index = resolve_item_index(reference, &self.steps)?;
        let removed = self.steps.remove(index);
        if self.current_step >= self.steps.len() {
            self.current_step = self.steps.len().saturating_sub(1);
        }
        Some(removed)
    }

    pub fn remove_material(&mut self, reference: &str) -> Option<String> {
        let index = resolve_item_index(reference, &self.materials)?;
        Some(self.materials.remove(index))
    }

    pub fn set_title(&mut self, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }
        self.title = Some(title.to_string());
        true
    }

    pub fn next_step(&mut self) -> bool {
        if self.current_step + 1 < self.steps.len() {
            self.current_step += 1;
            true
        } else {
            false
        }
    }

    pub fn previous_step(&mut self) -> bool {
        if self.current_step > 0 && !self.steps.is_empty() {
            self.current_step -= 1;
            true
        } else {
            false
        }
    }

    pub fn go_to_step(&mut self, reference: &str) -> bool {
        match resolve_item_index(reference, &self.steps) {
            Some(index) => {
                self.current_step = index;
                true
            }
            None => false,
        }
    }

    /// Whatever a fuzzy match left: the words after `anchor`
    fn trailing_argument<'a>(text: &'a str, anchor: &str) -> Option<&'a str> {
        text.split_once(anchor)
            .map(|(_, rest)| rest.trim())
            .filter(|rest| !rest.is_empty())
    }
}

/// Captured argument on an exact match, else the text after `anchor`
fn argument<'a>(text: &'a str, m: Option<&'a CommandMatch>, anchor: &str) -> Option<&'a str> {
    match m {
        Some(m) => m.group(1),
        None => SopDraft::trailing_argument(text, anchor),
    }
}

/// The SOP editing commands, in dispatch order
pub fn builtin_commands(draft: &SharedDraft) -> Result<Vec<CommandDefinition>, regex::Error> {
    let mut commands = Vec::new();

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("add step", r"^add step (.+)$")?
            .keywords(&["add", "step"])
            .description("Append a step and make it current")
            .example("add step pour water into the cup")
            .handler(move |text, m| match argument(text, m, "step ") {
                Some(arg) => lock(&d).add_step(arg),
                None => false,
            }),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("add material", r"^add material (.+)$")?
            .keywords(&["add", "material"])
            .description("Append a material")
            .example("add material nitrile gloves")
            .handler(move |text, m| match argument(text, m, "material ") {
                Some(arg) => lock(&d).add_material(arg),
                None => false,
            }),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("delete step", r"^(?:delete|remove) step (.+)$")?
            .keywords(&["delete", "step"])
            .description("Remove a step by number, name or 'last'")
            .example("delete step 2")
            .example("remove step last")
            .handler(move |text, m| match argument(text, m, "step ") {
                Some(arg) => lock(&d).remove_step(arg).is_some(),
                None => false,
            }),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("delete material", r"^(?:delete|remove) material (.+)$")?
            .keywords(&["delete", "material"])
            .description("Remove a material by number, name or 'last'")
            .example("remove material last")
            .handler(move |text, m| match argument(text, m, "material ") {
                Some(arg) => lock(&d).remove_material(arg).is_some(),
                None => false,
            }),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("set title", r"^set (?:the )?title (?:to )?(.+)$")?
            .alternative(r"^(?:title|call it) (.+)$")?
            .keywords(&["set", "title"])
            .description("Set the SOP title")
            .example("set title to cleaning the fume hood")
            .handler(move |text, m| match argument(text, m, "title ") {
                Some(arg) => lock(&d).set_title(arg.strip_prefix("to ").unwrap_or(arg)),
                None => false,
            }),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("go to step", r"^go to step (.+)$")?
            .description("Jump to a step")
            .example("go to step 3")
            .handler(move |_, m| match m.and_then(|m| m.group(1)) {
                Some(arg) => lock(&d).go_to_step(arg),
                None => false,
            }),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("next step", r"^next(?: step)?$")?
            .keywords(&["next", "step"])
            .description("Move to the next step")
            .example("next step")
            .handler(move |_, _| lock(&d).next_step()),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("previous step", r"^previous(?: step)?$")?
            .alternative(r"^back$")?
            .keywords(&["previous", "step"])
            .description("Move to the previous step")
            .example("previous step")
            .handler(move |_, _| lock(&d).previous_step()),
    );

    let d = Arc::clone(draft);
    commands.push(
        CommandDefinition::new("save sop", r"^save(?: (?:the )?sop)?$")?
            .keywords(&["save", "sop"])
            .description("Save the draft")
            .example("save sop")
            .handler(move |_, _| {
                lock(&d).save_requested = true;
                true
            }),
    );

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandRegistry, DispatchOutcome, MatchKind};

    fn registry(draft: &SharedDraft) -> CommandRegistry {
        let mut registry = CommandRegistry::new(0.7);
        for command in builtin_commands(draft).unwrap() {
            registry.register(command);
        }
        registry
    }

    #[test]
    fn test_add_and_remove_materials() {
        let draft = shared_draft();
        let mut registry = registry(&draft);
        for name in ["gloves", "beaker", "distilled water"] {
            assert!(registry.dispatch(&format!("add material {}", name)).is_success());
        }

        assert!(registry.dispatch("remove material last").is_success());
        assert_eq!(lock(&draft).materials, vec!["gloves", "beaker"]);
        assert!(registry.dispatch("delete material 1").is_success());
        assert_eq!(lock(&draft).materials, vec!["beaker"]);
        assert!(!registry.dispatch("delete material 5").is_success());
    }

    #[test]
    fn test_steps_and_navigation() {
        let draft = shared_draft();
        let mut registry = registry(&draft);
        registry.dispatch("add step weigh the sample");
        registry.dispatch("add step dissolve in water");
        registry.dispatch("add step filter");
        assert_eq!(lock(&draft).current_step, 2);

        assert!(!registry.dispatch("next step").is_success());
        assert!(registry.dispatch("previous").is_success());
        assert!(registry.dispatch("previous step").is_success());
        assert_eq!(lock(&draft).current_step, 0);
        assert!(!registry.dispatch("back").is_success());

        assert!(registry.dispatch("go to step third").is_success());
        assert_eq!(lock(&draft).current_step, 2);

        assert!(registry.dispatch("delete step filter").is_success());
        assert_eq!(lock(&draft).steps.len(), 2);
        assert_eq!(lock(&draft).current_step, 1);
    }

    #[test]
    fn test_set_title_and_save() {
        let draft = shared_draft();
        let mut registry = registry(&draft);
        assert!(registry.dispatch("set title to fume hood cleaning").is_success());
        assert!(registry.dispatch("save sop").is_success());
        let draft = lock(&draft);
        assert_eq!(draft.title.as_deref(), Some("fume hood cleaning"));
        assert!(draft.save_requested);
    }

    #[test]
    fn test_fuzzy_match_uses_trailing_words() {
        let draft = shared_draft();
        let mut registry = registry(&draft);
        let outcome = registry.dispatch("please add step rinse twice");
        assert!(matches!(
            outcome,
            DispatchOutcome::Handled { kind: MatchKind::Fuzzy, success: true, .. }
        ));
        assert_eq!(lock(&draft).steps, vec!["rinse twice"]);
    }

    #[test]
    fn test_fuzzy_match_without_argument_fails_cleanly() {
        let draft = shared_draft();
        let mut registry = registry(&draft);
        let outcome = registry.dispatch("add the step");
        assert!(matches!(
            outcome,
            DispatchOutcome::Handled { kind: MatchKind::Fuzzy, success: false, .. }
        ));
        assert!(lock(&draft).steps.is_empty());
    }
}
