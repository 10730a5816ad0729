//! Prompt assembly seam.
//!
//! Macro and template resolution belongs to the host application; the
//! engine only hands the resolved pieces to a [`PromptAssembler`].

use crate::context::ContextBlock;
use crate::ledger::ThreadEntry;

/// Everything a worker prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct PromptParts {
    pub instructions: Option<String>,
    /// Injected static, global, phase, team, agent and persistent blocks.
    pub context: Vec<ContextBlock>,
    /// Thread replay, oldest first.
    pub history: Vec<ThreadEntry>,
    /// Action input after its transform. `None` when the action has no input.
    pub input: Option<String>,
}

pub trait PromptAssembler: Send + Sync {
    fn assemble(&self, parts: &PromptParts) -> String;
}

/// Markdown sections in a fixed order; empty sections are omitted.
pub struct PlainAssembler;

impl PromptAssembler for PlainAssembler {
    fn assemble(&self, parts: &PromptParts) -> String {
        let mut sections: Vec<String> = Vec::new();

        if let Some(instructions) = parts.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            sections.push(format!("## Instructions\n\n{}", instructions.trim()));
        }

        let context: Vec<String> = parts
            .context
            .iter()
            .filter(|b| !b.value.is_empty())
            .map(|b| format!("### {} ({})\n{}", b.id, b.scope, b.value))
            .collect();
        if !context.is_empty() {
            sections.push(format!("## Context\n\n{}", context.join("\n\n")));
        }

        let history: Vec<String> = parts
            .history
            .iter()
            .map(|e| format!("**{}**: {}", e.display_name, e.content))
            .collect();
        if !history.is_empty() {
            sections.push(format!("## Conversation\n\n{}", history.join("\n")));
        }

        if let Some(input) = &parts.input {
            sections.push(format!("## Input\n\n{}", input));
        }

        sections.join("\n\n")
    }
}
