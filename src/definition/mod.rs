//! Pipeline definition documents and loading.
//!
//! This module provides:
//! - `PipelineDefinition`, the declarative document a run executes
//! - `PhaseDefinition` / `ActionDefinition` and their per-phase settings
//! - Loading from YAML or JSON files
//! - Validation (see [`validate`]) performed once before a run starts
//!
//! A definition is immutable once a run starts; the executor holds it behind
//! an `Arc` and never mutates it.

mod validate;

pub use validate::{Prerequisite, prerequisites};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::context::{ContextRef, ContextScope};
use crate::output::PermanentBlockId;
use crate::rag::RagScope;

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1".to_string()
}

fn default_rounds() -> u32 {
    1
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_editable() -> Vec<String> {
    vec!["output".to_string()]
}

/// The full pipeline document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub phases: Vec<PhaseDefinition>,
    /// Seeds for the read-only static scope.
    #[serde(default)]
    pub static_context: BTreeMap<String, String>,
    /// Seeds for the cross-phase global scope.
    #[serde(default)]
    pub global_context: BTreeMap<String, String>,
    /// Named persistent bindings, resolved lazily through the knowledge store.
    #[serde(default)]
    pub bindings: BTreeMap<String, PersistentBinding>,
}

/// Binding of a persistent reference to a knowledge-store key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistentBinding {
    pub store_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub thread: ThreadConfig,
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub context: ContextSpec,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag: Option<RagSpec>,
    #[serde(default)]
    pub execution: ExecutionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gavel: Option<GavelSpec>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Skip predicate: the phase runs only when this evaluates to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Global-context extraction rules applied after the phase settles.
    #[serde(default)]
    pub extract: Vec<ExtractionRule>,
}

impl PhaseDefinition {
    pub fn action(&self, action_id: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.id == action_id)
    }

    pub fn action_index(&self, action_id: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.id == action_id)
    }

    /// Team ids referenced by any action of this phase, in first-seen order.
    pub fn teams(&self) -> Vec<String> {
        let mut teams: Vec<String> = Vec::new();
        for action in &self.actions {
            for team in &action.participants.teams {
                if !teams.contains(team) {
                    teams.push(team.clone());
                }
            }
            if let OutputTarget::Team { team } = &action.output.target
                && !teams.contains(team)
            {
                teams.push(team.clone());
            }
        }
        teams
    }
}

/// Which conversational threads a phase opens and keeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadConfig {
    #[serde(default = "default_true")]
    pub main: bool,
    #[serde(default = "default_true")]
    pub team: bool,
    /// Keep the phase's main thread readable after the phase ends.
    #[serde(default = "default_true")]
    pub preserve_main: bool,
    #[serde(default)]
    pub preserve_team: bool,
    /// Maximum entries replayed into a worker prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_limit: Option<usize>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            main: true,
            team: true,
            preserve_main: true,
            preserve_team: false,
            replay_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextSpec {
    /// Static/global values injected into prompts. Empty injects every
    /// static and global value.
    #[serde(default)]
    pub inject: Vec<ContextRef>,
    /// Phase-scoped block ids created (empty) at phase start.
    #[serde(default)]
    pub phase_blocks: Vec<String>,
    /// Team-scoped block ids created per team at phase start.
    #[serde(default)]
    pub team_blocks: BTreeMap<String, Vec<String>>,
    /// Persistent binding names resolved on every prompt assembly.
    #[serde(default)]
    pub persistent_refs: Vec<String>,
    /// Phase block keys copied into the global scope when the phase completes.
    #[serde(default)]
    pub promote: Vec<String>,
    /// Team values copied to another team as soon as they are written.
    #[serde(default)]
    pub share: Vec<ShareRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareRule {
    pub from: String,
    pub key: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSpec {
    /// Commit the staged phase output.
    #[serde(default = "default_true")]
    pub phase: bool,
    /// Teams whose staged outputs are committed. Empty commits every staged team output.
    #[serde(default)]
    pub teams: Vec<String>,
    /// Mirror the phase output into this permanent block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent: Option<PermanentBlockId>,
    /// Replace an existing phase output instead of keeping it.
    #[serde(default)]
    pub overwrite: bool,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            phase: true,
            teams: Vec::new(),
            permanent: None,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RagSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub scope: RagScope,
    /// Query template; `{{key}}` placeholders resolve against context.
    pub query: String,
    /// Worker ids for agent-scoped requests. Empty targets every participant.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Upper bound on waiting for fulfillment, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionSpec {
    /// Run sequential-trigger actions of this phase as one parallel group.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// A failure that exhausts its retries moves the run to `error`.
    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GavelSpec {
    #[serde(default = "default_true")]
    pub required: bool,
    pub prompt: String,
    #[serde(default = "default_editable")]
    pub editable_fields: Vec<String>,
    #[serde(default)]
    pub can_skip: bool,
    /// Action re-run on rejection. Defaults to the action staging the phase output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionRule {
    pub key: String,
    pub from: ExtractSource,
    /// Regex; the first capture group (or the whole match) becomes the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractSource {
    PhaseOutput,
    TeamOutput { team: String },
    Action { action: String },
    PhaseContext { key: String },
}

/// Skip predicate evaluated against context and committed outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Present {
        scope: ContextScope,
        key: String,
    },
    Absent {
        scope: ContextScope,
        key: String,
    },
    Equals {
        scope: ContextScope,
        key: String,
        value: String,
    },
    OutputPresent {
        phase: String,
    },
    Not {
        condition: Box<Condition>,
    },
    All {
        conditions: Vec<Condition>,
    },
    Any {
        conditions: Vec<Condition>,
    },
}

impl Condition {
    pub fn evaluate(
        &self,
        lookup: &dyn Fn(&ContextRef) -> Option<String>,
        phase_output: &dyn Fn(&str) -> Option<String>,
    ) -> bool {
        let get = |scope: &ContextScope, key: &str| lookup(&ContextRef::new(*scope, key));
        match self {
            Condition::Present { scope, key } => get(scope, key).is_some(),
            Condition::Absent { scope, key } => get(scope, key).is_none(),
            Condition::Equals { scope, key, value } => {
                get(scope, key).as_deref() == Some(value.as_str())
            }
            Condition::OutputPresent { phase } => phase_output(phase).is_some(),
            Condition::Not { condition } => !condition.evaluate(lookup, phase_output),
            Condition::All { conditions } => {
                conditions.iter().all(|c| c.evaluate(lookup, phase_output))
            }
            Condition::Any { conditions } => {
                conditions.iter().any(|c| c.evaluate(lookup, phase_output))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub participants: ParticipantSpec,
    /// Role instructions handed to the prompt assembler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub input: InputSpec,
    #[serde(default)]
    pub output: ActionOutput,
    #[serde(default)]
    pub trigger: Trigger,
    /// Join adjacent parallel actions into one concurrently-run group.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Worker invoked once after the retry budget is exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl ActionDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantSpec {
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub mode: OrchestrationMode,
    #[serde(default = "default_rounds")]
    pub max_rounds: u32,
}

impl ParticipantSpec {
    pub fn workers(ids: &[&str]) -> Self {
        Self {
            workers: ids.iter().map(|s| s.to_string()).collect(),
            teams: Vec::new(),
            mode: OrchestrationMode::default(),
            max_rounds: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    #[default]
    Sequential,
    Parallel,
    RoundRobin,
    Consensus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputSpec {
    #[serde(default)]
    pub source: InputSource,
    #[serde(default)]
    pub transform: InputTransform,
    /// Fail instead of invoking when the source is absent. Defaults to true
    /// for every source except `none`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl InputSpec {
    pub fn is_required(&self) -> bool {
        self.required
            .unwrap_or(!matches!(self.source, InputSource::Empty))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    #[default]
    RunInput,
    PhaseOutput {
        phase: String,
    },
    TeamOutput {
        phase: String,
        team: String,
    },
    Permanent {
        block: PermanentBlockId,
    },
    Context {
        scope: ContextScope,
        key: String,
    },
    Action {
        action: String,
    },
    #[serde(rename = "none")]
    Empty,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputTransform {
    #[default]
    #[serde(rename = "none")]
    Identity,
    Trim,
    Prefix {
        text: String,
    },
    /// `{{input}}` is replaced with the source value.
    Template {
        text: String,
    },
}

impl InputTransform {
    pub fn apply(&self, input: &str) -> String {
        match self {
            InputTransform::Identity => input.to_string(),
            InputTransform::Trim => input.trim().to_string(),
            InputTransform::Prefix { text } => format!("{}{}", text, input),
            InputTransform::Template { text } => text.replace("{{input}}", input),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionOutput {
    #[serde(default)]
    pub target: OutputTarget,
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputTarget {
    #[default]
    Phase,
    Team {
        team: String,
    },
    Permanent {
        block: PermanentBlockId,
    },
    Context {
        scope: ContextScope,
        key: String,
    },
    Discard,
}

/// When an action may start relative to its siblings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Wait for the previous action (or parallel group) to settle.
    #[default]
    Sequential,
    /// Wait until `action` reaches `state`.
    Await { action: String, state: AwaitState },
    /// Start as soon as the phase's actions are scheduled.
    Immediate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AwaitState {
    Started,
    Completed,
    Failed,
    /// Completed, failed or skipped.
    Settled,
}

impl PipelineDefinition {
    /// Load a definition from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let definition = if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        };
        definition.with_context(|| format!("Failed to parse pipeline file: {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid pipeline YAML")
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid pipeline JSON")
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == phase_id)
    }
}
