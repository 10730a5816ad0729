//! Scoped key/value context consumed when assembling a worker's input.
//!
//! Scopes:
//! - **static**: seeded before the run starts, read-only afterwards
//! - **global**: cross-phase; writes made during a phase are staged and only
//!   merged into the cross-phase value when the phase ends
//! - **phase** / **team** / **agent**: exist only between `begin_phase` and
//!   `end_phase`, then discarded
//! - **persistent**: resolved on every read through [`PersistentBindings`]
//!
//! Lookups return `None` for undeclared keys, which is distinct from a
//! declared key holding an empty string.

mod persistent;

pub use persistent::{KnowledgeStore, NullKnowledgeStore, PersistentBindings};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::definition::ContextSpec;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Static,
    Global,
    Phase,
    Team,
    Agent,
    Persistent,
}

impl ContextScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextScope::Static => "static",
            ContextScope::Global => "global",
            ContextScope::Phase => "phase",
            ContextScope::Team => "team",
            ContextScope::Agent => "agent",
            ContextScope::Persistent => "persistent",
        }
    }
}

impl std::fmt::Display for ContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a context value. Team and agent references resolve against
/// the team or worker of the action doing the lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextRef {
    pub scope: ContextScope,
    pub key: String,
}

impl ContextRef {
    pub fn new(scope: ContextScope, key: impl Into<String>) -> Self {
        Self {
            scope,
            key: key.into(),
        }
    }

    pub fn global(key: impl Into<String>) -> Self {
        Self::new(ContextScope::Global, key)
    }
}

/// Where a context value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    Seed,
    RunInput,
    Declared { phase: String },
    Action { phase: String, action: String },
    Rag { request_id: String },
    Extraction { phase: String },
    Promotion { phase: String },
    Shared { from_team: String },
    Persistent { store_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub id: String,
    pub scope: ContextScope,
    pub value: String,
    pub provenance: Provenance,
    pub updated_at: DateTime<Utc>,
}

impl ContextBlock {
    pub fn new(
        id: impl Into<String>,
        scope: ContextScope,
        value: impl Into<String>,
        provenance: Provenance,
    ) -> Self {
        Self {
            id: id.into(),
            scope,
            value: value.into(),
            provenance,
            updated_at: Utc::now(),
        }
    }
}

type Blocks = BTreeMap<String, ContextBlock>;

/// Context that lives only for the duration of one phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseScope {
    pub phase_id: String,
    blocks: Blocks,
    teams: BTreeMap<String, Blocks>,
    agents: BTreeMap<String, Blocks>,
    pending_global: Blocks,
}

#[derive(Debug, Default)]
pub struct ContextStore {
    statics: Blocks,
    frozen: bool,
    global: Blocks,
    phase: Option<PhaseScope>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_static(
        &mut self,
        key: &str,
        value: impl Into<String>,
        provenance: Provenance,
    ) -> EngineResult<()> {
        if self.frozen {
            return Err(EngineError::StaticReadOnly(key.to_string()));
        }
        self.statics.insert(
            key.to_string(),
            ContextBlock::new(key, ContextScope::Static, value, provenance),
        );
        Ok(())
    }

    /// Make the static scope read-only. Called when the run starts.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn get_static(&self, key: &str) -> Option<&ContextBlock> {
        self.statics.get(key)
    }

    /// Write a global value. Inside a phase the write is staged until
    /// `end_phase`; outside a phase it is committed directly.
    pub fn set_global(&mut self, key: &str, value: impl Into<String>, provenance: Provenance) {
        let block = ContextBlock::new(key, ContextScope::Global, value, provenance);
        match self.phase.as_mut() {
            Some(scope) => {
                scope.pending_global.insert(key.to_string(), block);
            }
            None => {
                self.global.insert(key.to_string(), block);
            }
        }
    }

    /// Read a global value as seen from inside the current phase.
    pub fn get_global(&self, key: &str) -> Option<&ContextBlock> {
        self.phase
            .as_ref()
            .and_then(|scope| scope.pending_global.get(key))
            .or_else(|| self.global.get(key))
    }

    /// Read the cross-phase committed global value, ignoring staged writes.
    pub fn committed_global(&self, key: &str) -> Option<&ContextBlock> {
        self.global.get(key)
    }

    pub fn in_phase(&self) -> Option<&str> {
        self.phase.as_ref().map(|s| s.phase_id.as_str())
    }

    /// Open the phase scope and instantiate its declared blocks.
    pub fn begin_phase(&mut self, phase_id: &str, spec: &ContextSpec, teams: &[String]) {
        let declared = || Provenance::Declared {
            phase: phase_id.to_string(),
        };
        let mut scope = PhaseScope {
            phase_id: phase_id.to_string(),
            ..Default::default()
        };
        for id in &spec.phase_blocks {
            scope.blocks.insert(
                id.clone(),
                ContextBlock::new(id, ContextScope::Phase, "", declared()),
            );
        }
        for team in teams {
            scope.teams.entry(team.clone()).or_default();
        }
        for (team, ids) in &spec.team_blocks {
            let blocks = scope.teams.entry(team.clone()).or_default();
            for id in ids {
                blocks.insert(
                    id.clone(),
                    ContextBlock::new(id, ContextScope::Team, "", declared()),
                );
            }
        }
        self.phase = Some(scope);
    }

    /// Close the phase scope: commit staged global writes and discard
    /// phase, team and agent blocks. Returns the committed global keys.
    pub fn end_phase(&mut self) -> Vec<String> {
        let Some(scope) = self.phase.take() else {
            return Vec::new();
        };
        let keys: Vec<String> = scope.pending_global.keys().cloned().collect();
        self.global.extend(scope.pending_global);
        keys
    }

    /// Close the phase scope without committing staged global writes.
    pub fn discard_phase(&mut self) {
        self.phase = None;
    }

    fn scope_mut(&mut self, scope: &'static str) -> EngineResult<&mut PhaseScope> {
        self.phase
            .as_mut()
            .ok_or(EngineError::ScopeClosed { scope })
    }

    pub fn set_phase(
        &mut self,
        key: &str,
        value: impl Into<String>,
        provenance: Provenance,
    ) -> EngineResult<()> {
        let scope = self.scope_mut("phase")?;
        scope.blocks.insert(
            key.to_string(),
            ContextBlock::new(key, ContextScope::Phase, value, provenance),
        );
        Ok(())
    }

    pub fn get_phase(&self, key: &str) -> Option<&ContextBlock> {
        self.phase.as_ref().and_then(|s| s.blocks.get(key))
    }

    pub fn set_team(
        &mut self,
        team: &str,
        key: &str,
        value: impl Into<String>,
        provenance: Provenance,
    ) -> EngineResult<()> {
        let scope = self.scope_mut("team")?;
        scope.teams.entry(team.to_string()).or_default().insert(
            key.to_string(),
            ContextBlock::new(key, ContextScope::Team, value, provenance),
        );
        Ok(())
    }

    pub fn get_team(&self, team: &str, key: &str) -> Option<&ContextBlock> {
        self.phase
            .as_ref()
            .and_then(|s| s.teams.get(team))
            .and_then(|blocks| blocks.get(key))
    }

    /// Copy a team value into another team's scope.
    pub fn share_team(&mut self, from_team: &str, key: &str, to_team: &str) -> EngineResult<bool> {
        let Some(value) = self.get_team(from_team, key).map(|b| b.value.clone()) else {
            return Ok(false);
        };
        self.set_team(
            to_team,
            key,
            value,
            Provenance::Shared {
                from_team: from_team.to_string(),
            },
        )?;
        Ok(true)
    }

    pub fn set_agent(
        &mut self,
        worker: &str,
        key: &str,
        value: impl Into<String>,
        provenance: Provenance,
    ) -> EngineResult<()> {
        let scope = self.scope_mut("agent")?;
        scope.agents.entry(worker.to_string()).or_default().insert(
            key.to_string(),
            ContextBlock::new(key, ContextScope::Agent, value, provenance),
        );
        Ok(())
    }

    pub fn get_agent(&self, worker: &str, key: &str) -> Option<&ContextBlock> {
        self.phase
            .as_ref()
            .and_then(|s| s.agents.get(worker))
            .and_then(|blocks| blocks.get(key))
    }

    /// Stage a phase block for promotion into the global scope.
    pub fn promote(&mut self, key: &str) -> EngineResult<bool> {
        let scope = self.scope_mut("phase")?;
        let Some(block) = scope.blocks.get(key) else {
            return Ok(false);
        };
        let promoted = ContextBlock::new(
            key,
            ContextScope::Global,
            block.value.clone(),
            Provenance::Promotion {
                phase: scope.phase_id.clone(),
            },
        );
        scope.pending_global.insert(key.to_string(), promoted);
        Ok(true)
    }

    /// Resolve a non-persistent reference for an action running as `worker`
    /// on `team`. Persistent references always resolve to `None` here; use
    /// [`PersistentBindings::resolve`].
    pub fn lookup(
        &self,
        reference: &ContextRef,
        team: Option<&str>,
        worker: Option<&str>,
    ) -> Option<&ContextBlock> {
        match reference.scope {
            ContextScope::Static => self.get_static(&reference.key),
            ContextScope::Global => self.get_global(&reference.key),
            ContextScope::Phase => self.get_phase(&reference.key),
            ContextScope::Team => team.and_then(|t| self.get_team(t, &reference.key)),
            ContextScope::Agent => worker.and_then(|w| self.get_agent(w, &reference.key)),
            ContextScope::Persistent => None,
        }
    }

    /// Write through a scope-tagged target.
    pub fn write(
        &mut self,
        scope: ContextScope,
        key: &str,
        value: impl Into<String>,
        provenance: Provenance,
        team: Option<&str>,
        worker: Option<&str>,
    ) -> EngineResult<()> {
        match scope {
            ContextScope::Static => self.set_static(key, value, provenance),
            ContextScope::Global => {
                self.set_global(key, value, provenance);
                Ok(())
            }
            ContextScope::Phase => self.set_phase(key, value, provenance),
            ContextScope::Team => match team {
                Some(team) => self.set_team(team, key, value, provenance),
                None => Err(EngineError::ScopeClosed { scope: "team" }),
            },
            ContextScope::Agent => match worker {
                Some(worker) => self.set_agent(worker, key, value, provenance),
                None => Err(EngineError::ScopeClosed { scope: "agent" }),
            },
            ContextScope::Persistent => Err(EngineError::ScopeClosed {
                scope: "persistent",
            }),
        }
    }

    /// Blocks injected into a worker prompt for the given spec. An empty
    /// inject list selects every static and global value.
    pub fn injected(
        &self,
        spec: &ContextSpec,
        team: Option<&str>,
        worker: Option<&str>,
    ) -> Vec<ContextBlock> {
        let mut blocks: Vec<ContextBlock> = if spec.inject.is_empty() {
            let mut all: Blocks = self.statics.clone();
            all.extend(self.global.clone());
            if let Some(scope) = &self.phase {
                all.extend(scope.pending_global.clone());
            }
            all.into_values().collect()
        } else {
            spec.inject
                .iter()
                .filter_map(|r| self.lookup(r, team, worker).cloned())
                .collect()
        };

        if let Some(scope) = &self.phase {
            blocks.extend(scope.blocks.values().cloned());
            if let Some(team_blocks) = team.and_then(|t| scope.teams.get(t)) {
                blocks.extend(team_blocks.values().cloned());
            }
            if let Some(agent_blocks) = worker.and_then(|w| scope.agents.get(w)) {
                blocks.extend(agent_blocks.values().cloned());
            }
        }
        blocks
    }

    /// Every visible static/global key and phase-scoped key, used to build
    /// RAG context manifests.
    pub fn visible_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.statics.keys().cloned().collect();
        keys.extend(self.global.keys().cloned());
        if let Some(scope) = &self.phase {
            keys.extend(scope.pending_global.keys().cloned());
            keys.extend(scope.blocks.keys().map(|k| format!("phase.{k}")));
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Capture the current phase scope so a single action can be re-run
    /// against the same upstream context later.
    pub fn snapshot_phase(&self) -> Option<PhaseScope> {
        self.phase.clone()
    }

    /// Re-open a captured phase scope.
    pub fn restore_phase(&mut self, scope: PhaseScope) {
        self.phase = Some(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_blocks() -> ContextSpec {
        let mut spec = ContextSpec {
            phase_blocks: vec!["notes".into()],
            ..Default::default()
        };
        spec.team_blocks
            .insert("red".into(), vec!["plan".into()]);
        spec
    }

    #[test]
    fn test_static_is_read_only_after_freeze() {
        let mut store = ContextStore::new();
        store.set_static("genre", "noir", Provenance::Seed).unwrap();
        store.freeze();
        let err = store
            .set_static("genre", "romance", Provenance::Seed)
            .unwrap_err();
        assert!(matches!(err, EngineError::StaticReadOnly(k) if k == "genre"));
        assert_eq!(store.get_static("genre").unwrap().value, "noir");
    }

    #[test]
    fn test_global_writes_commit_at_phase_end() {
        let mut store = ContextStore::new();
        store.set_global("tone", "dark", Provenance::Seed);
        store.begin_phase("p1", &ContextSpec::default(), &[]);

        store.set_global(
            "tone",
            "light",
            Provenance::Extraction { phase: "p1".into() },
        );
        assert_eq!(store.get_global("tone").unwrap().value, "light");
        assert_eq!(store.committed_global("tone").unwrap().value, "dark");

        let committed = store.end_phase();
        assert_eq!(committed, vec!["tone".to_string()]);
        assert_eq!(store.committed_global("tone").unwrap().value, "light");
    }

    #[test]
    fn test_discard_phase_drops_staged_globals() {
        let mut store = ContextStore::new();
        store.begin_phase("p1", &ContextSpec::default(), &[]);
        store.set_global("k", "v", Provenance::Seed);
        store.discard_phase();
        assert!(store.get_global("k").is_none());
    }

    #[test]
    fn test_phase_scope_exists_only_inside_phase() {
        let mut store = ContextStore::new();
        assert!(matches!(
            store.set_phase("k", "v", Provenance::Seed),
            Err(EngineError::ScopeClosed { scope: "phase" })
        ));

        store.begin_phase("p1", &spec_with_blocks(), &[]);
        // Declared but unset: present and empty.
        assert_eq!(store.get_phase("notes").unwrap().value, "");
        // Undeclared: absent.
        assert!(store.get_phase("other").is_none());

        store.set_phase("notes", "n", Provenance::Seed).unwrap();
        store.end_phase();
        assert!(store.get_phase("notes").is_none());
    }

    #[test]
    fn test_team_isolation_and_sharing() {
        let mut store = ContextStore::new();
        store.begin_phase("p1", &spec_with_blocks(), &["blue".to_string()]);
        store
            .set_team("red", "plan", "attack", Provenance::Seed)
            .unwrap();
        assert_eq!(store.get_team("red", "plan").unwrap().value, "attack");
        assert!(store.get_team("blue", "plan").is_none());

        assert!(store.share_team("red", "plan", "blue").unwrap());
        let shared = store.get_team("blue", "plan").unwrap();
        assert_eq!(shared.value, "attack");
        assert_eq!(
            shared.provenance,
            Provenance::Shared {
                from_team: "red".into()
            }
        );
        assert!(!store.share_team("red", "missing", "blue").unwrap());
    }

    #[test]
    fn test_promote_stages_phase_block_into_global() {
        let mut store = ContextStore::new();
        store.begin_phase("p1", &spec_with_blocks(), &[]);
        store.set_phase("notes", "keep me", Provenance::Seed).unwrap();
        assert!(store.promote("notes").unwrap());
        assert!(store.committed_global("notes").is_none());
        store.end_phase();
        assert_eq!(store.committed_global("notes").unwrap().value, "keep me");
    }

    #[test]
    fn test_lookup_by_scope() {
        let mut store = ContextStore::new();
        store.set_static("s", "1", Provenance::Seed).unwrap();
        store.begin_phase("p1", &ContextSpec::default(), &[]);
        store.set_agent("w1", "rag", "facts", Provenance::Seed).unwrap();
        store.set_team("red", "t", "2", Provenance::Seed).unwrap();

        let agent_ref = ContextRef::new(ContextScope::Agent, "rag");
        assert_eq!(
            store.lookup(&agent_ref, None, Some("w1")).unwrap().value,
            "facts"
        );
        assert!(store.lookup(&agent_ref, None, Some("w2")).is_none());
        let team_ref = ContextRef::new(ContextScope::Team, "t");
        assert!(store.lookup(&team_ref, None, None).is_none());
        assert_eq!(store.lookup(&team_ref, Some("red"), None).unwrap().value, "2");
        assert_eq!(
            store
                .lookup(&ContextRef::new(ContextScope::Static, "s"), None, None)
                .unwrap()
                .value,
            "1"
        );
    }

    #[test]
    fn test_injected_defaults_to_all_static_and_global() {
        let mut store = ContextStore::new();
        store.set_static("a", "1", Provenance::Seed).unwrap();
        store.set_global("b", "2", Provenance::Seed);
        store.begin_phase("p1", &spec_with_blocks(), &[]);
        store.set_team("red", "plan", "x", Provenance::Seed).unwrap();

        let blocks = store.injected(&spec_with_blocks(), Some("red"), None);
        let ids: Vec<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "notes", "plan"]);

        let narrow = ContextSpec {
            inject: vec![ContextRef::global("b")],
            ..Default::default()
        };
        let blocks = store.injected(&narrow, None, None);
        let ids: Vec<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "notes"]);
    }

    #[test]
    fn test_snapshot_and_restore_phase() {
        let mut store = ContextStore::new();
        store.begin_phase("p1", &ContextSpec::default(), &[]);
        store.set_phase("k", "v", Provenance::Seed).unwrap();
        let snapshot = store.snapshot_phase().unwrap();
        store.end_phase();

        store.restore_phase(snapshot);
        assert_eq!(store.in_phase(), Some("p1"));
        assert_eq!(store.get_phase("k").unwrap().value, "v");
    }
}
