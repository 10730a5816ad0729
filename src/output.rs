//! Single source of truth for committed results.
//!
//! The router holds at most one output per phase, one per (phase, team), and
//! a fixed set of run-lifetime permanent blocks. Writes are idempotent unless
//! an overwrite is requested, every overwrite bumps the block version, and
//! every write lands in a bounded audit history that is never used for
//! recomputation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::errors::{EngineError, EngineResult};

/// Author recorded for edits made through a gavel approval.
pub const HUMAN_REVIEW: &str = "human-review";

const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// The fixed set of permanent block ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentBlockId {
    Instructions,
    FirstOutline,
    SecondOutline,
    FinalOutline,
    FirstDraft,
    SecondDraft,
    FinalDraft,
    Commentary,
}

impl PermanentBlockId {
    pub fn all() -> &'static [PermanentBlockId] {
        &[
            PermanentBlockId::Instructions,
            PermanentBlockId::FirstOutline,
            PermanentBlockId::SecondOutline,
            PermanentBlockId::FinalOutline,
            PermanentBlockId::FirstDraft,
            PermanentBlockId::SecondDraft,
            PermanentBlockId::FinalDraft,
            PermanentBlockId::Commentary,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermanentBlockId::Instructions => "instructions",
            PermanentBlockId::FirstOutline => "first_outline",
            PermanentBlockId::SecondOutline => "second_outline",
            PermanentBlockId::FinalOutline => "final_outline",
            PermanentBlockId::FirstDraft => "first_draft",
            PermanentBlockId::SecondDraft => "second_draft",
            PermanentBlockId::FinalDraft => "final_draft",
            PermanentBlockId::Commentary => "commentary",
        }
    }
}

impl std::fmt::Display for PermanentBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermanentBlockId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermanentBlockId::all()
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| EngineError::UnknownBlock(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Phase,
    Team,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBlock {
    pub id: String,
    pub kind: BlockKind,
    pub content: String,
    pub metadata: BlockMetadata,
}

impl OutputBlock {
    fn new(
        id: String,
        kind: BlockKind,
        content: String,
        author: &str,
        phase_id: Option<String>,
        team_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            content,
            metadata: BlockMetadata {
                created_at: now,
                updated_at: now,
                created_by: author.to_string(),
                updated_by: author.to_string(),
                phase_id,
                team_id,
                version: 1,
            },
        }
    }

    /// Replace content, bumping version and guaranteeing a strictly later
    /// `updated_at`. Returns the previous content.
    fn overwrite(&mut self, content: String, author: &str) -> String {
        let now = Utc::now();
        let previous = self.metadata.updated_at;
        self.metadata.updated_at = if now > previous {
            now
        } else {
            previous + Duration::microseconds(1)
        };
        self.metadata.updated_by = author.to_string();
        self.metadata.version += 1;
        std::mem::replace(&mut self.content, content)
    }
}

/// Result of a router write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub block: OutputBlock,
    /// False when an idempotent write returned the existing block.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub block_id: String,
    pub kind: BlockKind,
    pub version: u32,
    pub author: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    pub content: String,
}

#[derive(Debug)]
pub struct OutputRouter {
    phase: BTreeMap<String, OutputBlock>,
    team: BTreeMap<String, BTreeMap<String, OutputBlock>>,
    permanent: BTreeMap<PermanentBlockId, OutputBlock>,
    history: VecDeque<HistoryEntry>,
    capacity: usize,
    sealed: bool,
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            phase: BTreeMap::new(),
            team: BTreeMap::new(),
            permanent: BTreeMap::new(),
            history: VecDeque::new(),
            capacity: capacity.max(1),
            sealed: false,
        }
    }

    /// Reject every further write. Used once an abort is observed.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn guard(&self, target: &str) -> EngineResult<()> {
        if self.sealed {
            return Err(EngineError::OutputSealed(target.to_string()));
        }
        Ok(())
    }

    fn record(&mut self, block: &OutputBlock, previous: Option<String>) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            block_id: block.id.clone(),
            kind: block.kind,
            version: block.metadata.version,
            author: block.metadata.updated_by.clone(),
            at: block.metadata.updated_at,
            previous,
            content: block.content.clone(),
        });
    }

    /// Set a phase output. Without `overwrite`, an existing output is
    /// returned unchanged.
    pub fn set_phase_output(
        &mut self,
        phase_id: &str,
        content: impl Into<String>,
        author: &str,
        overwrite: bool,
    ) -> EngineResult<Committed> {
        self.guard(phase_id)?;
        let content = content.into();
        let (block, previous, changed) = match self.phase.get_mut(phase_id) {
            Some(existing) if !overwrite => {
                return Ok(Committed {
                    block: existing.clone(),
                    changed: false,
                });
            }
            Some(existing) => {
                let previous = existing.overwrite(content, author);
                (existing.clone(), Some(previous), true)
            }
            None => {
                let block = OutputBlock::new(
                    phase_id.to_string(),
                    BlockKind::Phase,
                    content,
                    author,
                    Some(phase_id.to_string()),
                    None,
                );
                self.phase.insert(phase_id.to_string(), block.clone());
                (block, None, true)
            }
        };
        self.record(&block, previous);
        Ok(Committed { block, changed })
    }

    /// Set a team output, idempotent per (phase, team).
    pub fn set_team_output(
        &mut self,
        phase_id: &str,
        team_id: &str,
        content: impl Into<String>,
        author: &str,
        overwrite: bool,
    ) -> EngineResult<Committed> {
        let block_id = format!("{phase_id}/{team_id}");
        self.guard(&block_id)?;
        let content = content.into();
        let teams = self.team.entry(phase_id.to_string()).or_default();
        let (block, previous) = match teams.get_mut(team_id) {
            Some(existing) if !overwrite => {
                return Ok(Committed {
                    block: existing.clone(),
                    changed: false,
                });
            }
            Some(existing) => {
                let previous = existing.overwrite(content, author);
                (existing.clone(), Some(previous))
            }
            None => {
                let block = OutputBlock::new(
                    block_id,
                    BlockKind::Team,
                    content,
                    author,
                    Some(phase_id.to_string()),
                    Some(team_id.to_string()),
                );
                teams.insert(team_id.to_string(), block.clone());
                (block, None)
            }
        };
        self.record(&block, previous);
        Ok(Committed {
            block,
            changed: true,
        })
    }

    /// Set a permanent block by name. Unknown names fail with `UnknownBlock`.
    pub fn set_permanent(
        &mut self,
        block_id: &str,
        content: impl Into<String>,
        author: &str,
    ) -> EngineResult<Committed> {
        let id: PermanentBlockId = block_id.parse()?;
        self.set_permanent_block(id, content, author)
    }

    /// Set a permanent block. Always overwrites and bumps the version.
    pub fn set_permanent_block(
        &mut self,
        id: PermanentBlockId,
        content: impl Into<String>,
        author: &str,
    ) -> EngineResult<Committed> {
        self.guard(id.as_str())?;
        let content = content.into();
        let (block, previous) = match self.permanent.get_mut(&id) {
            Some(existing) => {
                let previous = existing.overwrite(content, author);
                (existing.clone(), Some(previous))
            }
            None => {
                let block = OutputBlock::new(
                    id.as_str().to_string(),
                    BlockKind::Permanent,
                    content,
                    author,
                    None,
                    None,
                );
                self.permanent.insert(id, block.clone());
                (block, None)
            }
        };
        self.record(&block, previous);
        Ok(Committed {
            block,
            changed: true,
        })
    }

    pub fn get_phase_output(&self, phase_id: &str) -> Option<&OutputBlock> {
        self.phase.get(phase_id)
    }

    pub fn get_team_output(&self, phase_id: &str, team_id: &str) -> Option<&OutputBlock> {
        self.team.get(phase_id).and_then(|t| t.get(team_id))
    }

    pub fn get_all_team_outputs(&self, phase_id: &str) -> BTreeMap<String, OutputBlock> {
        self.team.get(phase_id).cloned().unwrap_or_default()
    }

    pub fn permanent(&self, id: PermanentBlockId) -> Option<&OutputBlock> {
        self.permanent.get(&id)
    }

    /// Look up a permanent block by name; unknown names are absent.
    pub fn get_permanent_block(&self, block_id: &str) -> Option<&OutputBlock> {
        block_id
            .parse::<PermanentBlockId>()
            .ok()
            .and_then(|id| self.permanent.get(&id))
    }

    fn first_present(&self, ids: &[PermanentBlockId]) -> Option<&OutputBlock> {
        ids.iter().find_map(|id| self.permanent.get(id))
    }

    /// Final draft, falling back to the second, then the first.
    pub fn latest_draft(&self) -> Option<&OutputBlock> {
        self.first_present(&[
            PermanentBlockId::FinalDraft,
            PermanentBlockId::SecondDraft,
            PermanentBlockId::FirstDraft,
        ])
    }

    /// Final outline, falling back to the second, then the first.
    pub fn latest_outline(&self) -> Option<&OutputBlock> {
        self.first_present(&[
            PermanentBlockId::FinalOutline,
            PermanentBlockId::SecondOutline,
            PermanentBlockId::FirstOutline,
        ])
    }

    pub fn final_draft(&self) -> Option<&OutputBlock> {
        self.permanent.get(&PermanentBlockId::FinalDraft)
    }

    pub fn permanent_blocks(&self) -> Vec<OutputBlock> {
        self.permanent.values().cloned().collect()
    }

    /// Replace the permanent blocks with previously exported ones.
    pub fn restore_permanent(&mut self, blocks: Vec<OutputBlock>) -> EngineResult<()> {
        let mut restored = BTreeMap::new();
        for block in blocks {
            let id: PermanentBlockId = block.id.parse()?;
            restored.insert(id, block);
        }
        self.permanent = restored;
        Ok(())
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Drop all but the newest `keep` history entries.
    pub fn prune_history(&mut self, keep: usize) {
        while self.history.len() > keep {
            self.history.pop_front();
        }
    }
}
