//! Retrieval-augmentation coordination.
//!
//! The coordinator only tracks request lifecycles (`pending → fulfilled` or
//! `pending → timed_out`). Writing fulfilled content into the context store
//! is done by the executor's session, which owns both.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// Context key fulfilled RAG content is written under.
pub const RAG_CONTEXT_KEY: &str = "rag";

/// Characters per token used for budget estimates.
const CHARS_PER_TOKEN: usize = 4;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.:-]+)\s*\}\}").expect("valid placeholder regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RagScope {
    Team,
    Agent,
    Phase,
}

impl RagScope {
    /// Phase and team requests are issued before actions run; agent
    /// requests are deferred to each action.
    pub fn is_phase_level(&self) -> bool {
        matches!(self, RagScope::Phase | RagScope::Team)
    }
}

/// What the requester already knows, so the knowledge system can avoid
/// returning redundant material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextManifest {
    pub keys: Vec<String>,
    pub thread_entries: usize,
    pub approx_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagRequest {
    pub id: String,
    pub phase_id: String,
    pub scope: RagScope,
    pub target_ids: Vec<String>,
    pub query: String,
    pub manifest: ContextManifest,
    pub max_tokens: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagResponse {
    pub request_id: String,
    pub content: String,
    pub sources: Vec<String>,
    pub token_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RagStatus {
    Pending,
    Fulfilled,
    TimedOut,
}

#[derive(Debug)]
struct Entry {
    request: RagRequest,
    status: RagStatus,
}

#[derive(Debug, Default)]
pub struct RagCoordinator {
    entries: BTreeMap<String, Entry>,
}

impl RagCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and return its id.
    pub fn request(
        &mut self,
        phase_id: &str,
        scope: RagScope,
        target_ids: Vec<String>,
        query: String,
        manifest: ContextManifest,
        max_tokens: u32,
    ) -> RagRequest {
        let request = RagRequest {
            id: Uuid::new_v4().to_string(),
            phase_id: phase_id.to_string(),
            scope,
            target_ids,
            query,
            manifest,
            max_tokens,
            created_at: Utc::now(),
        };
        self.entries.insert(
            request.id.clone(),
            Entry {
                request: request.clone(),
                status: RagStatus::Pending,
            },
        );
        request
    }

    /// Fulfill a pending request. Content beyond the token budget is cut.
    pub fn respond(
        &mut self,
        request_id: &str,
        content: &str,
        sources: Vec<String>,
    ) -> EngineResult<(RagRequest, RagResponse)> {
        let entry = self
            .entries
            .get_mut(request_id)
            .filter(|e| e.status == RagStatus::Pending)
            .ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))?;

        entry.status = RagStatus::Fulfilled;
        let content = truncate_to_tokens(content, entry.request.max_tokens);
        let response = RagResponse {
            request_id: request_id.to_string(),
            token_count: estimate_tokens(&content),
            content,
            sources,
        };
        Ok((entry.request.clone(), response))
    }

    /// Mark a still-pending request as timed out. Returns false if the
    /// request was already resolved.
    pub fn expire(&mut self, request_id: &str) -> bool {
        match self.entries.get_mut(request_id) {
            Some(entry) if entry.status == RagStatus::Pending => {
                entry.status = RagStatus::TimedOut;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, request_id: &str) -> Option<RagStatus> {
        self.entries.get(request_id).map(|e| e.status)
    }

    pub fn get(&self, request_id: &str) -> Option<&RagRequest> {
        self.entries.get(request_id).map(|e| &e.request)
    }

    pub fn pending(&self) -> Vec<RagRequest> {
        self.entries
            .values()
            .filter(|e| e.status == RagStatus::Pending)
            .map(|e| e.request.clone())
            .collect()
    }

    pub fn pending_for_phase(&self, phase_id: &str) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.status == RagStatus::Pending && e.request.phase_id == phase_id)
            .map(|e| e.request.id.clone())
            .collect()
    }

    /// True once none of `ids` is pending.
    pub fn all_resolved(&self, ids: &[String]) -> bool {
        ids.iter()
            .all(|id| self.status(id) != Some(RagStatus::Pending))
    }
}

/// Substitute `{{key}}` placeholders. Unknown keys become empty strings.
pub fn render_query(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .trim()
        .to_string()
}

pub fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u32
}

fn truncate_to_tokens(content: &str, max_tokens: u32) -> String {
    let max_chars = max_tokens as usize * CHARS_PER_TOKEN;
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    tracing::debug!(max_tokens, "Truncating RAG response to token budget");
    content.chars().take(max_chars).collect()
}
