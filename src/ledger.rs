//! Append-only conversational logs, one per scope.
//!
//! Thread ids are namespaced by kind: `main:<phase>`, `team:<phase>:<team>`,
//! `collab:<phase>:<action>`. Each thread assigns its own monotonic sequence
//! numbers; a ledger-wide counter additionally orders entries across threads,
//! so phase N's entries always precede phase N+1's.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Main,
    Team,
    Collaboration,
}

pub fn main_thread(phase_id: &str) -> String {
    format!("main:{phase_id}")
}

pub fn team_thread(phase_id: &str, team_id: &str) -> String {
    format!("team:{phase_id}:{team_id}")
}

pub fn collab_thread(phase_id: &str, action_id: &str) -> String {
    format!("collab:{phase_id}:{action_id}")
}

/// Participant id used for engine-authored markers.
pub const SYSTEM_PARTICIPANT: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub thread_id: String,
    pub participant_id: String,
    pub display_name: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Per-thread sequence number, starting at 1.
    pub seq: u64,
    /// Ledger-wide ordering stamp.
    pub ledger_seq: u64,
}

impl ThreadEntry {
    pub fn is_system(&self) -> bool {
        self.participant_id == SYSTEM_PARTICIPANT
    }
}

#[derive(Debug)]
struct Thread {
    kind: ThreadKind,
    entries: Vec<ThreadEntry>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct ThreadLedger {
    threads: BTreeMap<String, Thread>,
    next_ledger_seq: u64,
}

impl ThreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a thread. Re-opening an existing thread keeps its entries.
    pub fn open(&mut self, thread_id: &str, kind: ThreadKind) {
        self.threads
            .entry(thread_id.to_string())
            .and_modify(|t| t.closed = false)
            .or_insert_with(|| Thread {
                kind,
                entries: Vec::new(),
                closed: false,
            });
    }

    /// Close a thread. A preserved thread stays readable; otherwise it is
    /// dropped from the ledger.
    pub fn close(&mut self, thread_id: &str, preserve: bool) {
        if preserve {
            if let Some(thread) = self.threads.get_mut(thread_id) {
                thread.closed = true;
            }
        } else {
            self.threads.remove(thread_id);
        }
    }

    pub fn is_open(&self, thread_id: &str) -> bool {
        self.threads.get(thread_id).is_some_and(|t| !t.closed)
    }

    pub fn kind(&self, thread_id: &str) -> Option<ThreadKind> {
        self.threads.get(thread_id).map(|t| t.kind)
    }

    pub fn append_system_marker(&mut self, thread_id: &str, content: impl Into<String>) -> Option<u64> {
        self.append(
            thread_id,
            SYSTEM_PARTICIPANT,
            "System",
            content.into(),
            serde_json::Value::Null,
        )
    }

    pub fn append_participant_message(
        &mut self,
        thread_id: &str,
        participant_id: &str,
        display_name: &str,
        content: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Option<u64> {
        self.append(thread_id, participant_id, display_name, content.into(), metadata)
    }

    /// Append to an open thread, returning the assigned sequence number.
    /// Appends to closed or unknown threads are ignored.
    fn append(
        &mut self,
        thread_id: &str,
        participant_id: &str,
        display_name: &str,
        content: String,
        metadata: serde_json::Value,
    ) -> Option<u64> {
        let thread = self.threads.get_mut(thread_id).filter(|t| !t.closed)?;
        self.next_ledger_seq += 1;
        let seq = thread.entries.len() as u64 + 1;
        thread.entries.push(ThreadEntry {
            thread_id: thread_id.to_string(),
            participant_id: participant_id.to_string(),
            display_name: display_name.to_string(),
            content,
            metadata,
            timestamp: Utc::now(),
            seq,
            ledger_seq: self.next_ledger_seq,
        });
        Some(seq)
    }

    /// Entries with `seq > since`, oldest first, at most `limit`.
    pub fn read(&self, thread_id: &str, since: Option<u64>, limit: Option<usize>) -> Vec<ThreadEntry> {
        let Some(thread) = self.threads.get(thread_id) else {
            return Vec::new();
        };
        let since = since.unwrap_or(0);
        let iter = thread.entries.iter().filter(|e| e.seq > since).cloned();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// The most recent `limit` entries (or all), oldest first.
    pub fn tail(&self, thread_id: &str, limit: Option<usize>) -> Vec<ThreadEntry> {
        let Some(thread) = self.threads.get(thread_id) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |l| thread.entries.len().saturating_sub(l));
        thread.entries[skip..].to_vec()
    }

    pub fn len(&self, thread_id: &str) -> usize {
        self.threads.get(thread_id).map_or(0, |t| t.entries.len())
    }

    pub fn thread_ids(&self) -> Vec<String> {
        self.threads.keys().cloned().collect()
    }
}
