//! Run state, snapshots and the file-backed state store.
//!
//! A [`RunSnapshot`] (RunState plus the permanent output blocks) is the only
//! state that outlives a process. Snapshots carry a schema version; older
//! versions are migrated on load and newer ones are refused.

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, EngineResult, TransientKind};
use crate::events::RunEvent;
use crate::output::OutputBlock;

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Aborted
        )
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether gavels wait for a reviewer or approve themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Interactive,
    Automatic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phases_total: usize,
    pub phases_completed: usize,
    pub phases_skipped: usize,
    pub actions_completed: usize,
    pub actions_failed: usize,
}

/// Classification attached to every recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Transient,
    Fatal,
    StaleRequest,
    Timeout,
    Rejected,
    MissingInput,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
            ErrorClass::StaleRequest => "stale_request",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Rejected => "rejected",
            ErrorClass::MissingInput => "missing_input",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub class: ErrorClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient_kind: Option<TransientKind>,
    pub message: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub id: String,
    pub pipeline_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    #[serde(default)]
    pub events: Vec<RunEvent>,
}

impl RunState {
    pub fn new(id: &str, pipeline_id: &str, mode: RunMode, phases_total: usize) -> Self {
        Self {
            id: id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            mode,
            status: RunStatus::Idle,
            current_phase: None,
            current_action: None,
            progress: Progress {
                phases_total,
                ..Default::default()
            },
            started_at: None,
            updated_at: Utc::now(),
            completed_at: None,
            errors: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Move to `status`, stamping start and completion times.
    pub fn set_status(&mut self, status: RunStatus) {
        let now = Utc::now();
        if status == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
            self.current_action = None;
        }
        self.status = status;
        self.updated_at = now;
    }

    pub fn record_error(&mut self, error: RunError) {
        self.updated_at = Utc::now();
        self.errors.push(error);
    }

    /// Errors recorded for one action of a phase.
    pub fn errors_for(&self, phase_id: &str, action_id: &str) -> Vec<&RunError> {
        self.errors
            .iter()
            .filter(|e| {
                e.phase_id.as_deref() == Some(phase_id) && e.action_id.as_deref() == Some(action_id)
            })
            .collect()
    }
}

/// Persisted form of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub schema_version: u32,
    pub run: RunState,
    pub permanent: Vec<OutputBlock>,
}

impl RunSnapshot {
    pub fn new(run: RunState, permanent: Vec<OutputBlock>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run,
            permanent,
        }
    }

    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .context("Failed to serialize run snapshot")
            .map_err(EngineError::Persistence)
    }

    /// Parse a snapshot, migrating older schema versions.
    pub fn from_json(content: &str) -> EngineResult<Self> {
        let value: serde_json::Value = serde_json::from_str(content)
            .context("Snapshot is not valid JSON")
            .map_err(EngineError::Persistence)?;
        let value = migrate(value)?;
        serde_json::from_value(value)
            .context("Snapshot does not match the current schema")
            .map_err(EngineError::Persistence)
    }
}

/// Bring a raw snapshot up to [`SCHEMA_VERSION`].
///
/// Version 0 snapshots predate the version field and stored permanent blocks
/// as an object keyed by block id.
fn migrate(mut value: serde_json::Value) -> EngineResult<serde_json::Value> {
    let found = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    if found > SCHEMA_VERSION {
        return Err(EngineError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    if found == 0 {
        tracing::info!("Migrating run snapshot from schema 0");
        if let Some(obj) = value.as_object_mut() {
            if let Some(serde_json::Value::Object(blocks)) = obj.remove("permanent") {
                let list: Vec<serde_json::Value> = blocks.into_values().collect();
                obj.insert("permanent".into(), serde_json::Value::Array(list));
            }
            obj.entry("permanent")
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            obj.insert("schema_version".into(), SCHEMA_VERSION.into());
        }
    }
    Ok(value)
}

/// Snapshots stored as `<dir>/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn lock(&self) -> anyhow::Result<File> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state dir: {}", self.dir.display()))?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(".lock"))
            .context("Failed to open state lock file")?;
        lock.lock_exclusive()
            .context("Failed to acquire state lock")?;
        Ok(lock)
    }

    /// Write a snapshot atomically (temp file + rename) under the store lock.
    pub fn save(&self, snapshot: &RunSnapshot) -> EngineResult<PathBuf> {
        let json = snapshot.to_json()?;
        self.write_locked(&snapshot.run.id, &json)
            .map_err(EngineError::Persistence)
    }

    fn write_locked(&self, run_id: &str, json: &str) -> anyhow::Result<PathBuf> {
        let lock = self.lock()?;
        let path = self.path_for(run_id);
        let tmp = self.dir.join(format!(".{run_id}.json.tmp"));
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
        FileExt::unlock(&lock)?;
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> EngineResult<RunSnapshot> {
        let path = self.path_for(run_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("No snapshot for run {run_id} at {}", path.display()))
            .map_err(EngineError::Persistence)?;
        RunSnapshot::from_json(&content)
    }

    /// Run ids with a stored snapshot, sorted.
    pub fn list(&self) -> EngineResult<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))
            .map_err(EngineError::Persistence)?;
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json")
                    .filter(|stem| !stem.starts_with('.'))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputRouter;
    use tempfile::tempdir;

    fn snapshot() -> RunSnapshot {
        let mut run = RunState::new("run-1", "story", RunMode::Automatic, 2);
        run.set_status(RunStatus::Running);
        run.set_status(RunStatus::Completed);
        let mut router = OutputRouter::new();
        router.set_permanent("first_draft", "draft one", "writer").unwrap();
        RunSnapshot::new(run, router.permanent_blocks())
    }

    #[test]
    fn test_status_lifecycle_flags() {
        assert!(!RunStatus::Idle.is_terminal());
        assert!(RunStatus::Paused.is_active());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Aborted.is_active());
        assert_eq!(RunStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_set_status_stamps_times() {
        let mut run = RunState::new("r", "p", RunMode::Interactive, 1);
        assert!(run.started_at.is_none());
        run.set_status(RunStatus::Running);
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_none());
        run.set_status(RunStatus::Aborted);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("runs"));
        let snap = snapshot();
        let path = store.save(&snap).unwrap();
        assert!(path.ends_with("run-1.json"));

        let loaded = store.load("run-1").unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(store.list().unwrap(), vec!["run-1".to_string()]);
    }

    #[test]
    fn test_load_missing_run_is_persistence_error() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(matches!(store.load("nope"), Err(EngineError::Persistence(_))));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let mut value = serde_json::to_value(snapshot()).unwrap();
        value["schema_version"] = serde_json::json!(SCHEMA_VERSION + 1);
        let err = RunSnapshot::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedSchema { found, supported }
                if found == SCHEMA_VERSION + 1 && supported == SCHEMA_VERSION
        ));
    }

    #[test]
    fn test_schema_zero_is_migrated() {
        let snap = snapshot();
        let mut value = serde_json::to_value(&snap).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("schema_version");
        let blocks = obj.remove("permanent").unwrap();
        let mut keyed = serde_json::Map::new();
        for block in blocks.as_array().unwrap() {
            keyed.insert(block["id"].as_str().unwrap().to_string(), block.clone());
        }
        obj.insert("permanent".into(), serde_json::Value::Object(keyed));

        let migrated = RunSnapshot::from_json(&value.to_string()).unwrap();
        assert_eq!(migrated.schema_version, SCHEMA_VERSION);
        assert_eq!(migrated.permanent, snap.permanent);
    }
}
