//! Per-run state owned by one executor.
//!
//! Every component is behind its own `std::sync::Mutex`. Locks are held for
//! single statements only and never across an `.await`. Where two locks
//! nest the order is context before output, rag before context, and the
//! retry mark before state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::{ContextStore, PersistentBindings, PhaseScope};
use crate::definition::{ActionDefinition, OutputTarget, PhaseDefinition, PipelineDefinition};
use crate::errors::{EngineError, EngineResult, TransientKind};
use crate::events::{EventBus, EventKind, RunEvent};
use crate::gavel::GavelController;
use crate::ledger::ThreadLedger;
use crate::output::{OutputBlock, OutputRouter, PermanentBlockId};
use crate::rag::RagCoordinator;
use crate::state::{ErrorClass, FileStateStore, RunError, RunSnapshot, RunState, RunStatus};
use crate::worker::{PromptAssembler, WorkerRegistry};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A value staged by an action, committed at the end of the phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Staged {
    pub content: String,
    pub author: String,
}

/// Action results of one phase that have not reached the output router yet.
#[derive(Debug, Clone, Default)]
pub(crate) struct Staging {
    pub phase: Option<Staged>,
    pub teams: BTreeMap<String, Staged>,
    pub permanent: BTreeMap<PermanentBlockId, Staged>,
    /// Raw result of every completed action, for `action` input sources.
    pub results: BTreeMap<String, String>,
}

impl Staging {
    fn put(slot: &mut Option<Staged>, content: &str, author: &str, append: bool) {
        match slot {
            Some(existing) if append => {
                existing.content.push_str("\n\n");
                existing.content.push_str(content);
                existing.author = author.to_string();
            }
            _ => {
                *slot = Some(Staged {
                    content: content.to_string(),
                    author: author.to_string(),
                })
            }
        }
    }

    /// Stage `content` for a router target. Context and discard targets are
    /// not staged.
    pub fn stage(&mut self, target: &OutputTarget, author: &str, content: &str, append: bool) {
        match target {
            OutputTarget::Phase => Self::put(&mut self.phase, content, author, append),
            OutputTarget::Team { team } => {
                let mut slot = self.teams.remove(team);
                Self::put(&mut slot, content, author, append);
                if let Some(staged) = slot {
                    self.teams.insert(team.clone(), staged);
                }
            }
            OutputTarget::Permanent { block } => {
                let mut slot = self.permanent.remove(block);
                Self::put(&mut slot, content, author, append);
                if let Some(staged) = slot {
                    self.permanent.insert(*block, staged);
                }
            }
            OutputTarget::Context { .. } | OutputTarget::Discard => {}
        }
    }
}

/// The action `retry_action` may re-run, with everything needed to re-run it
/// against the same upstream context.
#[derive(Debug, Clone)]
pub(crate) struct RetrySlot {
    pub phase_index: usize,
    pub action_id: String,
    pub scope: Option<PhaseScope>,
    pub staging: Staging,
}

#[derive(Debug, Clone, Copy, Default)]
struct Budget {
    remaining: u32,
    used: u32,
}

pub(crate) struct RunSession {
    pub run_id: String,
    pub pipeline: Arc<PipelineDefinition>,
    pub input: String,
    pub config: EngineConfig,
    pub registry: Arc<dyn WorkerRegistry>,
    pub assembler: Arc<dyn PromptAssembler>,
    pub knowledge: PersistentBindings,
    pub events: Arc<EventBus>,
    pub store: Option<FileStateStore>,

    pub state: Mutex<RunState>,
    pub output: Mutex<OutputRouter>,
    pub context: Mutex<ContextStore>,
    pub ledger: Mutex<ThreadLedger>,
    pub rag: Mutex<RagCoordinator>,
    pub gavels: Mutex<GavelController>,

    pub cancel: CancellationToken,
    pub paused: watch::Sender<bool>,
    pub rag_notify: Notify,
    budgets: Mutex<HashMap<(String, String), Budget>>,
    pub retry_slot: Mutex<Option<RetrySlot>>,
    retrying: Mutex<Option<String>>,
}

/// Marks a targeted retry in flight. Dropping it clears the mark.
pub(crate) struct RetryGuard<'a> {
    session: &'a RunSession,
}

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.session.retrying) = None;
    }
}

pub(crate) struct SessionParts {
    pub run_id: String,
    pub pipeline: Arc<PipelineDefinition>,
    pub input: String,
    pub config: EngineConfig,
    pub registry: Arc<dyn WorkerRegistry>,
    pub assembler: Arc<dyn PromptAssembler>,
    pub knowledge: PersistentBindings,
    pub events: Arc<EventBus>,
    pub store: Option<FileStateStore>,
    pub state: RunState,
    pub context: ContextStore,
}

impl RunSession {
    pub fn new(parts: SessionParts) -> Self {
        let (paused, _) = watch::channel(false);
        let output = OutputRouter::with_capacity(parts.config.history_capacity);
        Self {
            run_id: parts.run_id,
            pipeline: parts.pipeline,
            input: parts.input,
            config: parts.config,
            registry: parts.registry,
            assembler: parts.assembler,
            knowledge: parts.knowledge,
            events: parts.events,
            store: parts.store,
            state: Mutex::new(parts.state),
            output: Mutex::new(output),
            context: Mutex::new(parts.context),
            ledger: Mutex::new(ThreadLedger::new()),
            rag: Mutex::new(RagCoordinator::new()),
            gavels: Mutex::new(GavelController::new()),
            cancel: CancellationToken::new(),
            paused,
            rag_notify: Notify::new(),
            budgets: Mutex::new(HashMap::new()),
            retry_slot: Mutex::new(None),
            retrying: Mutex::new(None),
        }
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.state).status
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit(&self, kind: EventKind) {
        let event = RunEvent::new(&self.run_id, kind);
        lock(&self.state).events.push(event.clone());
        self.events.emit(&event);
    }

    pub fn set_status(&self, status: RunStatus) {
        lock(&self.state).set_status(status);
    }

    /// Running to paused. Returns the blocking status otherwise.
    pub fn pause(&self) -> Result<(), RunStatus> {
        {
            let mut state = lock(&self.state);
            if state.status != RunStatus::Running {
                return Err(state.status);
            }
            state.set_status(RunStatus::Paused);
        }
        self.paused.send_replace(true);
        self.emit(EventKind::RunPaused);
        tracing::info!(run_id = %self.run_id, "Run paused");
        Ok(())
    }

    /// Running or paused to aborted. The status check and the move happen
    /// under one lock so a finishing run cannot overwrite it.
    pub fn mark_aborted(&self) -> Result<(), RunStatus> {
        let mut state = lock(&self.state);
        if !state.status.is_active() {
            return Err(state.status);
        }
        state.set_status(RunStatus::Aborted);
        Ok(())
    }

    /// Running to completed. False if the run left `running` first.
    pub fn complete(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status != RunStatus::Running || self.is_aborted() {
            return false;
        }
        state.set_status(RunStatus::Completed);
        state.current_phase = None;
        true
    }

    /// Claim the single retry slot for `action_id`. Only a paused run retries.
    pub fn begin_retry(&self, action_id: &str) -> EngineResult<RetryGuard<'_>> {
        let mut retrying = lock(&self.retrying);
        if let Some(active) = retrying.as_ref() {
            return Err(EngineError::RetryInProgress(active.clone()));
        }
        let status = self.status();
        if status != RunStatus::Paused {
            return Err(EngineError::InvalidTransition {
                operation: "retry_action",
                status,
            });
        }
        *retrying = Some(action_id.to_string());
        Ok(RetryGuard { session: self })
    }

    /// Paused to running, refused while a targeted retry is in flight.
    pub fn resume(&self) -> EngineResult<()> {
        {
            let retrying = lock(&self.retrying);
            if let Some(active) = retrying.as_ref() {
                return Err(EngineError::RetryInProgress(active.clone()));
            }
            let mut state = lock(&self.state);
            if state.status != RunStatus::Paused {
                return Err(EngineError::InvalidTransition {
                    operation: "resume",
                    status: state.status,
                });
            }
            state.set_status(RunStatus::Running);
        }
        self.paused.send_replace(false);
        self.emit(EventKind::RunResumed);
        tracing::info!(run_id = %self.run_id, "Run resumed");
        Ok(())
    }

    /// Action id of the targeted retry in flight.
    pub fn retrying(&self) -> Option<String> {
        lock(&self.retrying).clone()
    }

    /// Action id held in the retry slot.
    pub fn retry_candidate(&self) -> Option<String> {
        lock(&self.retry_slot).as_ref().map(|s| s.action_id.clone())
    }

    /// Block at a phase boundary while paused. Returns false once aborted.
    pub async fn wait_if_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.is_aborted() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return !self.is_aborted();
                    }
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    /// Sleep unless the run is aborted first. Returns false on abort.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_aborted(),
            _ = self.cancel.cancelled() => false,
        }
    }

    pub fn phase_timeout(&self, phase: &PhaseDefinition) -> Duration {
        phase
            .execution
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.phase_timeout())
    }

    pub fn action_timeout(&self, action: &ActionDefinition) -> Duration {
        action
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.action_timeout())
    }

    fn retry_count(&self, phase: &PhaseDefinition, action: &ActionDefinition) -> u32 {
        action
            .retry_count
            .or(phase.execution.retry_count)
            .unwrap_or(self.config.default_retry_count)
    }

    /// Consume one retry from the action's run-wide budget. Returns the
    /// 0-based retry number, or `None` once the budget is spent.
    pub fn take_retry(&self, phase: &PhaseDefinition, action: &ActionDefinition) -> Option<u32> {
        let initial = self.retry_count(phase, action);
        let mut budgets = lock(&self.budgets);
        let budget = budgets
            .entry((phase.id.clone(), action.id.clone()))
            .or_insert(Budget {
                remaining: initial,
                used: 0,
            });
        if budget.remaining == 0 {
            return None;
        }
        budget.remaining -= 1;
        budget.used += 1;
        Some(budget.used - 1)
    }

    pub fn record_error(&self, error: RunError) {
        lock(&self.state).record_error(error);
    }

    /// Record an action failure and emit `action:error`.
    pub fn action_error(
        &self,
        phase_id: &str,
        action_id: &str,
        class: ErrorClass,
        transient_kind: Option<TransientKind>,
        message: String,
        attempt: u32,
    ) {
        tracing::warn!(
            run_id = %self.run_id,
            phase = phase_id,
            action = action_id,
            class = %class,
            attempt,
            "Action failed: {}",
            message
        );
        self.record_error(RunError {
            at: chrono::Utc::now(),
            phase_id: Some(phase_id.to_string()),
            action_id: Some(action_id.to_string()),
            class,
            transient_kind,
            message: message.clone(),
            attempt,
        });
        self.emit(EventKind::ActionError {
            phase_id: phase_id.to_string(),
            action_id: action_id.to_string(),
            class,
            transient_kind,
            message,
            attempt,
        });
    }

    /// Move the run to `error` and emit `run:error`. `class` is the
    /// classification of the failure that halted the run.
    pub fn escalate(&self, phase_id: &str, action_id: Option<&str>, class: ErrorClass, message: String) {
        {
            let mut state = lock(&self.state);
            if !state.status.is_active() {
                return;
            }
            state.set_status(RunStatus::Error);
        }
        tracing::error!(run_id = %self.run_id, phase = phase_id, %class, "Run failed: {}", message);
        self.emit(EventKind::RunError {
            phase_id: Some(phase_id.to_string()),
            action_id: action_id.map(str::to_string),
            class,
            message,
        });
    }

    /// Class of the most recent error recorded for an action.
    pub fn last_error_class(&self, phase_id: &str, action_id: &str) -> Option<ErrorClass> {
        lock(&self.state)
            .errors_for(phase_id, action_id)
            .last()
            .map(|e| e.class)
    }

    /// Apply a router write unless the run was aborted. `None` means the
    /// write was discarded.
    fn commit(
        &self,
        target: &str,
        write: impl FnOnce(&mut OutputRouter) -> EngineResult<crate::output::Committed>,
    ) -> Option<OutputBlock> {
        let committed = {
            let mut router = lock(&self.output);
            if self.is_aborted() {
                tracing::debug!(run_id = %self.run_id, target, "Run aborted; discarding write");
                return None;
            }
            match write(&mut router) {
                Ok(committed) => committed,
                Err(e) => {
                    tracing::debug!(run_id = %self.run_id, target, "Write rejected: {}", e);
                    return None;
                }
            }
        };
        if committed.changed {
            self.emit(EventKind::OutputUpdated {
                block_id: committed.block.id.clone(),
                kind: committed.block.kind,
                version: committed.block.metadata.version,
            });
        }
        Some(committed.block)
    }

    pub fn commit_phase_output(
        &self,
        phase_id: &str,
        content: &str,
        author: &str,
        overwrite: bool,
    ) -> Option<OutputBlock> {
        self.commit(phase_id, |r| {
            r.set_phase_output(phase_id, content, author, overwrite)
        })
    }

    pub fn commit_team_output(
        &self,
        phase_id: &str,
        team_id: &str,
        content: &str,
        author: &str,
        overwrite: bool,
    ) -> Option<OutputBlock> {
        self.commit(team_id, |r| {
            r.set_team_output(phase_id, team_id, content, author, overwrite)
        })
    }

    pub fn commit_permanent(
        &self,
        block: PermanentBlockId,
        content: &str,
        author: &str,
    ) -> Option<OutputBlock> {
        self.commit(block.as_str(), |r| r.set_permanent_block(block, content, author))
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let run = lock(&self.state).clone();
        let permanent = lock(&self.output).permanent_blocks();
        RunSnapshot::new(run, permanent)
    }

    /// Save a snapshot when a state store is attached. Failures are logged;
    /// they never fail the run.
    pub fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save(&self.snapshot()) {
            Ok(path) => {
                tracing::debug!(run_id = %self.run_id, path = %path.display(), "Run state saved")
            }
            Err(e) => tracing::warn!(run_id = %self.run_id, "Failed to persist run state: {}", e),
        }
    }
}
