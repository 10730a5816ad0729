//! Pipeline executor: the run lifecycle and the review-surface entry points.
//!
//! One executor owns at most one active run. The run is driven by a spawned
//! task; every other call on the executor is a short, synchronous operation
//! on the run's session except `retry_action` and `wait`.

mod action;
mod phase;
mod session;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use self::session::{RunSession, SessionParts, lock};
use crate::config::EngineConfig;
use crate::context::{ContextStore, KnowledgeStore, NullKnowledgeStore, PersistentBindings, Provenance};
use crate::definition::PipelineDefinition;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, EventHandler, EventKind, RunEvent};
use crate::gavel::{GavelEdits, GavelRequest};
use crate::ledger::ThreadEntry;
use crate::output::{OutputBlock, OutputRouter, PermanentBlockId};
use crate::rag::{RagRequest, RagResponse};
use crate::state::{FileStateStore, RunMode, RunSnapshot, RunState, RunStatus};
use crate::worker::{PlainAssembler, PromptAssembler, WorkerRegistry};

/// Options for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub mode: RunMode,
    /// Static values layered over the pipeline's own seeds.
    #[serde(default)]
    pub static_context: BTreeMap<String, String>,
    /// Global values layered over the pipeline's own seeds.
    #[serde(default)]
    pub global_context: BTreeMap<String, String>,
    /// Content of the `instructions` permanent block.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl RunOptions {
    pub fn automatic() -> Self {
        Self {
            mode: RunMode::Automatic,
            ..Default::default()
        }
    }
}

pub struct PipelineExecutor {
    config: EngineConfig,
    registry: Arc<dyn WorkerRegistry>,
    knowledge: Arc<dyn KnowledgeStore>,
    assembler: Arc<dyn PromptAssembler>,
    store: Option<FileStateStore>,
    events: Arc<EventBus>,
    pipelines: Mutex<BTreeMap<String, Arc<PipelineDefinition>>>,
    current: Mutex<Option<Arc<RunSession>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<dyn WorkerRegistry>) -> Self {
        let config = EngineConfig::default();
        Self {
            events: Arc::new(EventBus::new(config.event_capacity)),
            config,
            registry,
            knowledge: Arc::new(NullKnowledgeStore),
            assembler: Arc::new(PlainAssembler),
            store: None,
            pipelines: Mutex::new(BTreeMap::new()),
            current: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Replace the engine configuration. Resets the event bus, so call this
    /// before subscribing.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.events = Arc::new(EventBus::new(config.event_capacity));
        self.config = config;
        self
    }

    pub fn with_knowledge_store(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn PromptAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_state_store(mut self, store: FileStateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and register a pipeline definition under its id.
    pub fn register_pipeline(&self, definition: PipelineDefinition) -> EngineResult<()> {
        definition.validate()?;
        tracing::debug!(pipeline = %definition.id, phases = definition.phases.len(), "Registered pipeline");
        lock(&self.pipelines).insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    fn session(&self) -> EngineResult<Arc<RunSession>> {
        lock(&self.current).clone().ok_or(EngineError::NoActiveRun)
    }

    /// Start a run of a registered pipeline and return its run id. Must be
    /// called inside a tokio runtime.
    pub fn start_run(&self, pipeline_id: &str, input: &str, options: RunOptions) -> EngineResult<String> {
        let pipeline = lock(&self.pipelines)
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidPipeline {
                pipeline: pipeline_id.to_string(),
                reason: "not registered".to_string(),
            })?;
        if let Err(e) = pipeline.validate() {
            return Err(EngineError::InvalidPipeline {
                pipeline: pipeline_id.to_string(),
                reason: e.to_string(),
            });
        }

        let mut current = lock(&self.current);
        if let Some(active) = current.as_ref()
            && !active.status().is_terminal()
        {
            return Err(EngineError::AlreadyRunning {
                run_id: active.run_id.clone(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let mut context = ContextStore::new();
        for (key, value) in &pipeline.static_context {
            context.set_static(key, value.as_str(), Provenance::Seed)?;
        }
        for (key, value) in &options.static_context {
            context.set_static(key, value.as_str(), Provenance::RunInput)?;
        }
        context.freeze();
        for (key, value) in &pipeline.global_context {
            context.set_global(key, value.as_str(), Provenance::Seed);
        }
        for (key, value) in &options.global_context {
            context.set_global(key, value.as_str(), Provenance::RunInput);
        }

        let session = Arc::new(RunSession::new(SessionParts {
            run_id: run_id.clone(),
            pipeline: pipeline.clone(),
            input: input.to_string(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            assembler: self.assembler.clone(),
            knowledge: PersistentBindings::new(pipeline.bindings.clone(), self.knowledge.clone()),
            events: self.events.clone(),
            store: self.store.clone(),
            state: RunState::new(&run_id, &pipeline.id, options.mode, pipeline.phases.len()),
            context,
        }));

        if let Some(instructions) = &options.instructions {
            session.commit_permanent(PermanentBlockId::Instructions, instructions, "run-input");
        }

        tracing::info!(run_id = %run_id, pipeline = %pipeline.id, mode = ?options.mode, "Starting run");
        session.set_status(RunStatus::Running);
        session.emit(EventKind::RunStarted {
            pipeline_id: pipeline.id.clone(),
        });

        *current = Some(session.clone());
        drop(current);
        *lock(&self.task) = Some(tokio::spawn(phase::drive(session, 0)));
        Ok(run_id)
    }

    /// Pause at the next phase boundary.
    pub fn pause(&self) -> EngineResult<()> {
        self.session()?
            .pause()
            .map_err(|status| EngineError::InvalidTransition {
                operation: "pause",
                status,
            })
    }

    pub fn resume(&self) -> EngineResult<()> {
        self.session()?.resume()
    }

    /// Abort the run. In-flight worker calls finish, but nothing they
    /// return reaches the output router.
    pub fn abort(&self) -> EngineResult<()> {
        let session = self.session()?;
        session
            .mark_aborted()
            .map_err(|status| EngineError::InvalidTransition {
                operation: "abort",
                status,
            })?;
        {
            let mut output = lock(&session.output);
            session.cancel.cancel();
            output.seal();
        }
        session.emit(EventKind::RunAborted);
        tracing::info!(run_id = %session.run_id, "Run aborted");
        session.persist();
        Ok(())
    }

    /// Re-run the action that last failed or was rejected in a non-critical
    /// phase, against the context it originally saw. Valid while the run is
    /// paused at a phase boundary; the run stays paused afterwards.
    pub async fn retry_action(&self, action_id: &str) -> EngineResult<()> {
        let session = self.session()?;
        let _retrying = session.begin_retry(action_id)?;
        if lock(&session.context).in_phase().is_some() {
            return Err(EngineError::RetryNotAllowed(action_id.to_string()));
        }
        let slot = {
            let mut slot = lock(&session.retry_slot);
            match slot.take() {
                Some(s) if s.action_id == action_id => s,
                other => {
                    *slot = other;
                    return Err(EngineError::RetryNotAllowed(action_id.to_string()));
                }
            }
        };

        let outcome = phase::rerun(&session, slot).await;
        tracing::info!(run_id = %session.run_id, action = action_id, ?outcome, "Targeted retry finished");
        Ok(())
    }

    /// Action a paused run is holding for, if any.
    pub fn retry_candidate(&self) -> Option<String> {
        lock(&self.current).as_ref().and_then(|s| s.retry_candidate())
    }

    /// Approve a pending gavel, optionally with edits.
    pub fn approve(&self, gavel_id: &str, edits: Option<GavelEdits>) -> EngineResult<GavelRequest> {
        let session = self.session()?;
        let result = lock(&session.gavels).approve(gavel_id, edits);
        stale(result, "approve")
    }

    pub fn reject(&self, gavel_id: &str, reason: Option<String>) -> EngineResult<GavelRequest> {
        let session = self.session()?;
        let result = lock(&session.gavels).reject(gavel_id, reason);
        stale(result, "reject")
    }

    pub fn skip(&self, gavel_id: &str) -> EngineResult<GavelRequest> {
        let session = self.session()?;
        let result = lock(&session.gavels).skip(gavel_id);
        stale(result, "skip")
    }

    /// Fulfill a pending RAG request. The content lands in the scope the
    /// request targeted before any waiter is released.
    pub fn respond_rag(&self, request_id: &str, content: &str, sources: Vec<String>) -> EngineResult<RagResponse> {
        let session = self.session()?;
        let response = {
            let mut rag = lock(&session.rag);
            let (request, response) = stale(rag.respond(request_id, content, sources), "respond_rag")?;
            phase::deliver_rag(&session, &request, &response.content);
            response
        };
        tracing::info!(request = request_id, tokens = response.token_count, "RAG request fulfilled");
        session.emit(EventKind::RagFulfilled {
            request_id: request_id.to_string(),
            token_count: response.token_count,
        });
        session.rag_notify.notify_waiters();
        Ok(response)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn on_event(&self, handler: EventHandler) {
        self.events.on(handler);
    }

    pub fn state(&self) -> Option<RunState> {
        lock(&self.current).as_ref().map(|s| lock(&s.state).clone())
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.current)
            .as_ref()
            .map(|s| s.status())
            .unwrap_or_default()
    }

    /// Read the output router of the current run.
    pub fn outputs<T>(&self, read: impl FnOnce(&OutputRouter) -> T) -> Option<T> {
        let session = lock(&self.current).clone()?;
        let router = lock(&session.output);
        Some(read(&router))
    }

    pub fn latest_draft(&self) -> Option<OutputBlock> {
        self.outputs(|r| r.latest_draft().cloned()).flatten()
    }

    pub fn latest_outline(&self) -> Option<OutputBlock> {
        self.outputs(|r| r.latest_outline().cloned()).flatten()
    }

    pub fn final_draft(&self) -> Option<OutputBlock> {
        self.outputs(|r| r.final_draft().cloned()).flatten()
    }

    pub fn permanent_block(&self, block_id: &str) -> Option<OutputBlock> {
        self.outputs(|r| r.get_permanent_block(block_id).cloned()).flatten()
    }

    pub fn phase_output(&self, phase_id: &str) -> Option<OutputBlock> {
        self.outputs(|r| r.get_phase_output(phase_id).cloned()).flatten()
    }

    pub fn team_outputs(&self, phase_id: &str) -> BTreeMap<String, OutputBlock> {
        self.outputs(|r| r.get_all_team_outputs(phase_id))
            .unwrap_or_default()
    }

    pub fn thread(&self, thread_id: &str) -> Vec<ThreadEntry> {
        lock(&self.current)
            .as_ref()
            .map(|s| lock(&s.ledger).read(thread_id, None, None))
            .unwrap_or_default()
    }

    pub fn pending_gavels(&self) -> Vec<GavelRequest> {
        lock(&self.current)
            .as_ref()
            .map(|s| lock(&s.gavels).pending())
            .unwrap_or_default()
    }

    pub fn pending_rag(&self) -> Vec<RagRequest> {
        lock(&self.current)
            .as_ref()
            .map(|s| lock(&s.rag).pending())
            .unwrap_or_default()
    }

    /// Committed value of a global context key.
    pub fn global(&self, key: &str) -> Option<String> {
        lock(&self.current)
            .as_ref()
            .and_then(|s| lock(&s.context).committed_global(key).map(|b| b.value.clone()))
    }

    /// Wait for the driving task to finish and return the final state.
    pub async fn wait(&self) -> Option<RunState> {
        let task = lock(&self.task).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!("Run task failed: {}", e);
        }
        self.state()
    }

    /// Snapshot of the current run for persistence or transfer.
    pub fn export(&self) -> EngineResult<RunSnapshot> {
        Ok(self.session()?.snapshot())
    }

    /// Load a snapshot as a read-only run. Its outputs answer the same
    /// draft and outline queries as the exported run.
    pub fn import(&self, snapshot: RunSnapshot) -> EngineResult<()> {
        let mut current = lock(&self.current);
        if let Some(active) = current.as_ref()
            && !active.status().is_terminal()
        {
            return Err(EngineError::AlreadyRunning {
                run_id: active.run_id.clone(),
            });
        }

        let run = snapshot.run;
        let pipeline = lock(&self.pipelines)
            .get(&run.pipeline_id)
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(PipelineDefinition {
                    id: run.pipeline_id.clone(),
                    name: run.pipeline_id.clone(),
                    version: String::new(),
                    phases: Vec::new(),
                    static_context: BTreeMap::new(),
                    global_context: BTreeMap::new(),
                    bindings: BTreeMap::new(),
                })
            });
        let run_id = run.id.clone();
        let session = RunSession::new(SessionParts {
            run_id: run_id.clone(),
            pipeline: pipeline.clone(),
            input: String::new(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            assembler: self.assembler.clone(),
            knowledge: PersistentBindings::new(pipeline.bindings.clone(), self.knowledge.clone()),
            events: self.events.clone(),
            store: None,
            state: run,
            context: ContextStore::new(),
        });
        {
            let mut output = lock(&session.output);
            output.restore_permanent(snapshot.permanent)?;
            output.seal();
        }
        tracing::info!(run_id = %run_id, "Imported run snapshot");
        *current = Some(Arc::new(session));
        Ok(())
    }
}

/// Log a resolution against an unknown or settled id. It has no run impact.
fn stale<T>(result: EngineResult<T>, operation: &str) -> EngineResult<T> {
    if let Err(e) = &result
        && matches!(e, EngineError::UnknownGavel(_) | EngineError::UnknownRequest(_))
    {
        tracing::warn!(operation, "Stale request ignored: {}", e);
    }
    result
}
