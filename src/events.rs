//! Observability event stream.
//!
//! Every lifecycle transition of a run is emitted as a [`RunEvent`]:
//! - appended to `RunState.events` by the executor
//! - broadcast to every [`EventBus::subscribe`] receiver
//! - passed to every registered callback handler
//!
//! Handlers run inside `catch_unwind`; a panicking handler is logged and
//! never reaches the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::errors::TransientKind;
use crate::output::BlockKind;
use crate::rag::RagScope;
use crate::state::ErrorClass;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "run:started")]
    RunStarted { pipeline_id: String },
    #[serde(rename = "run:paused")]
    RunPaused,
    #[serde(rename = "run:resumed")]
    RunResumed,
    #[serde(rename = "run:completed")]
    RunCompleted,
    /// The run escalated to `error`.
    #[serde(rename = "run:error")]
    RunError {
        phase_id: Option<String>,
        action_id: Option<String>,
        class: ErrorClass,
        message: String,
    },
    #[serde(rename = "run:aborted")]
    RunAborted,

    #[serde(rename = "phase:started")]
    PhaseStarted { phase_id: String, index: usize },
    #[serde(rename = "phase:completed")]
    PhaseCompleted { phase_id: String },
    /// The phase's skip predicate evaluated to false.
    #[serde(rename = "phase:skipped")]
    PhaseSkipped { phase_id: String },

    #[serde(rename = "action:started")]
    ActionStarted {
        phase_id: String,
        action_id: String,
        attempt: u32,
    },
    #[serde(rename = "action:completed")]
    ActionCompleted { phase_id: String, action_id: String },
    #[serde(rename = "action:error")]
    ActionError {
        phase_id: String,
        action_id: String,
        class: ErrorClass,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient_kind: Option<TransientKind>,
        message: String,
        attempt: u32,
    },
    #[serde(rename = "action:retried")]
    ActionRetried {
        phase_id: String,
        action_id: String,
        attempt: u32,
        reason: String,
    },

    #[serde(rename = "gavel:requested")]
    GavelRequested {
        gavel_id: String,
        phase_id: String,
        prompt: String,
    },
    #[serde(rename = "gavel:approved")]
    GavelApproved {
        gavel_id: String,
        phase_id: String,
        edited: bool,
    },
    #[serde(rename = "gavel:rejected")]
    GavelRejected { gavel_id: String, phase_id: String },
    #[serde(rename = "gavel:skipped")]
    GavelSkipped { gavel_id: String, phase_id: String },

    #[serde(rename = "output:updated")]
    OutputUpdated {
        block_id: String,
        kind: BlockKind,
        version: u32,
    },

    #[serde(rename = "rag:requested")]
    RagRequested {
        request_id: String,
        phase_id: String,
        scope: RagScope,
        query: String,
    },
    #[serde(rename = "rag:fulfilled")]
    RagFulfilled { request_id: String, token_count: u32 },
    #[serde(rename = "rag:timeout")]
    RagTimeout { request_id: String, phase_id: String },
}

impl EventKind {
    /// Wire name of the event, e.g. `phase:started`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run:started",
            EventKind::RunPaused => "run:paused",
            EventKind::RunResumed => "run:resumed",
            EventKind::RunCompleted => "run:completed",
            EventKind::RunError { .. } => "run:error",
            EventKind::RunAborted => "run:aborted",
            EventKind::PhaseStarted { .. } => "phase:started",
            EventKind::PhaseCompleted { .. } => "phase:completed",
            EventKind::PhaseSkipped { .. } => "phase:skipped",
            EventKind::ActionStarted { .. } => "action:started",
            EventKind::ActionCompleted { .. } => "action:completed",
            EventKind::ActionError { .. } => "action:error",
            EventKind::ActionRetried { .. } => "action:retried",
            EventKind::GavelRequested { .. } => "gavel:requested",
            EventKind::GavelApproved { .. } => "gavel:approved",
            EventKind::GavelRejected { .. } => "gavel:rejected",
            EventKind::GavelSkipped { .. } => "gavel:skipped",
            EventKind::OutputUpdated { .. } => "output:updated",
            EventKind::RagRequested { .. } => "rag:requested",
            EventKind::RagFulfilled { .. } => "rag:fulfilled",
            EventKind::RagTimeout { .. } => "rag:timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl RunEvent {
    pub fn new(run_id: &str, kind: EventKind) -> Self {
        Self {
            run_id: run_id.to_string(),
            at: Utc::now(),
            kind,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Fan-out of run events to broadcast receivers and callback handlers.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
    handlers: RwLock<Vec<EventHandler>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Register a callback invoked synchronously for every event.
    pub fn on(&self, handler: EventHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn emit(&self, event: &RunEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event.clone());

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(
                    run_id = %event.run_id,
                    event = event.kind.name(),
                    "Event handler panicked; event dropped for that handler"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
