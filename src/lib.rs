//! Conductor: a multi-phase, multi-worker generation pipeline engine.
//!
//! A [`PipelineDefinition`] is an ordered list of phases, each made of
//! actions that invoke external workers. The [`PipelineExecutor`] drives
//! one run at a time through those phases, routing results through the
//! [`OutputRouter`](output::OutputRouter), scoping inputs through the
//! [`ContextStore`](context::ContextStore), and pausing at human review
//! checkpoints (gavels).

pub mod config;
pub mod context;
pub mod definition;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gavel;
pub mod ledger;
pub mod output;
pub mod rag;
pub mod state;
pub mod telemetry;
pub mod worker;

pub use definition::PipelineDefinition;
pub use errors::{CallError, EngineError, EngineResult, TransientKind, ValidationError};
pub use events::{EventKind, RunEvent};
pub use executor::{PipelineExecutor, RunOptions};
pub use state::{RunMode, RunSnapshot, RunState, RunStatus};
pub use worker::{ExecutionContext, Invocable, StaticRegistry, WorkerRegistry};
