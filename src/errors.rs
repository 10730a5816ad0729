//! Typed error hierarchy for the conductor engine.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `ValidationError`: bad pipeline definitions, raised only before a run starts
//! - `CallError`: worker invocation failures, classified for retry policy
//! - `EngineError`: executor, router, context, RAG and gavel contract violations

use thiserror::Error;

/// Problems found while validating a pipeline definition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Pipeline id must not be empty")]
    EmptyPipelineId,

    #[error("Pipeline {pipeline} has no phases")]
    NoPhases { pipeline: String },

    #[error("Duplicate phase id '{phase}'")]
    DuplicatePhase { phase: String },

    #[error("Phase {phase} has no actions")]
    NoActions { phase: String },

    #[error("Duplicate action id '{action}' in phase {phase}")]
    DuplicateAction { phase: String, action: String },

    #[error("Phase {phase} depends on unknown or later phase {dependency}")]
    InvalidDependency { phase: String, dependency: String },

    #[error("Action {action} in phase {phase} awaits unknown action {target}")]
    UnknownAwaitTarget {
        phase: String,
        action: String,
        target: String,
    },

    #[error("Trigger cycle in phase {phase} involving action {action}")]
    TriggerCycle { phase: String, action: String },

    #[error("Action {action} in phase {phase} has no participants")]
    NoParticipants { phase: String, action: String },

    #[error("Action {action} in phase {phase} needs max_rounds >= 1")]
    InvalidRounds { phase: String, action: String },

    #[error("Phase {phase} references undeclared persistent binding {binding}")]
    UnknownBinding { phase: String, binding: String },

    #[error("Gavel in phase {phase} targets unknown action {action}")]
    UnknownGavelAction { phase: String, action: String },

    #[error("Invalid extraction pattern for key {key} in phase {phase}: {message}")]
    InvalidPattern {
        phase: String,
        key: String,
        message: String,
    },

    #[error("Phase {phase}: {message}")]
    InvalidPhase { phase: String, message: String },
}

/// Transient failure kinds, all retryable under the action's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    NetworkError,
    RateLimited,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::NetworkError => write!(f, "network_error"),
            TransientKind::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// Failure of a single worker invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("Transient {kind} failure: {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Fatal worker failure: {message}")]
    Fatal { message: String },
}

impl CallError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transient {
            kind: TransientKind::Timeout,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient {
            kind: TransientKind::NetworkError,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::Transient {
            kind: TransientKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the retry policy may re-attempt this call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors from the engine's public contract.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid pipeline '{pipeline}': {reason}")]
    InvalidPipeline { pipeline: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("A run is already active on this executor ({run_id})")]
    AlreadyRunning { run_id: String },

    #[error("No active run")]
    NoActiveRun,

    #[error("Cannot {operation} while run is {status}")]
    InvalidTransition {
        operation: &'static str,
        status: crate::state::RunStatus,
    },

    #[error("Unknown permanent block '{0}'")]
    UnknownBlock(String),

    #[error("Unknown or already resolved RAG request {0}")]
    UnknownRequest(String),

    #[error("Unknown or already resolved gavel {0}")]
    UnknownGavel(String),

    #[error("Gavel {0} cannot be skipped")]
    SkipNotAllowed(String),

    #[error("Field '{field}' is not editable on gavel {gavel}")]
    FieldNotEditable { gavel: String, field: String },

    #[error("Action {0} is not eligible for retry")]
    RetryNotAllowed(String),

    #[error("A retry of action {0} is already in progress")]
    RetryInProgress(String),

    #[error("Output router is sealed; write to {0} discarded")]
    OutputSealed(String),

    #[error("{scope} scope is not open")]
    ScopeClosed { scope: &'static str },

    #[error("Static context is read-only once a run has started (key {0})")]
    StaticReadOnly(String),

    #[error("Unsupported snapshot schema version {found} (max {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
