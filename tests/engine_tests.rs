//! Engine tests for Conductor
//!
//! These tests drive whole runs through `PipelineExecutor` with scripted
//! in-process workers.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};

use conductor::config::EngineConfig;
use conductor::gavel::GavelEdits;
use conductor::state::{ErrorClass, FileStateStore};
use conductor::{
    CallError, EngineError, EventKind, ExecutionContext, Invocable, PipelineDefinition,
    PipelineExecutor, RunEvent, RunOptions, RunStatus, StaticRegistry,
};

/// Worker answering from a script, then with a fixed reply.
struct Scripted {
    replies: Mutex<VecDeque<Result<String, CallError>>>,
    default_reply: String,
    delay: Duration,
    calls: AtomicUsize,
    finished: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(replies: Vec<Result<String, CallError>>, default_reply: &str) -> Arc<Self> {
        Self::delayed(replies, default_reply, Duration::ZERO)
    }

    fn always(reply: &str) -> Arc<Self> {
        Self::new(Vec::new(), reply)
    }

    fn slow(reply: &str, delay: Duration) -> Arc<Self> {
        Self::delayed(Vec::new(), reply, delay)
    }

    fn delayed(replies: Vec<Result<String, CallError>>, default_reply: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            default_reply: default_reply.to_string(),
            delay,
            calls: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Invocable for Scripted {
    async fn invoke(&self, prompt: &str, _ctx: &ExecutionContext) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.default_reply.clone()))
    }
}

/// Worker replying with its prompt's input section, prefixed.
struct Echo(&'static str);

#[async_trait]
impl Invocable for Echo {
    async fn invoke(&self, prompt: &str, _ctx: &ExecutionContext) -> Result<String, CallError> {
        let input = prompt
            .split_once("## Input\n\n")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        Ok(format!("{}{}", self.0, input))
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_ms: 1,
        max_backoff_ms: 5,
        ..Default::default()
    }
}

fn executor(registry: StaticRegistry) -> PipelineExecutor {
    PipelineExecutor::new(Arc::new(registry)).with_config(fast_config())
}

fn pipeline(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::from_yaml_str(yaml).unwrap()
}

async fn next_event(
    rx: &mut broadcast::Receiver<RunEvent>,
    matches: impl Fn(&EventKind) -> bool,
) -> RunEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event.kind) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

fn gavel_id(event: &RunEvent) -> String {
    match &event.kind {
        EventKind::GavelRequested { gavel_id, .. } => gavel_id.clone(),
        other => panic!("expected gavel:requested, got {}", other.name()),
    }
}

// =============================================================================
// Gavel Checkpoints
// =============================================================================

mod gavels {
    use super::*;

    const OUTLINE: &str = r#"
id: book
name: Book
phases:
  - id: outline
    name: Outline
    actions:
      - id: draft_outline
        participants: { workers: [writer] }
    output:
      permanent: final_outline
    gavel:
      prompt: Approve the outline?
"#;

    #[tokio::test]
    async fn test_approve_with_edits_overwrites_permanent_block() {
        let exec = executor(StaticRegistry::new().with_worker("writer", Scripted::always("outline:v1")));
        exec.register_pipeline(pipeline(OUTLINE)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("book", "", RunOptions::default()).unwrap();

        let requested = next_event(&mut events, |k| matches!(k, EventKind::GavelRequested { .. })).await;
        let before = exec.permanent_block("final_outline").unwrap();
        assert_eq!(before.content, "outline:v1");

        exec.approve(&gavel_id(&requested), Some(GavelEdits::output("outline:v1-edited")))
            .unwrap();
        let state = exec.wait().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        let after = exec.permanent_block("final_outline").unwrap();
        assert_eq!(after.content, "outline:v1-edited");
        assert_eq!(after.metadata.version, before.metadata.version + 1);
        assert_eq!(after.metadata.updated_by, "human-review");
        assert_eq!(exec.phase_output("outline").unwrap().content, "outline:v1-edited");
    }

    #[tokio::test]
    async fn test_skip_not_allowed_leaves_gavel_pending() {
        let exec = executor(StaticRegistry::new().with_worker("writer", Scripted::always("outline:v1")));
        exec.register_pipeline(pipeline(OUTLINE)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("book", "", RunOptions::default()).unwrap();

        let id = gavel_id(&next_event(&mut events, |k| matches!(k, EventKind::GavelRequested { .. })).await);
        let err = exec.skip(&id).unwrap_err();
        assert!(matches!(err, EngineError::SkipNotAllowed(_)));
        assert!(exec.pending_gavels().iter().any(|g| g.id == id));

        exec.approve(&id, None).unwrap();
        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(exec.permanent_block("final_outline").unwrap().content, "outline:v1");
    }

    #[tokio::test]
    async fn test_reject_reruns_only_implicated_action() {
        let yaml = r#"
id: book
name: Book
phases:
  - id: outline
    name: Outline
    actions:
      - id: research
        participants: { workers: [researcher] }
        output: { target: { kind: discard } }
      - id: draft_outline
        participants: { workers: [writer] }
    gavel:
      prompt: Approve?
"#;
        let researcher = Scripted::always("notes");
        let writer = Scripted::new(vec![Ok("v1".into()), Ok("v2".into())], "v3");
        let exec = executor(
            StaticRegistry::new()
                .with_worker("researcher", researcher.clone())
                .with_worker("writer", writer.clone()),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("book", "", RunOptions::default()).unwrap();

        let first = gavel_id(&next_event(&mut events, |k| matches!(k, EventKind::GavelRequested { .. })).await);
        exec.reject(&first, Some("too short".into())).unwrap();
        let second = gavel_id(&next_event(&mut events, |k| matches!(k, EventKind::GavelRequested { .. })).await);
        assert_ne!(first, second);
        exec.approve(&second, None).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(exec.phase_output("outline").unwrap().content, "v2");
        assert_eq!(researcher.calls(), 1);
        assert_eq!(writer.calls(), 2);
        let rejected = state.errors_for("outline", "draft_outline");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].class, ErrorClass::Rejected);
    }

    #[tokio::test]
    async fn test_automatic_mode_approves_without_review() {
        let exec = executor(StaticRegistry::new().with_worker("writer", Scripted::always("outline:v1")));
        exec.register_pipeline(pipeline(OUTLINE)).unwrap();
        exec.start_run("book", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.events.iter().any(|e| matches!(
            e.kind,
            EventKind::GavelApproved { edited: false, .. }
        )));
    }
}

// =============================================================================
// Actions, Retries and Orchestration
// =============================================================================

mod actions {
    use super::*;

    #[tokio::test]
    async fn test_parallel_team_outputs_all_committed() {
        let yaml = r#"
id: critique
name: Critique
phases:
  - id: review
    name: Review
    actions:
      - id: red
        participants: { workers: [slow] }
        output: { target: { kind: team, team: red } }
        parallel: true
      - id: green
        participants: { workers: [mid] }
        output: { target: { kind: team, team: green } }
        parallel: true
      - id: blue
        participants: { workers: [fast] }
        output: { target: { kind: team, team: blue } }
        parallel: true
"#;
        let exec = executor(
            StaticRegistry::new()
                .with_worker("slow", Scripted::slow("from red", Duration::from_millis(60)))
                .with_worker("mid", Scripted::slow("from green", Duration::from_millis(30)))
                .with_worker("fast", Scripted::always("from blue")),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("critique", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        let outputs = exec.team_outputs("review");
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs["red"].content, "from red");
        assert_eq!(outputs["green"].content, "from green");
        assert_eq!(outputs["blue"].content, "from blue");
        assert!(exec.phase_output("review").is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_retried_within_budget() {
        let yaml = r#"
id: p
name: P
phases:
  - id: draft
    name: Draft
    actions:
      - id: write
        participants: { workers: [flaky] }
        retry_count: 2
"#;
        let flaky = Scripted::new(
            vec![
                Err(CallError::network("connection reset")),
                Err(CallError::timeout("slow")),
                Ok("third".into()),
            ],
            "unused",
        );
        let exec = executor(StaticRegistry::new().with_worker("flaky", flaky.clone()));
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(exec.phase_output("draft").unwrap().content, "third");
        assert_eq!(flaky.calls(), 3);

        let errors = state.errors_for("draft", "write");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.class == ErrorClass::Transient));
        let retried = state
            .events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::ActionRetried { .. }))
            .count();
        assert_eq!(retried, 2);
    }

    #[tokio::test]
    async fn test_fatal_error_skips_retries_and_uses_fallback() {
        let yaml = r#"
id: p
name: P
phases:
  - id: draft
    name: Draft
    actions:
      - id: write
        participants: { workers: [broken] }
        retry_count: 3
        fallback: backup
"#;
        let broken = Scripted::new(vec![Err(CallError::fatal("bad request"))], "unused");
        let exec = executor(
            StaticRegistry::new()
                .with_worker("broken", broken.clone())
                .with_worker("backup", Scripted::always("from backup")),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(broken.calls(), 1);
        assert_eq!(exec.phase_output("draft").unwrap().content, "from backup");
    }

    #[tokio::test]
    async fn test_failed_action_leaves_absent_input_downstream() {
        let yaml = r#"
id: p
name: P
phases:
  - id: draft
    name: Draft
    actions:
      - id: write
        participants: { workers: [broken] }
        retry_count: 0
  - id: edit
    name: Edit
    actions:
      - id: polish
        participants: { workers: [editor] }
        input: { source: { kind: phase_output, phase: draft } }
"#;
        let editor = Scripted::always("polished");
        let exec = executor(
            StaticRegistry::new()
                .with_worker("broken", Scripted::new(vec![Err(CallError::fatal("no"))], "unused"))
                .with_worker("editor", editor.clone()),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(editor.calls(), 0);
        let missing = state.errors_for("edit", "polish");
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].class, ErrorClass::MissingInput);
        assert_eq!(state.progress.actions_failed, 2);
    }

    #[tokio::test]
    async fn test_sequential_participants_chain_input() {
        let yaml = r#"
id: p
name: P
phases:
  - id: chain
    name: Chain
    actions:
      - id: relay
        participants: { workers: [a, b] }
"#;
        let exec = executor(
            StaticRegistry::new()
                .with_worker("a", Arc::new(Echo("a:")))
                .with_worker("b", Arc::new(Echo("b:"))),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "seed", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        assert_eq!(exec.phase_output("chain").unwrap().content, "b:a:seed");
    }

    #[tokio::test]
    async fn test_parallel_mode_consolidates_by_participant() {
        let yaml = r#"
id: p
name: P
phases:
  - id: brainstorm
    name: Brainstorm
    actions:
      - id: ideas
        participants: { workers: [a, b], mode: parallel }
"#;
        let exec = executor(
            StaticRegistry::new()
                .with_named_worker("a", "Alice", Scripted::slow("alpha", Duration::from_millis(20)))
                .with_named_worker("b", "Bob", Scripted::always("beta")),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        assert_eq!(
            exec.phase_output("brainstorm").unwrap().content,
            "### Alice\nalpha\n\n### Bob\nbeta"
        );
    }

    #[tokio::test]
    async fn test_consensus_stops_at_first_agreement() {
        let yaml = r#"
id: p
name: P
phases:
  - id: decide
    name: Decide
    actions:
      - id: vote
        participants: { workers: [a, b], mode: consensus, max_rounds: 3 }
"#;
        let a = Scripted::always("ship it");
        let b = Scripted::always(" ship   it ");
        let exec = executor(StaticRegistry::new().with_worker("a", a.clone()).with_worker("b", b.clone()));
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        assert_eq!(exec.phase_output("decide").unwrap().content, "ship it");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_await_trigger_waits_for_named_action() {
        let yaml = r#"
id: p
name: P
phases:
  - id: draft
    name: Draft
    actions:
      - id: outline
        participants: { workers: [slow] }
        output: { target: { kind: team, team: plan } }
      - id: review
        participants: { workers: [reviewer] }
        trigger: { kind: await, action: outline, state: completed }
        input: { source: { kind: action, action: outline } }
"#;
        let reviewer = Arc::new(Echo("reviewed:"));
        let exec = executor(
            StaticRegistry::new()
                .with_worker("slow", Scripted::slow("the plan", Duration::from_millis(40)))
                .with_worker("reviewer", reviewer),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        assert_eq!(exec.phase_output("draft").unwrap().content, "reviewed:the plan");
    }
}

// =============================================================================
// RAG Requests
// =============================================================================

mod rag {
    use super::*;

    #[tokio::test]
    async fn test_unfulfilled_request_times_out_to_absence() {
        let yaml = r#"
id: p
name: P
static_context:
  topic: tides
phases:
  - id: research
    name: Research
    rag: { scope: phase, query: "facts about {{topic}}" }
    execution: { timeout_ms: 500 }
    actions:
      - id: summarize
        participants: { workers: [w] }
"#;
        let worker = Scripted::always("summary");
        let exec = executor(StaticRegistry::new().with_worker("w", worker.clone()));
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.events.iter().any(|e| matches!(
            &e.kind,
            EventKind::RagRequested { query, .. } if query == "facts about tides"
        )));
        assert!(state.events.iter().any(|e| matches!(e.kind, EventKind::RagTimeout { .. })));
        assert!(!state.events.iter().any(|e| matches!(e.kind, EventKind::RunError { .. })));
        assert!(!worker.last_prompt().contains("### rag"));
        assert!(exec.pending_rag().is_empty());
    }

    #[tokio::test]
    async fn test_fulfilled_content_reaches_prompt() {
        let yaml = r#"
id: p
name: P
phases:
  - id: research
    name: Research
    rag: { scope: phase, query: "tides", wait_ms: 5000 }
    actions:
      - id: summarize
        participants: { workers: [w] }
"#;
        let worker = Scripted::always("summary");
        let exec = executor(StaticRegistry::new().with_worker("w", worker.clone()));
        exec.register_pipeline(pipeline(yaml)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let requested = next_event(&mut events, |k| matches!(k, EventKind::RagRequested { .. })).await;
        let EventKind::RagRequested { request_id, .. } = requested.kind else {
            unreachable!()
        };
        exec.respond_rag(&request_id, "the moon pulls water", vec!["almanac".into()])
            .unwrap();

        exec.wait().await.unwrap();
        assert!(worker.last_prompt().contains("### rag (phase)\nthe moon pulls water"));
        assert!(matches!(
            exec.respond_rag(&request_id, "again", vec![]),
            Err(EngineError::UnknownRequest(_))
        ));
    }
}

// =============================================================================
// Run Control
// =============================================================================

mod run_control {
    use super::*;

    #[tokio::test]
    async fn test_abort_discards_in_flight_results() {
        let yaml = r#"
id: p
name: P
phases:
  - id: first
    name: First
    actions:
      - id: a1
        participants: { workers: [fast] }
  - id: second
    name: Second
    actions:
      - id: p1
        participants: { workers: [slow] }
        output: { target: { kind: team, team: x } }
        parallel: true
      - id: p2
        participants: { workers: [slow] }
        output: { target: { kind: team, team: y } }
        parallel: true
"#;
        let slow = Scripted::slow("late", Duration::from_millis(300));
        let exec = executor(
            StaticRegistry::new()
                .with_worker("fast", Scripted::always("early"))
                .with_worker("slow", slow.clone()),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        for _ in 0..2 {
            next_event(&mut events, |k| {
                matches!(k, EventKind::ActionStarted { phase_id, .. } if phase_id == "second")
            })
            .await;
        }
        exec.abort().unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Aborted);
        assert_eq!(state.progress.phases_completed, 1);
        assert_eq!(slow.finished.load(Ordering::SeqCst), 2);
        assert!(exec.team_outputs("second").is_empty());
        assert_eq!(exec.phase_output("first").unwrap().content, "early");

        let aborted_at = state
            .events
            .iter()
            .position(|e| matches!(e.kind, EventKind::RunAborted))
            .unwrap();
        assert!(
            !state.events[aborted_at..]
                .iter()
                .any(|e| matches!(e.kind, EventKind::OutputUpdated { .. }))
        );
    }

    #[tokio::test]
    async fn test_critical_failure_keeps_prior_draft() {
        let yaml = r#"
id: p
name: P
phases:
  - id: draft
    name: Draft
    actions:
      - id: write
        participants: { workers: [writer] }
    output: { permanent: final_draft }
  - id: rewrite
    name: Rewrite
    execution: { critical: true }
    actions:
      - id: polish
        participants: { workers: [flaky] }
        retry_count: 1
    output: { permanent: final_draft }
"#;
        let flaky = Scripted::new(
            vec![
                Err(CallError::rate_limited("429")),
                Err(CallError::rate_limited("429")),
            ],
            "draft:v2",
        );
        let exec = executor(
            StaticRegistry::new()
                .with_worker("writer", Scripted::always("draft:v1"))
                .with_worker("flaky", flaky.clone()),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(flaky.calls(), 2);
        let draft = exec.final_draft().unwrap();
        assert_eq!(draft.content, "draft:v1");
        assert_eq!(draft.metadata.version, 1);
        assert!(exec.phase_output("rewrite").is_none());
        assert!(state.events.iter().any(|e| matches!(
            &e.kind,
            EventKind::RunError { phase_id: Some(phase), action_id: Some(action), class: ErrorClass::Transient, .. }
                if phase == "rewrite" && action == "polish"
        )));

        // The error status is terminal.
        assert!(matches!(
            exec.retry_action("polish").await,
            Err(EngineError::InvalidTransition { operation: "retry_action", status: RunStatus::Error })
        ));
        assert_eq!(exec.status(), RunStatus::Error);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(exec.final_draft().unwrap().content, "draft:v1");
    }

    const HELD_FOR_RETRY: &str = r#"
id: p
name: P
phases:
  - id: draft
    name: Draft
    actions:
      - id: write
        participants: { workers: [flaky] }
        retry_count: 0
  - id: review
    name: Review
    actions:
      - id: read
        participants: { workers: [reader] }
"#;

    #[tokio::test]
    async fn test_interactive_failure_holds_run_for_retry() {
        let flaky = Scripted::new(vec![Err(CallError::fatal("bad request"))], "draft:v2");
        let exec = executor(
            StaticRegistry::new()
                .with_worker("flaky", flaky.clone())
                .with_worker("reader", Scripted::always("looks good")),
        );
        exec.register_pipeline(pipeline(HELD_FOR_RETRY)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("p", "", RunOptions::default()).unwrap();

        next_event(&mut events, |k| matches!(k, EventKind::RunPaused)).await;
        assert_eq!(exec.status(), RunStatus::Paused);
        assert_eq!(exec.retry_candidate().as_deref(), Some("write"));
        assert!(exec.phase_output("draft").is_none());
        assert!(!exec.state().unwrap().events.iter().any(|e| matches!(
            &e.kind,
            EventKind::PhaseStarted { phase_id, .. } if phase_id == "review"
        )));

        exec.retry_action("write").await.unwrap();
        assert_eq!(flaky.calls(), 2);
        assert_eq!(exec.phase_output("draft").unwrap().content, "draft:v2");
        assert_eq!(exec.status(), RunStatus::Paused);
        assert!(exec.retry_candidate().is_none());

        exec.resume().unwrap();
        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(exec.phase_output("review").unwrap().content, "looks good");
    }

    #[tokio::test]
    async fn test_automatic_failure_does_not_hold_run() {
        let flaky = Scripted::new(vec![Err(CallError::fatal("bad request"))], "draft:v2");
        let exec = executor(
            StaticRegistry::new()
                .with_worker("flaky", flaky)
                .with_worker("reader", Scripted::always("looks good")),
        );
        exec.register_pipeline(pipeline(HELD_FOR_RETRY)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(!state.events.iter().any(|e| matches!(e.kind, EventKind::RunPaused)));
        assert!(exec.phase_output("draft").is_none());
    }

    #[tokio::test]
    async fn test_run_stays_owned_while_retry_in_flight() {
        let flaky = Scripted::delayed(
            vec![Err(CallError::fatal("bad request"))],
            "draft:v2",
            Duration::from_millis(300),
        );
        let exec = executor(
            StaticRegistry::new()
                .with_worker("flaky", flaky.clone())
                .with_worker("reader", Scripted::always("looks good")),
        );
        exec.register_pipeline(pipeline(HELD_FOR_RETRY)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("p", "", RunOptions::default()).unwrap();
        next_event(&mut events, |k| matches!(k, EventKind::RunPaused)).await;

        let retry = exec.retry_action("write");
        let contend = async {
            next_event(&mut events, |k| {
                matches!(k, EventKind::ActionStarted { action_id, .. } if action_id == "write")
            })
            .await;
            assert!(matches!(
                exec.start_run("p", "", RunOptions::default()),
                Err(EngineError::AlreadyRunning { .. })
            ));
            assert!(matches!(exec.resume(), Err(EngineError::RetryInProgress(id)) if id == "write"));
            assert!(matches!(
                exec.retry_action("write").await,
                Err(EngineError::RetryInProgress(_))
            ));
        };
        let (retried, ()) = tokio::join!(retry, contend);
        retried.unwrap();
        assert_eq!(flaky.calls(), 2);
        assert_eq!(exec.status(), RunStatus::Paused);

        exec.resume().unwrap();
        assert_eq!(exec.wait().await.unwrap().status, RunStatus::Completed);
        assert_eq!(exec.phase_output("draft").unwrap().content, "draft:v2");
    }

    #[tokio::test]
    async fn test_retry_action_rejected_for_other_action() {
        let exec = executor(
            StaticRegistry::new()
                .with_worker("flaky", Scripted::new(vec![Err(CallError::fatal("no"))], "ok"))
                .with_worker("reader", Scripted::always("fine")),
        );
        exec.register_pipeline(pipeline(HELD_FOR_RETRY)).unwrap();
        let mut events = exec.subscribe();
        exec.start_run("p", "", RunOptions::default()).unwrap();
        next_event(&mut events, |k| matches!(k, EventKind::RunPaused)).await;

        assert!(matches!(
            exec.retry_action("read").await,
            Err(EngineError::RetryNotAllowed(_))
        ));
        assert_eq!(exec.retry_candidate().as_deref(), Some("write"));
        exec.retry_action("write").await.unwrap();
        assert!(matches!(
            exec.retry_action("write").await,
            Err(EngineError::RetryNotAllowed(_))
        ));

        exec.resume().unwrap();
        assert_eq!(exec.wait().await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_phases_complete_in_declared_order() {
        let yaml = r#"
id: p
name: P
phases:
  - { id: one, name: One, actions: [{ id: a, participants: { workers: [w] } }] }
  - { id: two, name: Two, actions: [{ id: a, participants: { workers: [w] } }], depends_on: [one] }
  - { id: three, name: Three, actions: [{ id: a, participants: { workers: [w] } }] }
"#;
        let exec = executor(StaticRegistry::new().with_worker("w", Scripted::always("ok")));
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        let order: Vec<&str> = state
            .events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::PhaseCompleted { phase_id } => Some(phase_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_pause_holds_at_phase_boundary() {
        let yaml = r#"
id: p
name: P
phases:
  - { id: one, name: One, actions: [{ id: a, participants: { workers: [slow] } }] }
  - { id: two, name: Two, actions: [{ id: b, participants: { workers: [slow] } }] }
"#;
        let exec = executor(
            StaticRegistry::new().with_worker("slow", Scripted::slow("ok", Duration::from_millis(100))),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.pause().unwrap();
        assert!(matches!(
            exec.pause(),
            Err(EngineError::InvalidTransition { operation: "pause", .. })
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let state = exec.state().unwrap();
        assert_eq!(state.status, RunStatus::Paused);
        assert!(!state.events.iter().any(|e| matches!(
            &e.kind,
            EventKind::PhaseStarted { phase_id, .. } if phase_id == "two"
        )));

        exec.resume().unwrap();
        let state = exec.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.progress.phases_completed, 2);
    }

    #[tokio::test]
    async fn test_second_start_fails_while_running() {
        let yaml = r#"
id: p
name: P
phases:
  - { id: one, name: One, actions: [{ id: a, participants: { workers: [slow] } }] }
"#;
        let exec = executor(
            StaticRegistry::new().with_worker("slow", Scripted::slow("ok", Duration::from_millis(200))),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let err = exec.start_run("p", "", RunOptions::automatic()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));

        exec.abort().unwrap();
        assert_eq!(exec.wait().await.unwrap().status, RunStatus::Aborted);
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_predicate_false_skips_phase() {
        let yaml = r#"
id: p
name: P
global_context:
  genre: noir
phases:
  - id: romance
    name: Romance
    condition: { kind: equals, scope: global, key: genre, value: romance }
    actions:
      - { id: a, participants: { workers: [w] } }
  - id: mystery
    name: Mystery
    condition: { kind: present, scope: global, key: genre }
    actions:
      - { id: b, participants: { workers: [w] } }
"#;
        let worker = Scripted::always("ok");
        let exec = executor(StaticRegistry::new().with_worker("w", worker.clone()));
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        let state = exec.wait().await.unwrap();
        assert_eq!(state.progress.phases_skipped, 1);
        assert_eq!(state.progress.phases_completed, 1);
        assert!(exec.phase_output("romance").is_none());
        assert_eq!(worker.calls(), 1);
    }
}

// =============================================================================
// Context and Persistence
// =============================================================================

mod context_and_state {
    use super::*;

    #[tokio::test]
    async fn test_extraction_feeds_later_phase() {
        let yaml = r#"
id: p
name: P
phases:
  - id: plan
    name: Plan
    actions:
      - { id: a, participants: { workers: [planner] } }
    extract:
      - key: title
        from: { kind: phase_output }
        pattern: "title: (\\w+)"
  - id: write
    name: Write
    actions:
      - id: b
        participants: { workers: [echo] }
        input: { source: { kind: context, scope: global, key: title } }
"#;
        let exec = executor(
            StaticRegistry::new()
                .with_worker("planner", Scripted::always("title: Tides\nbody text"))
                .with_worker("echo", Arc::new(Echo("book:"))),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        assert_eq!(exec.global("title").as_deref(), Some("Tides"));
        assert_eq!(exec.phase_output("write").unwrap().content, "book:Tides");
    }

    #[tokio::test]
    async fn test_promoted_and_shared_context_reach_later_readers() {
        let yaml = r#"
id: p
name: P
phases:
  - id: plan
    name: Plan
    context:
      promote: [theme, missing]
      share: [{ from: red, key: idea, to: blue }]
    actions:
      - id: theme
        participants: { workers: [planner] }
        output: { target: { kind: context, scope: phase, key: theme } }
      - id: pitch
        participants: { teams: [red] }
        output: { target: { kind: context, scope: team, key: idea } }
      - id: answer
        participants: { teams: [blue] }
        input: { source: { kind: context, scope: team, key: idea } }
  - id: write
    name: Write
    actions:
      - id: recall
        participants: { workers: [echo] }
        input: { source: { kind: context, scope: global, key: theme } }
"#;
        let exec = executor(
            StaticRegistry::new()
                .with_worker("planner", Scripted::always("noir"))
                .with_worker("pitcher", Scripted::always("a heist"))
                .with_worker("answerer", Arc::new(Echo("answered:")))
                .with_worker("echo", Arc::new(Echo("book:")))
                .with_team("red", &["pitcher"])
                .with_team("blue", &["answerer"]),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        assert_eq!(exec.wait().await.unwrap().status, RunStatus::Completed);

        assert_eq!(exec.phase_output("plan").unwrap().content, "answered:a heist");
        assert_eq!(exec.global("theme").as_deref(), Some("noir"));
        assert!(exec.global("idea").is_none());
        assert!(exec.global("missing").is_none());
        assert_eq!(exec.phase_output("write").unwrap().content, "book:noir");
    }

    #[tokio::test]
    async fn test_unshared_team_context_stays_isolated() {
        let yaml = r#"
id: p
name: P
phases:
  - id: plan
    name: Plan
    actions:
      - id: pitch
        participants: { teams: [red] }
        output: { target: { kind: context, scope: team, key: idea } }
      - id: answer
        participants: { teams: [blue] }
        input: { source: { kind: context, scope: team, key: idea } }
"#;
        let answerer = Scripted::always("nothing to go on");
        let exec = executor(
            StaticRegistry::new()
                .with_worker("pitcher", Scripted::always("a heist"))
                .with_worker("answerer", answerer.clone())
                .with_team("red", &["pitcher"])
                .with_team("blue", &["answerer"]),
        );
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        assert!(!answerer.last_prompt().contains("a heist"));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_state_store() {
        let yaml = r#"
id: p
name: P
phases:
  - id: outline
    name: Outline
    actions: [{ id: a, participants: { workers: [w] } }]
    output: { permanent: first_outline }
  - id: draft
    name: Draft
    actions: [{ id: b, participants: { workers: [w] } }]
    output: { permanent: second_draft }
"#;
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        let exec = executor(StaticRegistry::new().with_worker("w", Scripted::always("content")))
            .with_state_store(store.clone());
        exec.register_pipeline(pipeline(yaml)).unwrap();
        let run_id = exec.start_run("p", "", RunOptions::automatic()).unwrap();
        exec.wait().await.unwrap();

        let snapshot = store.load(&run_id).unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);

        let restored = executor(StaticRegistry::new());
        restored.import(snapshot).unwrap();
        assert_eq!(restored.latest_draft(), exec.latest_draft());
        assert_eq!(restored.latest_outline(), exec.latest_outline());
        assert_eq!(restored.latest_draft().unwrap().id, "second_draft");
    }

    #[tokio::test]
    async fn test_event_handler_panic_does_not_reach_run() {
        let yaml = r#"
id: p
name: P
phases:
  - { id: one, name: One, actions: [{ id: a, participants: { workers: [w] } }] }
"#;
        let exec = executor(StaticRegistry::new().with_worker("w", Scripted::always("ok")));
        exec.on_event(Arc::new(|event: &RunEvent| {
            if matches!(event.kind, EventKind::PhaseStarted { .. }) {
                panic!("handler failure");
            }
        }));
        exec.register_pipeline(pipeline(yaml)).unwrap();
        exec.start_run("p", "", RunOptions::automatic()).unwrap();

        assert_eq!(exec.wait().await.unwrap().status, RunStatus::Completed);
    }
}
