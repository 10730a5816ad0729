//! Single-action execution: input resolution, orchestration modes, retry
//! budget and fallback.

use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::future::join_all;

use super::session::{RunSession, Staging, lock};
use crate::context::{ContextScope, Provenance};
use crate::definition::{
    ActionDefinition, InputSource, OrchestrationMode, OutputTarget, PhaseDefinition,
};
use crate::errors::CallError;
use crate::events::EventKind;
use crate::ledger::{ThreadKind, collab_thread, main_thread, team_thread};
use crate::rag::{ContextManifest, RagScope, estimate_tokens, render_query};
use crate::state::ErrorClass;
use crate::worker::{ExecutionContext, PromptParts};

/// How an action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ActionOutcome {
    Completed(String),
    Failed,
    /// Abort was observed; any result was discarded.
    Aborted,
}

/// A worker taking part in an action, with the team it was drawn from.
#[derive(Debug, Clone)]
struct Participant {
    worker_id: String,
    team_id: Option<String>,
    display_name: String,
}

/// What a single attempt invokes with.
struct Attempt<'a> {
    session: &'a RunSession,
    phase: &'a PhaseDefinition,
    action: &'a ActionDefinition,
    attempt: u32,
}

impl Attempt<'_> {
    fn thread_for(&self, participant: &Participant) -> Option<String> {
        match (&participant.team_id, self.phase.thread.team, self.phase.thread.main) {
            (Some(team), true, _) => Some(team_thread(&self.phase.id, team)),
            (_, _, true) => Some(main_thread(&self.phase.id)),
            _ => None,
        }
    }

    /// Invoke one participant. History is replayed from `thread` and the
    /// reply appended to it.
    async fn invoke(
        &self,
        participant: &Participant,
        input: Option<String>,
        thread: Option<&str>,
        round: u32,
    ) -> Result<String, CallError> {
        let session = self.session;
        let team = participant.team_id.as_deref();
        let worker = Some(participant.worker_id.as_str());

        let mut context = lock(&session.context).injected(&self.phase.context, team, worker);
        context.extend(
            session
                .knowledge
                .resolve_all(&self.phase.context.persistent_refs)
                .await,
        );
        let history = thread
            .map(|t| lock(&session.ledger).tail(t, self.phase.thread.replay_limit))
            .unwrap_or_default();
        let prompt = session.assembler.assemble(&PromptParts {
            instructions: self.action.instructions.clone(),
            context,
            history,
            input,
        });

        let ctx = ExecutionContext {
            run_id: session.run_id.clone(),
            phase_id: self.phase.id.clone(),
            action_id: self.action.id.clone(),
            worker_id: participant.worker_id.clone(),
            team_id: participant.team_id.clone(),
            attempt: self.attempt,
            round,
        };
        let Some(invocable) = session.registry.resolve(&participant.worker_id) else {
            return Err(CallError::fatal(format!(
                "Unknown worker '{}'",
                participant.worker_id
            )));
        };

        let timeout = session.action_timeout(self.action);
        let content = match tokio::time::timeout(timeout, invocable.invoke(&prompt, &ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CallError::timeout(format!(
                    "Worker '{}' did not answer within {:?}",
                    participant.worker_id, timeout
                )));
            }
        };

        if let Some(thread) = thread
            && !session.is_aborted()
        {
            lock(&session.ledger).append_participant_message(
                thread,
                &participant.worker_id,
                &participant.display_name,
                content.clone(),
                serde_json::json!({
                    "action_id": self.action.id,
                    "attempt": self.attempt,
                    "round": round,
                }),
            );
        }
        Ok(content)
    }

    async fn sequential(
        &self,
        participants: &[Participant],
        input: Option<String>,
    ) -> Result<String, CallError> {
        let mut current = input;
        for participant in participants {
            let thread = self.thread_for(participant);
            current = Some(self.invoke(participant, current, thread.as_deref(), 1).await?);
        }
        Ok(current.unwrap_or_default())
    }

    async fn parallel(
        &self,
        participants: &[Participant],
        input: Option<String>,
    ) -> Result<String, CallError> {
        let threads: Vec<Option<String>> = participants.iter().map(|p| self.thread_for(p)).collect();
        let replies = join_all(
            participants
                .iter()
                .zip(&threads)
                .map(|(p, thread)| self.invoke(p, input.clone(), thread.as_deref(), 1)),
        )
        .await;

        let mut sections = Vec::with_capacity(replies.len());
        for (participant, reply) in participants.iter().zip(replies) {
            sections.push((participant, reply?));
        }
        if let [(_, only)] = sections.as_slice() {
            return Ok(only.clone());
        }
        Ok(sections
            .iter()
            .map(|(p, content)| format!("### {}\n{}", p.display_name, content))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    fn open_collaboration(&self) -> String {
        let thread = collab_thread(&self.phase.id, &self.action.id);
        let mut ledger = lock(&self.session.ledger);
        ledger.open(&thread, ThreadKind::Collaboration);
        ledger.append_system_marker(
            &thread,
            format!("Collaboration on {} (attempt {})", self.action.display_name(), self.attempt),
        );
        thread
    }

    async fn round_robin(
        &self,
        participants: &[Participant],
        input: Option<String>,
        rounds: u32,
    ) -> Result<String, CallError> {
        let thread = self.open_collaboration();
        let mut last = String::new();
        for round in 1..=rounds {
            for participant in participants {
                last = self
                    .invoke(participant, input.clone(), Some(&thread), round)
                    .await?;
            }
        }
        Ok(last)
    }

    async fn consensus(
        &self,
        participants: &[Participant],
        input: Option<String>,
        rounds: u32,
    ) -> Result<String, CallError> {
        let thread = self.open_collaboration();
        let mut answers: Vec<String> = Vec::new();
        for round in 1..=rounds {
            let replies = join_all(
                participants
                    .iter()
                    .map(|p| self.invoke(p, input.clone(), Some(&thread), round)),
            )
            .await;
            answers = replies.into_iter().collect::<Result<Vec<_>, _>>()?;

            let first = normalize(&answers[0]);
            if answers.iter().all(|a| normalize(a) == first) {
                tracing::debug!(action = %self.action.id, round, "Consensus reached");
                return Ok(answers.swap_remove(0));
            }
            if round < rounds {
                lock(&self.session.ledger).append_system_marker(
                    &thread,
                    format!("Round {} ended without agreement", round),
                );
            }
        }
        Ok(majority(answers))
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Most frequent answer by normalized text; ties go to the earliest participant.
fn majority(answers: Vec<String>) -> String {
    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (i, answer) in answers.iter().enumerate() {
        let entry = counts.entry(normalize(answer)).or_insert((0, i));
        entry.0 += 1;
    }
    let winner = counts
        .values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|&(_, first)| first);
    winner
        .and_then(|i| answers.into_iter().nth(i))
        .unwrap_or_default()
}

/// Expand worker and team ids into participants, in declaration order.
fn participants(
    session: &RunSession,
    action: &ActionDefinition,
) -> Result<Vec<Participant>, CallError> {
    let named = |worker_id: &str, team_id: Option<&str>| Participant {
        worker_id: worker_id.to_string(),
        team_id: team_id.map(str::to_string),
        display_name: session.registry.display_name(worker_id),
    };
    let mut list: Vec<Participant> = action
        .participants
        .workers
        .iter()
        .map(|w| named(w, None))
        .collect();
    for team in &action.participants.teams {
        let members = session
            .registry
            .team_members(team)
            .ok_or_else(|| CallError::fatal(format!("Unknown team '{}'", team)))?;
        list.extend(members.iter().map(|w| named(w, Some(team))));
    }
    if list.is_empty() {
        return Err(CallError::fatal("Action has no resolvable participants"));
    }
    Ok(list)
}

/// Resolve the action's input. Outer `None` means the source is absent.
async fn resolve_input(
    session: &RunSession,
    phase: &PhaseDefinition,
    action: &ActionDefinition,
    staging: &Mutex<Staging>,
) -> Option<String> {
    if let InputSource::Context {
        scope: ContextScope::Persistent,
        key,
    } = &action.input.source
    {
        let block = session.knowledge.resolve(key).await?;
        return Some(action.input.transform.apply(&block.value));
    }

    let raw = match &action.input.source {
        InputSource::RunInput => Some(session.input.clone()),
        InputSource::PhaseOutput { phase: source } if *source == phase.id => {
            lock(staging).phase.as_ref().map(|s| s.content.clone())
        }
        InputSource::PhaseOutput { phase: source } => lock(&session.output)
            .get_phase_output(source)
            .map(|b| b.content.clone()),
        InputSource::TeamOutput { phase: source, team } if *source == phase.id => {
            lock(staging).teams.get(team).map(|s| s.content.clone())
        }
        InputSource::TeamOutput { phase: source, team } => lock(&session.output)
            .get_team_output(source, team)
            .map(|b| b.content.clone()),
        InputSource::Permanent { block } => lock(&session.output)
            .permanent(*block)
            .map(|b| b.content.clone()),
        InputSource::Context { scope, key } => {
            let reference = crate::context::ContextRef::new(*scope, key.clone());
            let team = action.participants.teams.first().map(String::as_str);
            let worker = action.participants.workers.first().map(String::as_str);
            lock(&session.context)
                .lookup(&reference, team, worker)
                .map(|b| b.value.clone())
        }
        InputSource::Action { action: source } => lock(staging).results.get(source).cloned(),
        InputSource::Empty => None,
    };
    raw.map(|value| action.input.transform.apply(&value))
}

/// Issue agent-scoped RAG requests for the action's targeted participants
/// and wait for them, bounded by the RAG wait and the phase timeout.
async fn request_agent_rag(
    session: &RunSession,
    phase: &PhaseDefinition,
    participants: &[Participant],
) {
    let Some(spec) = phase
        .rag
        .as_ref()
        .filter(|r| r.enabled && r.scope == RagScope::Agent)
    else {
        return;
    };
    let targets: Vec<&Participant> = participants
        .iter()
        .filter(|p| spec.targets.is_empty() || spec.targets.contains(&p.worker_id))
        .collect();
    let ids: Vec<String> = targets
        .into_iter()
        .map(|p| {
            super::phase::issue_rag(
                session,
                phase,
                spec,
                RagScope::Agent,
                vec![p.worker_id.clone()],
                p.team_id.as_deref(),
            )
        })
        .collect();
    super::phase::await_rag(session, phase, spec, &ids).await;
}

pub(crate) fn manifest(session: &RunSession, phase: &PhaseDefinition) -> ContextManifest {
    let context = lock(&session.context);
    let keys = context.visible_keys();
    let approx_tokens = context
        .injected(&phase.context, None, None)
        .iter()
        .map(|b| estimate_tokens(&b.value))
        .sum();
    drop(context);
    ContextManifest {
        keys,
        thread_entries: lock(&session.ledger).len(&main_thread(&phase.id)),
        approx_tokens,
    }
}

pub(crate) fn render_rag_query(
    session: &RunSession,
    template: &str,
    team: Option<&str>,
    worker: Option<&str>,
) -> String {
    let context = lock(&session.context);
    render_query(template, |key| {
        let value = match key.split_once('.') {
            Some(("phase", k)) => context.get_phase(k),
            Some(("team", k)) => team.and_then(|t| context.get_team(t, k)),
            Some(("agent", k)) => worker.and_then(|w| context.get_agent(w, k)),
            Some(("static", k)) => context.get_static(k),
            Some(("global", k)) => context.get_global(k),
            _ => context.get_global(key).or_else(|| context.get_static(key)),
        };
        value.map(|b| b.value.clone())
    })
}

/// Write a result to a context target.
fn write_context(
    session: &RunSession,
    phase: &PhaseDefinition,
    action: &ActionDefinition,
    scope: ContextScope,
    key: &str,
    content: &str,
) {
    let team = action.participants.teams.first().map(String::as_str);
    let worker = action.participants.workers.first().map(String::as_str);
    let provenance = Provenance::Action {
        phase: phase.id.clone(),
        action: action.id.clone(),
    };
    let mut context = lock(&session.context);
    if let Err(e) = context.write(scope, key, content, provenance, team, worker) {
        tracing::warn!(phase = %phase.id, action = %action.id, key, "Context write failed: {}", e);
        return;
    }
    let Some(team) = team.filter(|_| scope == ContextScope::Team) else {
        return;
    };
    for rule in phase.context.share.iter().filter(|r| r.from == team && r.key == key) {
        match context.share_team(&rule.from, &rule.key, &rule.to) {
            Ok(_) => tracing::debug!(phase = %phase.id, key, to = %rule.to, "Shared team context"),
            Err(e) => tracing::warn!(phase = %phase.id, key, to = %rule.to, "Context share failed: {}", e),
        }
    }
}

/// Run one action to completion: resolve input, invoke with retries against
/// the shared budget, then the fallback worker, then stage the result.
pub(crate) async fn execute_action(
    session: &RunSession,
    phase: &PhaseDefinition,
    action: &ActionDefinition,
    staging: &Mutex<Staging>,
) -> ActionOutcome {
    lock(&session.state).current_action = Some(action.id.clone());

    let input = resolve_input(session, phase, action, staging).await;
    if input.is_none() && action.input.is_required() {
        session.action_error(
            &phase.id,
            &action.id,
            ErrorClass::MissingInput,
            None,
            format!("Input {:?} is absent", action.input.source),
            0,
        );
        return ActionOutcome::Failed;
    }

    let participants = match participants(session, action) {
        Ok(list) => list,
        Err(e) => {
            session.action_error(&phase.id, &action.id, ErrorClass::Fatal, None, e.to_string(), 0);
            return ActionOutcome::Failed;
        }
    };
    request_agent_rag(session, phase, &participants).await;

    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        if session.is_aborted() {
            return ActionOutcome::Aborted;
        }
        session.emit(EventKind::ActionStarted {
            phase_id: phase.id.clone(),
            action_id: action.id.clone(),
            attempt,
        });
        tracing::info!(phase = %phase.id, action = %action.id, attempt, "Running action");

        let step = Attempt {
            session,
            phase,
            action,
            attempt,
        };
        let rounds = action.participants.max_rounds.max(1);
        let result = match action.participants.mode {
            OrchestrationMode::Sequential => step.sequential(&participants, input.clone()).await,
            OrchestrationMode::Parallel => step.parallel(&participants, input.clone()).await,
            OrchestrationMode::RoundRobin => {
                step.round_robin(&participants, input.clone(), rounds).await
            }
            OrchestrationMode::Consensus => {
                step.consensus(&participants, input.clone(), rounds).await
            }
        };
        if session.is_aborted() {
            tracing::info!(
                phase = %phase.id,
                action = %action.id,
                "Discarding result resolved after abort"
            );
            return ActionOutcome::Aborted;
        }

        match result {
            Ok(content) => break Some(content),
            Err(CallError::Transient { kind, message }) => {
                session.action_error(
                    &phase.id,
                    &action.id,
                    ErrorClass::Transient,
                    Some(kind),
                    message.clone(),
                    attempt,
                );
                let Some(n) = session.take_retry(phase, action) else {
                    break None;
                };
                session.emit(EventKind::ActionRetried {
                    phase_id: phase.id.clone(),
                    action_id: action.id.clone(),
                    attempt: attempt + 1,
                    reason: message,
                });
                if !session.sleep(session.config.backoff(n)).await {
                    return ActionOutcome::Aborted;
                }
            }
            Err(CallError::Fatal { message }) => {
                session.action_error(&phase.id, &action.id, ErrorClass::Fatal, None, message, attempt);
                break None;
            }
        }
    };

    let content = match result {
        Some(content) => content,
        None => match run_fallback(session, phase, action, input, attempt + 1).await {
            Some(content) => content,
            None if session.is_aborted() => return ActionOutcome::Aborted,
            None => return ActionOutcome::Failed,
        },
    };

    match &action.output.target {
        OutputTarget::Context { scope, key } => {
            write_context(session, phase, action, *scope, key, &content)
        }
        target => lock(staging).stage(target, &action.id, &content, action.output.append),
    }
    lock(staging).results.insert(action.id.clone(), content.clone());
    session.emit(EventKind::ActionCompleted {
        phase_id: phase.id.clone(),
        action_id: action.id.clone(),
    });
    ActionOutcome::Completed(content)
}

/// Single invocation of the fallback worker once the budget is exhausted.
async fn run_fallback(
    session: &RunSession,
    phase: &PhaseDefinition,
    action: &ActionDefinition,
    input: Option<String>,
    attempt: u32,
) -> Option<String> {
    let fallback = action.fallback.as_deref()?;
    if session.is_aborted() {
        return None;
    }
    tracing::info!(phase = %phase.id, action = %action.id, fallback, "Invoking fallback worker");
    let participant = Participant {
        worker_id: fallback.to_string(),
        team_id: None,
        display_name: session.registry.display_name(fallback),
    };
    let step = Attempt {
        session,
        phase,
        action,
        attempt,
    };
    let thread = step.thread_for(&participant);
    let result = step.invoke(&participant, input, thread.as_deref(), 1).await;
    if session.is_aborted() {
        return None;
    }
    match result {
        Ok(content) => Some(content),
        Err(e) => {
            let (class, kind) = match &e {
                CallError::Transient { kind, .. } => (ErrorClass::Transient, Some(*kind)),
                CallError::Fatal { .. } => (ErrorClass::Fatal, None),
            };
            let message = format!("Fallback failed: {}", e);
            session.action_error(&phase.id, &action.id, class, kind, message, attempt);
            None
        }
    }
}
