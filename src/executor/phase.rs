//! The run control loop and the per-phase algorithm.
//!
//! Each phase goes through these steps:
//! 1. skip predicate
//! 2. context scope
//! 3. threads and the phase-start marker
//! 4. phase- or team-level RAG
//! 5. actions, scheduled by trigger
//! 6. commit, then the gavel
//! 7. extraction
//! 8. teardown
//!
//! Action futures of one phase are polled together by `join_all`; ordering
//! between them comes only from their prerequisites.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::sync::watch;

use super::action::{ActionOutcome, execute_action, manifest, render_rag_query};
use super::session::{RetrySlot, RunSession, Staging, lock};
use crate::context::Provenance;
use crate::definition::{
    AwaitState, ExtractSource, GavelSpec, PhaseDefinition, Prerequisite, RagSpec, prerequisites,
};
use crate::events::EventKind;
use crate::gavel::GavelDecision;
use crate::ledger::{ThreadKind, main_thread, team_thread};
use crate::output::HUMAN_REVIEW;
use crate::rag::{RAG_CONTEXT_KEY, RagRequest, RagScope};
use crate::state::{ErrorClass, RunMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseOutcome {
    Completed,
    Skipped,
    /// The run escalated to `error`, or a targeted retry failed again.
    Halted,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionState {
    Pending,
    Started,
    Completed,
    Failed,
    Skipped,
}

impl ActionState {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            ActionState::Completed | ActionState::Failed | ActionState::Skipped
        )
    }

    fn satisfies(&self, wanted: AwaitState) -> bool {
        match wanted {
            AwaitState::Started => !matches!(self, ActionState::Pending | ActionState::Skipped),
            AwaitState::Completed => *self == ActionState::Completed,
            AwaitState::Failed => *self == ActionState::Failed,
            AwaitState::Settled => self.is_settled(),
        }
    }
}

/// Drive phases from `start` to the end of the pipeline.
pub(crate) async fn drive(session: Arc<RunSession>, start: usize) {
    let pipeline = session.pipeline.clone();
    for (index, phase) in pipeline.phases.iter().enumerate().skip(start) {
        if !session.wait_if_paused().await {
            break;
        }
        match run_phase(&session, index, phase).await {
            PhaseOutcome::Completed => hold_for_retry(&session),
            PhaseOutcome::Skipped => {}
            PhaseOutcome::Halted | PhaseOutcome::Aborted => break,
        }
    }

    if session.wait_if_paused().await && session.complete() {
        session.emit(EventKind::RunCompleted);
        tracing::info!(run_id = %session.run_id, "Run completed");
    }
    session.persist();
}

/// In interactive mode a phase that left a failed or rejected action in the
/// retry slot pauses the run at the boundary so the action can be retried.
fn hold_for_retry(session: &RunSession) {
    if lock(&session.state).mode != RunMode::Interactive {
        return;
    }
    let Some(action_id) = session.retry_candidate() else {
        return;
    };
    if session.pause().is_ok() {
        tracing::info!(run_id = %session.run_id, action = %action_id, "Holding run for retry");
    }
}

fn should_run(session: &RunSession, phase: &PhaseDefinition) -> bool {
    let Some(condition) = &phase.condition else {
        return true;
    };
    let context = lock(&session.context);
    let output = lock(&session.output);
    condition.evaluate(
        &|r| context.lookup(r, None, None).map(|b| b.value.clone()),
        &|p| output.get_phase_output(p).map(|b| b.content.clone()),
    )
}

async fn run_phase(session: &RunSession, index: usize, phase: &PhaseDefinition) -> PhaseOutcome {
    // 1. skip predicate
    if !should_run(session, phase) {
        tracing::info!(phase = %phase.id, "Skip predicate false; skipping phase");
        lock(&session.state).progress.phases_skipped += 1;
        session.emit(EventKind::PhaseSkipped {
            phase_id: phase.id.clone(),
        });
        return PhaseOutcome::Skipped;
    }

    tracing::info!(run_id = %session.run_id, phase = %phase.id, index, "Starting phase");
    lock(&session.state).current_phase = Some(phase.id.clone());
    *lock(&session.retry_slot) = None;
    session.emit(EventKind::PhaseStarted {
        phase_id: phase.id.clone(),
        index,
    });

    // 2. context
    let teams = phase.teams();
    lock(&session.context).begin_phase(&phase.id, &phase.context, &teams);

    // 3. threads
    open_threads(session, phase, &teams);

    // 4. phase/team RAG
    if let Some(spec) = phase
        .rag
        .as_ref()
        .filter(|r| r.enabled && r.scope.is_phase_level())
    {
        let ids = match spec.scope {
            RagScope::Team => {
                let targets = if spec.targets.is_empty() {
                    teams.clone()
                } else {
                    spec.targets.clone()
                };
                targets
                    .into_iter()
                    .map(|team| {
                        let team_ref = team.clone();
                        issue_rag(session, phase, spec, RagScope::Team, vec![team], Some(&team_ref))
                    })
                    .collect()
            }
            _ => vec![issue_rag(
                session,
                phase,
                spec,
                RagScope::Phase,
                vec![phase.id.clone()],
                None,
            )],
        };
        await_rag(session, phase, spec, &ids).await;
    }

    // 5. actions
    let staging = Mutex::new(Staging::default());
    let failed = run_actions(session, phase, &staging).await;
    if session.is_aborted() {
        abandon_phase(session, phase);
        return PhaseOutcome::Aborted;
    }

    if let Some(action_id) = &failed {
        if phase.execution.critical {
            abandon_phase(session, phase);
            let class = session
                .last_error_class(&phase.id, action_id)
                .unwrap_or(ErrorClass::Fatal);
            session.escalate(
                &phase.id,
                Some(action_id),
                class,
                format!("Critical phase {} failed at action {}", phase.id, action_id),
            );
            return PhaseOutcome::Halted;
        }
        store_retry_slot(session, index, action_id, &staging);
    }

    finish_phase(session, index, phase, &staging, false, true).await
}

/// Steps 6-8. `overwrite` forces replacing committed outputs (re-runs).
async fn finish_phase(
    session: &RunSession,
    index: usize,
    phase: &PhaseDefinition,
    staging: &Mutex<Staging>,
    overwrite: bool,
    count_completion: bool,
) -> PhaseOutcome {
    // 6. commit and gavel
    let staged = lock(staging).clone();
    commit_staged(session, phase, &staged, overwrite || phase.output.overwrite);

    if let Some(gavel) = phase.gavel.as_ref().filter(|g| g.required) {
        match run_gavel(session, index, phase, gavel, staging).await {
            PhaseOutcome::Completed => {}
            other => return other,
        }
    }
    if session.is_aborted() {
        abandon_phase(session, phase);
        return PhaseOutcome::Aborted;
    }

    // 7. extraction and promotion
    extract(session, phase, &lock(staging));
    promote(session, phase);

    // 8. teardown
    close_phase(session, phase, true);
    if count_completion {
        lock(&session.state).progress.phases_completed += 1;
    }
    session.emit(EventKind::PhaseCompleted {
        phase_id: phase.id.clone(),
    });
    tracing::info!(run_id = %session.run_id, phase = %phase.id, "Phase completed");
    session.persist();
    PhaseOutcome::Completed
}

fn promote(session: &RunSession, phase: &PhaseDefinition) {
    let mut context = lock(&session.context);
    for key in &phase.context.promote {
        match context.promote(key) {
            Ok(true) => tracing::debug!(phase = %phase.id, key = %key, "Promoted phase context"),
            Ok(false) => tracing::debug!(phase = %phase.id, key = %key, "Promotion source absent"),
            Err(e) => tracing::warn!(phase = %phase.id, key = %key, "Context promotion failed: {}", e),
        }
    }
}

fn open_threads(session: &RunSession, phase: &PhaseDefinition, teams: &[String]) {
    let mut ledger = lock(&session.ledger);
    if phase.thread.main {
        let thread = main_thread(&phase.id);
        ledger.open(&thread, ThreadKind::Main);
        ledger.append_system_marker(&thread, format!("Phase {} started", phase.name));
    }
    if phase.thread.team {
        for team in teams {
            let thread = team_thread(&phase.id, team);
            ledger.open(&thread, ThreadKind::Team);
            ledger.append_system_marker(&thread, format!("Phase {} started for team {}", phase.name, team));
        }
    }
}

/// Close the phase's threads and context scope. Staged global writes are
/// committed only when `commit` is set.
fn close_phase(session: &RunSession, phase: &PhaseDefinition, commit: bool) {
    {
        let mut context = lock(&session.context);
        if commit {
            let keys = context.end_phase();
            if !keys.is_empty() {
                tracing::debug!(phase = %phase.id, ?keys, "Committed global context");
            }
        } else {
            context.discard_phase();
        }
    }

    {
        let mut ledger = lock(&session.ledger);
        ledger.close(&main_thread(&phase.id), phase.thread.preserve_main);
        let team_prefix = format!("team:{}:", phase.id);
        let collab_prefix = format!("collab:{}:", phase.id);
        for id in ledger.thread_ids() {
            if id.starts_with(&team_prefix) {
                ledger.close(&id, phase.thread.preserve_team);
            } else if id.starts_with(&collab_prefix) {
                ledger.close(&id, phase.thread.preserve_main);
            }
        }
    }

    let pending = lock(&session.rag).pending_for_phase(&phase.id);
    for request_id in pending {
        if lock(&session.rag).expire(&request_id) {
            session.emit(EventKind::RagTimeout {
                request_id,
                phase_id: phase.id.clone(),
            });
        }
    }
}

fn abandon_phase(session: &RunSession, phase: &PhaseDefinition) {
    tracing::info!(phase = %phase.id, "Abandoning phase; staged results discarded");
    close_phase(session, phase, false);
}

fn store_retry_slot(
    session: &RunSession,
    index: usize,
    action_id: &str,
    staging: &Mutex<Staging>,
) {
    let slot = RetrySlot {
        phase_index: index,
        action_id: action_id.to_string(),
        scope: lock(&session.context).snapshot_phase(),
        staging: lock(staging).clone(),
    };
    *lock(&session.retry_slot) = Some(slot);
}

/// Run every action of the phase honoring triggers. Returns the last action
/// that failed, if any. Actions still running at the phase timeout fail.
async fn run_actions(
    session: &RunSession,
    phase: &PhaseDefinition,
    staging: &Mutex<Staging>,
) -> Option<String> {
    let prereqs = prerequisites(phase);
    let channels: Vec<(watch::Sender<ActionState>, watch::Receiver<ActionState>)> = phase
        .actions
        .iter()
        .map(|_| watch::channel(ActionState::Pending))
        .collect();
    let receivers: Vec<watch::Receiver<ActionState>> =
        channels.iter().map(|(_, rx)| rx.clone()).collect();

    let tasks = phase.actions.iter().enumerate().map(|(i, action)| {
        let tx = &channels[i].0;
        let deps: &[Prerequisite] = &prereqs[i];
        let receivers = &receivers;
        async move {
            if !prerequisites_met(receivers, deps).await || session.is_aborted() {
                tracing::debug!(phase = %phase.id, action = %action.id, "Prerequisites unmet; not running");
                tx.send_replace(ActionState::Skipped);
                return;
            }
            tx.send_replace(ActionState::Started);
            let outcome = execute_action(session, phase, action, staging).await;
            let state = match outcome {
                ActionOutcome::Completed(_) => {
                    lock(&session.state).progress.actions_completed += 1;
                    ActionState::Completed
                }
                ActionOutcome::Failed => {
                    lock(&session.state).progress.actions_failed += 1;
                    ActionState::Failed
                }
                ActionOutcome::Aborted => ActionState::Skipped,
            };
            tx.send_replace(state);
        }
    });

    let timeout = session.phase_timeout(phase);
    if tokio::time::timeout(timeout, join_all(tasks)).await.is_err() {
        tracing::warn!(phase = %phase.id, ?timeout, "Phase timed out with actions still running");
        for (i, action) in phase.actions.iter().enumerate() {
            if !channels[i].1.borrow().is_settled() {
                channels[i].0.send_replace(ActionState::Failed);
                lock(&session.state).progress.actions_failed += 1;
                session.action_error(
                    &phase.id,
                    &action.id,
                    ErrorClass::Timeout,
                    None,
                    format!("Phase timeout of {:?} reached", timeout),
                    0,
                );
            }
        }
    }

    phase
        .actions
        .iter()
        .enumerate()
        .filter(|(i, _)| *channels[*i].1.borrow() == ActionState::Failed)
        .map(|(_, a)| a.id.clone())
        .next_back()
}

/// Wait until every prerequisite is satisfied. False when one can no longer be.
async fn prerequisites_met(receivers: &[watch::Receiver<ActionState>], deps: &[Prerequisite]) -> bool {
    for dep in deps {
        let mut rx = receivers[dep.index].clone();
        let wanted = dep.state;
        let reached = rx
            .wait_for(|s| s.satisfies(wanted) || s.is_settled())
            .await
            .map(|s| s.satisfies(wanted));
        if !matches!(reached, Ok(true)) {
            return false;
        }
    }
    true
}

/// Commit staged outputs through the router. The phase output is mirrored
/// into its permanent block when it changed.
fn commit_staged(session: &RunSession, phase: &PhaseDefinition, staged: &Staging, overwrite: bool) {
    if phase.output.phase
        && let Some(out) = &staged.phase
        && let Some(block) = session.commit_phase_output(&phase.id, &out.content, &out.author, overwrite)
        && let Some(permanent) = phase.output.permanent
        && block.content == out.content
    {
        session.commit_permanent(permanent, &block.content, &block.metadata.updated_by);
    }

    for (team, out) in &staged.teams {
        if phase.output.teams.is_empty() || phase.output.teams.contains(team) {
            session.commit_team_output(&phase.id, team, &out.content, &out.author, overwrite);
        }
    }

    for (block, out) in &staged.permanent {
        session.commit_permanent(*block, &out.content, &out.author);
    }
}

/// The action a rejection re-runs.
fn implicated_action(phase: &PhaseDefinition, gavel: &GavelSpec, staging: &Staging) -> Option<String> {
    gavel
        .action_id
        .clone()
        .or_else(|| staging.phase.as_ref().map(|s| s.author.clone()))
        .or_else(|| phase.actions.last().map(|a| a.id.clone()))
}

async fn run_gavel(
    session: &RunSession,
    index: usize,
    phase: &PhaseDefinition,
    spec: &GavelSpec,
    staging: &Mutex<Staging>,
) -> PhaseOutcome {
    loop {
        let current = lock(&session.output)
            .get_phase_output(&phase.id)
            .map(|b| b.content.clone())
            .unwrap_or_default();
        let action_id = implicated_action(phase, spec, &lock(staging));

        let (request, rx) = lock(&session.gavels).open(&phase.id, action_id.clone(), spec, &current);
        session.emit(EventKind::GavelRequested {
            gavel_id: request.id.clone(),
            phase_id: phase.id.clone(),
            prompt: request.prompt.clone(),
        });

        let mode = lock(&session.state).mode;
        if mode == RunMode::Automatic {
            tracing::info!(phase = %phase.id, gavel = %request.id, "Automatic mode; approving gavel");
            if let Err(e) = lock(&session.gavels).approve(&request.id, None) {
                tracing::warn!(gavel = %request.id, "Auto-approval failed: {}", e);
            }
        }

        let Some(decision) = await_decision(session, &request.id, rx).await else {
            return PhaseOutcome::Aborted;
        };

        match decision {
            GavelDecision::Approved { edits } => {
                let edited = edits.content().map(str::to_string);
                if let Some(content) = &edited {
                    apply_edit(session, phase, content);
                }
                session.emit(EventKind::GavelApproved {
                    gavel_id: request.id,
                    phase_id: phase.id.clone(),
                    edited: edited.is_some(),
                });
                return PhaseOutcome::Completed;
            }
            GavelDecision::Skipped => {
                session.emit(EventKind::GavelSkipped {
                    gavel_id: request.id,
                    phase_id: phase.id.clone(),
                });
                return PhaseOutcome::Completed;
            }
            GavelDecision::Rejected { reason } => {
                session.emit(EventKind::GavelRejected {
                    gavel_id: request.id,
                    phase_id: phase.id.clone(),
                });
                let Some(action) = action_id.as_deref().and_then(|id| phase.action(id)) else {
                    return PhaseOutcome::Completed;
                };
                let reason = reason.unwrap_or_else(|| "Rejected at review".to_string());
                session.action_error(&phase.id, &action.id, ErrorClass::Rejected, None, reason.clone(), 0);

                let Some(_) = session.take_retry(phase, action) else {
                    tracing::warn!(phase = %phase.id, action = %action.id, "Retry budget exhausted after rejection");
                    if phase.execution.critical {
                        abandon_phase(session, phase);
                        session.escalate(
                            &phase.id,
                            Some(&action.id),
                            ErrorClass::Rejected,
                            format!("Output of critical phase {} rejected with no retries left", phase.id),
                        );
                        return PhaseOutcome::Halted;
                    }
                    store_retry_slot(session, index, &action.id, staging);
                    return PhaseOutcome::Completed;
                };
                session.emit(EventKind::ActionRetried {
                    phase_id: phase.id.clone(),
                    action_id: action.id.clone(),
                    attempt: 0,
                    reason,
                });

                let rerun = Mutex::new(Staging {
                    results: lock(staging).results.clone(),
                    ..Default::default()
                });
                match execute_action(session, phase, action, &rerun).await {
                    ActionOutcome::Completed(_) => {
                        let staged = lock(&rerun).clone();
                        commit_staged(session, phase, &staged, true);
                        merge_staging(staging, staged);
                    }
                    ActionOutcome::Aborted => return PhaseOutcome::Aborted,
                    ActionOutcome::Failed => {
                        if phase.execution.critical {
                            abandon_phase(session, phase);
                            let class = session
                                .last_error_class(&phase.id, &action.id)
                                .unwrap_or(ErrorClass::Fatal);
                            session.escalate(
                                &phase.id,
                                Some(&action.id),
                                class,
                                format!("Re-run of {} after rejection failed", action.id),
                            );
                            return PhaseOutcome::Halted;
                        }
                        store_retry_slot(session, index, &action.id, staging);
                        return PhaseOutcome::Completed;
                    }
                }
            }
        }
    }
}

fn merge_staging(into: &Mutex<Staging>, from: Staging) {
    let mut staging = lock(into);
    if from.phase.is_some() {
        staging.phase = from.phase;
    }
    staging.teams.extend(from.teams);
    staging.permanent.extend(from.permanent);
    staging.results.extend(from.results);
}

/// Wait for a gavel decision. Interactive gavels auto-reject after the
/// configured timeout. `None` when the run is aborted first.
async fn await_decision(
    session: &RunSession,
    gavel_id: &str,
    mut rx: tokio::sync::oneshot::Receiver<GavelDecision>,
) -> Option<GavelDecision> {
    let timeout = session.config.gavel_timeout();
    let timed = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(decision) => decision.ok(),
                Err(_) => None,
            },
            None => (&mut rx).await.ok(),
        }
    };
    let decision = tokio::select! {
        decision = timed => decision,
        _ = session.cancel.cancelled() => return None,
    };
    match decision {
        Some(decision) => Some(decision),
        None => {
            tracing::warn!(gavel = gavel_id, "Gavel timed out; rejecting");
            // A decision may have landed between the timeout and this lock.
            match lock(&session.gavels).reject(gavel_id, Some("Review timed out".to_string())) {
                Ok(_) => Some(GavelDecision::Rejected {
                    reason: Some("Review timed out".to_string()),
                }),
                Err(_) => rx.try_recv().ok(),
            }
        }
    }
}

/// Overwrite the phase block (and its permanent mirror) with reviewer edits.
fn apply_edit(session: &RunSession, phase: &PhaseDefinition, content: &str) {
    session.commit_phase_output(&phase.id, content, HUMAN_REVIEW, true);
    if let Some(block) = phase.output.permanent {
        session.commit_permanent(block, content, HUMAN_REVIEW);
    }
}

fn extract(session: &RunSession, phase: &PhaseDefinition, staging: &Staging) {
    for rule in &phase.extract {
        let source = match &rule.from {
            ExtractSource::PhaseOutput => lock(&session.output)
                .get_phase_output(&phase.id)
                .map(|b| b.content.clone()),
            ExtractSource::TeamOutput { team } => lock(&session.output)
                .get_team_output(&phase.id, team)
                .map(|b| b.content.clone()),
            ExtractSource::Action { action } => staging.results.get(action).cloned(),
            ExtractSource::PhaseContext { key } => lock(&session.context)
                .get_phase(key)
                .map(|b| b.value.clone()),
        };
        let Some(text) = source else {
            tracing::debug!(phase = %phase.id, key = %rule.key, "Extraction source absent");
            continue;
        };

        let value = match &rule.pattern {
            None => Some(text.trim().to_string()),
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => re.captures(&text).and_then(|caps| {
                    caps.get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                }),
                Err(e) => {
                    tracing::warn!(phase = %phase.id, key = %rule.key, "Bad extraction pattern: {}", e);
                    None
                }
            },
        };
        if let Some(value) = value {
            lock(&session.context).set_global(
                &rule.key,
                value,
                Provenance::Extraction {
                    phase: phase.id.clone(),
                },
            );
        }
    }
}

/// Register a RAG request and emit `rag:requested`.
pub(crate) fn issue_rag(
    session: &RunSession,
    phase: &PhaseDefinition,
    spec: &RagSpec,
    scope: RagScope,
    targets: Vec<String>,
    team: Option<&str>,
) -> String {
    let worker = (scope == RagScope::Agent)
        .then(|| targets.first().cloned())
        .flatten();
    let query = render_rag_query(session, &spec.query, team, worker.as_deref());
    let manifest = manifest(session, phase);
    let request = lock(&session.rag).request(&phase.id, scope, targets, query, manifest, spec.max_tokens);
    tracing::info!(phase = %phase.id, request = %request.id, ?scope, "RAG requested");
    session.emit(EventKind::RagRequested {
        request_id: request.id.clone(),
        phase_id: phase.id.clone(),
        scope,
        query: request.query,
    });
    request.id
}

/// Wait for RAG fulfillment, bounded by the phase's own wait, the engine's RAG
/// wait and the phase timeout. Unfulfilled requests time out to absence.
pub(crate) async fn await_rag(
    session: &RunSession,
    phase: &PhaseDefinition,
    spec: &RagSpec,
    ids: &[String],
) {
    if ids.is_empty() {
        return;
    }
    let bound = spec
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| session.config.rag_wait())
        .min(session.phase_timeout(phase));
    let deadline = tokio::time::Instant::now() + bound;

    loop {
        let notified = session.rag_notify.notified();
        if lock(&session.rag).all_resolved(ids) {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(deadline) => break,
            _ = session.cancel.cancelled() => return,
        }
    }

    for id in ids {
        if lock(&session.rag).expire(id) {
            tracing::warn!(phase = %phase.id, request = %id, ?bound, "RAG request timed out; context left absent");
            session.emit(EventKind::RagTimeout {
                request_id: id.clone(),
                phase_id: phase.id.clone(),
            });
        }
    }
}

/// Write fulfilled RAG content into the scope the request targeted.
pub(crate) fn deliver_rag(session: &RunSession, request: &RagRequest, content: &str) {
    let provenance = || Provenance::Rag {
        request_id: request.id.clone(),
    };
    let mut context = lock(&session.context);
    if context.in_phase() != Some(request.phase_id.as_str()) {
        tracing::warn!(request = %request.id, "RAG response arrived outside its phase; dropped");
        return;
    }
    let result = match request.scope {
        RagScope::Phase => context.set_phase(RAG_CONTEXT_KEY, content, provenance()),
        RagScope::Team => request
            .target_ids
            .iter()
            .try_for_each(|team| context.set_team(team, RAG_CONTEXT_KEY, content, provenance())),
        RagScope::Agent => request
            .target_ids
            .iter()
            .try_for_each(|worker| context.set_agent(worker, RAG_CONTEXT_KEY, content, provenance())),
    };
    if let Err(e) = result {
        tracing::warn!(request = %request.id, "Failed to store RAG content: {}", e);
    }
}

/// Re-run the action held in the retry slot against its captured context,
/// then commit the phase again with overwrite.
pub(crate) async fn rerun(session: &RunSession, slot: RetrySlot) -> PhaseOutcome {
    let pipeline = session.pipeline.clone();
    let Some(phase) = pipeline.phases.get(slot.phase_index) else {
        return PhaseOutcome::Halted;
    };
    let Some(action) = phase.action(&slot.action_id) else {
        return PhaseOutcome::Halted;
    };

    tracing::info!(phase = %phase.id, action = %action.id, "Re-running action on request");
    lock(&session.state).current_phase = Some(phase.id.clone());
    if let Some(scope) = slot.scope {
        lock(&session.context).restore_phase(scope);
    } else {
        lock(&session.context).begin_phase(&phase.id, &phase.context, &phase.teams());
    }
    open_threads(session, phase, &phase.teams());

    let staging = Mutex::new(slot.staging);
    match execute_action(session, phase, action, &staging).await {
        ActionOutcome::Completed(_) => {
            lock(&session.state).progress.actions_completed += 1;
            finish_phase(session, slot.phase_index, phase, &staging, true, false).await
        }
        ActionOutcome::Failed => {
            lock(&session.state).progress.actions_failed += 1;
            store_retry_slot(session, slot.phase_index, &action.id, &staging);
            abandon_phase(session, phase);
            PhaseOutcome::Halted
        }
        ActionOutcome::Aborted => {
            abandon_phase(session, phase);
            PhaseOutcome::Aborted
        }
    }
}
