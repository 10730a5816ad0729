//! Pipeline execution: `conductor run`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use conductor::config::ConductorConfig;
use conductor::definition::PipelineDefinition;
use conductor::state::FileStateStore;
use conductor::{EventKind, PipelineExecutor, RunEvent, RunMode, RunOptions, RunStatus};

use super::review::{self, Recovery, Review};

pub struct RunRequest {
    pub pipeline: PathBuf,
    pub input: Option<String>,
    pub input_file: Option<PathBuf>,
    pub instructions: Option<PathBuf>,
    pub auto_approve: bool,
}

fn read_optional(path: Option<&Path>, what: &str) -> Result<Option<String>> {
    path.map(|p| {
        std::fs::read_to_string(p).with_context(|| format!("Failed to read {} file: {}", what, p.display()))
    })
    .transpose()
}

pub async fn cmd_run(config: &ConductorConfig, request: RunRequest) -> Result<()> {
    let pipeline = PipelineDefinition::load(&request.pipeline)?;
    let pipeline_id = pipeline.id.clone();
    let input = match read_optional(request.input_file.as_deref(), "input")? {
        Some(text) => text,
        None => request.input.clone().unwrap_or_default(),
    };
    let instructions = read_optional(request.instructions.as_deref(), "instructions")?;

    for warning in config.validate() {
        println!("  {} {}", console::style("⚠").yellow(), warning);
    }

    let registry = config.worker_registry()?;
    let store = FileStateStore::new(&config.state.dir);
    let executor = PipelineExecutor::new(Arc::new(registry))
        .with_config(config.engine.clone())
        .with_state_store(store.clone());
    executor
        .register_pipeline(pipeline)
        .with_context(|| format!("Pipeline '{}' is invalid", pipeline_id))?;

    let options = RunOptions {
        mode: if request.auto_approve {
            RunMode::Automatic
        } else {
            RunMode::Interactive
        },
        instructions,
        ..Default::default()
    };

    let mut events = executor.subscribe();
    let run_id = executor.start_run(&pipeline_id, &input, options)?;
    println!();
    println!(
        "{} {} ({})",
        console::style("Running").bold().cyan(),
        pipeline_id,
        console::style(&run_id).dim()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                println!("{}", console::style("Interrupted; aborting run.").yellow());
                if let Err(e) = executor.abort() {
                    tracing::warn!("Abort failed: {}", e);
                }
                continue;
            }
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event receiver lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event.kind {
            EventKind::PhaseStarted { phase_id, index } => {
                println!("  {} {}", console::style(format!("[{}]", index + 1)).cyan(), phase_id);
            }
            EventKind::PhaseSkipped { phase_id } => {
                println!("  {} {}", console::style("skipped").dim(), phase_id);
            }
            EventKind::ActionStarted { action_id, attempt, .. } if *attempt > 1 => {
                println!("    {} {} (attempt {})", console::style("→").dim(), action_id, attempt);
            }
            EventKind::ActionError { action_id, message, .. } => {
                println!("    {} {}: {}", console::style("Error:").red().bold(), action_id, message);
            }
            EventKind::RagTimeout { phase_id, .. } => {
                println!("    {} RAG request for {} timed out", console::style("⚠").yellow(), phase_id);
            }
            EventKind::GavelRequested { gavel_id, .. } if !request.auto_approve => {
                decide(&executor, gavel_id).await?;
            }
            EventKind::RunPaused if !request.auto_approve => {
                recover(&executor, &mut events).await?;
            }
            EventKind::GavelApproved { phase_id, .. } if request.auto_approve => {
                println!("    {} {}", console::style("Auto-approved").dim(), phase_id);
            }
            EventKind::RunCompleted | EventKind::RunError { .. } | EventKind::RunAborted => break,
            _ => {}
        }
    }

    let state = executor
        .wait()
        .await
        .context("Run state unavailable after completion")?;

    println!();
    println!("{}", console::style("Run Summary").bold().cyan());
    println!("─────────────────────────");
    println!("Status: {}", state.status);
    println!(
        "Phases: {}/{} completed, {} skipped",
        state.progress.phases_completed, state.progress.phases_total, state.progress.phases_skipped
    );
    println!(
        "Actions: {} completed, {} failed",
        state.progress.actions_completed, state.progress.actions_failed
    );
    println!("State: {}", store.path_for(&state.id).display());

    if let Some(draft) = executor.latest_draft() {
        println!();
        println!("{}", console::style(format!("Latest draft ({})", draft.id)).bold());
        println!("{}", draft.content);
    }

    match state.status {
        RunStatus::Completed => Ok(()),
        status => anyhow::bail!("Run {} ended with status {}", state.id, status),
    }
}

async fn decide(executor: &PipelineExecutor, gavel_id: &str) -> Result<()> {
    let Some(gavel) = executor
        .pending_gavels()
        .into_iter()
        .find(|g| g.id == gavel_id)
    else {
        return Ok(());
    };
    let review = tokio::task::spawn_blocking(move || review::prompt(&gavel))
        .await
        .context("Review prompt task failed")??;

    let result = match review {
        Review::Approve(edits) => executor.approve(gavel_id, edits),
        Review::Reject(reason) => executor.reject(gavel_id, reason),
        Review::Skip => executor.skip(gavel_id),
    };
    if let Err(e) = result {
        println!("  {} {}", console::style("Review not applied:").red(), e);
    }
    Ok(())
}

/// Offer a retry for each action the paused run is holding, then resume.
async fn recover(executor: &PipelineExecutor, events: &mut broadcast::Receiver<RunEvent>) -> Result<()> {
    while executor.status() == RunStatus::Paused {
        let Some(action_id) = executor.retry_candidate() else {
            break;
        };
        let held = action_id.clone();
        let choice = tokio::task::spawn_blocking(move || review::recovery(&held))
            .await
            .context("Recovery prompt task failed")??;

        match choice {
            Recovery::Retry => {
                let retry = executor.retry_action(&action_id);
                tokio::pin!(retry);
                // The re-run may open a gavel of its own.
                loop {
                    tokio::select! {
                        result = &mut retry => {
                            if let Err(e) = result {
                                println!("  {} {}", console::style("Retry not applied:").red(), e);
                            }
                            break;
                        }
                        event = events.recv() => {
                            if let Ok(event) = event
                                && let EventKind::GavelRequested { gavel_id, .. } = &event.kind
                            {
                                decide(executor, gavel_id).await?;
                            }
                        }
                    }
                }
            }
            Recovery::Continue => break,
            Recovery::Abort => {
                executor.abort()?;
                return Ok(());
            }
        }
    }
    if executor.status() == RunStatus::Paused {
        executor.resume()?;
    }
    Ok(())
}
