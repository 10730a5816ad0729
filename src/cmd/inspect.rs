//! Stored run views: `conductor inspect` and `conductor export`.

use anyhow::{Context, Result};
use std::path::Path;

use conductor::config::ConductorConfig;
use conductor::output::{OutputBlock, PermanentBlockId};
use conductor::state::FileStateStore;

pub fn cmd_inspect(config: &ConductorConfig, run_id: Option<&str>) -> Result<()> {
    let store = FileStateStore::new(&config.state.dir);

    let Some(run_id) = run_id else {
        let runs = store.list()?;
        if runs.is_empty() {
            println!("No runs found in {}", store.dir().display());
        }
        for id in runs {
            println!("{}", id);
        }
        return Ok(());
    };

    let snapshot = store
        .load(run_id)
        .with_context(|| format!("Failed to load run '{}'", run_id))?;
    let run = &snapshot.run;

    println!();
    println!("{} {}", console::style("Run").bold().cyan(), run.id);
    println!("─────────────────────────");
    println!("Pipeline: {}", run.pipeline_id);
    println!("Status: {}", run.status);
    if let Some(phase) = &run.current_phase {
        println!("Current phase: {}", phase);
    }
    println!(
        "Phases: {}/{} completed, {} skipped",
        run.progress.phases_completed, run.progress.phases_total, run.progress.phases_skipped
    );
    println!(
        "Actions: {} completed, {} failed",
        run.progress.actions_completed, run.progress.actions_failed
    );

    if !run.errors.is_empty() {
        println!();
        println!("{}", console::style("Errors").bold().red());
        for error in &run.errors {
            println!(
                "  [{}] {}/{}: {}",
                error.class,
                error.phase_id.as_deref().unwrap_or("-"),
                error.action_id.as_deref().unwrap_or("-"),
                error.message
            );
        }
    }

    let latest = |ids: &[PermanentBlockId]| -> Option<&OutputBlock> {
        ids.iter()
            .find_map(|id| snapshot.permanent.iter().find(|b| b.id == id.as_str()))
    };
    let outline = latest(&[
        PermanentBlockId::FinalOutline,
        PermanentBlockId::SecondOutline,
        PermanentBlockId::FirstOutline,
    ]);
    let draft = latest(&[
        PermanentBlockId::FinalDraft,
        PermanentBlockId::SecondDraft,
        PermanentBlockId::FirstDraft,
    ]);
    for (title, block) in [("Latest outline", outline), ("Latest draft", draft)] {
        if let Some(block) = block {
            println!();
            println!(
                "{} {}",
                console::style(title).bold(),
                console::style(format!("({} v{})", block.id, block.metadata.version)).dim()
            );
            println!("{}", block.content);
        }
    }
    Ok(())
}

pub fn cmd_export(config: &ConductorConfig, run_id: &str, output: &Path) -> Result<()> {
    let store = FileStateStore::new(&config.state.dir);
    let snapshot = store
        .load(run_id)
        .with_context(|| format!("Failed to load run '{}'", run_id))?;
    let json = snapshot.to_json()?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write snapshot: {}", output.display()))?;
    println!("Exported run {} to {}", run_id, output.display());
    Ok(())
}
