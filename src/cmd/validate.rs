//! Definition checking: `conductor validate`.

use anyhow::{Context, Result};
use std::path::Path;

use conductor::definition::PipelineDefinition;

pub fn cmd_validate(path: &Path) -> Result<()> {
    let pipeline = PipelineDefinition::load(path)?;
    pipeline
        .validate()
        .with_context(|| format!("Pipeline '{}' is invalid", pipeline.id))?;

    println!();
    println!(
        "{} {} ({}, version {})",
        console::style("Pipeline").bold().cyan(),
        pipeline.id,
        pipeline.name,
        pipeline.version
    );
    println!("─────────────────────────");
    for (index, phase) in pipeline.phases.iter().enumerate() {
        let mut flags = Vec::new();
        if phase.execution.critical {
            flags.push("critical");
        }
        if phase.gavel.as_ref().is_some_and(|g| g.required) {
            flags.push("gavel");
        }
        if phase.rag.as_ref().is_some_and(|r| r.enabled) {
            flags.push("rag");
        }
        if phase.condition.is_some() {
            flags.push("conditional");
        }
        println!(
            "  {:>2}. {:<20} {} action(s) {}",
            index + 1,
            phase.id,
            phase.actions.len(),
            console::style(flags.join(", ")).dim()
        );
    }
    println!();
    println!("{}", console::style("Pipeline is valid.").green());
    Ok(())
}
