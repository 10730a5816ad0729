//! Interactive gavel review and failure recovery for `conductor run`.

use anyhow::{Context, Result};
use dialoguer::{Editor, Input, Select};

use conductor::gavel::{GavelEdits, GavelRequest};

/// What the reviewer chose for one gavel.
pub enum Review {
    Approve(Option<GavelEdits>),
    Reject(Option<String>),
    Skip,
}

/// Show the gavel's pending output and ask for a decision. Blocks on the
/// terminal, so call it from a blocking task.
pub fn prompt(gavel: &GavelRequest) -> Result<Review> {
    println!();
    println!(
        "{} {}",
        console::style("Review:").bold().yellow(),
        console::style(&gavel.phase_id).bold()
    );
    println!("{}", gavel.prompt);
    println!("─────────────────────────");
    println!("{}", gavel.current_output);
    println!("─────────────────────────");

    let mut options = vec!["Approve", "Edit and approve", "Reject"];
    if gavel.can_skip {
        options.push("Skip");
    }
    let choice = Select::new()
        .with_prompt("Decision")
        .items(&options)
        .default(0)
        .interact()
        .context("Failed to read review decision")?;

    match options[choice] {
        "Approve" => Ok(Review::Approve(None)),
        "Edit and approve" => {
            let edited = Editor::new()
                .edit(&gavel.current_output)
                .context("Failed to open editor")?;
            Ok(Review::Approve(edited.map(GavelEdits::output)))
        }
        "Reject" => {
            let reason: String = Input::new()
                .with_prompt("Reason (optional)")
                .allow_empty(true)
                .interact_text()
                .context("Failed to read rejection reason")?;
            let reason = reason.trim();
            Ok(Review::Reject((!reason.is_empty()).then(|| reason.to_string())))
        }
        _ => Ok(Review::Skip),
    }
}

/// What to do with a run held for a failed action.
pub enum Recovery {
    Retry,
    Continue,
    Abort,
}

pub fn recovery(action_id: &str) -> Result<Recovery> {
    println!();
    println!(
        "{} action {} did not produce output",
        console::style("Held:").bold().yellow(),
        console::style(action_id).bold()
    );
    let options = ["Retry action", "Continue without it", "Abort run"];
    let choice = Select::new()
        .with_prompt("Recovery")
        .items(&options)
        .default(0)
        .interact()
        .context("Failed to read recovery choice")?;

    Ok(match choice {
        0 => Recovery::Retry,
        1 => Recovery::Continue,
        _ => Recovery::Abort,
    })
}
