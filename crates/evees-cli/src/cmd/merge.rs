use anyhow::Result;
use clap::Args;
use serde::Serialize;

use evees_core::merge::MergeOutcome;

use crate::cmd::Project;
use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Perspective receiving the changes.
    pub to: String,

    /// Perspective the changes come from.
    pub from: String,

    /// Squash the merged history into one commit per perspective on flush.
    #[arg(long)]
    pub condense: bool,
}

#[derive(Debug, Serialize)]
struct MergeReport {
    to: String,
    from: String,
    /// `unchanged`, `fast-forward` or `merged`.
    outcome: &'static str,
    head: Option<String>,
}

pub async fn run_merge(args: &MergeArgs, project: &Project, output: OutputMode) -> Result<()> {
    let evees = &project.evees;
    let outcome = evees.merge_perspectives(&args.to, &args.from).await?;
    if args.condense {
        evees.condense_pending().await?;
    } else {
        evees.flush().await?;
    }

    let kind = match &outcome {
        MergeOutcome::Unchanged(_) => "unchanged",
        MergeOutcome::FastForward(_) => "fast-forward",
        MergeOutcome::Merged(_) => "merged",
    };
    // Condensing may have replaced the merge commit.
    let head = evees.get_perspective_details(&args.to).await?.head_id;
    let report = MergeReport {
        to: args.to.clone(),
        from: args.from.clone(),
        outcome: kind,
        head,
    };
    render_mode(
        output,
        &report,
        |r, w| writeln!(w, "{}  {}", r.outcome, r.head.as_deref().unwrap_or("-")),
        |r, w| {
            writeln!(w, "Merged {} into {}", r.from, r.to)?;
            pretty_kv(w, "outcome", r.outcome)?;
            pretty_kv(w, "head", r.head.as_deref().unwrap_or("-"))
        },
    )
}
