use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cmd::{Project, parse_json};
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Perspective to update.
    pub perspective: String,

    /// New content.
    #[arg(value_name = "JSON")]
    pub document: String,

    /// Commit message.
    #[arg(short, long)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct Updated {
    perspective: String,
    head: String,
}

/// Commit new content on top of the perspective's head.
pub async fn run_update(args: &UpdateArgs, project: &Project, output: OutputMode) -> Result<()> {
    let object = parse_json(&args.document)?;
    let evees = &project.evees;
    let head = evees
        .update_perspective_data(&args.perspective, object, args.message.clone())
        .await?;
    evees.flush().await?;
    let updated = Updated {
        perspective: args.perspective.clone(),
        head,
    };
    render(output, &updated, |u, w| writeln!(w, "{}", u.head))
}
