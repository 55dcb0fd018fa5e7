use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cmd::Project;
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct ForkArgs {
    /// Perspective to fork.
    pub perspective: String,

    /// Remote that will own the fork.
    #[arg(long)]
    pub remote: Option<String>,
}

#[derive(Debug, Serialize)]
struct Forked {
    id: String,
    from: String,
}

pub async fn run_fork(args: &ForkArgs, project: &Project, output: OutputMode) -> Result<()> {
    let evees = &project.evees;
    let id = evees
        .fork_perspective(&args.perspective, args.remote.as_deref())
        .await?;
    evees.flush().await?;
    let forked = Forked {
        id,
        from: args.perspective.clone(),
    };
    render(output, &forked, |f, w| writeln!(w, "{}", f.id))
}
