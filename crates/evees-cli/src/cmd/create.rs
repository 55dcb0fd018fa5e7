use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cmd::{Project, parse_json};
use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Initial content of the perspective.
    #[arg(value_name = "JSON")]
    pub document: String,

    /// Link the new perspective under this parent.
    #[arg(long)]
    pub parent: Option<String>,

    /// Remote that will own the perspective.
    #[arg(long)]
    pub remote: Option<String>,
}

#[derive(Debug, Serialize)]
struct Created {
    id: String,
    head: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
}

pub async fn run_create(args: &CreateArgs, project: &Project, output: OutputMode) -> Result<()> {
    let object = parse_json(&args.document)?;
    let evees = &project.evees;
    let id = evees
        .create_evee(object, args.remote.as_deref(), args.parent.as_deref())
        .await?;
    evees.flush().await?;

    let created = Created {
        head: evees.get_perspective_details(&id).await?.head_id,
        id,
        parent: args.parent.clone(),
    };
    render_mode(
        output,
        &created,
        |c, w| writeln!(w, "{}", c.id),
        |c, w| {
            writeln!(w, "Created perspective {}", c.id)?;
            pretty_kv(w, "head", c.head.as_deref().unwrap_or("-"))?;
            if let Some(parent) = &c.parent {
                pretty_kv(w, "parent", parent)?;
            }
            Ok(())
        },
    )
}
