use anyhow::{Context as _, Result};
use clap::Args;

use evees_core::model::Entity;

use crate::cmd::Project;
use crate::output::{OutputMode, render_mode};

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Content id.
    pub id: String,
}

/// Print a stored document. JSON mode includes the id.
pub async fn run_get(args: &GetArgs, project: &Project, output: OutputMode) -> Result<()> {
    let entity: Entity = project
        .evees
        .client()
        .store()
        .get_entity(&args.id)
        .await
        .with_context(|| format!("Failed to load {}", args.id))?;
    render_mode(
        output,
        &entity,
        |e, w| writeln!(w, "{}", e.object),
        |e, w| {
            let body = serde_json::to_string_pretty(&e.object).map_err(std::io::Error::other)?;
            writeln!(w, "{body}")
        },
    )
}
