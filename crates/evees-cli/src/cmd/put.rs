use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cmd::{Project, parse_json};
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct PutArgs {
    /// JSON document to store.
    #[arg(value_name = "JSON")]
    pub document: String,
}

#[derive(Debug, Serialize)]
struct PutReport {
    id: String,
}

/// Store a document in the local content store.
pub async fn run_put(args: &PutArgs, project: &Project, output: OutputMode) -> Result<()> {
    let object = parse_json(&args.document)?;
    let client = project.evees.client();
    let entity = client.store().store_entity(object.into()).await?;
    client.flush().await?;
    render(output, &PutReport { id: entity.id }, |r, w| writeln!(w, "{}", r.id))
}
