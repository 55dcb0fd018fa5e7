use anyhow::Result;
use clap::Args;
use serde::Serialize;

use evees_core::config::EffectiveConfig;

use crate::cmd::parse_json;
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct HashArgs {
    /// JSON document to hash.
    #[arg(value_name = "JSON")]
    pub document: String,
}

#[derive(Debug, Serialize)]
struct HashReport {
    id: String,
}

/// Print the content id of a document without storing it.
pub fn run_hash(args: &HashArgs, config: &EffectiveConfig, output: OutputMode) -> Result<()> {
    let object = parse_json(&args.document)?;
    let report = HashReport {
        id: config.project.hash.hash_value(&object),
    };
    render(output, &report, |r, w| writeln!(w, "{}", r.id))
}
