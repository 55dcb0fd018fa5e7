use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cmd::{Project, millis_to_local};
use crate::output::{OutputMode, pretty_rule, render_mode};

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Perspective id.
    pub perspective: String,

    /// Maximum number of commits to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
struct LogRow {
    id: String,
    timestamp_ms: i64,
    creators: Vec<String>,
    parents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    data_id: String,
}

/// Commits along first parents, newest first.
pub async fn run_log(args: &LogArgs, project: &Project, output: OutputMode) -> Result<()> {
    let rows: Vec<LogRow> = project
        .evees
        .history(&args.perspective, args.limit)
        .await?
        .into_iter()
        .map(|commit| LogRow {
            id: commit.id,
            timestamp_ms: commit.object.timestamp,
            creators: commit.object.creators_ids,
            parents: commit.object.parents_ids,
            message: commit.object.message,
            data_id: commit.object.data_id,
        })
        .collect();

    render_mode(
        output,
        &rows,
        |rows, w| {
            for row in rows {
                writeln!(
                    w,
                    "{}  {}  {}",
                    row.id,
                    row.timestamp_ms,
                    row.message.as_deref().unwrap_or("")
                )?;
            }
            Ok(())
        },
        |rows, w| {
            for row in rows {
                writeln!(w, "commit {}", row.id)?;
                if row.parents.len() > 1 {
                    writeln!(w, "Merge:  {}", row.parents.join(" "))?;
                }
                writeln!(w, "Author: {}", row.creators.join(", "))?;
                writeln!(w, "Date:   {}", millis_to_local(row.timestamp_ms))?;
                if let Some(message) = &row.message {
                    writeln!(w, "\n    {message}")?;
                }
                pretty_rule(w)?;
            }
            Ok(())
        },
    )
}
