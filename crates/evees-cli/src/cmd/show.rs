//! `evees show`: a perspective, where it points and how it is linked.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;

use evees_core::client;

use crate::cmd::{Project, millis_to_local};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Perspective id.
    pub perspective: String,
}

#[derive(Debug, Serialize)]
pub struct ShowPerspective {
    pub id: String,
    pub remote: String,
    pub creator_id: String,
    pub context: String,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian: Option<String>,
    pub data: Option<Value>,
    pub children: Vec<String>,
    pub parents: Vec<String>,
    /// Other perspectives of the same context.
    pub versions: Vec<String>,
}

pub async fn run_show(args: &ShowArgs, project: &Project, output: OutputMode) -> Result<()> {
    let evees = &project.evees;
    let id = args.perspective.as_str();
    let perspective = client::load_perspective(evees.client().as_ref(), id).await?;
    let details = evees.get_perspective_details(id).await?;
    let data = evees.get_perspective_data(id).await?.map(|d| d.object);

    let versions = project
        .remote
        .perspectives_with_context(&perspective.object.context)?
        .into_iter()
        .filter(|other| other != id)
        .collect();
    let forked_from = perspective
        .object
        .meta
        .and_then(|meta| meta.forking)
        .map(|fork| fork.perspective_id);

    let show = ShowPerspective {
        id: perspective.id,
        remote: perspective.object.remote,
        creator_id: perspective.object.creator_id,
        context: perspective.object.context,
        created_at_ms: perspective.object.timestamp,
        forked_from,
        head: details.head_id,
        guardian: details.guardian_id,
        data,
        children: project.remote.children_of(id)?,
        parents: project.remote.ecosystem_parents(id)?,
        versions,
    };
    render_mode(output, &show, render_text, render_pretty)
}

fn render_text(show: &ShowPerspective, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "{}  head={}  context={}",
        show.id,
        show.head.as_deref().unwrap_or("-"),
        show.context
    )?;
    if let Some(data) = &show.data {
        writeln!(w, "{data}")?;
    }
    Ok(())
}

fn render_pretty(show: &ShowPerspective, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("Perspective {}", show.id))?;
    pretty_kv(w, "remote", &show.remote)?;
    pretty_kv(w, "creator", &show.creator_id)?;
    pretty_kv(w, "created", millis_to_local(show.created_at_ms))?;
    pretty_kv(w, "context", &show.context)?;
    if let Some(from) = &show.forked_from {
        pretty_kv(w, "forked from", from)?;
    }
    pretty_kv(w, "head", show.head.as_deref().unwrap_or("-"))?;
    if let Some(guardian) = &show.guardian {
        pretty_kv(w, "guardian", guardian)?;
    }
    for (label, ids) in [
        ("children", &show.children),
        ("parents", &show.parents),
        ("versions", &show.versions),
    ] {
        if !ids.is_empty() {
            pretty_kv(w, label, ids.join(", "))?;
        }
    }
    if let Some(data) = &show.data {
        writeln!(w)?;
        let body = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        writeln!(w, "{body}")?;
    }
    Ok(())
}
