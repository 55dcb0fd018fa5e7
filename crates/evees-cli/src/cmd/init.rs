use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use std::path::Path;

use evees_core::config::{EVEES_DIR, EffectiveConfig, save_project_config};
use evees_core::remote::SqliteRemote;

use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Re-initialize even if `.evees/` already exists.
    #[arg(long)]
    pub force: bool,
}

const GITIGNORE: &str = "evees.db\nevees.db-wal\nevees.db-shm\n";

#[derive(Debug, Serialize)]
struct InitReport {
    config: String,
    database: String,
    remote: String,
}

/// Execute `evees init`:
///
/// ```text
/// .evees/
///   config.toml   (effective project config)
///   evees.db      (local remote, migrated)
///   .gitignore
/// ```
pub fn run_init(
    args: &InitArgs,
    config: &EffectiveConfig,
    output: OutputMode,
    project_root: &Path,
) -> Result<()> {
    let dir = project_root.join(EVEES_DIR);
    if dir.exists() && !args.force {
        anyhow::bail!(".evees/ already exists. Use `evees init --force` to reinitialize.");
    }

    let config_path = save_project_config(project_root, &config.project)?;
    let gitignore = dir.join(".gitignore");
    std::fs::write(&gitignore, GITIGNORE)
        .with_context(|| format!("Failed to write {}", gitignore.display()))?;

    let db_path = config.project.db_path(project_root);
    SqliteRemote::open(&db_path, config.project.store.remote.clone(), config.project.hash)
        .with_context(|| format!("Failed to create {}", db_path.display()))?;

    let report = InitReport {
        config: config_path.display().to_string(),
        database: db_path.display().to_string(),
        remote: config.project.store.remote.clone(),
    };
    render_mode(
        output,
        &report,
        |r, w| writeln!(w, "{}", r.database),
        |r, w| {
            writeln!(w, "Initialized {EVEES_DIR}/")?;
            pretty_kv(w, "config", &r.config)?;
            pretty_kv(w, "database", &r.database)?;
            pretty_kv(w, "remote", &r.remote)
        },
    )
}
