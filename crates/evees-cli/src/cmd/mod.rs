//! Command handlers. Each one takes its parsed args, the output mode and the
//! project root.

pub mod create;
pub mod fork;
pub mod get;
pub mod hash;
pub mod init;
pub mod log;
pub mod merge;
pub mod put;
pub mod show;
pub mod update;

use anyhow::{Context as _, Result, bail};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use evees_core::client::ClientCachedWithBase;
use evees_core::config::{EVEES_DIR, EffectiveConfig};
use evees_core::remote::{RemoteEvees, SqliteRemote};
use evees_core::{ErrorCode, Evees, EveesContext};

/// An opened project: the local SQLite remote under a layered client.
pub struct Project {
    pub evees: Evees,
    pub remote: Arc<SqliteRemote>,
}

impl Project {
    /// Open `.evees/` under `project_root` with already-resolved config.
    pub async fn open(project_root: &Path, config: &EffectiveConfig) -> Result<Self> {
        if !project_root.join(EVEES_DIR).is_dir() {
            let code = ErrorCode::NotInitialized;
            bail!(
                "{}: {} ({})",
                code.code(),
                code.message(),
                code.hint().unwrap_or_default()
            );
        }

        let project = &config.project;
        let db_path = project.db_path(project_root);
        let remote = Arc::new(
            SqliteRemote::open(&db_path, project.store.remote.clone(), project.hash)
                .with_context(|| format!("Failed to open {}", db_path.display()))?,
        );
        if let Some(user) = &config.user.user {
            remote.login(user).await?;
        }
        debug!(db = %db_path.display(), remote = %project.store.remote, "opened project");

        let client = Arc::new(ClientCachedWithBase::new(
            remote.clone(),
            project.hash,
            "cli",
        ));
        let ctx = EveesContext::new(
            client,
            vec![remote.clone() as Arc<dyn RemoteEvees>],
            project.clone(),
        );
        Ok(Self {
            evees: Evees::new(ctx),
            remote,
        })
    }
}

/// Parse a JSON document given on the command line.
pub fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {raw}"))
}

/// Timestamp in milliseconds as local time.
pub fn millis_to_local(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms).map_or_else(
        || ms.to_string(),
        |ts| {
            ts.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use evees_core::config::resolve_config;

    #[test]
    fn json_arguments_parse() {
        assert_eq!(parse_json(r#"{"a":1}"#).expect("object")["a"], 1);
        let err = parse_json("{oops").expect_err("invalid");
        assert!(format!("{err:#}").contains("Invalid JSON"));
    }

    #[test]
    fn millis_render_or_fall_back() {
        assert_eq!(millis_to_local(i64::MAX), i64::MAX.to_string());
        assert_eq!(millis_to_local(0).len(), "1970-01-01 00:00:00".len());
    }

    #[tokio::test]
    async fn uninitialized_project_is_reported() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = resolve_config(root.path(), true).expect("config");
        let Err(err) = Project::open(root.path(), &config).await else {
            panic!("expected an error");
        };
        assert!(err.to_string().contains("E1001"));
    }
}
