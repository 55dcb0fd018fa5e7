use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cas::router::DEFAULT_SOURCE_TIMEOUT;
use crate::hash::Hasher;
use crate::merge::MergeConfig;

/// Directory holding project state, relative to the project root.
pub const EVEES_DIR: &str = ".evees";

/// Project settings from `.evees/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EveesConfig {
    #[serde(default)]
    pub hash: Hasher,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How long a fan-out read waits on any one source.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database, relative to `.evees/`.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Id of the local remote; perspectives created here name it.
    #[serde(default = "default_remote")]
    pub remote: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            remote: default_remote(),
        }
    }
}

impl EveesConfig {
    /// Absolute path of the SQLite database for a project.
    #[must_use]
    pub fn db_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(EVEES_DIR).join(&self.store.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    /// Identity recorded as creator of perspectives and commits.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub project: EveesConfig,
    pub user: UserConfig,
    pub resolved_output: String,
}

pub fn load_project_config(project_root: &Path) -> Result<EveesConfig> {
    let path = project_root.join(EVEES_DIR).join("config.toml");
    if !path.exists() {
        return Ok(EveesConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EveesConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write `config` to `.evees/config.toml`, creating the directory.
pub fn save_project_config(project_root: &Path, config: &EveesConfig) -> Result<PathBuf> {
    let dir = project_root.join(EVEES_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join("config.toml");
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("evees/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn resolve_config(project_root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let project = load_project_config(project_root)?;
    let mut user = load_user_config()?;
    if let Ok(from_env) = env::var("EVEES_USER") {
        user.user = Some(from_env);
    }

    let env_format = env::var("FORMAT").ok();
    let resolved_output = resolve_output(cli_json, user.output.clone(), env_format);

    Ok(EffectiveConfig {
        project,
        user,
        resolved_output,
    })
}

fn resolve_output(
    cli_json: bool,
    user_output: Option<String>,
    env_format: Option<String>,
) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "plain" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

fn default_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_SOURCE_TIMEOUT.as_millis()).unwrap_or(u64::MAX)
}

fn default_db_path() -> PathBuf {
    PathBuf::from("evees.db")
}

fn default_remote() -> String {
    "local".to_string()
}
