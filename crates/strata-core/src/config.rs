use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::NodeErrorKind;

/// Top-level Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Role type -> command template.
    #[serde(default)]
    pub commands: HashMap<String, String>,
    /// Role type -> error kind reported when its command exits non-zero
    /// without an explicit error marker.
    #[serde(default)]
    pub failure_kinds: HashMap<String, NodeErrorKind>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub journal: Option<JournalConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on nodes dispatched in one batch.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// Limit for roles with no entry in `role_instance_limits`.
    #[serde(default = "default_role_limit")]
    pub default_role_limit: usize,
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub role_instance_limits: HashMap<String, usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
            default_role_limit: default_role_limit(),
            event_capacity: default_event_capacity(),
            role_instance_limits: HashMap::new(),
        }
    }
}

fn default_max_parallel_nodes() -> usize { 4 }
fn default_role_limit() -> usize { 1 }
fn default_event_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Per-node working directories are created under here.
    #[serde(default = "default_workspace_root")]
    pub root: String,
    /// Directory scanned by the CLI for workflow definitions.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            workflows_dir: default_workflows_dir(),
        }
    }
}

fn default_workspace_root() -> String {
    "~/.strata/sessions".to_string()
}

fn default_workflows_dir() -> String {
    "workflows".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Create real git branches. Off by default.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_repo_dir")]
    pub repo_dir: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repo_dir: default_repo_dir(),
        }
    }
}

fn default_repo_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Extra environment variables injected into every session.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// JSONL event log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable the event log (default: true when section is present).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.strata/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

/// SQLite execution journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Database path. Default: ~/.strata/journal.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_true() -> bool { true }

/// Scheduling limits, fixed for the lifetime of an orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub max_parallel_nodes: usize,
    pub default_role_limit: usize,
    pub role_instance_limits: HashMap<String, usize>,
}

impl ConcurrencyConfig {
    pub fn new(max_parallel_nodes: usize) -> Self {
        Self {
            max_parallel_nodes: max_parallel_nodes.max(1),
            default_role_limit: 1,
            role_instance_limits: HashMap::new(),
        }
    }

    pub fn with_role_limit(mut self, role: impl Into<String>, limit: usize) -> Self {
        self.role_instance_limits.insert(role.into(), limit.max(1));
        self
    }

    /// Build from `[engine]`. Zero limits are clamped to one.
    pub fn from_engine(engine: &EngineConfig) -> Self {
        let clamp = |what: &str, value: usize| {
            if value == 0 {
                tracing::warn!(setting = what, "Concurrency limit of 0 clamped to 1");
                1
            } else {
                value
            }
        };
        Self {
            max_parallel_nodes: clamp("max_parallel_nodes", engine.max_parallel_nodes),
            default_role_limit: clamp("default_role_limit", engine.default_role_limit),
            role_instance_limits: engine
                .role_instance_limits
                .iter()
                .map(|(role, &limit)| (role.clone(), clamp(role, limit)))
                .collect(),
        }
    }

    pub fn limit_for(&self, role: &str) -> usize {
        self.role_instance_limits
            .get(role)
            .copied()
            .unwrap_or(self.default_role_limit)
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrataError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| StrataError::Config(e.to_string()))
    }

    pub fn concurrency(&self) -> ConcurrencyConfig {
        ConcurrencyConfig::from_engine(&self.engine)
    }

    /// Root for per-node working directories (expand ~).
    pub fn workspace_root(&self) -> PathBuf {
        expand_home(&self.workspace.root)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        expand_home(&self.workspace.workflows_dir)
    }

    /// Event log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => strata_home().join("logs"),
        })
    }

    /// Journal database path, if the journal is enabled.
    pub fn journal_path(&self) -> Option<PathBuf> {
        let journal = self.journal.as_ref().filter(|j| j.enabled)?;
        Some(match &journal.path {
            Some(path) => expand_home(path),
            None => strata_home().join("journal.db"),
        })
    }
}

/// `~/.strata`, or `.strata` when HOME is unset.
pub fn strata_home() -> PathBuf {
    dirs_home()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
