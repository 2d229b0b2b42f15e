use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use strata_core::execution::WorkflowExecution;
use strata_core::traits::{BranchCreator, CommandBuilder};
use strata_core::types::{OutputBuffer, SessionStatus, TerminalSession};
use strata_core::workflow::WorkflowNode;

use crate::command::render_template;

/// Turn a rendered branch pattern into a valid git ref name.
pub fn sanitize_branch_name(raw: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    static REPEATS: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^A-Za-z0-9._/-]+").unwrap());
    let repeats = REPEATS.get_or_init(|| Regex::new(r"([-/.])[-/.]+").unwrap());

    let replaced = invalid.replace_all(raw.trim(), "-");
    let collapsed = repeats.replace_all(&replaced, "$1");
    let trimmed = collapsed
        .trim_matches(|c| c == '/' || c == '-' || c == '.')
        .trim_end_matches(".lock");
    if trimmed.is_empty() {
        "strata/unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Opens and closes per-node terminal sessions and records branch refs.
pub struct SessionManager {
    branch_creator: Arc<dyn BranchCreator>,
    command_builder: Arc<dyn CommandBuilder>,
    workspace_root: Option<PathBuf>,
    extra_env: HashMap<String, String>,
    sessions: RwLock<HashMap<String, TerminalSession>>,
}

impl SessionManager {
    pub fn new(branch_creator: Arc<dyn BranchCreator>, command_builder: Arc<dyn CommandBuilder>) -> Self {
        Self {
            branch_creator,
            command_builder,
            workspace_root: None,
            extra_env: HashMap::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create per-node working directories under `root`.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.extra_env = env;
        self
    }

    /// Open a session for `node`.
    ///
    /// Branch creation and directory setup are best-effort: failures are
    /// logged and the session is still returned. The branch name is written
    /// to the execution's `branch_refs` before this returns.
    pub async fn open(
        &self,
        execution: &Mutex<WorkflowExecution>,
        node: &WorkflowNode,
    ) -> TerminalSession {
        let snapshot = execution.lock().await.clone();
        let branch_name = sanitize_branch_name(&render_template(
            &node.branch_strategy.pattern,
            &snapshot,
            node,
        ));

        if let Err(e) = self
            .branch_creator
            .create_branch(branch_name.clone(), node.branch_strategy.base_ref.clone())
            .await
        {
            warn!(
                execution_id = %snapshot.id,
                node_id = %node.id,
                branch = %branch_name,
                error = %e,
                "Branch creation failed, continuing without it"
            );
        }

        execution
            .lock()
            .await
            .branch_refs
            .insert(node.id.clone(), branch_name.clone());

        let working_directory = match &self.workspace_root {
            Some(root) => {
                let dir = root.join(snapshot.id.as_str()).join(&node.id);
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    warn!(path = %dir.display(), error = %e, "Failed to create session directory");
                }
                dir
            }
            None => PathBuf::from("."),
        };

        let mut environment_variables = self.extra_env.clone();
        environment_variables.extend([
            ("STRATA_EXECUTION_ID".to_string(), snapshot.id.to_string()),
            ("STRATA_WORKFLOW_ID".to_string(), snapshot.workflow_id.clone()),
            ("STRATA_WORK_ITEM_ID".to_string(), snapshot.work_item_id.clone()),
            ("STRATA_NODE_ID".to_string(), node.id.clone()),
            ("STRATA_ROLE".to_string(), node.role_type.clone()),
            ("STRATA_BRANCH".to_string(), branch_name.clone()),
        ]);

        let session = TerminalSession {
            id: Uuid::new_v4().to_string(),
            execution_id: snapshot.id.clone(),
            node_id: node.id.clone(),
            role_type: node.role_type.clone(),
            branch_name,
            command: self.command_builder.build_command(&snapshot, node),
            working_directory,
            environment_variables,
            status: SessionStatus::Active,
            start_time: Utc::now(),
            output: OutputBuffer::new(),
        };

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, node_id = %node.id, "Session opened");
        session
    }

    /// Remove a session from the registry. Branch refs are kept.
    pub async fn close(&self, session_id: &str) -> Option<TerminalSession> {
        let mut session = self.sessions.write().await.remove(session_id)?;
        session.status = SessionStatus::Closed;
        debug!(session_id, node_id = %session.node_id, "Session closed");
        Some(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<TerminalSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// All open sessions, oldest first.
    pub async fn list(&self) -> Vec<TerminalSession> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.start_time);
        sessions
    }
}
