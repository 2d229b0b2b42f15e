use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use strata_core::config::{AppConfig, ConcurrencyConfig};
use strata_core::error::{Result, StrataError};
use strata_core::event::{EventBus, ExecutionEvent};
use strata_core::execution::WorkflowExecution;
use strata_core::traits::{BranchCreator, CommandBuilder, RoleExecutor, WorkflowSource};
use strata_core::types::{ExecutionId, TerminalSession};

use crate::command::TemplateCommandBuilder;
use crate::dispatch::RoleRegistry;
use crate::executors::ShellRoleExecutor;
use crate::journal::ExecutionJournal;
use crate::limiter::RoleLimiter;
use crate::session::SessionManager;
use crate::traversal::{self, ExecutionHandle, Traversal};
use crate::vcs::{GitBranchCreator, NoopBranchCreator};

/// Owns live executions and exposes the public API.
///
/// Each `start_workflow` call spawns one traversal task. Executions are
/// independent: they share only the role limiter, the session registry,
/// and the event bus.
pub struct Orchestrator {
    source: Arc<dyn WorkflowSource>,
    limiter: Arc<RoleLimiter>,
    sessions: Arc<SessionManager>,
    roles: Arc<RoleRegistry>,
    bus: Arc<EventBus>,
    traversal: Arc<Traversal>,
    journal: Option<Arc<ExecutionJournal>>,
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    source: Arc<dyn WorkflowSource>,
    concurrency: ConcurrencyConfig,
    branch_creator: Arc<dyn BranchCreator>,
    command_builder: Arc<dyn CommandBuilder>,
    workspace_root: Option<PathBuf>,
    session_env: HashMap<String, String>,
    event_capacity: usize,
    journal: Option<Arc<ExecutionJournal>>,
    executors: Vec<Arc<dyn RoleExecutor>>,
}

impl OrchestratorBuilder {
    pub fn concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn branch_creator(mut self, creator: Arc<dyn BranchCreator>) -> Self {
        self.branch_creator = creator;
        self
    }

    pub fn command_builder(mut self, builder: Arc<dyn CommandBuilder>) -> Self {
        self.command_builder = builder;
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn session_env(mut self, env: HashMap<String, String>) -> Self {
        self.session_env = env;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn journal(mut self, journal: Arc<ExecutionJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RoleExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn build(self) -> Orchestrator {
        let mut sessions = SessionManager::new(self.branch_creator, self.command_builder)
            .with_env(self.session_env);
        if let Some(root) = self.workspace_root {
            sessions = sessions.with_workspace_root(root);
        }

        let limiter = Arc::new(RoleLimiter::new(self.concurrency));
        let sessions = Arc::new(sessions);
        let roles = Arc::new(RoleRegistry::new());
        for executor in self.executors {
            roles.register(executor);
        }
        let bus = Arc::new(EventBus::new(self.event_capacity));
        let traversal = Arc::new(Traversal::new(
            limiter.clone(),
            sessions.clone(),
            roles.clone(),
            bus.clone(),
        ));

        Orchestrator {
            source: self.source,
            limiter,
            sessions,
            roles,
            bus,
            traversal,
            journal: self.journal,
            executions: RwLock::new(HashMap::new()),
        }
    }
}

impl Orchestrator {
    pub fn builder(source: Arc<dyn WorkflowSource>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            source,
            concurrency: ConcurrencyConfig::default(),
            branch_creator: Arc::new(NoopBranchCreator),
            command_builder: Arc::new(TemplateCommandBuilder::default()),
            workspace_root: None,
            session_env: HashMap::new(),
            event_capacity: 256,
            journal: None,
            executors: vec![],
        }
    }

    /// Wire an orchestrator from configuration: git branches when `[vcs]`
    /// is enabled, `[commands]` templates, one shell executor per
    /// configured role, and the journal when `[journal]` is enabled.
    pub fn from_config(config: &AppConfig, source: Arc<dyn WorkflowSource>) -> Result<Self> {
        let branch_creator: Arc<dyn BranchCreator> = if config.vcs.enabled {
            Arc::new(GitBranchCreator::new(&config.vcs.repo_dir))
        } else {
            Arc::new(NoopBranchCreator)
        };

        let mut builder = Self::builder(source)
            .concurrency(config.concurrency())
            .branch_creator(branch_creator)
            .command_builder(Arc::new(TemplateCommandBuilder::new(config.commands.clone())))
            .workspace_root(config.workspace_root())
            .session_env(config.session.env.clone())
            .event_capacity(config.engine.event_capacity);

        for role in config.commands.keys() {
            let mut executor = ShellRoleExecutor::new(role.clone());
            if let Some(kind) = config.failure_kinds.get(role) {
                executor = executor.with_failure_kind(*kind);
            }
            builder = builder.executor(Arc::new(executor));
        }

        if let Some(path) = config.journal_path() {
            builder = builder.journal(Arc::new(ExecutionJournal::open(&path)?));
        }

        Ok(builder.build())
    }

    /// Start a workflow and return immediately with the new execution id.
    ///
    /// An unknown workflow id is reported synchronously and creates no
    /// execution.
    pub async fn start_workflow(
        &self,
        work_item_id: &str,
        workflow_id: &str,
        inputs: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionId> {
        let workflow = self
            .source
            .get_workflow(workflow_id)
            .ok_or_else(|| StrataError::WorkflowNotFound(workflow_id.to_string()))?;

        let max_parallel = self.traversal.max_parallel_nodes();
        for group in traversal::oversized_groups(&workflow, max_parallel) {
            warn!(
                workflow_id,
                group = ?group,
                max_parallel_nodes = max_parallel,
                "Parallel group larger than max_parallel_nodes can never be scheduled"
            );
        }

        let execution = WorkflowExecution::new(workflow_id, work_item_id, inputs, metadata);
        let id = execution.id.clone();
        let handle = Arc::new(ExecutionHandle::new(execution, workflow));
        self.executions
            .write()
            .await
            .insert(id.to_string(), handle.clone());

        info!(execution_id = %id, workflow_id, work_item_id, "Workflow execution queued");

        let traversal = self.traversal.clone();
        let journal = self.journal.clone();
        tokio::spawn(async move {
            let record = traversal.run(handle.clone()).await;
            if let Some(journal) = journal {
                if let Err(e) = journal.record_execution(&record) {
                    warn!(execution_id = %record.id, error = %e, "Failed to journal execution");
                }
            }
            handle.mark_finished();
        });

        Ok(id)
    }

    /// Current snapshot of an execution.
    pub async fn get_execution_status(&self, execution_id: &str) -> Result<WorkflowExecution> {
        Ok(self.handle(execution_id).await?.snapshot().await)
    }

    /// Cancel a running execution. Returns false, leaving the execution
    /// untouched, when it is in any other status, including PENDING.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool> {
        let handle = self.handle(execution_id).await?;
        match handle.cancel().await {
            Some(previous_status) => {
                info!(execution_id, previous = %previous_status, "Execution cancelled");
                self.bus.publish(ExecutionEvent::ExecutionCancelled {
                    execution_id: ExecutionId::from_string(execution_id),
                    previous_status,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Executions that are running or backtracking.
    pub async fn get_active_executions(&self) -> Vec<WorkflowExecution> {
        let handles: Vec<_> = self.executions.read().await.values().cloned().collect();
        let mut active = Vec::new();
        for handle in handles {
            let snapshot = handle.snapshot().await;
            if snapshot.status.is_active() {
                active.push(snapshot);
            }
        }
        active.sort_by_key(|e| e.start_time);
        active
    }

    /// Every execution known to this orchestrator, oldest first.
    pub async fn list_executions(&self) -> Vec<WorkflowExecution> {
        let handles: Vec<_> = self.executions.read().await.values().cloned().collect();
        let mut all = Vec::with_capacity(handles.len());
        for handle in handles {
            all.push(handle.snapshot().await);
        }
        all.sort_by_key(|e| e.start_time);
        all
    }

    /// Drop finished executions from the registry and return how many
    /// were removed. Their records stay in the journal, if one is set.
    pub async fn prune_finished(&self) -> usize {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, handle| !(handle.status().is_terminal() && handle.is_finished()));
        let removed = before - executions.len();
        if removed > 0 {
            debug!(removed, remaining = executions.len(), "Pruned finished executions");
        }
        removed
    }

    /// Sessions of nodes currently running.
    pub async fn get_terminal_sessions(&self) -> Vec<TerminalSession> {
        self.sessions.list().await
    }

    /// Resolve with the final record once the execution's traversal task
    /// has finished, including journaling.
    pub async fn wait_for_completion(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let handle = self.handle(execution_id).await?;
        handle.finished().await;
        Ok(handle.snapshot().await)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn register_executor(&self, executor: Arc<dyn RoleExecutor>) {
        self.roles.register(executor);
    }

    pub fn limiter(&self) -> &RoleLimiter {
        &self.limiter
    }

    pub fn journal(&self) -> Option<&ExecutionJournal> {
        self.journal.as_deref()
    }

    async fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StrataError::ExecutionNotFound(execution_id.to_string()))
    }
}
