use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use strata_core::traits::{NodeContext, RoleExecutor};
use strata_core::types::{NodeError, RoleResult};

/// Fallback for role types with no registered executor. Always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRoleExecutor;

impl RoleExecutor for NoopRoleExecutor {
    fn role_type(&self) -> &str {
        "noop"
    }

    fn run(&self, ctx: NodeContext) -> BoxFuture<'_, RoleResult> {
        Box::pin(async move {
            debug!(node_id = %ctx.node.id, role = %ctx.node.role_type, "No executor registered, node passes");
            RoleResult::success()
        })
    }
}

/// Registry of role executors, keyed by role type.
pub struct RoleRegistry {
    executors: RwLock<HashMap<String, Arc<dyn RoleExecutor>>>,
    fallback: Arc<dyn RoleExecutor>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            fallback: Arc::new(NoopRoleExecutor),
        }
    }

    /// Register an executor under its role type, replacing any previous one.
    pub fn register(&self, executor: Arc<dyn RoleExecutor>) {
        let role = executor.role_type().to_string();
        if let Ok(mut executors) = self.executors.write() {
            if executors.insert(role.clone(), executor).is_some() {
                debug!(role = %role, "Replaced role executor");
            }
        }
    }

    pub fn unregister(&self, role_type: &str) -> bool {
        self.executors
            .write()
            .map(|mut e| e.remove(role_type).is_some())
            .unwrap_or(false)
    }

    /// Executor for a role, or the no-op fallback.
    pub fn get(&self, role_type: &str) -> Arc<dyn RoleExecutor> {
        self.executors
            .read()
            .ok()
            .and_then(|e| e.get(role_type).cloned())
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn contains(&self, role_type: &str) -> bool {
        self.executors
            .read()
            .map(|e| e.contains_key(role_type))
            .unwrap_or(false)
    }

    /// Registered role types, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut roles: Vec<String> = self
            .executors
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        roles.sort();
        roles
    }

    /// Run the node's executor under its execution timeout.
    pub async fn execute(&self, ctx: NodeContext) -> RoleResult {
        let executor = self.get(&ctx.node.role_type);
        let timeout_ms = ctx.node.execution_timeout_ms;
        let node_id = ctx.node.id.clone();

        match tokio::time::timeout(Duration::from_millis(timeout_ms), executor.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(node_id = %node_id, timeout_ms, "Node execution timed out");
                RoleResult::failure(NodeError::timeout(timeout_ms))
            }
        }
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::execution::WorkflowExecution;
    use strata_core::types::{NodeErrorKind, OutputBuffer, SessionStatus, TerminalSession};
    use strata_core::workflow::WorkflowNode;
    use tokio_util::sync::CancellationToken;

    struct SlowExecutor;

    impl RoleExecutor for SlowExecutor {
        fn role_type(&self) -> &str {
            "slow"
        }

        fn run(&self, _ctx: NodeContext) -> BoxFuture<'_, RoleResult> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                RoleResult::success()
            })
        }
    }

    struct ScoringExecutor;

    impl RoleExecutor for ScoringExecutor {
        fn role_type(&self) -> &str {
            "testing"
        }

        fn run(&self, _ctx: NodeContext) -> BoxFuture<'_, RoleResult> {
            Box::pin(async { RoleResult::success().with_score("coverage", 0.9) })
        }
    }

    fn ctx(node: WorkflowNode) -> NodeContext {
        let execution =
            WorkflowExecution::new("wf", "ITEM", serde_json::Value::Null, HashMap::new());
        let session = TerminalSession {
            id: "s".into(),
            execution_id: execution.id.clone(),
            node_id: node.id.clone(),
            role_type: node.role_type.clone(),
            branch_name: "b".into(),
            command: "true".into(),
            working_directory: ".".into(),
            environment_variables: HashMap::new(),
            status: SessionStatus::Active,
            start_time: chrono::Utc::now(),
            output: OutputBuffer::new(),
        };
        NodeContext {
            execution,
            node,
            session,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn routes_by_role_type() {
        let registry = RoleRegistry::new();
        registry.register(Arc::new(ScoringExecutor));
        assert!(registry.contains("testing"));
        assert_eq!(registry.list(), vec!["testing"]);

        let result = registry.execute(ctx(WorkflowNode::new("t", "testing"))).await;
        assert!(result.success);
        assert_eq!(result.quality_scores["coverage"], 0.9);
    }

    #[tokio::test]
    async fn unknown_role_falls_back_to_noop() {
        let registry = RoleRegistry::new();
        let result = registry.execute(ctx(WorkflowNode::new("x", "unregistered"))).await;
        assert!(result.success);
        assert!(result.quality_scores.is_empty());
    }

    #[tokio::test]
    async fn timeout_becomes_timeout_failure() {
        let registry = RoleRegistry::new();
        registry.register(Arc::new(SlowExecutor));
        let node = WorkflowNode::new("s", "slow").with_timeout_ms(20);
        let result = registry.execute(ctx(node)).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, NodeErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unregister_restores_fallback() {
        let registry = RoleRegistry::new();
        registry.register(Arc::new(SlowExecutor));
        assert!(registry.unregister("slow"));
        assert!(!registry.unregister("slow"));
        let node = WorkflowNode::new("s", "slow").with_timeout_ms(20);
        assert!(registry.execute(ctx(node)).await.success);
    }
}
