use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::execution::WorkflowExecution;
use crate::types::{RoleResult, TerminalSession};
use crate::workflow::{WorkflowDag, WorkflowNode};

/// Everything a role executor gets for one node run.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Snapshot of the execution taken when the batch was dispatched.
    pub execution: WorkflowExecution,
    pub node: WorkflowNode,
    pub session: TerminalSession,
    /// Cancelled when the execution is cancelled.
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn inputs(&self) -> &serde_json::Value {
        &self.execution.inputs
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Role executor. Performs the work of one role at a node.
pub trait RoleExecutor: Send + Sync + 'static {
    /// Role type this executor serves (matches `WorkflowNode::role_type`).
    fn role_type(&self) -> &str;

    /// Run the node. Failures are reported in the result, not as `Err`.
    fn run(&self, ctx: NodeContext) -> BoxFuture<'_, RoleResult>;
}

/// VCS branch creation. Best-effort: callers log errors and carry on.
pub trait BranchCreator: Send + Sync + 'static {
    fn create_branch(&self, name: String, base_ref: String) -> BoxFuture<'_, Result<()>>;
}

/// Builds the command string recorded on a node's terminal session.
pub trait CommandBuilder: Send + Sync + 'static {
    fn build_command(&self, execution: &WorkflowExecution, node: &WorkflowNode) -> String;
}

/// Workflow template lookup.
pub trait WorkflowSource: Send + Sync + 'static {
    fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDag>>;

    /// Ids of every workflow this source can resolve.
    fn list_workflows(&self) -> Vec<String>;
}
