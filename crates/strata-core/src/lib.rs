pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::{AppConfig, ConcurrencyConfig};
pub use error::{Result, StrataError};
pub use event::{EventBus, ExecutionEvent, GateResult};
pub use execution::{BacktrackEvent, ExecutionStatus, WorkflowExecution};
pub use traits::{BranchCreator, CommandBuilder, NodeContext, RoleExecutor, WorkflowSource};
pub use types::*;
pub use workflow::{
    BacktrackRule, BranchStrategy, ContextScope, Edge, GateComparison, QualityGate,
    WorkflowDag, WorkflowDefinition, WorkflowNode,
};
