pub mod backtrack;
pub mod command;
pub mod dispatch;
pub mod executors;
pub mod gate;
pub mod journal;
pub mod limiter;
pub mod orchestrator;
pub mod run_log;
pub mod session;
pub mod source;
pub mod traversal;
pub mod vcs;

pub use command::TemplateCommandBuilder;
pub use dispatch::{NoopRoleExecutor, RoleRegistry};
pub use executors::ShellRoleExecutor;
pub use gate::{GateEvaluation, MergePointResult};
pub use journal::{ExecutionJournal, ExecutionSummary};
pub use limiter::{RoleLimiter, RolePermit};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use run_log::EventLogger;
pub use session::SessionManager;
pub use source::{DirectoryWorkflowSource, InMemoryWorkflowSource};
pub use traversal::{ExecutionHandle, Traversal};
pub use vcs::{GitBranchCreator, NoopBranchCreator};
