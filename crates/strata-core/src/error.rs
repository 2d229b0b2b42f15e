use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    // Orchestration errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid workflow {workflow}: {reason}")]
    InvalidWorkflow { workflow: String, reason: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Collaborator errors (advisory, never fail a node by themselves)
    #[error("Branch creation failed: {0}")]
    Branch(String),

    #[error("Session setup failed: {0}")]
    Session(String),

    #[error("Role limiter unavailable for role: {0}")]
    LimiterClosed(String),

    // Storage errors
    #[error("Journal error: {0}")]
    Journal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrataError {
    pub fn invalid_workflow(workflow: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWorkflow {
            workflow: workflow.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
