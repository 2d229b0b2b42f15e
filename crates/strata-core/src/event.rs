use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::execution::{BacktrackEvent, ExecutionStatus};
use crate::types::{ExecutionId, NodeError};

/// Outcome of one gate check at a merge point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub metric: String,
    pub threshold: f64,
    pub actual: Option<f64>,
    pub passed: bool,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        work_item_id: String,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
        role_type: String,
        session_id: String,
        branch_name: String,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        quality_scores: HashMap<String, f64>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: String,
        error: NodeError,
    },
    QualityGateEvaluated {
        execution_id: ExecutionId,
        node_id: String,
        passed: bool,
        results: Vec<GateResult>,
    },
    BacktrackInitiated {
        execution_id: ExecutionId,
        event: BacktrackEvent,
    },
    BacktrackCompleted {
        execution_id: ExecutionId,
        target_node: String,
        reset_nodes: Vec<String>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        completed_nodes: Vec<String>,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        failed_node: Option<String>,
        reason: String,
        error: Option<NodeError>,
    },
    ExecutionCancelled {
        execution_id: ExecutionId,
        previous_status: ExecutionStatus,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::QualityGateEvaluated { execution_id, .. }
            | Self::BacktrackInitiated { execution_id, .. }
            | Self::BacktrackCompleted { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id, .. } => execution_id,
        }
    }

    /// Kebab-case event name, as used in the serialized `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution-started",
            Self::NodeStarted { .. } => "node-started",
            Self::NodeCompleted { .. } => "node-completed",
            Self::NodeFailed { .. } => "node-failed",
            Self::QualityGateEvaluated { .. } => "quality-gate-evaluated",
            Self::BacktrackInitiated { .. } => "backtrack-initiated",
            Self::BacktrackCompleted { .. } => "backtrack-completed",
            Self::ExecutionCompleted { .. } => "execution-completed",
            Self::ExecutionFailed { .. } => "execution-failed",
            Self::ExecutionCancelled { .. } => "execution-cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
        )
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
