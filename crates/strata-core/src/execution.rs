use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::types::{ExecutionId, TriggerKind};

/// Lifecycle of a workflow execution.
///
/// ```text
/// PENDING -> RUNNING -> COMPLETED | FAILED | CANCELLED
///            RUNNING <-> BACKTRACKING
/// PENDING -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Backtracking,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Backtracking)
                | (Backtracking, Running)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Running or backtracking.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Backtracking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Backtracking => "BACKTRACKING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktrackEvent {
    pub id: String,
    pub from_node: String,
    pub to_node: String,
    pub reason: TriggerKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// 1-based count of this trigger kind within the execution.
    pub attempts: u32,
}

impl BacktrackEvent {
    pub fn new(
        from_node: impl Into<String>,
        to_node: impl Into<String>,
        reason: TriggerKind,
        attempts: u32,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_node: from_node.into(),
            to_node: to_node.into(),
            reason,
            timestamp: Utc::now(),
            context,
            attempts,
        }
    }
}

/// Live record of one `start_workflow` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub work_item_id: String,
    pub status: ExecutionStatus,
    pub current_node: Option<String>,
    /// Completion order. Only rollback removes entries.
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    /// Optional nodes (and their descendants) that will not run.
    #[serde(default)]
    pub skipped_nodes: Vec<String>,
    pub quality_scores: HashMap<String, f64>,
    pub branch_refs: HashMap<String, String>,
    pub backtrack_history: Vec<BacktrackEvent>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: impl Into<String>,
        work_item_id: impl Into<String>,
        inputs: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id: workflow_id.into(),
            work_item_id: work_item_id.into(),
            status: ExecutionStatus::Pending,
            current_node: None,
            completed_nodes: vec![],
            failed_nodes: vec![],
            skipped_nodes: vec![],
            quality_scores: HashMap::new(),
            branch_refs: HashMap::new(),
            backtrack_history: vec![],
            start_time: Utc::now(),
            end_time: None,
            inputs,
            metadata,
            failure_reason: None,
        }
    }

    /// Move to `next`, rejecting transitions outside the state machine.
    /// Terminal states also stamp `end_time`.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StrataError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed_nodes.iter().any(|n| n == node_id)
    }

    pub fn is_skipped(&self, node_id: &str) -> bool {
        self.skipped_nodes.iter().any(|n| n == node_id)
    }

    /// Number of recorded backtracks for one trigger kind.
    pub fn backtrack_count(&self, reason: TriggerKind) -> u32 {
        self.backtrack_history
            .iter()
            .filter(|e| e.reason == reason)
            .count() as u32
    }

    /// Data visible to edge conditions: quality scores, object inputs,
    /// metadata, and `{node}_status` for every finished node.
    pub fn condition_context(&self) -> HashMap<String, serde_json::Value> {
        let mut ctx: HashMap<String, serde_json::Value> = HashMap::new();
        if let Some(obj) = self.inputs.as_object() {
            ctx.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        ctx.extend(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (metric, score) in &self.quality_scores {
            ctx.insert(metric.clone(), serde_json::json!(score));
        }
        for node in &self.completed_nodes {
            ctx.insert(format!("{}_status", node), serde_json::json!("completed"));
        }
        for node in &self.failed_nodes {
            ctx.insert(format!("{}_status", node), serde_json::json!("failed"));
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> WorkflowExecution {
        WorkflowExecution::new("wf", "ITEM-1", serde_json::json!({}), HashMap::new())
    }

    #[test]
    fn follows_state_machine() {
        let mut e = exec();
        assert_eq!(e.status, ExecutionStatus::Pending);
        e.transition(ExecutionStatus::Running).unwrap();
        e.transition(ExecutionStatus::Backtracking).unwrap();
        e.transition(ExecutionStatus::Running).unwrap();
        e.transition(ExecutionStatus::Completed).unwrap();
        assert!(e.end_time.is_some());
    }

    #[test]
    fn rejects_invalid_transitions() {
        let mut e = exec();
        assert!(e.transition(ExecutionStatus::Completed).is_err());
        e.transition(ExecutionStatus::Running).unwrap();
        e.transition(ExecutionStatus::Backtracking).unwrap();
        let err = e.transition(ExecutionStatus::Failed).unwrap_err();
        assert!(err.to_string().contains("BACKTRACKING"));
        assert_eq!(e.status, ExecutionStatus::Backtracking);
    }

    #[test]
    fn pending_cannot_be_cancelled() {
        let mut e = exec();
        assert!(e.transition(ExecutionStatus::Cancelled).is_err());
        assert_eq!(e.status, ExecutionStatus::Pending);
        assert!(e.end_time.is_none());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            for next in [
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Backtracking,
                ExecutionStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn counts_backtracks_per_reason() {
        let mut e = exec();
        let ctx = serde_json::Map::new();
        e.backtrack_history
            .push(BacktrackEvent::new("b", "a", TriggerKind::TestFailure, 1, ctx.clone()));
        e.backtrack_history
            .push(BacktrackEvent::new("c", "a", TriggerKind::BuildFailure, 1, ctx.clone()));
        e.backtrack_history
            .push(BacktrackEvent::new("b", "a", TriggerKind::TestFailure, 2, ctx));
        assert_eq!(e.backtrack_count(TriggerKind::TestFailure), 2);
        assert_eq!(e.backtrack_count(TriggerKind::SecurityViolation), 0);
    }

    #[test]
    fn condition_context_merges_sources() {
        let mut e = WorkflowExecution::new(
            "wf",
            "ITEM-1",
            serde_json::json!({"priority": "high"}),
            HashMap::from([("team".to_string(), serde_json::json!("core"))]),
        );
        e.quality_scores.insert("coverage".into(), 0.9);
        e.completed_nodes.push("a".into());
        e.failed_nodes.push("b".into());
        let ctx = e.condition_context();
        assert_eq!(ctx["priority"], "high");
        assert_eq!(ctx["team"], "core");
        assert_eq!(ctx["coverage"], 0.9);
        assert_eq!(ctx["a_status"], "completed");
        assert_eq!(ctx["b_status"], "failed");
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&ExecutionStatus::Backtracking).unwrap();
        assert_eq!(json, "\"BACKTRACKING\"");
    }
}
