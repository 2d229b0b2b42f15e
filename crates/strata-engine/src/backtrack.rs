use std::collections::{BTreeSet, VecDeque};

use tracing::info;

use strata_core::error::Result;
use strata_core::execution::{BacktrackEvent, ExecutionStatus, WorkflowExecution};
use strata_core::types::{NodeError, NodeErrorKind, TriggerKind};
use strata_core::workflow::{BacktrackRule, ContextScope, WorkflowDag};

/// Map a node error onto the trigger vocabulary of backtrack rules.
pub fn classify(error: &NodeError) -> TriggerKind {
    match error.kind {
        NodeErrorKind::TestFailure => TriggerKind::TestFailure,
        NodeErrorKind::BuildFailure => TriggerKind::BuildFailure,
        NodeErrorKind::QualityGateFailure => TriggerKind::QualityGateFailure,
        NodeErrorKind::SecurityViolation => TriggerKind::SecurityViolation,
        NodeErrorKind::Timeout | NodeErrorKind::Unclassified => TriggerKind::Unclassified,
    }
}

/// The rule to apply for `error`, if any applies and its ceiling has not
/// been reached.
pub fn should_backtrack<'a>(
    execution: &WorkflowExecution,
    workflow: &'a WorkflowDag,
    error: &NodeError,
) -> Option<&'a BacktrackRule> {
    let trigger = classify(error);
    if trigger == TriggerKind::Unclassified {
        return None;
    }
    let rule = workflow.backtrack_rules.iter().find(|r| r.trigger == trigger)?;
    (execution.backtrack_count(trigger) < rule.max_backtrack_count).then_some(rule)
}

/// What a rollback did.
#[derive(Debug, Clone)]
pub struct BacktrackOutcome {
    pub event: BacktrackEvent,
    /// Previously completed nodes that became eligible again.
    pub reset_nodes: Vec<String>,
}

/// Record a backtrack and roll the execution back to `rule.target_node`.
///
/// The target and everything forward-reachable from it leave the
/// completed, failed and skipped lists and the queue; the failing node is
/// reset too. The target is then re-queued, followed by the failing node
/// when it is not downstream of the target. Status goes
/// RUNNING -> BACKTRACKING -> RUNNING.
pub fn initiate(
    execution: &mut WorkflowExecution,
    workflow: &WorkflowDag,
    from_node: &str,
    rule: &BacktrackRule,
    error: &NodeError,
    queue: &mut VecDeque<String>,
) -> Result<BacktrackOutcome> {
    execution.transition(ExecutionStatus::Backtracking)?;

    let attempts = execution.backtrack_count(rule.trigger) + 1;
    let context = gather_context(execution, &rule.include_context, error);
    let event = BacktrackEvent::new(from_node, &rule.target_node, rule.trigger, attempts, context);
    execution.backtrack_history.push(event.clone());

    info!(
        execution_id = %execution.id,
        from_node,
        to_node = %rule.target_node,
        reason = %rule.trigger,
        attempts,
        max = rule.max_backtrack_count,
        "Backtracking"
    );

    let downstream = workflow.descendants_inclusive(&rule.target_node);
    let mut reset: BTreeSet<String> = downstream.clone();
    reset.insert(from_node.to_string());

    let reset_nodes: Vec<String> = execution
        .completed_nodes
        .iter()
        .filter(|n| reset.contains(*n))
        .cloned()
        .collect();
    execution.completed_nodes.retain(|n| !reset.contains(n));
    execution.failed_nodes.retain(|n| !reset.contains(n));
    execution.skipped_nodes.retain(|n| !reset.contains(n));
    queue.retain(|n| !reset.contains(n));

    for node in [rule.target_node.as_str(), from_node] {
        if (node == rule.target_node || !downstream.contains(node))
            && !queue.iter().any(|q| q == node)
        {
            queue.push_back(node.to_string());
        }
    }
    execution.current_node = Some(rule.target_node.clone());

    execution.transition(ExecutionStatus::Running)?;
    Ok(BacktrackOutcome { event, reset_nodes })
}

fn gather_context(
    execution: &WorkflowExecution,
    scopes: &[ContextScope],
    error: &NodeError,
) -> serde_json::Map<String, serde_json::Value> {
    let mut ctx = serde_json::Map::new();
    for scope in scopes {
        let (key, value) = match scope {
            ContextScope::QualityScores => (
                "quality_scores",
                serde_json::to_value(&execution.quality_scores).unwrap_or_default(),
            ),
            ContextScope::CompletedNodes => {
                ("completed_nodes", serde_json::json!(execution.completed_nodes))
            }
            ContextScope::FailedNodes => ("failed_nodes", serde_json::json!(execution.failed_nodes)),
            ContextScope::BranchRefs => (
                "branch_refs",
                serde_json::to_value(&execution.branch_refs).unwrap_or_default(),
            ),
            ContextScope::Error => ("error", serde_json::to_value(error).unwrap_or_default()),
            ContextScope::Inputs => ("inputs", execution.inputs.clone()),
        };
        ctx.insert(key.to_string(), value);
    }
    ctx
}
