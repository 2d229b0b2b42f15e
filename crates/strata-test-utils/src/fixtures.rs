use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;

use strata_core::execution::{ExecutionStatus, WorkflowExecution};
use strata_core::types::TriggerKind;
use strata_core::workflow::{
    BacktrackRule, Edge, QualityGate, WorkflowDag, WorkflowDefinition, WorkflowNode,
};

/// Validate a definition, panicking on error.
pub fn dag(def: WorkflowDefinition) -> WorkflowDag {
    WorkflowDag::from_definition(def).expect("fixture workflow must be valid")
}

/// `nodes` in a chain: each depends on, and has an edge from, the one
/// before it.
pub fn chain(id: &str, nodes: Vec<WorkflowNode>) -> WorkflowDefinition {
    let mut linked = Vec::with_capacity(nodes.len());
    let mut edges = Vec::new();
    let mut prev: Option<String> = None;
    for mut node in nodes {
        if let Some(p) = &prev {
            node.dependencies.insert(p.clone());
            edges.push(Edge::new(p.clone(), node.id.clone()));
        }
        prev = Some(node.id.clone());
        linked.push(node);
    }
    WorkflowDefinition {
        id: id.to_string(),
        name: id.to_string(),
        nodes: linked,
        edges,
        ..Default::default()
    }
}

/// `A -> B -> C`, every node on role `worker`.
pub fn linear_workflow() -> WorkflowDag {
    dag(chain(
        "linear",
        vec![
            WorkflowNode::new("A", "worker"),
            WorkflowNode::new("B", "worker"),
            WorkflowNode::new("C", "worker"),
        ],
    ))
}

/// `A -> {B, C} -> D` with B and C declared parallel. B runs on role
/// `left`, C on role `right`, A and D on `worker`.
pub fn fan_out_workflow() -> WorkflowDag {
    dag(WorkflowDefinition {
        id: "fan-out".into(),
        name: "Fan out".into(),
        nodes: vec![
            WorkflowNode::new("A", "worker"),
            WorkflowNode::new("B", "left").depends_on(&["A"]).parallel_with(&["C"]),
            WorkflowNode::new("C", "right").depends_on(&["A"]).parallel_with(&["B"]),
            WorkflowNode::new("D", "worker").depends_on(&["B", "C"]),
        ],
        edges: vec![
            Edge::new("A", "B"),
            Edge::new("A", "C"),
            Edge::new("B", "D"),
            Edge::new("C", "D"),
        ],
        ..Default::default()
    })
}

/// `A -> B`, where a `TEST_FAILURE` at B backtracks to A up to
/// `max_backtracks` times.
pub fn retry_workflow(max_backtracks: u32) -> WorkflowDag {
    let mut def = chain(
        "retry",
        vec![
            WorkflowNode::new("A", "test_design"),
            WorkflowNode::new("B", "implementation"),
        ],
    );
    def.backtrack_rules = vec![BacktrackRule::new(TriggerKind::TestFailure, "A", max_backtracks)];
    dag(def)
}

/// Test-driven workflow: tests -> impl -> review, where review is a merge
/// point gated on `coverage >= 0.8`. Test failures go back to `tests`,
/// gate failures back to `impl`.
pub fn tdd_workflow() -> WorkflowDag {
    let mut def = chain(
        "tdd",
        vec![
            WorkflowNode::new("tests", "test_design"),
            WorkflowNode::new("impl", "implementation"),
            WorkflowNode::new("review", "code_review").with_gates(&["coverage"]),
        ],
    );
    def.merge_points = vec!["review".into()];
    def.quality_gates = vec![QualityGate::at_least("coverage", "coverage", 0.8)];
    def.backtrack_rules = vec![
        BacktrackRule::new(TriggerKind::TestFailure, "tests", 2),
        BacktrackRule::new(TriggerKind::QualityGateFailure, "impl", 1),
    ];
    dag(def)
}

/// Two independent nodes on the same role.
pub fn same_role_workflow(role: &str) -> WorkflowDag {
    dag(WorkflowDefinition {
        id: "same-role".into(),
        nodes: vec![WorkflowNode::new("X1", role), WorkflowNode::new("X2", role)],
        ..Default::default()
    })
}

/// A fresh pending execution of `workflow`.
pub fn pending_execution(workflow: &WorkflowDag) -> WorkflowExecution {
    WorkflowExecution::new(&workflow.id, "ITEM-1", serde_json::Value::Null, HashMap::new())
}

/// A running execution of `workflow` with `completed` already done.
pub fn running_execution(workflow: &WorkflowDag, completed: &[&str]) -> WorkflowExecution {
    let mut exec = pending_execution(workflow);
    exec.transition(ExecutionStatus::Running)
        .expect("pending -> running is always valid");
    exec.completed_nodes = completed.iter().map(|s| s.to_string()).collect();
    exec
}

pub fn shared(workflow: WorkflowDag) -> Arc<WorkflowDag> {
    Arc::new(workflow)
}

/// A temp directory holding the given `(file name, contents)` pairs.
pub fn workflow_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    for (name, contents) in files {
        std::fs::write(dir.path().join(name), contents).expect("write workflow file");
    }
    dir
}
