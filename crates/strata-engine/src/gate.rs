use strata_core::event::GateResult;
use strata_core::execution::WorkflowExecution;
use strata_core::types::{NodeError, NodeErrorKind};
use strata_core::workflow::{QualityGate, WorkflowDag, WorkflowNode};

/// Gate results for one merge point.
#[derive(Debug, Clone)]
pub struct MergePointResult {
    pub node_id: String,
    pub passed: bool,
    pub results: Vec<GateResult>,
}

/// Outcome of evaluating every merge point in a batch.
#[derive(Debug, Clone, Default)]
pub struct GateEvaluation {
    pub passed: bool,
    pub merge_points: Vec<MergePointResult>,
}

impl GateEvaluation {
    /// First merge point whose gates did not all pass.
    pub fn first_failure(&self) -> Option<&MergePointResult> {
        self.merge_points.iter().find(|m| !m.passed)
    }
}

impl MergePointResult {
    /// Error handed to backtracking when this merge point fails.
    pub fn to_node_error(&self) -> NodeError {
        let failed: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| match r.actual {
                Some(actual) => format!("{} ({} = {}, threshold {})", r.gate_id, r.metric, actual, r.threshold),
                None => format!("{} ({} missing)", r.gate_id, r.metric),
            })
            .collect();
        NodeError::new(
            NodeErrorKind::QualityGateFailure,
            format!("Quality gates failed at {}: {}", self.node_id, failed.join(", ")),
        )
        .with_detail(serde_json::to_value(&self.results).unwrap_or_default())
    }
}

/// Gates that apply at a merge point: the ones it names, or every
/// workflow gate when it names none.
pub fn relevant_gates<'a>(workflow: &'a WorkflowDag, node: &WorkflowNode) -> Vec<&'a QualityGate> {
    if node.quality_gates.is_empty() {
        workflow.quality_gates.iter().collect()
    } else {
        workflow
            .quality_gates
            .iter()
            .filter(|g| node.quality_gates.contains(&g.id))
            .collect()
    }
}

/// Check the gates of every merge point among `batch` against the
/// execution's accumulated quality scores.
pub fn evaluate(
    execution: &WorkflowExecution,
    workflow: &WorkflowDag,
    batch: &[String],
) -> GateEvaluation {
    let mut merge_points = Vec::new();

    for node in batch
        .iter()
        .filter(|id| workflow.is_merge_point(id))
        .filter_map(|id| workflow.node(id))
    {
        let results: Vec<GateResult> = relevant_gates(workflow, node)
            .into_iter()
            .map(|gate| {
                let actual = execution.quality_scores.get(&gate.metric).copied();
                GateResult {
                    gate_id: gate.id.clone(),
                    metric: gate.metric.clone(),
                    threshold: gate.threshold,
                    actual,
                    passed: gate.passes(actual),
                }
            })
            .collect();
        merge_points.push(MergePointResult {
            node_id: node.id.clone(),
            passed: results.iter().all(|r| r.passed),
            results,
        });
    }

    GateEvaluation {
        passed: merge_points.iter().all(|m| m.passed),
        merge_points,
    }
}
