use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use strata_core::config::AppConfig;
use strata_core::execution::ExecutionStatus;
use strata_core::types::TriggerKind;
use strata_engine::{DirectoryWorkflowSource, Orchestrator};
use strata_test_utils::workflow_dir;

const TDD_WORKFLOW: &str = r#"
id = "tdd"
name = "Test-driven change"
merge_points = ["review"]

[[nodes]]
id = "tests"
role_type = "test_design"

[[nodes]]
id = "impl"
role_type = "implementation"
dependencies = ["tests"]

[[nodes]]
id = "review"
role_type = "code_review"
dependencies = ["impl"]
quality_gates = ["coverage"]

[[edges]]
from = "tests"
to = "impl"

[[edges]]
from = "impl"
to = "review"

[[quality_gates]]
id = "coverage"
metric = "coverage"
threshold = 0.8

[[backtrack_rules]]
trigger = "TEST_FAILURE"
target_node = "tests"
max_backtrack_count = 1
include_context = ["error"]
"#;

fn config(root: &std::path::Path, implementation: &str) -> AppConfig {
    let toml = format!(
        r#"
[workspace]
root = "{root}/sessions"

[session]
env = {{ STRATA_TEST = "1" }}

[commands]
test_design = "echo designing {{nodeId}} for {{workItemId}}"
implementation = "{implementation}"
code_review = "test -n \"$STRATA_BRANCH\" && test \"$STRATA_TEST\" = 1"

[journal]
path = "{root}/journal.db"
"#,
        root = root.display(),
        implementation = implementation,
    );
    AppConfig::from_toml_str(&toml).unwrap()
}

async fn run(config: &AppConfig, workflows: &std::path::Path) -> (Orchestrator, strata_core::WorkflowExecution) {
    let source = Arc::new(DirectoryWorkflowSource::load(workflows).unwrap());
    let orch = Orchestrator::from_config(config, source).unwrap();
    let id = orch
        .start_workflow("ITEM-42", "tdd", serde_json::Value::Null, HashMap::new())
        .await
        .unwrap();
    let exec = tokio::time::timeout(Duration::from_secs(20), orch.wait_for_completion(id.as_str()))
        .await
        .unwrap()
        .unwrap();
    (orch, exec)
}

#[tokio::test]
async fn shell_roles_complete_a_gated_workflow() {
    let workflows = workflow_dir(&[("tdd.toml", TDD_WORKFLOW)]);
    let scratch = tempfile::tempdir().unwrap();
    let config = config(scratch.path(), "echo STRATA_SCORE coverage 0.93");

    let (orch, exec) = run(&config, workflows.path()).await;

    assert_eq!(exec.status, ExecutionStatus::Completed, "{:?}", exec.failure_reason);
    assert_eq!(exec.completed_nodes, vec!["tests", "impl", "review"]);
    assert_eq!(exec.quality_scores.get("coverage"), Some(&0.93));
    assert!(scratch.path().join("sessions").join(exec.id.as_str()).join("impl").is_dir());

    let journal = orch.journal().unwrap();
    let recent = journal.recent(10).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, "COMPLETED");
    assert_eq!(recent[0].work_item_id, "ITEM-42");
}

#[tokio::test]
async fn error_marker_drives_backtracking_until_ceiling() {
    let workflows = workflow_dir(&[("tdd.toml", TDD_WORKFLOW)]);
    let scratch = tempfile::tempdir().unwrap();
    let config = config(
        scratch.path(),
        "echo STRATA_ERROR TEST_FAILURE 1 test failed; exit 1",
    );

    let (orch, exec) = run(&config, workflows.path()).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failed_nodes, vec!["impl"]);
    assert_eq!(exec.backtrack_history.len(), 1);
    let bt = &exec.backtrack_history[0];
    assert_eq!(bt.reason, TriggerKind::TestFailure);
    assert_eq!(bt.context["error"]["message"], "1 test failed");

    let journal = orch.journal().unwrap();
    assert_eq!(journal.recent(1).unwrap()[0].status, "FAILED");
    let recorded = journal.backtracks_for(exec.id.as_str()).unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].to_node, "tests");
}
