use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use strata_core::error::Result;
use strata_core::traits::WorkflowSource;
use strata_core::workflow::WorkflowDag;

/// Workflows registered programmatically.
#[derive(Default)]
pub struct InMemoryWorkflowSource {
    workflows: RwLock<HashMap<String, Arc<WorkflowDag>>>,
}

impl InMemoryWorkflowSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow, replacing any with the same id.
    pub fn register(&self, workflow: WorkflowDag) -> Arc<WorkflowDag> {
        let workflow = Arc::new(workflow);
        if let Ok(mut map) = self.workflows.write() {
            map.insert(workflow.id.clone(), workflow.clone());
        }
        workflow
    }

    pub fn with(self, workflow: WorkflowDag) -> Self {
        self.register(workflow);
        self
    }
}

impl WorkflowSource for InMemoryWorkflowSource {
    fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDag>> {
        self.workflows.read().ok()?.get(workflow_id).cloned()
    }

    fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workflows
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// Workflows loaded from `*.toml` and `*.json` files in one directory.
///
/// Files are read once. A file that fails to parse or validate is logged
/// and skipped.
pub struct DirectoryWorkflowSource {
    workflows: HashMap<String, Arc<WorkflowDag>>,
}

impl DirectoryWorkflowSource {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut workflows = HashMap::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && matches!(p.extension().and_then(|e| e.to_str()), Some("toml" | "json"))
            })
            .collect();
        entries.sort();

        for path in entries {
            match WorkflowDag::load(&path) {
                Ok(dag) => {
                    if workflows.contains_key(&dag.id) {
                        warn!(path = %path.display(), workflow_id = %dag.id, "Duplicate workflow id, skipping");
                        continue;
                    }
                    debug!(path = %path.display(), workflow_id = %dag.id, "Loaded workflow");
                    workflows.insert(dag.id.clone(), Arc::new(dag));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid workflow file");
                }
            }
        }

        info!(dir = %dir.display(), count = workflows.len(), "Workflow directory loaded");
        Ok(Self { workflows })
    }
}

impl WorkflowSource for DirectoryWorkflowSource {
    fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDag>> {
        self.workflows.get(workflow_id).cloned()
    }

    fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.keys().cloned().collect();
        ids.sort();
        ids
    }
}
