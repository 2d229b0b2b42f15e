use std::collections::HashMap;

use strata_core::execution::WorkflowExecution;
use strata_core::traits::CommandBuilder;
use strata_core::workflow::WorkflowNode;

/// Substitute `{workItemId}`, `{nodeId}`, `{roleType}` and `{executionId}`.
/// Unknown placeholders are left as written.
pub fn render_template(template: &str, execution: &WorkflowExecution, node: &WorkflowNode) -> String {
    template
        .replace("{workItemId}", &execution.work_item_id)
        .replace("{nodeId}", &node.id)
        .replace("{roleType}", &node.role_type)
        .replace("{executionId}", execution.id.as_str())
}

/// Command builder backed by per-role templates from `[commands]`.
#[derive(Debug, Clone, Default)]
pub struct TemplateCommandBuilder {
    templates: HashMap<String, String>,
}

impl TemplateCommandBuilder {
    pub fn new(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }
}

impl CommandBuilder for TemplateCommandBuilder {
    fn build_command(&self, execution: &WorkflowExecution, node: &WorkflowNode) -> String {
        match self.templates.get(&node.role_type) {
            Some(template) => render_template(template, execution, node),
            None => format!(
                "strata-role {} --node {} --work-item {}",
                node.role_type, node.id, execution.work_item_id
            ),
        }
    }
}
