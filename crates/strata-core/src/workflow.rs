use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::condition::evaluate_condition;
use crate::error::{Result, StrataError};
use crate::types::TriggerKind;

/// How a node's working branch is named and where it forks from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStrategy {
    /// Branch name pattern. Supports `{workItemId}`, `{nodeId}`,
    /// `{roleType}` and `{executionId}` placeholders.
    #[serde(default = "default_branch_pattern")]
    pub pattern: String,
    /// Ref the branch is created from.
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
}

impl Default for BranchStrategy {
    fn default() -> Self {
        Self {
            pattern: default_branch_pattern(),
            base_ref: default_base_ref(),
        }
    }
}

fn default_branch_pattern() -> String {
    "strata/{workItemId}/{nodeId}".to_string()
}

fn default_base_ref() -> String {
    "main".to_string()
}

fn default_timeout_ms() -> u64 {
    600_000
}

/// A unit of work assigned to a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier for this node.
    pub id: String,
    /// Role whose executor performs this node.
    pub role_type: String,
    /// Nodes that must be completed before this one may start.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Nodes intended to run in the same batch as this one.
    #[serde(default)]
    pub parallel_with: BTreeSet<String>,
    /// Hard timeout for the role executor.
    #[serde(default = "default_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Gate ids evaluated when this node is a merge point.
    #[serde(default)]
    pub quality_gates: Vec<String>,
    #[serde(default)]
    pub branch_strategy: BranchStrategy,
    /// A failed optional node is skipped instead of failing the execution.
    #[serde(default)]
    pub optional: bool,
}

impl WorkflowNode {
    /// Create a node with default timeout and branch strategy.
    pub fn new(id: impl Into<String>, role_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role_type: role_type.into(),
            dependencies: BTreeSet::new(),
            parallel_with: BTreeSet::new(),
            execution_timeout_ms: default_timeout_ms(),
            quality_gates: vec![],
            branch_strategy: BranchStrategy::default(),
            optional: false,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn parallel_with(mut self, ids: &[&str]) -> Self {
        self.parallel_with.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.execution_timeout_ms = timeout_ms;
        self
    }

    pub fn with_gates(mut self, gates: &[&str]) -> Self {
        self.quality_gates = gates.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_branch_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.branch_strategy.pattern = pattern.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Optional expression that must hold for the edge to be followed.
    /// See [`evaluate_condition`] for the supported syntax.
    #[serde(default)]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(expr.into()),
        }
    }

    /// Whether this edge may be followed given the execution data.
    pub fn is_satisfied(&self, data: &HashMap<String, serde_json::Value>) -> bool {
        match &self.condition {
            None => true,
            Some(expr) => evaluate_condition(expr, data),
        }
    }
}

/// Which parts of the execution a backtrack event snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    QualityScores,
    CompletedNodes,
    FailedNodes,
    BranchRefs,
    Error,
    Inputs,
}

/// Maps a failure trigger to a rollback target and a retry ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktrackRule {
    pub trigger: TriggerKind,
    pub target_node: String,
    #[serde(default = "default_max_backtrack_count")]
    pub max_backtrack_count: u32,
    #[serde(default)]
    pub include_context: Vec<ContextScope>,
}

fn default_max_backtrack_count() -> u32 {
    1
}

impl BacktrackRule {
    pub fn new(trigger: TriggerKind, target_node: impl Into<String>, max_backtrack_count: u32) -> Self {
        Self {
            trigger,
            target_node: target_node.into(),
            max_backtrack_count,
            include_context: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateComparison {
    #[default]
    AtLeast,
    AtMost,
}

/// Threshold check on one quality metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub id: String,
    pub metric: String,
    pub threshold: f64,
    #[serde(default)]
    pub comparison: GateComparison,
    #[serde(default)]
    pub description: Option<String>,
}

impl QualityGate {
    pub fn at_least(id: impl Into<String>, metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            id: id.into(),
            metric: metric.into(),
            threshold,
            comparison: GateComparison::AtLeast,
            description: None,
        }
    }

    pub fn at_most(id: impl Into<String>, metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            comparison: GateComparison::AtMost,
            ..Self::at_least(id, metric, threshold)
        }
    }

    /// A missing score never passes.
    pub fn passes(&self, score: Option<f64>) -> bool {
        match (score, self.comparison) {
            (Some(s), GateComparison::AtLeast) => s >= self.threshold,
            (Some(s), GateComparison::AtMost) => s <= self.threshold,
            (None, _) => false,
        }
    }
}

/// Authoring form of a workflow, as stored in TOML/JSON files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub exit_points: Vec<String>,
    #[serde(default)]
    pub merge_points: Vec<String>,
    #[serde(default)]
    pub backtrack_rules: Vec<BacktrackRule>,
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
}

/// Immutable, validated workflow template.
///
/// Built from a [`WorkflowDefinition`] by [`WorkflowDag::from_definition`],
/// which also resolves parallel groups as connected components of the
/// symmetric `parallel_with` relation.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    pub id: String,
    pub name: String,
    pub nodes: BTreeMap<String, WorkflowNode>,
    pub edges: Vec<Edge>,
    pub entry_points: Vec<String>,
    pub exit_points: BTreeSet<String>,
    pub merge_points: BTreeSet<String>,
    pub backtrack_rules: Vec<BacktrackRule>,
    pub quality_gates: Vec<QualityGate>,
    parallel_groups: Vec<Vec<String>>,
    group_of: HashMap<String, usize>,
}

impl WorkflowDag {
    /// Validate a definition and build the DAG.
    pub fn from_definition(def: WorkflowDefinition) -> Result<Self> {
        let wf = def.id.clone();
        let invalid = |reason: String| StrataError::invalid_workflow(wf.clone(), reason);

        if def.id.trim().is_empty() {
            return Err(invalid("workflow id is empty".into()));
        }
        if def.nodes.is_empty() {
            return Err(invalid("workflow has no nodes".into()));
        }

        let mut nodes = BTreeMap::new();
        for node in def.nodes {
            if node.id.trim().is_empty() {
                return Err(invalid("node with empty id".into()));
            }
            if let Some(dup) = nodes.insert(node.id.clone(), node) {
                return Err(invalid(format!("duplicate node id '{}'", dup.id)));
            }
        }

        let known = |id: &str| nodes.contains_key(id);

        for node in nodes.values() {
            for dep in &node.dependencies {
                if !known(dep) {
                    return Err(invalid(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dep
                    )));
                }
            }
            for peer in &node.parallel_with {
                if !known(peer) {
                    return Err(invalid(format!(
                        "node '{}' is parallel with unknown node '{}'",
                        node.id, peer
                    )));
                }
            }
            for gate in &node.quality_gates {
                if !def.quality_gates.iter().any(|g| &g.id == gate) {
                    return Err(invalid(format!(
                        "node '{}' references unknown quality gate '{}'",
                        node.id, gate
                    )));
                }
            }
        }

        for edge in &def.edges {
            if !known(&edge.from) || !known(&edge.to) {
                return Err(invalid(format!(
                    "edge {} -> {} references an unknown node",
                    edge.from, edge.to
                )));
            }
        }

        for (label, ids) in [
            ("entry point", &def.entry_points),
            ("exit point", &def.exit_points),
            ("merge point", &def.merge_points),
        ] {
            if let Some(missing) = ids.iter().find(|id| !known(id)) {
                return Err(invalid(format!("unknown {} '{}'", label, missing)));
            }
        }

        for rule in &def.backtrack_rules {
            if !known(&rule.target_node) {
                return Err(invalid(format!(
                    "backtrack rule for {} targets unknown node '{}'",
                    rule.trigger, rule.target_node
                )));
            }
        }

        let mut dag = Self {
            id: def.id,
            name: def.name,
            nodes,
            edges: def.edges,
            entry_points: vec![],
            exit_points: def.exit_points.into_iter().collect(),
            merge_points: def.merge_points.into_iter().collect(),
            backtrack_rules: def.backtrack_rules,
            quality_gates: def.quality_gates,
            parallel_groups: vec![],
            group_of: HashMap::new(),
        };

        if let Some(node) = dag.find_cycle() {
            return Err(invalid(format!("cycle detected through node '{}'", node)));
        }

        dag.entry_points = if def.entry_points.is_empty() {
            dag.derive_entry_points()
        } else {
            let mut seen = HashSet::new();
            def.entry_points
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };
        if dag.entry_points.is_empty() {
            return Err(invalid("workflow has no entry points".into()));
        }
        if dag.exit_points.is_empty() {
            dag.exit_points = dag
                .nodes
                .keys()
                .filter(|id| !dag.edges.iter().any(|e| &e.from == *id))
                .cloned()
                .collect();
        }

        dag.resolve_parallel_groups();
        Ok(dag)
    }

    /// Parse and validate a TOML workflow definition.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let def: WorkflowDefinition =
            toml::from_str(content).map_err(|e| StrataError::Config(e.to_string()))?;
        Self::from_definition(def)
    }

    /// Parse and validate a JSON workflow definition.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let def: WorkflowDefinition = serde_json::from_str(content)?;
        Self::from_definition(def)
    }

    /// Load a workflow file; the format is chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrataError::ConfigNotFound(path.display().to_string()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn is_merge_point(&self, id: &str) -> bool {
        self.merge_points.contains(id)
    }

    /// All resolved parallel groups (each has at least two members).
    pub fn parallel_groups(&self) -> &[Vec<String>] {
        &self.parallel_groups
    }

    /// The parallel group a node belongs to, if any.
    pub fn parallel_group_of(&self, id: &str) -> Option<&[String]> {
        self.group_of
            .get(id)
            .map(|&idx| self.parallel_groups[idx].as_slice())
    }

    /// Nodes to enqueue once `id` has completed: targets of satisfied
    /// outgoing edges, then nodes declaring `id` as a dependency.
    pub fn successors(&self, id: &str, data: &HashMap<String, serde_json::Value>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for edge in self.edges.iter().filter(|e| e.from == id) {
            if edge.is_satisfied(data) && !out.contains(&edge.to) {
                out.push(edge.to.clone());
            }
        }
        for node in self.nodes.values() {
            if node.dependencies.contains(id) && !out.contains(&node.id) {
                out.push(node.id.clone());
            }
        }
        out
    }

    /// `id` plus every node reachable forward from it through edges or
    /// dependency links.
    pub fn descendants_inclusive(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for next in self.forward_neighbors(&current) {
                if !seen.contains(&next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Sum of all rule ceilings; bounds the number of rollbacks per execution.
    pub fn total_backtrack_allowance(&self) -> u64 {
        self.backtrack_rules
            .iter()
            .map(|r| r.max_backtrack_count as u64)
            .sum()
    }

    fn forward_neighbors(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.clone())
            .collect();
        out.extend(
            self.nodes
                .values()
                .filter(|n| n.dependencies.contains(id))
                .map(|n| n.id.clone()),
        );
        out
    }

    fn derive_entry_points(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.is_empty() && !self.edges.iter().any(|e| e.to == n.id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Kahn's algorithm over edges plus dependency links. Returns a node
    /// on a cycle, if there is one.
    fn find_cycle(&self) -> Option<String> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        let mut links: Vec<(String, String)> = self
            .edges
            .iter()
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                links.push((dep.clone(), node.id.clone()));
            }
        }
        links.sort();
        links.dedup();
        for (_, to) in &links {
            if let Some(d) = in_degree.get_mut(to.as_str()) {
                *d += 1;
            }
        }

        let mut queue: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(k, _)| k.to_string())
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for (_, to) in links.iter().filter(|(from, _)| *from == id) {
                if let Some(d) = in_degree.get_mut(to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(to.clone());
                    }
                }
            }
        }

        if visited == self.nodes.len() {
            None
        } else {
            in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(k, _)| k.to_string())
                .min()
        }
    }

    fn resolve_parallel_groups(&mut self) {
        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for node in self.nodes.values() {
            for peer in node.parallel_with.iter().filter(|p| **p != node.id) {
                adjacency.entry(node.id.as_str()).or_default().insert(peer);
                adjacency.entry(peer.as_str()).or_default().insert(&node.id);
            }
        }

        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut assigned: HashSet<&str> = HashSet::new();
        for &start in adjacency.keys() {
            if assigned.contains(start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut stack = vec![start];
            while let Some(current) = stack.pop() {
                if !component.insert(current) {
                    continue;
                }
                if let Some(peers) = adjacency.get(current) {
                    stack.extend(peers.iter().copied());
                }
            }
            assigned.extend(component.iter().copied());
            groups.push(component.into_iter().map(String::from).collect());
        }

        self.group_of = groups
            .iter()
            .enumerate()
            .flat_map(|(idx, members)| members.iter().map(move |m| (m.clone(), idx)))
            .collect();
        self.parallel_groups = groups;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(nodes: Vec<WorkflowNode>, edges: Vec<Edge>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            name: "Test".into(),
            nodes,
            edges,
            ..Default::default()
        }
    }

    #[test]
    fn derives_entry_and_exit_points() {
        let dag = WorkflowDag::from_definition(def(
            vec![
                WorkflowNode::new("a", "test_design"),
                WorkflowNode::new("b", "implementation").depends_on(&["a"]),
            ],
            vec![Edge::new("a", "b")],
        ))
        .unwrap();
        assert_eq!(dag.entry_points, vec!["a"]);
        assert!(dag.exit_points.contains("b"));
        assert_eq!(dag.exit_points.len(), 1);
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let err = WorkflowDag::from_definition(def(
            vec![WorkflowNode::new("a", "x"), WorkflowNode::new("a", "y")],
            vec![],
        ))
        .unwrap_err();
        assert!(matches!(err, StrataError::InvalidWorkflow { .. }));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_unknown_references() {
        let err = WorkflowDag::from_definition(def(
            vec![WorkflowNode::new("a", "x").depends_on(&["ghost"])],
            vec![],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = WorkflowDag::from_definition(def(
            vec![WorkflowNode::new("a", "x")],
            vec![Edge::new("a", "nowhere")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("unknown node"));
    }

    #[test]
    fn rejects_cycles() {
        let err = WorkflowDag::from_definition(def(
            vec![
                WorkflowNode::new("a", "x"),
                WorkflowNode::new("b", "x"),
                WorkflowNode::new("c", "x"),
            ],
            vec![Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("c", "b")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn parallel_groups_are_symmetric_components() {
        // Asymmetric declarations still land in one group.
        let dag = WorkflowDag::from_definition(def(
            vec![
                WorkflowNode::new("a", "x"),
                WorkflowNode::new("b", "x").depends_on(&["a"]).parallel_with(&["c"]),
                WorkflowNode::new("c", "x").depends_on(&["a"]),
                WorkflowNode::new("d", "x").depends_on(&["a"]).parallel_with(&["c"]),
            ],
            vec![],
        ))
        .unwrap();
        assert_eq!(dag.parallel_groups().len(), 1);
        assert_eq!(dag.parallel_group_of("c").unwrap(), &["b", "c", "d"]);
        assert_eq!(dag.parallel_group_of("b"), dag.parallel_group_of("d"));
        assert!(dag.parallel_group_of("a").is_none());
    }

    #[test]
    fn descendants_follow_edges_and_dependencies() {
        let dag = WorkflowDag::from_definition(def(
            vec![
                WorkflowNode::new("a", "x"),
                WorkflowNode::new("b", "x"),
                WorkflowNode::new("c", "x").depends_on(&["b"]),
                WorkflowNode::new("d", "x"),
            ],
            vec![Edge::new("a", "b"), Edge::new("a", "d")],
        ))
        .unwrap();
        let from_b: Vec<_> = dag.descendants_inclusive("b").into_iter().collect();
        assert_eq!(from_b, vec!["b", "c"]);
        assert_eq!(dag.descendants_inclusive("a").len(), 4);
    }

    #[test]
    fn successors_respect_edge_conditions() {
        let dag = WorkflowDag::from_definition(def(
            vec![
                WorkflowNode::new("review", "x"),
                WorkflowNode::new("ship", "x"),
                WorkflowNode::new("rework", "x"),
            ],
            vec![
                Edge::conditional("review", "ship", "coverage >= 0.8"),
                Edge::conditional("review", "rework", "coverage < 0.8"),
            ],
        ))
        .unwrap();
        let mut data = HashMap::new();
        data.insert("coverage".to_string(), serde_json::json!(0.92));
        assert_eq!(dag.successors("review", &data), vec!["ship"]);
    }

    #[test]
    fn gate_comparisons() {
        let gate = QualityGate::at_least("cov", "coverage", 0.8);
        assert!(gate.passes(Some(0.8)));
        assert!(!gate.passes(Some(0.79)));
        assert!(!gate.passes(None));

        let gate = QualityGate::at_most("vulns", "critical_vulns", 0.0);
        assert!(gate.passes(Some(0.0)));
        assert!(!gate.passes(Some(1.0)));
    }

    #[test]
    fn parses_toml_definition() {
        let toml_str = r#"
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
execution_timeout_ms = 5000

[nodes.branch_strategy]
pattern = "feature/{workItemId}-impl"
base_ref = "develop"

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
target_node = "impl"
max_backtrack_count = 2
include_context = ["quality_scores", "error"]
"#;
        let dag = WorkflowDag::from_toml_str(toml_str).unwrap();
        assert_eq!(dag.name, "Test-driven change");
        assert_eq!(dag.nodes.len(), 3);
        let node = dag.node("impl").unwrap();
        assert_eq!(node.execution_timeout_ms, 5000);
        assert_eq!(node.branch_strategy.base_ref, "develop");
        assert_eq!(dag.node("tests").unwrap().branch_strategy, BranchStrategy::default());
        assert!(dag.is_merge_point("review"));
        assert_eq!(dag.backtrack_rules[0].trigger, TriggerKind::TestFailure);
        assert_eq!(dag.backtrack_rules[0].max_backtrack_count, 2);
        assert_eq!(dag.total_backtrack_allowance(), 2);
    }
}
