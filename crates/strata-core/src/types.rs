use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of failure reported by a role executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeErrorKind {
    TestFailure,
    BuildFailure,
    QualityGateFailure,
    SecurityViolation,
    Timeout,
    Unclassified,
}

impl NodeErrorKind {
    /// Parse a raw error type string from an external executor.
    ///
    /// Case and separators are ignored, so `test_failure`, `TEST-FAILURE`
    /// and `TestFailure` all map to the same kind. Unknown strings map to
    /// `Unclassified`.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "testfailure" => Self::TestFailure,
            "buildfailure" => Self::BuildFailure,
            "qualitygatefailure" => Self::QualityGateFailure,
            "securityviolation" => Self::SecurityViolation,
            "timeout" => Self::Timeout,
            _ => Self::Unclassified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestFailure => "TEST_FAILURE",
            Self::BuildFailure => "BUILD_FAILURE",
            Self::QualityGateFailure => "QUALITY_GATE_FAILURE",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::Timeout => "TIMEOUT",
            Self::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl std::fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backtrack trigger kinds. `Unclassified` failures never backtrack,
/// even when a rule names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    TestFailure,
    BuildFailure,
    QualityGateFailure,
    SecurityViolation,
    Unclassified,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestFailure => "TEST_FAILURE",
            Self::BuildFailure => "BUILD_FAILURE",
            Self::QualityGateFailure => "QUALITY_GATE_FAILURE",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error object attached to a failed node run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    #[serde(rename = "type")]
    pub kind: NodeErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            NodeErrorKind::Timeout,
            format!("Node exceeded execution timeout of {}ms", timeout_ms),
        )
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result returned by a role executor for one node run.
///
/// `payload` is the role-specific part of the result; the engine never
/// inspects it. Quality score contributions are merged into the
/// execution's `quality_scores` when the node succeeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleResult {
    pub success: bool,
    #[serde(default)]
    pub quality_scores: HashMap<String, f64>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub error: Option<NodeError>,
}

impl RoleResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: NodeError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_score(mut self, metric: impl Into<String>, score: f64) -> Self {
        self.quality_scores.insert(metric.into(), score);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// The error to act on when the result is a failure.
    ///
    /// A failed result without an error object is treated as unclassified.
    pub fn failure_error(&self) -> Option<NodeError> {
        if self.success {
            return None;
        }
        Some(self.error.clone().unwrap_or_else(|| {
            NodeError::new(NodeErrorKind::Unclassified, "Role reported failure without an error")
        }))
    }
}

/// Lifecycle of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Output buffer shared between the session registry and the executor
/// writing into it.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.into());
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for OutputBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.lines().serialize(serializer)
    }
}

/// Isolated execution context for one node run.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalSession {
    pub id: String,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub role_type: String,
    pub branch_name: String,
    pub command: String,
    pub working_directory: PathBuf,
    pub environment_variables: HashMap<String, String>,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub output: OutputBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_kind_ignores_case_and_separators() {
        assert_eq!(NodeErrorKind::parse("TEST_FAILURE"), NodeErrorKind::TestFailure);
        assert_eq!(NodeErrorKind::parse("test-failure"), NodeErrorKind::TestFailure);
        assert_eq!(NodeErrorKind::parse("BuildFailure"), NodeErrorKind::BuildFailure);
        assert_eq!(
            NodeErrorKind::parse("quality_gate_failure"),
            NodeErrorKind::QualityGateFailure
        );
        assert_eq!(NodeErrorKind::parse("timeout"), NodeErrorKind::Timeout);
        assert_eq!(NodeErrorKind::parse("disk full"), NodeErrorKind::Unclassified);
    }

    #[test]
    fn node_error_serializes_kind_as_type() {
        let err = NodeError::new(NodeErrorKind::SecurityViolation, "secret in diff");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "SECURITY_VIOLATION");
        assert_eq!(json["message"], "secret in diff");
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn failed_result_without_error_is_unclassified() {
        let result = RoleResult {
            success: false,
            ..Default::default()
        };
        let err = result.failure_error().unwrap();
        assert_eq!(err.kind, NodeErrorKind::Unclassified);
        assert!(RoleResult::success().failure_error().is_none());
    }

    #[test]
    fn output_buffer_is_shared_between_clones() {
        let buf = OutputBuffer::new();
        let writer = buf.clone();
        writer.push_line("compiling");
        writer.push_line("done");
        assert_eq!(buf.lines(), vec!["compiling", "done"]);
        assert_eq!(serde_json::to_string(&buf).unwrap(), r#"["compiling","done"]"#);
    }
}
