use std::collections::HashMap;
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use strata_core::traits::{NodeContext, RoleExecutor};
use strata_core::types::{NodeError, NodeErrorKind, OutputBuffer, RoleResult};

const SCORE_MARKER: &str = "STRATA_SCORE";
const ERROR_MARKER: &str = "STRATA_ERROR";

/// Runs a node's session command through `sh -c`.
///
/// Output lines are appended to the session buffer as they arrive. Two
/// marker lines are recognised on either stream:
///
/// ```text
/// STRATA_SCORE coverage 0.87
/// STRATA_ERROR TEST_FAILURE 3 assertions failed
/// ```
///
/// A non-zero exit without an error marker fails with the executor's
/// configured kind.
pub struct ShellRoleExecutor {
    role: String,
    failure_kind: NodeErrorKind,
}

impl ShellRoleExecutor {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            failure_kind: NodeErrorKind::Unclassified,
        }
    }

    pub fn with_failure_kind(mut self, kind: NodeErrorKind) -> Self {
        self.failure_kind = kind;
        self
    }
}

/// Markers and tail collected from one output stream.
#[derive(Debug, Default)]
struct StreamReport {
    scores: HashMap<String, f64>,
    error: Option<NodeError>,
    last_line: Option<String>,
    lines: usize,
}

impl StreamReport {
    fn absorb(&mut self, line: &str) {
        self.lines += 1;
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        match parts.next() {
            Some(SCORE_MARKER) => {
                let metric = parts.next();
                let value = parts.next().and_then(|v| v.trim().parse::<f64>().ok());
                match (metric, value) {
                    (Some(metric), Some(value)) => {
                        self.scores.insert(metric.to_string(), value);
                    }
                    _ => warn!(line, "Malformed score marker ignored"),
                }
            }
            Some(ERROR_MARKER) => {
                let kind = parts.next().map(NodeErrorKind::parse).unwrap_or(NodeErrorKind::Unclassified);
                let message = parts.next().unwrap_or("").trim().to_string();
                self.error = Some(NodeError::new(kind, message));
            }
            _ => {
                if !line.trim().is_empty() {
                    self.last_line = Some(line.to_string());
                }
            }
        }
    }

    fn merge(&mut self, other: StreamReport) {
        self.scores.extend(other.scores);
        if self.error.is_none() {
            self.error = other.error;
        }
        if other.last_line.is_some() {
            self.last_line = other.last_line;
        }
        self.lines += other.lines;
    }
}

async fn read_stream<R>(reader: Option<R>, buffer: &OutputBuffer) -> StreamReport
where
    R: AsyncRead + Unpin,
{
    let mut report = StreamReport::default();
    let Some(reader) = reader else {
        return report;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                report.absorb(&line);
                buffer.push_line(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read command output");
                break;
            }
        }
    }
    report
}

impl RoleExecutor for ShellRoleExecutor {
    fn role_type(&self) -> &str {
        &self.role
    }

    fn run(&self, ctx: NodeContext) -> BoxFuture<'_, RoleResult> {
        Box::pin(async move {
            let session = &ctx.session;
            debug!(
                node_id = %ctx.node.id,
                role = %self.role,
                command = %session.command,
                "Running shell command"
            );

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(&session.command)
                .envs(&session.environment_variables)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if session.working_directory.is_dir() {
                cmd.current_dir(&session.working_directory);
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    return RoleResult::failure(NodeError::new(
                        NodeErrorKind::Unclassified,
                        format!("Failed to spawn command: {}", e),
                    ));
                }
            };

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let buffer = session.output.clone();

            let finished = async {
                let (mut report, err_report) =
                    tokio::join!(read_stream(stdout, &buffer), read_stream(stderr, &buffer));
                report.merge(err_report);
                (report, child.wait().await)
            };

            let (report, status) = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    // Dropping the child kills it.
                    return RoleResult::failure(NodeError::new(
                        NodeErrorKind::Unclassified,
                        "Cancelled",
                    ));
                }
                done = finished => done,
            };

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    return RoleResult::failure(NodeError::new(
                        NodeErrorKind::Unclassified,
                        format!("Failed to wait for command: {}", e),
                    ));
                }
            };

            let payload = serde_json::json!({
                "exit_code": status.code(),
                "output_lines": report.lines,
            });

            let mut result = if let Some(error) = report.error {
                RoleResult::failure(error)
            } else if status.success() {
                RoleResult::success()
            } else {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let message = match report.last_line {
                    Some(line) => format!("Exit code {}: {}", code, line),
                    None => format!("Exit code {}", code),
                };
                RoleResult::failure(NodeError::new(self.failure_kind, message))
            };
            result.quality_scores = report.scores;
            result.with_payload(payload)
        })
    }
}
