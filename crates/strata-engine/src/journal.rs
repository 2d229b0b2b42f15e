use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use strata_core::error::{Result, StrataError};
use strata_core::execution::{BacktrackEvent, ExecutionStatus, WorkflowExecution};

/// One finished execution as stored in the journal.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub work_item_id: String,
    pub status: String,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub backtracks: usize,
    pub failure_reason: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// SQLite history of finished executions and their backtracks.
///
/// Written once per execution after it reaches a terminal status. This is
/// a report, not a resume point: in-flight state is never stored.
pub struct ExecutionJournal {
    conn: Mutex<Connection>,
}

fn journal_err(context: &str, e: impl std::fmt::Display) -> StrataError {
    StrataError::Journal(format!("{}: {}", context, e))
}

impl ExecutionJournal {
    /// Open or create the journal database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| journal_err("Failed to create journal directory", e))?;
        }
        let conn =
            Connection::open(path).map_err(|e| journal_err("Failed to open journal", e))?;
        Self::init(conn)
    }

    /// In-memory journal, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| journal_err("Failed to open journal", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS executions (
                 id TEXT PRIMARY KEY,
                 workflow_id TEXT NOT NULL,
                 work_item_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 completed_nodes TEXT NOT NULL DEFAULT '[]',
                 failed_nodes TEXT NOT NULL DEFAULT '[]',
                 quality_scores TEXT NOT NULL DEFAULT '{}',
                 backtracks INTEGER NOT NULL DEFAULT 0,
                 failure_reason TEXT,
                 start_time TEXT NOT NULL,
                 end_time TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_exec_start
                 ON executions(start_time);

             CREATE TABLE IF NOT EXISTS backtracks (
                 id TEXT PRIMARY KEY,
                 execution_id TEXT NOT NULL,
                 from_node TEXT NOT NULL,
                 to_node TEXT NOT NULL,
                 reason TEXT NOT NULL,
                 attempts INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 context_json TEXT NOT NULL DEFAULT '{}'
             );

             CREATE INDEX IF NOT EXISTS idx_bt_exec
                 ON backtracks(execution_id, timestamp);",
        )
        .map_err(|e| journal_err("Failed to initialize journal schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Store the final state of an execution and its backtrack history.
    pub fn record_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| journal_err("Journal lock poisoned", e))?;
        let tx = conn
            .transaction()
            .map_err(|e| journal_err("Failed to begin transaction", e))?;

        tx.execute(
            "INSERT OR REPLACE INTO executions
                 (id, workflow_id, work_item_id, status, completed_nodes, failed_nodes,
                  quality_scores, backtracks, failure_reason, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                execution.id.as_str(),
                execution.workflow_id,
                execution.work_item_id,
                execution.status.as_str(),
                serde_json::to_string(&execution.completed_nodes)?,
                serde_json::to_string(&execution.failed_nodes)?,
                serde_json::to_string(&execution.quality_scores)?,
                execution.backtrack_history.len() as i64,
                execution.failure_reason,
                execution.start_time.to_rfc3339(),
                execution.end_time.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| journal_err("Failed to record execution", e))?;

        for event in &execution.backtrack_history {
            tx.execute(
                "INSERT OR REPLACE INTO backtracks
                     (id, execution_id, from_node, to_node, reason, attempts, timestamp, context_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.id,
                    execution.id.as_str(),
                    event.from_node,
                    event.to_node,
                    event.reason.as_str(),
                    event.attempts as i64,
                    event.timestamp.to_rfc3339(),
                    serde_json::to_string(&event.context)?,
                ],
            )
            .map_err(|e| journal_err("Failed to record backtrack", e))?;
        }

        tx.commit().map_err(|e| journal_err("Failed to commit", e))?;
        Ok(())
    }

    /// Most recent executions, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let conn = self.conn.lock().map_err(|e| journal_err("Journal lock poisoned", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, workflow_id, work_item_id, status, completed_nodes, failed_nodes,
                        backtracks, failure_reason, start_time, end_time
                 FROM executions
                 ORDER BY start_time DESC
                 LIMIT ?1",
            )
            .map_err(|e| journal_err("Failed to query executions", e))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let completed: String = row.get(4)?;
                let failed: String = row.get(5)?;
                let start: String = row.get(8)?;
                let end: Option<String> = row.get(9)?;
                Ok(ExecutionSummary {
                    execution_id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    work_item_id: row.get(2)?,
                    status: row.get(3)?,
                    completed_nodes: serde_json::from_str(&completed).unwrap_or_default(),
                    failed_nodes: serde_json::from_str(&failed).unwrap_or_default(),
                    backtracks: row.get::<_, i64>(6)? as usize,
                    failure_reason: row.get(7)?,
                    start_time: parse_time(&start),
                    end_time: end.as_deref().map(parse_time),
                })
            })
            .map_err(|e| journal_err("Failed to fetch executions", e))?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.map_err(|e| journal_err("Failed to read row", e))?);
        }
        Ok(summaries)
    }

    /// Backtracks recorded for one execution, oldest first.
    pub fn backtracks_for(&self, execution_id: &str) -> Result<Vec<BacktrackEvent>> {
        let conn = self.conn.lock().map_err(|e| journal_err("Journal lock poisoned", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, from_node, to_node, reason, attempts, timestamp, context_json
                 FROM backtracks
                 WHERE execution_id = ?1
                 ORDER BY timestamp ASC",
            )
            .map_err(|e| journal_err("Failed to query backtracks", e))?;

        let rows = stmt
            .query_map(params![execution_id], |row| {
                let reason: String = row.get(3)?;
                let ts: String = row.get(5)?;
                let context: String = row.get(6)?;
                Ok(BacktrackEvent {
                    id: row.get(0)?,
                    from_node: row.get(1)?,
                    to_node: row.get(2)?,
                    reason: serde_json::from_value(serde_json::Value::String(reason))
                        .unwrap_or(strata_core::types::TriggerKind::Unclassified),
                    timestamp: parse_time(&ts),
                    context: serde_json::from_str(&context).unwrap_or_default(),
                    attempts: row.get::<_, i64>(4)? as u32,
                })
            })
            .map_err(|e| journal_err("Failed to fetch backtracks", e))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| journal_err("Failed to read row", e))?);
        }
        Ok(events)
    }

    /// Count of journaled executions with the given final status.
    pub fn count_with_status(&self, status: ExecutionStatus) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| journal_err("Journal lock poisoned", e))?;
        conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE status = ?1",
            params![status.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(|e| journal_err("Failed to count executions", e))
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::types::TriggerKind;

    fn finished() -> WorkflowExecution {
        let mut e = WorkflowExecution::new("tdd", "ITEM-9", serde_json::Value::Null, HashMap::new());
        e.transition(ExecutionStatus::Running).unwrap();
        e.completed_nodes = vec!["a".into(), "b".into()];
        let mut ctx = serde_json::Map::new();
        ctx.insert("error".into(), serde_json::json!({"type": "TEST_FAILURE"}));
        e.backtrack_history
            .push(BacktrackEvent::new("b", "a", TriggerKind::TestFailure, 1, ctx));
        e.transition(ExecutionStatus::Completed).unwrap();
        e
    }

    #[test]
    fn records_and_reads_back() {
        let journal = ExecutionJournal::in_memory().unwrap();
        let exec = finished();
        journal.record_execution(&exec).unwrap();

        let recent = journal.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        let summary = &recent[0];
        assert_eq!(summary.execution_id, exec.id.as_str());
        assert_eq!(summary.status, "COMPLETED");
        assert_eq!(summary.completed_nodes, vec!["a", "b"]);
        assert_eq!(summary.backtracks, 1);
        assert!(summary.end_time.is_some());

        let backtracks = journal.backtracks_for(exec.id.as_str()).unwrap();
        assert_eq!(backtracks.len(), 1);
        assert_eq!(backtracks[0].reason, TriggerKind::TestFailure);
        assert_eq!(backtracks[0].context["error"]["type"], "TEST_FAILURE");
        assert_eq!(journal.count_with_status(ExecutionStatus::Completed).unwrap(), 1);
    }

    #[test]
    fn rerecording_replaces() {
        let journal = ExecutionJournal::in_memory().unwrap();
        let exec = finished();
        journal.record_execution(&exec).unwrap();
        journal.record_execution(&exec).unwrap();
        assert_eq!(journal.recent(10).unwrap().len(), 1);
        assert_eq!(journal.backtracks_for(exec.id.as_str()).unwrap().len(), 1);
    }

    #[test]
    fn opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("journal.db");
        let journal = ExecutionJournal::open(&path).unwrap();
        journal.record_execution(&finished()).unwrap();
        drop(journal);

        let reopened = ExecutionJournal::open(&path).unwrap();
        assert_eq!(reopened.recent(5).unwrap().len(), 1);
    }
}
