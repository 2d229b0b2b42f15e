use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::event::{EventBus, ExecutionEvent};
use strata_core::execution::{ExecutionStatus, WorkflowExecution};
use strata_core::traits::NodeContext;
use strata_core::types::{NodeError, NodeErrorKind, RoleResult};
use strata_core::workflow::{WorkflowDag, WorkflowNode};

use crate::backtrack;
use crate::dispatch::RoleRegistry;
use crate::gate;
use crate::limiter::RoleLimiter;
use crate::session::SessionManager;

/// Shared state of one live execution.
///
/// The record mutex is the execution's logical lock: the traversal loop
/// and `cancel` both mutate it only while holding it.
pub struct ExecutionHandle {
    pub record: Mutex<WorkflowExecution>,
    pub workflow: Arc<WorkflowDag>,
    pub cancel: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
    transitions_tx: broadcast::Sender<ExecutionStatus>,
    finished_tx: watch::Sender<bool>,
}

impl ExecutionHandle {
    pub fn new(execution: WorkflowExecution, workflow: Arc<WorkflowDag>) -> Self {
        let (status_tx, _) = watch::channel(execution.status);
        let (transitions_tx, _) = broadcast::channel(64);
        let (finished_tx, _) = watch::channel(false);
        Self {
            record: Mutex::new(execution),
            workflow,
            cancel: CancellationToken::new(),
            status_tx,
            transitions_tx,
            finished_tx,
        }
    }

    pub async fn snapshot(&self) -> WorkflowExecution {
        self.record.lock().await.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status_tx.borrow()
    }

    /// Latest status. BACKTRACKING only lasts while the record lock is
    /// held, so a watcher normally sees RUNNING on either side of it; use
    /// `subscribe_transitions` to observe every step.
    pub fn watch_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    /// Every status the execution moves into, in order, from now on.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ExecutionStatus> {
        self.transitions_tx.subscribe()
    }

    fn notify(&self, status: ExecutionStatus) {
        self.status_tx.send_replace(status);
        // No subscribers is fine.
        let _ = self.transitions_tx.send(status);
    }

    /// Mark the traversal task as done, after its final bookkeeping.
    pub fn mark_finished(&self) {
        self.finished_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished_tx.borrow()
    }

    /// Wait until `mark_finished` has been called.
    pub async fn finished(&self) {
        let mut rx = self.finished_tx.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Cancel if the execution is running. Returns the status it was
    /// cancelled from; any other status is left untouched.
    pub async fn cancel(&self) -> Option<ExecutionStatus> {
        let mut record = self.record.lock().await;
        let previous = record.status;
        if previous != ExecutionStatus::Running {
            return None;
        }
        record.transition(ExecutionStatus::Cancelled).ok()?;
        self.cancel.cancel();
        self.notify(ExecutionStatus::Cancelled);
        Some(previous)
    }
}

/// The scheduling loop. One `run` call drives one execution to a
/// terminal status.
pub struct Traversal {
    limiter: Arc<RoleLimiter>,
    sessions: Arc<SessionManager>,
    roles: Arc<RoleRegistry>,
    bus: Arc<EventBus>,
}

impl Traversal {
    pub fn new(
        limiter: Arc<RoleLimiter>,
        sessions: Arc<SessionManager>,
        roles: Arc<RoleRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            limiter,
            sessions,
            roles,
            bus,
        }
    }

    pub fn max_parallel_nodes(&self) -> usize {
        self.limiter.config().max_parallel_nodes.max(1)
    }

    /// Drive the execution until it completes, fails, or is cancelled.
    /// Returns the final record.
    pub async fn run(&self, handle: Arc<ExecutionHandle>) -> WorkflowExecution {
        let workflow = handle.workflow.clone();

        {
            let mut record = handle.record.lock().await;
            if record.transition(ExecutionStatus::Running).is_err() {
                debug!(execution_id = %record.id, status = %record.status, "Execution not startable");
                return record.clone();
            }
            handle.notify(ExecutionStatus::Running);
            info!(
                execution_id = %record.id,
                workflow_id = %workflow.id,
                work_item_id = %record.work_item_id,
                "Execution started"
            );
            self.bus.publish(ExecutionEvent::ExecutionStarted {
                execution_id: record.id.clone(),
                workflow_id: record.workflow_id.clone(),
                work_item_id: record.work_item_id.clone(),
            });
        }

        let mut queue: VecDeque<String> = workflow.entry_points.iter().cloned().collect();
        let max_rounds = round_limit(&workflow);
        let mut rounds = 0u64;

        loop {
            if handle.cancel.is_cancelled() {
                break;
            }

            let batch = {
                let mut record = handle.record.lock().await;
                if record.status != ExecutionStatus::Running {
                    break;
                }
                queue.retain(|n| !record.is_completed(n) && !record.is_skipped(n));

                let batch = ready_batch(&workflow, &record, &queue, self.max_parallel_nodes());
                if batch.is_empty() {
                    if queue.is_empty() {
                        self.complete(&handle, &mut record);
                    } else {
                        let stuck: Vec<&str> = queue.iter().map(String::as_str).collect();
                        let reason = format!("stalled: no schedulable nodes among [{}]", stuck.join(", "));
                        self.fail(&handle, &mut record, None, reason, None);
                    }
                    break;
                }

                rounds += 1;
                if rounds > max_rounds {
                    let reason = format!("round limit exceeded ({} rounds)", max_rounds);
                    self.fail(&handle, &mut record, None, reason, None);
                    break;
                }

                queue.retain(|n| !batch.contains(n));
                record.current_node = batch.first().cloned();
                debug!(execution_id = %record.id, round = rounds, batch = ?batch, "Dispatching batch");
                batch
            };

            let Some(results) = self.dispatch_batch(&handle, &workflow, &batch).await else {
                debug!("Cancelled while batch in flight, discarding results");
                break;
            };

            let mut record = handle.record.lock().await;
            if record.status != ExecutionStatus::Running {
                // Cancelled while the batch ran.
                break;
            }
            if !self.merge_batch(&handle, &workflow, &mut record, &mut queue, results) {
                break;
            }
        }

        handle.snapshot().await
    }

    /// Run every node of the batch concurrently. `None` if the execution
    /// was cancelled before all nodes finished.
    async fn dispatch_batch(
        &self,
        handle: &Arc<ExecutionHandle>,
        workflow: &WorkflowDag,
        batch: &[String],
    ) -> Option<Vec<(String, RoleResult)>> {
        let mut in_flight = FuturesUnordered::new();
        for node_id in batch {
            let Some(node) = workflow.node(node_id).cloned() else {
                continue;
            };
            let task = tokio::spawn(run_node(
                self.limiter.clone(),
                self.sessions.clone(),
                self.roles.clone(),
                self.bus.clone(),
                handle.clone(),
                node,
            ));
            let node_id = node_id.clone();
            in_flight.push(async move {
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => RoleResult::failure(NodeError::new(
                        NodeErrorKind::Unclassified,
                        format!("Role executor task failed: {}", e),
                    )),
                };
                (node_id, result)
            });
        }

        let mut results = Vec::with_capacity(batch.len());
        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => return None,
                next = in_flight.next() => match next {
                    Some(done) => results.push(done),
                    None => return Some(results),
                },
            }
        }
    }

    /// Fold batch results into the record. Returns false once the
    /// execution has reached a terminal status.
    fn merge_batch(
        &self,
        handle: &ExecutionHandle,
        workflow: &WorkflowDag,
        record: &mut WorkflowExecution,
        queue: &mut VecDeque<String>,
        results: Vec<(String, RoleResult)>,
    ) -> bool {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for (node_id, result) in results {
            match result.failure_error() {
                None => {
                    record.quality_scores.extend(result.quality_scores.clone());
                    if !record.is_completed(&node_id) {
                        record.completed_nodes.push(node_id.clone());
                    }
                    debug!(execution_id = %record.id, node_id = %node_id, "Node completed");
                    self.bus.publish(ExecutionEvent::NodeCompleted {
                        execution_id: record.id.clone(),
                        node_id: node_id.clone(),
                        quality_scores: result.quality_scores,
                    });
                    succeeded.push(node_id);
                }
                Some(err) => failed.push((node_id, err)),
            }
        }

        let ctx = record.condition_context();
        for node_id in &succeeded {
            for next in workflow.successors(node_id, &ctx) {
                if !record.is_completed(&next)
                    && !record.is_skipped(&next)
                    && !queue.contains(&next)
                {
                    queue.push_back(next);
                }
            }
        }

        for (node_id, err) in failed {
            warn!(execution_id = %record.id, node_id = %node_id, error = %err, "Node failed");
            self.bus.publish(ExecutionEvent::NodeFailed {
                execution_id: record.id.clone(),
                node_id: node_id.clone(),
                error: err.clone(),
            });
            if !self.handle_failure(handle, workflow, record, queue, &node_id, err) {
                return false;
            }
        }

        // Merge points reset by a backtrack above are no longer completed.
        let merge_candidates: Vec<String> = succeeded
            .into_iter()
            .filter(|n| workflow.is_merge_point(n) && record.is_completed(n))
            .collect();
        if merge_candidates.is_empty() {
            return true;
        }

        let evaluation = gate::evaluate(record, workflow, &merge_candidates);
        for merge in &evaluation.merge_points {
            debug!(
                execution_id = %record.id,
                node_id = %merge.node_id,
                passed = merge.passed,
                "Quality gates evaluated"
            );
            self.bus.publish(ExecutionEvent::QualityGateEvaluated {
                execution_id: record.id.clone(),
                node_id: merge.node_id.clone(),
                passed: merge.passed,
                results: merge.results.clone(),
            });
        }

        match evaluation.first_failure() {
            None => true,
            Some(failure) => {
                let err = failure.to_node_error();
                let node_id = failure.node_id.clone();
                warn!(execution_id = %record.id, node_id = %node_id, error = %err, "Quality gate failed");
                self.handle_failure(handle, workflow, record, queue, &node_id, err)
            }
        }
    }

    /// Offer a failure to backtracking; otherwise skip an optional node or
    /// fail the execution. Returns false if the execution failed.
    fn handle_failure(
        &self,
        handle: &ExecutionHandle,
        workflow: &WorkflowDag,
        record: &mut WorkflowExecution,
        queue: &mut VecDeque<String>,
        node_id: &str,
        err: NodeError,
    ) -> bool {
        if let Some(rule) = backtrack::should_backtrack(record, workflow, &err) {
            handle.notify(ExecutionStatus::Backtracking);
            match backtrack::initiate(record, workflow, node_id, rule, &err, queue) {
                Ok(outcome) => {
                    handle.notify(ExecutionStatus::Running);
                    self.bus.publish(ExecutionEvent::BacktrackInitiated {
                        execution_id: record.id.clone(),
                        event: outcome.event,
                    });
                    self.bus.publish(ExecutionEvent::BacktrackCompleted {
                        execution_id: record.id.clone(),
                        target_node: rule.target_node.clone(),
                        reset_nodes: outcome.reset_nodes,
                    });
                    return true;
                }
                Err(e) => {
                    error!(execution_id = %record.id, error = %e, "Backtrack rejected");
                    handle.notify(record.status);
                }
            }
        }

        let optional = workflow.node(node_id).is_some_and(|n| n.optional);
        if optional && record.status == ExecutionStatus::Running {
            let skipped = workflow.descendants_inclusive(node_id);
            info!(
                execution_id = %record.id,
                node_id,
                skipped = skipped.len(),
                "Optional node failed, skipping it and its dependents"
            );
            if !record.failed_nodes.iter().any(|n| n == node_id) {
                record.failed_nodes.push(node_id.to_string());
            }
            record.completed_nodes.retain(|n| n != node_id);
            for n in skipped {
                if !record.is_skipped(&n) && !record.is_completed(&n) {
                    record.skipped_nodes.push(n);
                }
            }
            queue.retain(|n| !record.is_skipped(n));
            return true;
        }

        if !record.failed_nodes.iter().any(|n| n == node_id) {
            record.failed_nodes.push(node_id.to_string());
        }
        let reason = format!("node {} failed: {}", node_id, err);
        self.fail(handle, record, Some(node_id.to_string()), reason, Some(err));
        false
    }

    fn complete(&self, handle: &ExecutionHandle, record: &mut WorkflowExecution) {
        if record.transition(ExecutionStatus::Completed).is_err() {
            return;
        }
        record.current_node = None;
        handle.notify(ExecutionStatus::Completed);
        info!(
            execution_id = %record.id,
            completed = record.completed_nodes.len(),
            backtracks = record.backtrack_history.len(),
            "Execution completed"
        );
        self.bus.publish(ExecutionEvent::ExecutionCompleted {
            execution_id: record.id.clone(),
            completed_nodes: record.completed_nodes.clone(),
        });
    }

    fn fail(
        &self,
        handle: &ExecutionHandle,
        record: &mut WorkflowExecution,
        failed_node: Option<String>,
        reason: String,
        err: Option<NodeError>,
    ) {
        if record.transition(ExecutionStatus::Failed).is_err() {
            return;
        }
        record.failure_reason = Some(reason.clone());
        handle.notify(ExecutionStatus::Failed);
        error!(execution_id = %record.id, reason = %reason, "Execution failed");
        self.bus.publish(ExecutionEvent::ExecutionFailed {
            execution_id: record.id.clone(),
            failed_node,
            reason,
            error: err,
        });
    }
}

/// One node run: permit, session, executor, teardown.
async fn run_node(
    limiter: Arc<RoleLimiter>,
    sessions: Arc<SessionManager>,
    roles: Arc<RoleRegistry>,
    bus: Arc<EventBus>,
    handle: Arc<ExecutionHandle>,
    node: WorkflowNode,
) -> RoleResult {
    let permit = match limiter.acquire(&node.role_type).await {
        Ok(permit) => permit,
        Err(e) => {
            return RoleResult::failure(NodeError::new(NodeErrorKind::Unclassified, e.to_string()))
        }
    };
    if handle.cancel.is_cancelled() {
        return RoleResult::failure(NodeError::new(NodeErrorKind::Unclassified, "Execution cancelled"));
    }

    let session = sessions.open(&handle.record, &node).await;
    let execution = handle.snapshot().await;
    bus.publish(ExecutionEvent::NodeStarted {
        execution_id: execution.id.clone(),
        node_id: node.id.clone(),
        role_type: node.role_type.clone(),
        session_id: session.id.clone(),
        branch_name: session.branch_name.clone(),
    });
    debug!(execution_id = %execution.id, node_id = %node.id, role = %node.role_type, "Node started");

    let session_id = session.id.clone();
    let node_id = node.id.clone();
    let run = roles.execute(NodeContext {
        execution,
        node,
        session,
        cancel: handle.cancel.child_token(),
    });
    let result = match std::panic::AssertUnwindSafe(run).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(node_id = %node_id, "Role executor panicked");
            RoleResult::failure(NodeError::new(
                NodeErrorKind::Unclassified,
                "Role executor panicked",
            ))
        }
    };

    sessions.close(&session_id).await;
    drop(permit);
    result
}

/// Parallel groups that can never fit in one batch of `max_parallel`.
pub fn oversized_groups(workflow: &WorkflowDag, max_parallel: usize) -> Vec<&[String]> {
    workflow
        .parallel_groups()
        .iter()
        .filter(|group| group.len() > max_parallel)
        .map(Vec::as_slice)
        .collect()
}

/// Maximum scheduling rounds for a workflow:
/// nodes x (1 + total backtrack allowance) + 1.
pub fn round_limit(workflow: &WorkflowDag) -> u64 {
    let nodes = workflow.nodes.len() as u64;
    nodes
        .saturating_mul(1 + workflow.total_backtrack_allowance())
        .saturating_add(1)
}

/// Next batch: ready scheduling units in queue order, bounded by
/// `max_parallel`. A unit is a single node or a whole parallel group.
///
/// A node is ready when all of its dependencies are completed. A group is
/// ready when every member not yet finished is ready and the group fits
/// within `max_parallel`.
pub fn ready_batch(
    workflow: &WorkflowDag,
    execution: &WorkflowExecution,
    queue: &VecDeque<String>,
    max_parallel: usize,
) -> Vec<String> {
    let is_ready = |id: &str| {
        !execution.is_completed(id)
            && !execution.is_skipped(id)
            && workflow
                .node(id)
                .is_some_and(|n| n.dependencies.iter().all(|d| execution.is_completed(d)))
    };

    let mut seen_groups: HashSet<&[String]> = HashSet::new();
    let mut batch: Vec<String> = Vec::new();

    for id in queue {
        let unit: Vec<String> = match workflow.parallel_group_of(id) {
            Some(group) => {
                if !seen_groups.insert(group) {
                    continue;
                }
                let pending: Vec<&String> = group
                    .iter()
                    .filter(|m| !execution.is_completed(m) && !execution.is_skipped(m))
                    .collect();
                if group.len() > max_parallel || !pending.iter().all(|m| is_ready(m.as_str())) {
                    continue;
                }
                pending.into_iter().cloned().collect()
            }
            None if is_ready(id.as_str()) => vec![id.clone()],
            None => continue,
        };

        let unit: Vec<String> = unit.into_iter().filter(|n| !batch.contains(n)).collect();
        if unit.is_empty() {
            continue;
        }
        if batch.is_empty() || batch.len() + unit.len() <= max_parallel {
            batch.extend(unit);
        }
    }

    batch
}
