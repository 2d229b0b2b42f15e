use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use strata_core::traits::{NodeContext, RoleExecutor};
use strata_core::types::{NodeError, NodeErrorKind, RoleResult};

/// Tracks how many runs overlap. Clone it into several executors to
/// measure concurrency across roles.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    active: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping runs observed.
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Scriptable role executor.
///
/// Each node id has a queue of results; once a node's queue is empty the
/// default result (success unless changed) is returned. Runs can be
/// delayed, or held until [`MockRoleExecutor::release`] is called.
pub struct MockRoleExecutor {
    role: String,
    scripts: Mutex<HashMap<String, VecDeque<RoleResult>>>,
    default_result: RoleResult,
    delay: Duration,
    gate: watch::Sender<bool>,
    calls: Mutex<Vec<String>>,
    contexts: Mutex<Vec<NodeContext>>,
    probe: ConcurrencyProbe,
    own: ConcurrencyProbe,
}

impl MockRoleExecutor {
    pub fn new(role: &str) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            role: role.to_string(),
            scripts: Mutex::new(HashMap::new()),
            default_result: RoleResult::success(),
            delay: Duration::ZERO,
            gate,
            calls: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            probe: ConcurrencyProbe::new(),
            own: ConcurrencyProbe::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_default(mut self, result: RoleResult) -> Self {
        self.default_result = result;
        self
    }

    /// Share a probe with other executors.
    pub fn with_probe(mut self, probe: ConcurrencyProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Queue results for one node, consumed one per run.
    pub fn with_script(self, node_id: &str, results: impl IntoIterator<Item = RoleResult>) -> Self {
        self.script(node_id, results);
        self
    }

    pub fn script(&self, node_id: &str, results: impl IntoIterator<Item = RoleResult>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(node_id.to_string())
            .or_default()
            .extend(results);
    }

    /// Hold every run until `release` is called.
    pub fn blocked(self) -> Self {
        self.gate.send_replace(false);
        self
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Node ids in the order their runs started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == node_id).count()
    }

    /// Contexts received, in call order.
    pub fn contexts(&self) -> Vec<NodeContext> {
        self.contexts.lock().unwrap().clone()
    }

    /// Runs of this executor currently in progress.
    pub fn active(&self) -> usize {
        self.own.active()
    }

    /// Highest number of this executor's runs that overlapped.
    pub fn max_concurrency(&self) -> usize {
        self.own.max()
    }

    fn next_result(&self, node_id: &str) -> RoleResult {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(node_id)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| self.default_result.clone())
    }
}

impl RoleExecutor for MockRoleExecutor {
    fn role_type(&self) -> &str {
        &self.role
    }

    fn run(&self, ctx: NodeContext) -> BoxFuture<'_, RoleResult> {
        Box::pin(async move {
            let node_id = ctx.node.id.clone();
            self.calls.lock().unwrap().push(node_id.clone());
            self.contexts.lock().unwrap().push(ctx.clone());
            self.own.enter();
            self.probe.enter();

            let work = async {
                let mut gate = self.gate.subscribe();
                let _ = gate.wait_for(|open| *open).await;
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
            };

            let cancelled = tokio::select! {
                _ = ctx.cancel.cancelled() => true,
                _ = work => false,
            };

            self.probe.exit();
            self.own.exit();

            if cancelled {
                RoleResult::failure(NodeError::new(NodeErrorKind::Unclassified, "Cancelled"))
            } else {
                self.next_result(&node_id)
            }
        })
    }
}
