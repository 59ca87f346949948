//! Graph walker.
//!
//! Nodes are dispatched as soon as their dependencies complete, bounded by
//! a semaphore. A single coordinating loop owns every node status, so a
//! node is claimed exactly once. Failures skip every transitive dependent
//! without touching siblings. A panicking apply task fails its node like
//! any other error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{NodeStatus, ProgressEvent, ProgressHook};
use super::executor::ApplyExecutor;
use crate::address::ResourceAddress;
use crate::error::ApplyError;
use crate::planner::{Action, DependencyGraph, NodeId, NodePhase};
use crate::provider::ProviderRegistry;

/// Soft and hard cancellation of a walk.
///
/// A soft cancel stops dispatching; in-flight nodes finish. A hard cancel
/// also asks providers to stop and abandons operations still running after
/// the grace period.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    hard: CancellationToken,
    soft: CancellationToken,
}

impl CancelSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let hard = CancellationToken::new();
        let soft = hard.child_token();
        Self { hard, soft }
    }

    /// Stops dispatching new nodes.
    pub fn soft_cancel(&self) {
        self.soft.cancel();
    }

    /// Stops dispatching and aborts in-flight operations.
    pub fn hard_cancel(&self) {
        self.hard.cancel();
    }

    /// Returns true once any cancel was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.soft.is_cancelled()
    }

    /// Token fired by hard cancel only.
    #[must_use]
    pub const fn hard_token(&self) -> &CancellationToken {
        &self.hard
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Final state of one node.
#[derive(Debug, Clone)]
pub struct NodeReport {
    /// Node address.
    pub address: ResourceAddress,
    /// Action the node performed. The destroy half of a replacement
    /// reports [`Action::Delete`].
    pub action: Action,
    /// Which half of the change the node performed.
    pub phase: NodePhase,
    /// Final status.
    pub status: NodeStatus,
    /// Time spent running.
    pub duration: Option<Duration>,
}

/// Aggregate result of a walk.
#[derive(Debug, Default)]
pub struct WalkResult {
    /// One report per node, in node order.
    pub nodes: Vec<NodeReport>,
    /// Errors of nodes that ran and failed.
    pub errors: Vec<ApplyError>,
    /// Why each skipped node did not run.
    pub skipped: Vec<ApplyError>,
    /// Whether the walk was cancelled.
    pub cancelled: bool,
}

impl WalkResult {
    /// Returns true if no node errored.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of changes with the given action that reached `status`. A
    /// replacement counts once, by its create half.
    #[must_use]
    pub fn count(&self, action: Action, status: NodeStatus) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.phase == NodePhase::Apply && n.action == action && n.status == status)
            .count()
    }

    /// Number of nodes with the given status.
    #[must_use]
    pub fn count_status(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Addresses whose provider asked for replacement.
    #[must_use]
    pub fn replan_addresses(&self) -> Vec<ResourceAddress> {
        self.errors
            .iter()
            .filter(|e| e.is_replan_signal())
            .map(|e| e.address().clone())
            .collect()
    }
}

/// Walks a dependency graph, applying each change.
pub struct Walker {
    executor: ApplyExecutor,
    registry: ProviderRegistry,
    hook: Arc<dyn ProgressHook>,
    parallelism: usize,
    grace: Duration,
}

type Finished = (NodeId, Duration, Result<(), ApplyError>);

/// Records the node of a task that unwinds.
struct PanicGuard {
    id: NodeId,
    panicked: Arc<Mutex<Vec<NodeId>>>,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking()
            && let Ok(mut ids) = self.panicked.lock()
        {
            ids.push(self.id);
        }
    }
}

struct Run<'g> {
    graph: &'g DependencyGraph,
    hook: Arc<dyn ProgressHook>,
    status: Vec<NodeStatus>,
    waiting_on: Vec<usize>,
    durations: Vec<Option<Duration>>,
    ready: VecDeque<NodeId>,
    result: WalkResult,
}

impl<'g> Run<'g> {
    fn new(graph: &'g DependencyGraph, hook: Arc<dyn ProgressHook>) -> Self {
        let n = graph.len();
        let mut run = Self {
            graph,
            hook,
            status: vec![NodeStatus::Pending; n],
            waiting_on: graph.nodes().iter().map(|node| node.dependencies.len()).collect(),
            durations: vec![None; n],
            ready: VecDeque::new(),
            result: WalkResult::default(),
        };
        for id in 0..n {
            if run.waiting_on[id] == 0 {
                run.make_ready(id);
            }
        }
        run
    }

    fn emit(&self, id: NodeId, duration: Option<Duration>, error: Option<String>) {
        let node = self.graph.node(id);
        self.hook.on_event(&ProgressEvent {
            address: node.change.address.clone(),
            action: node.action(),
            status: self.status[id],
            duration,
            error,
        });
    }

    fn make_ready(&mut self, id: NodeId) {
        self.status[id] = NodeStatus::Ready;
        self.emit(id, None, None);
        self.ready.push_back(id);
    }

    fn complete(&mut self, id: NodeId, duration: Duration) {
        self.status[id] = NodeStatus::Complete;
        self.durations[id] = Some(duration);
        self.emit(id, Some(duration), None);
        let graph = self.graph;
        for &dependent in &graph.node(id).dependents {
            self.waiting_on[dependent] -= 1;
            if self.waiting_on[dependent] == 0 && self.status[dependent] == NodeStatus::Pending {
                self.make_ready(dependent);
            }
        }
    }

    fn fail(&mut self, id: NodeId, duration: Option<Duration>, error: ApplyError) {
        self.status[id] = NodeStatus::Errored;
        self.durations[id] = duration;
        self.emit(id, duration, Some(error.to_string()));
        self.result.errors.push(error);

        let graph = self.graph;
        let failed = &graph.node(id).change.address;
        let mut queue: VecDeque<NodeId> = graph.node(id).dependents.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if self.status[next] != NodeStatus::Pending {
                continue;
            }
            let address = &graph.node(next).change.address;
            let error = ApplyError::DependencyFailed {
                address: address.clone(),
                dependency: failed.clone(),
            };
            self.status[next] = NodeStatus::Skipped;
            self.emit(next, None, Some(error.to_string()));
            // The create half of a failed replacement is already reported
            if address != failed {
                self.result.skipped.push(error);
            }
            queue.extend(graph.node(next).dependents.iter().copied());
        }
    }

    fn finish(&mut self, (id, duration, outcome): Finished) {
        match outcome {
            Ok(()) => self.complete(id, duration),
            Err(e) => self.fail(id, Some(duration), e),
        }
    }

    /// Fails the nodes whose tasks panicked.
    fn panicked(&mut self, panicked: &Mutex<Vec<NodeId>>, message: &str) {
        let ids = std::mem::take(&mut *panicked.lock().unwrap_or_else(PoisonError::into_inner));
        for id in ids {
            if self.status[id] != NodeStatus::Running {
                continue;
            }
            let address = self.graph.node(id).change.address.clone();
            error!(address = %address, "Apply task panicked: {message}");
            self.fail(
                id,
                None,
                ApplyError::Panicked {
                    address,
                    message: message.to_string(),
                },
            );
        }
    }

    fn into_result(mut self, cancelled: bool) -> WalkResult {
        for id in 0..self.graph.len() {
            let address = self.graph.node(id).change.address.clone();
            match self.status[id] {
                NodeStatus::Pending | NodeStatus::Ready => {
                    self.status[id] = NodeStatus::Skipped;
                    self.emit(id, None, Some(String::from("walk cancelled")));
                    self.result.skipped.push(ApplyError::Cancelled { address });
                }
                NodeStatus::Running => {
                    self.status[id] = NodeStatus::Errored;
                    self.emit(id, None, Some(String::from("operation abandoned")));
                    self.result.errors.push(ApplyError::Cancelled { address });
                }
                _ => {}
            }
        }

        self.result.cancelled = cancelled;
        self.result.nodes = self
            .graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(id, node)| NodeReport {
                address: node.change.address.clone(),
                action: node.action(),
                phase: node.phase,
                status: self.status[id],
                duration: self.durations[id],
            })
            .collect();
        self.result
    }
}

impl Walker {
    /// Creates a walker.
    #[must_use]
    pub fn new(executor: ApplyExecutor, registry: ProviderRegistry, hook: Arc<dyn ProgressHook>) -> Self {
        Self {
            executor,
            registry,
            hook,
            parallelism: 10,
            grace: Duration::from_secs(10),
        }
    }

    /// Sets the maximum number of nodes running at once.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets how long in-flight operations get after a hard cancel.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Walks the graph to completion or cancellation.
    pub async fn walk(&self, graph: &DependencyGraph, cancel: &CancelSignal) -> WalkResult {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut run = Run::new(graph, Arc::clone(&self.hook));
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut abort_at: Option<Instant> = None;
        let panicked: Arc<Mutex<Vec<NodeId>>> = Arc::default();

        info!(nodes = graph.len(), parallelism = self.parallelism, "Walking graph");

        loop {
            if !cancel.is_cancelled() {
                while let Some(&id) = run.ready.front() {
                    let node = graph.node(id);
                    if !node.action().is_change() {
                        run.ready.pop_front();
                        run.complete(id, Duration::ZERO);
                        continue;
                    }
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };
                    run.ready.pop_front();
                    run.status[id] = NodeStatus::Running;
                    run.emit(id, None, None);

                    let executor = self.executor.clone();
                    let change = node.change.clone();
                    let phase = node.phase;
                    let guard = PanicGuard {
                        id,
                        panicked: Arc::clone(&panicked),
                    };
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _guard = guard;
                        let start = Instant::now();
                        let outcome = match phase {
                            NodePhase::Apply => executor.apply(&change).await,
                            NodePhase::Destroy => executor.destroy(&change).await,
                        };
                        (id, start.elapsed(), outcome)
                    });
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.hard_token().cancelled(), if abort_at.is_none() => {
                    warn!("Hard cancel: stopping providers, {} operations in flight", tasks.len());
                    self.registry.stop_all();
                    abort_at = Some(Instant::now() + self.grace);
                }
                () = sleep_until(abort_at), if abort_at.is_some() => {
                    warn!("Grace period over, abandoning {} operations", tasks.len());
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Ok(finished) => run.finish(finished),
                            Err(e) if e.is_panic() => run.panicked(&panicked, &e.to_string()),
                            Err(_) => {}
                        }
                    }
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(finished)) => run.finish(finished),
                    Some(Err(e)) if e.is_panic() => run.panicked(&panicked, &e.to_string()),
                    Some(Err(e)) => warn!("Apply task ended abnormally: {e}"),
                    None => {}
                },
            }
        }

        let result = run.into_result(cancel.is_cancelled());
        debug!(
            errors = result.errors.len(),
            skipped = result.skipped.len(),
            cancelled = result.cancelled,
            "Walk finished"
        );
        result
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, ResolvedConfig, resolve};
    use crate::context::EngineContext;
    use crate::planner::Change;
    use crate::provider::{ObjectState, Provider};
    use crate::state::{StateSnapshot, WorkingState};
    use crate::testing::{CollectingHook, FakeProvider};

    fn create(name: &str, deps: &[&str]) -> Change {
        let mut change = Change::no_op(ResourceAddress::new("null_resource", name), "null", ObjectState::default());
        change.action = Action::Create;
        change.before = None;
        change.depends_on = deps.iter().map(|d| ResourceAddress::new("null_resource", *d)).collect();
        change
    }

    fn config_for(names: &[&str]) -> ResolvedConfig {
        let mut yaml = String::from("project:\n  name: demo\nresources:\n");
        for name in names {
            yaml.push_str(&format!("  - type: null_resource\n    name: {name}\n"));
        }
        resolve(&ConfigParser::new().parse_yaml(&yaml, None).unwrap()).unwrap()
    }

    fn walker(fake: Arc<FakeProvider>, names: &[&str], hook: Arc<CollectingHook>, parallelism: usize) -> (Walker, WorkingState) {
        let mut registry = crate::provider::ProviderRegistry::new();
        registry.register("null", fake as Arc<dyn Provider>);
        let ctx = Arc::new(EngineContext::with_registry(registry.clone()));
        let state = WorkingState::new(StateSnapshot::new());
        let cancel = CancelSignal::new();
        let executor = ApplyExecutor::new(ctx, Arc::new(config_for(names)), state.clone(), cancel.hard_token().clone());
        let walker = Walker::new(executor, registry, hook).with_parallelism(parallelism);
        (walker, state)
    }

    #[tokio::test]
    async fn test_parallelism_bound() {
        let fake = Arc::new(FakeProvider::new().with_delay(Duration::from_millis(50)));
        let hook = Arc::new(CollectingHook::default());
        let (walker, _) = walker(fake.clone(), &["a", "b", "c"], hook, 2);
        let graph = DependencyGraph::build(
            vec![create("a", &[]), create("b", &[]), create("c", &[])],
            &Default::default(),
        )
        .unwrap();

        let result = walker.walk(&graph, &CancelSignal::new()).await;
        assert!(result.is_success());
        assert_eq!(result.count(Action::Create, NodeStatus::Complete), 3);
        assert!(fake.max_concurrent() <= 2);
        assert_eq!(fake.calls("create"), 3);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_not_siblings() {
        // b <- a <- c, d unrelated
        let fake = Arc::new(FakeProvider::new().fail("null_resource.a"));
        let hook = Arc::new(CollectingHook::default());
        let (walker, state) = walker(fake.clone(), &["a", "b", "c", "d"], hook.clone(), 4);
        let graph = DependencyGraph::build(
            vec![create("a", &["b"]), create("b", &[]), create("c", &["a"]), create("d", &[])],
            &Default::default(),
        )
        .unwrap();

        let result = walker.walk(&graph, &CancelSignal::new()).await;
        assert!(!result.is_success());
        assert_eq!(result.errors.len(), 1);

        let status = |name: &str| {
            result
                .nodes
                .iter()
                .find(|n| n.address.name() == name)
                .map(|n| n.status)
                .unwrap()
        };
        assert_eq!(status("a"), NodeStatus::Errored);
        assert_eq!(status("b"), NodeStatus::Complete);
        assert_eq!(status("c"), NodeStatus::Skipped);
        assert_eq!(status("d"), NodeStatus::Complete);
        assert_eq!(fake.calls_for("null_resource.c"), 0);
        assert!(matches!(
            &result.skipped[0],
            ApplyError::DependencyFailed { dependency, .. } if dependency.name() == "a"
        ));
        assert!(state.get(&ResourceAddress::new("null_resource", "c")).await.is_none());
        assert!(hook.statuses("null_resource.c").contains(&NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_panicking_task_fails_its_node() {
        let fake = Arc::new(FakeProvider::new().panic_on("null_resource.a"));
        let hook = Arc::new(CollectingHook::default());
        let (walker, _) = walker(fake.clone(), &["a", "b", "c"], hook.clone(), 2);
        let graph = DependencyGraph::build(
            vec![create("a", &[]), create("b", &["a"]), create("c", &[])],
            &Default::default(),
        )
        .unwrap();

        let result = walker.walk(&graph, &CancelSignal::new()).await;
        assert!(!result.cancelled);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            &result.errors[0],
            ApplyError::Panicked { address, .. } if address.name() == "a"
        ));
        assert!(matches!(
            &result.skipped[..],
            [ApplyError::DependencyFailed { address, dependency }] if address.name() == "b" && dependency.name() == "a"
        ));
        assert_eq!(result.count(Action::Create, NodeStatus::Errored), 1);
        assert_eq!(result.count(Action::Create, NodeStatus::Skipped), 1);
        assert_eq!(result.count(Action::Create, NodeStatus::Complete), 1);
        assert!(hook.statuses("null_resource.a").contains(&NodeStatus::Errored));
    }

    #[tokio::test]
    async fn test_replacement_runs_as_destroy_then_create() {
        let fake = Arc::new(FakeProvider::new());
        let hook = Arc::new(CollectingHook::default());
        let (walker, _) = walker(fake.clone(), &["a"], hook.clone(), 2);
        let mut replace = create("a", &[]);
        replace.action = Action::Replace;
        let graph = DependencyGraph::build(vec![replace], &Default::default()).unwrap();

        let result = walker.walk(&graph, &CancelSignal::new()).await;
        assert!(result.is_success());
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.count(Action::Replace, NodeStatus::Complete), 1);
        assert_eq!(result.count(Action::Delete, NodeStatus::Complete), 0);
        assert_eq!(fake.calls("create"), 1);

        let actions: Vec<Action> = hook
            .events()
            .into_iter()
            .filter(|e| e.status == NodeStatus::Complete)
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![Action::Delete, Action::Replace]);
    }

    #[tokio::test]
    async fn test_dependents_see_applied_values() {
        let fake = Arc::new(FakeProvider::new());
        let hook = Arc::new(CollectingHook::default());
        let yaml = "project:\n  name: demo\nresources:\n  - type: null_resource\n    name: a\n  - type: null_resource\n    name: b\n    attributes:\n      name: \"copy-${null_resource.a.id}\"\n";
        let config = resolve(&ConfigParser::new().parse_yaml(yaml, None).unwrap()).unwrap();
        let mut registry = crate::provider::ProviderRegistry::new();
        registry.register("null", fake as Arc<dyn Provider>);
        let ctx = Arc::new(EngineContext::with_registry(registry.clone()));
        let state = WorkingState::new(StateSnapshot::new());
        let executor = ApplyExecutor::new(ctx, Arc::new(config), state.clone(), CancellationToken::new());
        let walker = Walker::new(executor, registry, hook);

        let graph = DependencyGraph::build(vec![create("a", &[]), create("b", &["a"])], &Default::default()).unwrap();
        assert!(walker.walk(&graph, &CancelSignal::new()).await.is_success());

        let a = state.get(&ResourceAddress::new("null_resource", "a")).await.unwrap();
        let b = state.get(&ResourceAddress::new("null_resource", "b")).await.unwrap();
        let id = a.attributes.get("id").and_then(|v| v.as_str()).unwrap().to_string();
        assert_eq!(b.attributes.get("name").and_then(|v| v.as_str()), Some(format!("copy-{id}").as_str()));
        assert_eq!(b.dependencies, vec![ResourceAddress::new("null_resource", "a")]);
    }

    #[tokio::test]
    async fn test_no_op_nodes_complete_without_calls() {
        let fake = Arc::new(FakeProvider::new());
        let hook = Arc::new(CollectingHook::default());
        let (walker, _) = walker(fake.clone(), &["a"], hook.clone(), 1);
        let noop = Change::no_op(ResourceAddress::new("null_resource", "a"), "null", ObjectState::default());
        let graph = DependencyGraph::build(vec![noop], &Default::default()).unwrap();

        let result = walker.walk(&graph, &CancelSignal::new()).await;
        assert_eq!(result.count_status(NodeStatus::Complete), 1);
        assert_eq!(fake.total_calls(), 0);
        assert!(!hook.statuses("null_resource.a").contains(&NodeStatus::Running));
    }

    #[tokio::test]
    async fn test_soft_cancel_stops_dispatch() {
        let fake = Arc::new(FakeProvider::new());
        let hook = Arc::new(CollectingHook::default());
        let (walker, _) = walker(fake.clone(), &["a", "b"], hook, 1);
        let graph = DependencyGraph::build(vec![create("a", &[]), create("b", &["a"])], &Default::default()).unwrap();

        let cancel = CancelSignal::new();
        cancel.soft_cancel();
        let result = walker.walk(&graph, &cancel).await;
        assert!(result.cancelled);
        assert_eq!(result.count_status(NodeStatus::Skipped), 2);
        assert_eq!(fake.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_hard_cancel_stops_providers_and_abandons() {
        let fake = Arc::new(FakeProvider::new().with_delay(Duration::from_secs(30)));
        let hook = Arc::new(CollectingHook::default());
        let (walker, _) = walker(fake.clone(), &["a"], hook, 1);
        let walker = walker.with_grace(Duration::from_millis(20));
        let graph = DependencyGraph::build(vec![create("a", &[])], &Default::default()).unwrap();

        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.hard_cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), walker.walk(&graph, &cancel))
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(fake.was_stopped());
        assert_eq!(result.count_status(NodeStatus::Errored), 1);
    }
}
