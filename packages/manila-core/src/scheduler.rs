//! Executes the layered sequence an [`ExecutionGraph`] produces, with
//! maximum intra-layer parallelism (`spec.md` §5.F).
//!
//! Layers are awaited level-by-level — the same `tokio::spawn` one batch,
//! `join` the batch, move to the next batch shape as `ciroque-the-dagwood`'s
//! level-by-level executor, generalized here with a layer-scoped `RwLock` so
//! a `blocking` node can exclude its layer-mates instead of merely limiting
//! concurrency with a semaphore. Blocking nodes within a layer are run one
//! after another by a single task, in the order their [`ExecutionNode`]s
//! were minted, rather than raced against each other for the write half of
//! that lock: `graph.rs`'s layering sorts a layer by the random
//! `executable_id` for determinism, which is not declaration order, and
//! racing write-lock acquisitions would leave that order to the runtime's
//! task scheduling rather than to the graph.

use std::{collections::HashMap, sync::Arc};

use jiff::Timestamp;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    collab::BoxFuture,
    error::EngineError,
    graph::ExecutionGraph,
    value::{BuildExitCode, ExecutableId, ExecutionNode},
};

/// Runs a single node to completion. Implemented by the engine glue that
/// knows how to dispatch a `Job`'s actions and an artifact build through the
/// Artifact Manager; the scheduler itself is agnostic to what a node does.
pub trait NodeExecutor: Send + Sync {
    fn execute<'a>(&'a self, node: &'a ExecutionNode) -> BoxFuture<'a, Result<BuildExitCode, EngineError>>;
}

/// Either half of a layer-scoped lock: `blocking` nodes hold the write half
/// (excluding every other node in the layer), non-blocking nodes hold the
/// read half (running concurrently with each other).
enum LayerGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

struct NodeOutcome {
    id: ExecutableId,
    identifier: String,
    started_at: Timestamp,
    result: Result<BuildExitCode, EngineError>,
}

/// Run a single node: acquire its half of `layer_lock`, then dispatch to
/// `executor` unless cancellation was observed first.
async fn run_node(
    node: ExecutionNode,
    blocking: bool,
    layer_lock: Arc<RwLock<()>>,
    executor: Arc<dyn NodeExecutor>,
    cancel: CancellationToken,
) -> NodeOutcome {
    let id = node.executable_id;
    let identifier = node.identifier();

    if cancel.is_cancelled() {
        return NodeOutcome { id, identifier, started_at: Timestamp::now(), result: Err(EngineError::Cancelled) };
    }

    let _guard = if blocking {
        LayerGuard::Write(layer_lock.write_owned().await)
    } else {
        LayerGuard::Read(layer_lock.read_owned().await)
    };

    let started_at = Timestamp::now();
    let result = if cancel.is_cancelled() { Err(EngineError::Cancelled) } else { executor.execute(&node).await };

    NodeOutcome { id, identifier, started_at, result }
}

/// Executes the layers of an [`ExecutionGraph`] for a given target.
#[derive(Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Run every layer of `target`'s ancestor subgraph in order, honoring
    /// `blocking` within each layer and cooperative cancellation via
    /// `cancel`.
    ///
    /// Non-blocking nodes in a layer each run in their own task, concurrent
    /// with one another. Blocking nodes in the same layer run one after
    /// another, in the order their nodes were minted (`spec.md` §4.F's
    /// "multiple blocking nodes in a layer execute in declaration order"),
    /// inside a single task that holds the layer's write lock for the
    /// duration of each one's run — excluding every non-blocking node from
    /// starting or proceeding until it finishes, and excluding every other
    /// blocking node until its turn.
    ///
    /// On success, returns the target node's own `BuildExitCode`. If any
    /// node in a layer fails, every node already in flight in that layer is
    /// still drained before returning; the layer after it never starts. The
    /// returned error is `EngineError::BuildFailed`, carrying the failure
    /// with the lowest execution-start timestamp (ties broken by node
    /// identifier).
    pub async fn execute(
        &self,
        graph: &ExecutionGraph,
        target: ExecutableId,
        executor: Arc<dyn NodeExecutor>,
        cancel: CancellationToken,
    ) -> Result<BuildExitCode, EngineError> {
        let layers = graph.layers(target)?;
        let mut statuses: HashMap<ExecutableId, BuildExitCode> = HashMap::new();

        for layer in &layers {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let layer_lock = Arc::new(RwLock::new(()));
            let mut blocking_nodes: Vec<ExecutionNode> = layer
                .iter()
                .map(|&id| graph.node(id).expect("node in a computed layer exists in the graph").clone())
                .filter(|node| node.executable.blocking())
                .collect();
            blocking_nodes.sort_by_key(|node| node.sequence);
            let blocking_ids: std::collections::HashSet<ExecutableId> =
                blocking_nodes.iter().map(|node| node.executable_id).collect();

            let mut handles: Vec<tokio::task::JoinHandle<Vec<NodeOutcome>>> = Vec::with_capacity(layer.len());

            for &id in layer.iter().filter(|id| !blocking_ids.contains(id)) {
                let node = graph.node(id).expect("node in a computed layer exists in the graph").clone();
                let identifier = node.identifier();
                let layer_lock = layer_lock.clone();
                let executor = executor.clone();
                let cancel = cancel.clone();

                let span = tracing::info_span!("execute_node", executable_id = %id, identifier = %identifier);
                handles.push(tokio::spawn(
                    async move { vec![run_node(node, false, layer_lock, executor, cancel).await] }.instrument(span),
                ));
            }

            if !blocking_nodes.is_empty() {
                let layer_lock = layer_lock.clone();
                let executor = executor.clone();
                let cancel = cancel.clone();
                let span = tracing::info_span!("execute_blocking_chain", count = blocking_nodes.len());

                handles.push(tokio::spawn(
                    async move {
                        let mut outcomes = Vec::with_capacity(blocking_nodes.len());
                        for node in blocking_nodes {
                            let id = node.executable_id;
                            let identifier = node.identifier();
                            let node_span = tracing::info_span!("execute_node", executable_id = %id, identifier = %identifier);
                            outcomes.push(
                                run_node(node, true, layer_lock.clone(), executor.clone(), cancel.clone())
                                    .instrument(node_span)
                                    .await,
                            );
                        }
                        outcomes
                    }
                    .instrument(span),
                ));
            }

            let mut outcomes = Vec::new();
            for handle in handles {
                outcomes.extend(handle.await.expect("node task does not panic"));
            }

            let mut failures: Vec<&NodeOutcome> = outcomes.iter().filter(|o| o.result.is_err()).collect();
            if !failures.is_empty() {
                failures.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.identifier.cmp(&b.identifier)));
                let first = &failures[0];
                let reason = match first.result.as_ref().unwrap_err() {
                    EngineError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                return Err(EngineError::BuildFailed { node: Some(first.id), reason });
            }

            for outcome in outcomes {
                if let Ok(status) = outcome.result {
                    statuses.insert(outcome.id, status);
                }
            }
        }

        Ok(statuses.remove(&target).unwrap_or(BuildExitCode::Success))
    }
}
