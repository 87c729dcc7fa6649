// Copyright 2025 capdispatch Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::DispatcherConfig;
use crate::error::{BoxError, DispatchError, Result};
use crate::events::{DispatchEvent, EventSink};
use crate::node::{Node, NodeId, SlotGuard, DEFAULT_HIGH_LOAD_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// Caller-supplied correlation id for one routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Load of one node at the time it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub id: NodeId,
    pub active: usize,
    pub capacity: usize,
}

/// Point-in-time reading of every node's load, in dispatcher order.
///
/// Each entry is read independently, so the snapshot as a whole is not a
/// consistent view. It backs exactly one routing decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub nodes: Vec<NodeLoad>,
}

impl LoadSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_load(&self) -> usize {
        self.nodes.iter().map(|n| n.active).sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.nodes.iter().map(|n| n.capacity).sum()
    }
}

/// Index of the least-loaded entry in `snapshot`.
///
/// Ties go to the entry that comes first, i.e. the node added to the
/// dispatcher earliest. Returns `None` for an empty snapshot.
pub fn least_loaded(snapshot: &LoadSnapshot) -> Option<usize> {
    snapshot
        .nodes
        .iter()
        .enumerate()
        .min_by_key(|(_, load)| load.active)
        .map(|(index, _)| index)
}

/// What happened to a routed request, without the completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Admitted(NodeId),
    Rejected(NodeId),
    NoNodesAvailable,
    NoRuntime,
}

/// Result of [`Dispatcher::route`].
///
/// Rejection and an empty node set are ordinary values, not errors.
pub enum RouteResult<T> {
    /// The request holds a slot on a node and its work is running.
    Admitted(Admission<T>),
    /// The chosen node was full at acquire time. Nothing was changed.
    Rejected(NodeId),
    /// The dispatcher has no nodes. Nothing was attempted.
    NoNodesAvailable,
    /// Called outside a Tokio runtime, so the work could not be spawned.
    /// No slot was taken and no event was emitted.
    NoRuntime,
}

impl<T> RouteResult<T> {
    pub fn outcome(&self) -> RouteOutcome {
        match self {
            RouteResult::Admitted(admission) => RouteOutcome::Admitted(admission.node_id().clone()),
            RouteResult::Rejected(node_id) => RouteOutcome::Rejected(node_id.clone()),
            RouteResult::NoNodesAvailable => RouteOutcome::NoNodesAvailable,
            RouteResult::NoRuntime => RouteOutcome::NoRuntime,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, RouteResult::Admitted(_))
    }

    /// Node chosen for the request, whether or not it admitted it.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            RouteResult::Admitted(admission) => Some(admission.node_id()),
            RouteResult::Rejected(node_id) => Some(node_id),
            RouteResult::NoNodesAvailable | RouteResult::NoRuntime => None,
        }
    }

    pub fn into_admission(self) -> Option<Admission<T>> {
        match self {
            RouteResult::Admitted(admission) => Some(admission),
            _ => None,
        }
    }
}

impl<T> fmt::Debug for RouteResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteResult::Admitted(admission) => f.debug_tuple("Admitted").field(admission).finish(),
            RouteResult::Rejected(node_id) => f.debug_tuple("Rejected").field(node_id).finish(),
            RouteResult::NoNodesAvailable => f.write_str("NoNodesAvailable"),
            RouteResult::NoRuntime => f.write_str("NoRuntime"),
        }
    }
}

/// Handle to work running under an admitted slot.
///
/// Dropping the handle detaches the work; it keeps running and still
/// releases its slot when it ends.
pub struct Admission<T> {
    request_id: RequestId,
    node_id: NodeId,
    handle: JoinHandle<Result<T>>,
}

impl<T> Admission<T> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the work. Its slot is released when the task is torn down.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Waits for the work to end.
    ///
    /// By the time this returns the slot has been released.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::WorkFailed`] if the work returned an error
    /// - [`DispatchError::WorkTimedOut`] if it exceeded the dispatcher's work timeout
    /// - [`DispatchError::WorkPanicked`] if it panicked
    /// - [`DispatchError::WorkCancelled`] if it was aborted
    pub async fn wait(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(DispatchError::WorkPanicked {
                node_id: self.node_id,
            }),
            Err(_) => Err(DispatchError::WorkCancelled {
                node_id: self.node_id,
            }),
        }
    }
}

impl<T> fmt::Debug for Admission<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("request_id", &self.request_id)
            .field("node_id", &self.node_id)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

type Sinks = Arc<Vec<Arc<dyn EventSink>>>;

fn emit(sinks: &Sinks, event: DispatchEvent) {
    for sink in sinks.iter() {
        sink.emit(&event);
    }
}

/// One admitted request while its work runs.
///
/// Dropped exactly once when the task ends, however it ends. The slot is
/// released first, then `Completed` is emitted.
struct InFlight {
    slot: Option<SlotGuard>,
    request_id: RequestId,
    started: Instant,
    succeeded: bool,
    sinks: Sinks,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let node_id = slot.node_id().clone();
        drop(slot);

        emit(
            &self.sinks,
            DispatchEvent::Completed {
                request_id: self.request_id,
                node_id,
                elapsed: self.started.elapsed(),
                success: self.succeeded,
            },
        );
    }
}

/// Routes requests to the least-loaded node with free capacity.
///
/// The dispatcher owns no mutable state of its own. The node list is fixed at
/// construction and each node guards its own counter, so concurrent `route`
/// calls never contend on a shared lock. Two calls may read the same snapshot
/// and pick the same node; the node's compare-and-increment then admits one
/// and the other is rejected.
///
/// # Example
///
/// ```no_run
/// use capdispatch_core::{Dispatcher, Node, RouteResult};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher = Dispatcher::new(vec![
///     Arc::new(Node::new("node-a", 2)?),
///     Arc::new(Node::new("node-b", 2)?),
/// ]);
///
/// match dispatcher.route(1, || async { Ok::<_, std::io::Error>(42) }) {
///     RouteResult::Admitted(admission) => println!("done: {}", admission.wait().await?),
///     RouteResult::Rejected(node) => println!("{} is full", node),
///     RouteResult::NoNodesAvailable => println!("no nodes"),
///     RouteResult::NoRuntime => println!("not inside a Tokio runtime"),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    nodes: Vec<Arc<Node>>,
    sinks: Sinks,
    high_load_threshold: f64,
    work_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Creates a dispatcher over `nodes`.
    ///
    /// Order matters: it is the tie-break order for equally loaded nodes.
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self {
            nodes,
            sinks: Arc::new(Vec::new()),
            high_load_threshold: DEFAULT_HIGH_LOAD_THRESHOLD,
            work_timeout: None,
        }
    }

    /// Validates `config` and builds a dispatcher from it.
    pub fn from_config(config: &DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let nodes = config
            .nodes
            .iter()
            .map(|n| Node::new(n.id.clone(), n.capacity).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let mut dispatcher =
            Self::new(nodes).with_high_load_threshold(config.high_load_threshold);
        if let Some(timeout) = config.work_timeout() {
            dispatcher = dispatcher.with_work_timeout(timeout);
        }

        info!(
            nodes = dispatcher.node_count(),
            total_capacity = dispatcher.total_capacity(),
            "Dispatcher initialized"
        );
        Ok(dispatcher)
    }

    /// Adds a sink that receives every [`DispatchEvent`].
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        Arc::make_mut(&mut self.sinks).push(sink);
        self
    }

    /// Sets the load fraction above which `HighLoad` is emitted.
    ///
    /// Values outside `(0, 1]`, NaN included, are ignored with a warning and
    /// the previous threshold is kept.
    pub fn with_high_load_threshold(mut self, threshold: f64) -> Self {
        if threshold > 0.0 && threshold <= 1.0 {
            self.high_load_threshold = threshold;
        } else {
            warn!(
                threshold,
                kept = self.high_load_threshold,
                "Ignoring high load threshold outside (0, 1]"
            );
        }
        self
    }

    /// Cancels admitted work that runs longer than `timeout`.
    pub fn with_work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout = Some(timeout);
        self
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_capacity(&self) -> usize {
        self.nodes.iter().map(|n| n.capacity()).sum()
    }

    pub fn total_load(&self) -> usize {
        self.nodes.iter().map(|n| n.current_load()).sum()
    }

    pub fn high_load_threshold(&self) -> f64 {
        self.high_load_threshold
    }

    pub fn work_timeout(&self) -> Option<Duration> {
        self.work_timeout
    }

    /// Reads the current load of every node.
    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|node| NodeLoad {
                    id: node.id().clone(),
                    active: node.current_load(),
                    capacity: node.capacity(),
                })
                .collect(),
        }
    }

    /// Routes one request.
    ///
    /// Takes a fresh snapshot, picks the least-loaded node (first one wins a
    /// tie) and tries to admit the request there. On admission `work` is
    /// spawned on the current Tokio runtime holding the slot, and the slot is
    /// released when the work ends, fails, panics, times out or is aborted.
    /// A full node rejects the request; no other node is tried.
    ///
    /// Outside a Tokio runtime the result is [`RouteResult::NoRuntime`] and
    /// no node is touched.
    pub fn route<F, Fut, T, E>(&self, request_id: impl Into<RequestId>, work: F) -> RouteResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let request_id = request_id.into();
        let snapshot = self.snapshot();

        let Some(index) = least_loaded(&snapshot) else {
            emit(&self.sinks, DispatchEvent::NoNodesAvailable { request_id });
            return RouteResult::NoNodesAvailable;
        };

        // The snapshot was built from `self.nodes`, so its indices line up.
        let node = &self.nodes[index];
        self.admit(request_id, node.id(), Some(node), work)
    }

    /// Routes one request using a snapshot taken earlier.
    ///
    /// The selection step runs on `snapshot`; admission still runs against
    /// the live node, so a stale snapshot can only cause a rejection, never
    /// an over-admission. The chosen entry is matched to a node by id. A
    /// snapshot naming a node this dispatcher does not have rejects the
    /// request without touching any node.
    ///
    /// Outside a Tokio runtime the result is [`RouteResult::NoRuntime`].
    pub fn route_with_snapshot<F, Fut, T, E>(
        &self,
        request_id: impl Into<RequestId>,
        snapshot: &LoadSnapshot,
        work: F,
    ) -> RouteResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let request_id = request_id.into();

        let Some(index) = least_loaded(snapshot) else {
            emit(&self.sinks, DispatchEvent::NoNodesAvailable { request_id });
            return RouteResult::NoNodesAvailable;
        };

        let chosen = &snapshot.nodes[index].id;
        self.admit(request_id, chosen, self.node(chosen), work)
    }

    /// Tries to take a slot on `node` and spawn `work` under it.
    fn admit<F, Fut, T, E>(
        &self,
        request_id: RequestId,
        chosen: &NodeId,
        node: Option<&Arc<Node>>,
        work: F,
    ) -> RouteResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!(request_id = %request_id, "route called outside a Tokio runtime");
            return RouteResult::NoRuntime;
        };

        let Some(slot) = node.and_then(|node| node.try_acquire_slot()) else {
            emit(
                &self.sinks,
                DispatchEvent::Rejected {
                    request_id,
                    node_id: chosen.clone(),
                },
            );
            return RouteResult::Rejected(chosen.clone());
        };

        let node = Arc::clone(slot.node());
        let node_id = node.id().clone();
        let load = node.current_load();
        let capacity = node.capacity();

        emit(
            &self.sinks,
            DispatchEvent::Admitted {
                request_id,
                node_id: node_id.clone(),
                load,
                capacity,
            },
        );

        let fraction = load as f64 / capacity as f64;
        if fraction > self.high_load_threshold {
            emit(
                &self.sinks,
                DispatchEvent::HighLoad {
                    node_id: node_id.clone(),
                    fraction,
                },
            );
        }

        let in_flight = InFlight {
            slot: Some(slot),
            request_id,
            started: Instant::now(),
            succeeded: false,
            sinks: Arc::clone(&self.sinks),
        };
        let handle = runtime.spawn(run_admitted(
            in_flight,
            node_id.clone(),
            work,
            self.work_timeout,
        ));

        RouteResult::Admitted(Admission {
            request_id,
            node_id,
            handle,
        })
    }
}

async fn run_admitted<F, Fut, T, E>(
    mut in_flight: InFlight,
    node_id: NodeId,
    work: F,
    timeout: Option<Duration>,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work()).await {
            Ok(result) => result.map_err(|e| DispatchError::WorkFailed {
                node_id,
                source: e.into(),
            }),
            Err(_) => Err(DispatchError::WorkTimedOut {
                node_id,
                timeout_ms: limit.as_millis() as u64,
            }),
        },
        None => work().await.map_err(|e| DispatchError::WorkFailed {
            node_id,
            source: e.into(),
        }),
    };

    in_flight.succeeded = result.is_ok();
    result
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("nodes", &self.nodes)
            .field("sinks", &self.sinks.len())
            .field("high_load_threshold", &self.high_load_threshold)
            .field("work_timeout", &self.work_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use std::io;
    use tokio::sync::oneshot;

    fn dispatcher(capacities: &[usize]) -> Dispatcher {
        let nodes = capacities
            .iter()
            .enumerate()
            .map(|(i, &cap)| Arc::new(Node::new(format!("node{}", i), cap).unwrap()))
            .collect();
        Dispatcher::new(nodes)
    }

    fn snapshot(loads: &[(&str, usize, usize)]) -> LoadSnapshot {
        LoadSnapshot {
            nodes: loads
                .iter()
                .map(|&(id, active, capacity)| NodeLoad {
                    id: NodeId::from(id),
                    active,
                    capacity,
                })
                .collect(),
        }
    }

    /// Work that blocks until the returned sender fires.
    fn gated() -> (
        oneshot::Sender<()>,
        impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = io::Result<()>> + Send>> + Send + 'static,
    ) {
        let (tx, rx) = oneshot::channel::<()>();
        let work = move || -> std::pin::Pin<Box<dyn Future<Output = io::Result<()>> + Send>> {
            Box::pin(async move {
                let _ = rx.await;
                Ok(())
            })
        };
        (tx, work)
    }

    #[test]
    fn test_least_loaded_picks_minimum() {
        let snap = snapshot(&[("a", 3, 4), ("b", 1, 4), ("c", 2, 4)]);
        assert_eq!(least_loaded(&snap), Some(1));
    }

    #[test]
    fn test_least_loaded_tie_breaks_to_first() {
        let snap = snapshot(&[("a", 2, 4), ("b", 1, 4), ("c", 1, 4)]);
        for _ in 0..100 {
            assert_eq!(least_loaded(&snap), Some(1));
        }
    }

    #[test]
    fn test_least_loaded_empty() {
        assert_eq!(least_loaded(&LoadSnapshot::default()), None);
    }

    #[test]
    fn test_least_loaded_uses_count_not_fraction() {
        // 1/1 is fuller than 2/10, but 1 < 2 active
        let snap = snapshot(&[("small", 1, 1), ("big", 2, 10)]);
        assert_eq!(least_loaded(&snap), Some(0));
    }

    #[test]
    fn test_snapshot_totals() {
        let snap = snapshot(&[("a", 1, 2), ("b", 2, 3)]);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.total_load(), 3);
        assert_eq!(snap.total_capacity(), 5);
    }

    #[tokio::test]
    async fn test_empty_dispatcher_returns_no_nodes() {
        let sink = Arc::new(RecordingSink::default());
        let d = Dispatcher::new(vec![]).with_event_sink(sink.clone());

        for id in 0..3 {
            let result = d.route(id, || async { Ok::<_, io::Error>(()) });
            assert_eq!(result.outcome(), RouteOutcome::NoNodesAvailable);
            assert!(result.node_id().is_none());
        }

        assert_eq!(sink.events().len(), 3);
        assert!(sink
            .events()
            .iter()
            .all(|e| matches!(e, DispatchEvent::NoNodesAvailable { .. })));
    }

    #[tokio::test]
    async fn test_route_returns_work_value() {
        let d = dispatcher(&[1]);
        let admission = d
            .route(7, || async { Ok::<_, io::Error>(21 * 2) })
            .into_admission()
            .unwrap();
        assert_eq!(admission.request_id(), RequestId(7));
        assert_eq!(admission.node_id().as_str(), "node0");
        assert_eq!(admission.wait().await.unwrap(), 42);
        assert_eq!(d.total_load(), 0);
    }

    #[tokio::test]
    async fn test_route_picks_least_loaded_node() {
        let d = dispatcher(&[4, 4, 4]);
        assert!(d.nodes()[0].try_acquire());
        assert!(d.nodes()[0].try_acquire());
        assert!(d.nodes()[1].try_acquire());

        let (tx, work) = gated();
        let result = d.route(1, work);
        assert_eq!(result.outcome(), RouteOutcome::Admitted(NodeId::from("node2")));
        assert_eq!(d.nodes()[2].current_load(), 1);

        tx.send(()).unwrap();
        result.into_admission().unwrap().wait().await.unwrap();
        assert_eq!(d.nodes()[2].current_load(), 0);
    }

    #[tokio::test]
    async fn test_equal_loads_route_to_first_node() {
        let d = dispatcher(&[2, 2]);
        let snap = d.snapshot();

        let (tx, work) = gated();
        let result = d.route_with_snapshot(1, &snap, work);
        assert_eq!(result.outcome(), RouteOutcome::Admitted(NodeId::from("node0")));
        tx.send(()).unwrap();
        result.into_admission().unwrap().wait().await.unwrap();

        // same snapshot, same choice
        let (tx, work) = gated();
        let result = d.route_with_snapshot(2, &snap, work);
        assert_eq!(result.outcome(), RouteOutcome::Admitted(NodeId::from("node0")));
        tx.send(()).unwrap();
        result.into_admission().unwrap().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_changes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(&[1, 1]).with_event_sink(sink.clone());
        assert!(d.nodes()[0].try_acquire());
        assert!(d.nodes()[1].try_acquire());
        let before = d.snapshot();

        let result = d.route(9, || async { Ok::<_, io::Error>(()) });
        assert_eq!(result.outcome(), RouteOutcome::Rejected(NodeId::from("node0")));
        assert_eq!(d.snapshot(), before);
        assert_eq!(
            sink.events(),
            vec![DispatchEvent::Rejected {
                request_id: RequestId(9),
                node_id: NodeId::from("node0"),
            }]
        );
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rejected_not_overadmitted() {
        let d = dispatcher(&[1]);
        let stale = d.snapshot();

        let (tx, work) = gated();
        let first = d.route_with_snapshot(1, &stale, work);
        assert!(first.is_admitted());

        let second = d.route_with_snapshot(2, &stale, || async { Ok::<_, io::Error>(()) });
        assert_eq!(second.outcome(), RouteOutcome::Rejected(NodeId::from("node0")));
        assert_eq!(d.nodes()[0].current_load(), 1);

        tx.send(()).unwrap();
        first.into_admission().unwrap().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_node_in_snapshot_is_rejected() {
        let d = dispatcher(&[1]);
        let foreign = snapshot(&[("elsewhere", 0, 1)]);
        let result = d.route_with_snapshot(1, &foreign, || async { Ok::<_, io::Error>(()) });
        assert_eq!(result.outcome(), RouteOutcome::Rejected(NodeId::from("elsewhere")));
        assert_eq!(d.total_load(), 0);
    }

    #[tokio::test]
    async fn test_work_failure_releases_slot() {
        let d = dispatcher(&[1]);
        let admission = d
            .route(1, || async {
                Err::<(), _>(io::Error::new(io::ErrorKind::Other, "boom"))
            })
            .into_admission()
            .unwrap();

        let err = admission.wait().await.unwrap_err();
        assert!(matches!(err, DispatchError::WorkFailed { .. }));
        assert!(err.to_string().contains("boom"));
        assert_eq!(d.total_load(), 0);
    }

    #[tokio::test]
    async fn test_work_panic_releases_slot() {
        let d = dispatcher(&[1]);
        let admission = d
            .route(1, || async {
                if true {
                    panic!("work panicked");
                }
                Ok::<(), io::Error>(())
            })
            .into_admission()
            .unwrap();

        let err = admission.wait().await.unwrap_err();
        assert!(matches!(err, DispatchError::WorkPanicked { .. }));
        assert_eq!(d.total_load(), 0);
    }

    #[tokio::test]
    async fn test_abort_releases_slot() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(&[1]).with_event_sink(sink.clone());
        let (_tx, work) = gated();

        let admission = d.route(1, work).into_admission().unwrap();
        assert_eq!(d.total_load(), 1);

        admission.abort();
        let err = admission.wait().await.unwrap_err();
        assert!(matches!(err, DispatchError::WorkCancelled { .. }));
        assert_eq!(d.total_load(), 0);

        let completed: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, DispatchEvent::Completed { success: false, .. }))
            .collect();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_timeout_releases_slot() {
        let d = dispatcher(&[1]).with_work_timeout(Duration::from_millis(50));
        let admission = d
            .route(1, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, io::Error>(())
            })
            .into_admission()
            .unwrap();

        let err = admission.wait().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::WorkTimedOut { timeout_ms: 50, .. }
        ));
        assert_eq!(d.total_load(), 0);
    }

    #[tokio::test]
    async fn test_events_for_admitted_request() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(&[2]).with_event_sink(sink.clone());

        let admission = d
            .route(5, || async { Ok::<_, io::Error>(()) })
            .into_admission()
            .unwrap();
        admission.wait().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DispatchEvent::Admitted {
                request_id: RequestId(5),
                node_id: NodeId::from("node0"),
                load: 1,
                capacity: 2,
            }
        );
        assert!(matches!(
            &events[1],
            DispatchEvent::Completed { request_id: RequestId(5), success: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_high_load_event_above_threshold_only() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(&[10]).with_event_sink(sink.clone());

        let mut gates = Vec::new();
        let mut admissions = Vec::new();
        for id in 0..10u64 {
            let (tx, work) = gated();
            gates.push(tx);
            admissions.push(d.route(id, work).into_admission().unwrap());
        }

        let alerts: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DispatchEvent::HighLoad { fraction, .. } => Some(fraction),
                _ => None,
            })
            .collect();
        // 9/10 sits on the threshold and does not alert; 10/10 does
        assert_eq!(alerts, vec![1.0]);

        for tx in gates {
            tx.send(()).unwrap();
        }
        for admission in admissions {
            admission.wait().await.unwrap();
        }
        assert_eq!(d.total_load(), 0);
    }

    #[tokio::test]
    async fn test_dropped_admission_still_releases() {
        let d = dispatcher(&[1]);
        let (tx, work) = gated();
        drop(d.route(1, work));
        assert_eq!(d.total_load(), 1);

        tx.send(()).unwrap();
        for _ in 0..100 {
            if d.total_load() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(d.total_load(), 0);
    }

    #[tokio::test]
    async fn test_route_admits_on_selected_node_with_shared_id() {
        let d = Dispatcher::new(vec![
            Arc::new(Node::new("a", 1).unwrap()),
            Arc::new(Node::new("a", 1).unwrap()),
        ]);
        assert!(d.nodes()[0].try_acquire());

        let (tx, work) = gated();
        let result = d.route(1, work);
        assert_eq!(result.outcome(), RouteOutcome::Admitted(NodeId::from("a")));
        assert_eq!(d.nodes()[0].current_load(), 1);
        assert_eq!(d.nodes()[1].current_load(), 1);

        tx.send(()).unwrap();
        result.into_admission().unwrap().wait().await.unwrap();
        assert_eq!(d.nodes()[1].current_load(), 0);
        d.nodes()[0].release();
    }

    #[test]
    fn test_route_outside_runtime_touches_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(&[1]).with_event_sink(sink.clone());

        let result = d.route(1, || async { Ok::<_, io::Error>(()) });
        assert_eq!(result.outcome(), RouteOutcome::NoRuntime);
        assert!(result.node_id().is_none());
        assert_eq!(d.total_load(), 0);
        assert!(sink.events().is_empty());

        let result = d.route_with_snapshot(2, &d.snapshot(), || async { Ok::<_, io::Error>(()) });
        assert_eq!(result.outcome(), RouteOutcome::NoRuntime);
        assert_eq!(d.total_load(), 0);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_empty_dispatcher_outside_runtime() {
        let d = Dispatcher::new(vec![]);
        let result = d.route(1, || async { Ok::<_, io::Error>(()) });
        assert_eq!(result.outcome(), RouteOutcome::NoNodesAvailable);
    }

    #[test]
    fn test_high_load_threshold_out_of_range_is_ignored() {
        for threshold in [f64::NAN, 0.0, -0.5, 1.5] {
            let d = dispatcher(&[1]).with_high_load_threshold(threshold);
            assert_eq!(d.high_load_threshold(), DEFAULT_HIGH_LOAD_THRESHOLD);
        }

        let d = dispatcher(&[1]).with_high_load_threshold(0.5);
        assert_eq!(d.high_load_threshold(), 0.5);
        let d = d.with_high_load_threshold(f64::NAN);
        assert_eq!(d.high_load_threshold(), 0.5);
    }

    #[test]
    fn test_lookup_and_totals() {
        let d = dispatcher(&[2, 3]);
        assert_eq!(d.node_count(), 2);
        assert_eq!(d.total_capacity(), 5);
        assert_eq!(d.total_load(), 0);
        assert!(d.node(&NodeId::from("node1")).is_some());
        assert!(d.node(&NodeId::from("missing")).is_none());
        assert_eq!(d.high_load_threshold(), DEFAULT_HIGH_LOAD_THRESHOLD);
        assert!(d.work_timeout().is_none());
    }
}
