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

//! Advisory notifications emitted by the dispatcher.
//!
//! Sinks are fire-and-forget: the dispatcher calls [`EventSink::emit`] inline
//! on the routing or completion path and ignores whatever the sink does with
//! the event. Implementations must therefore be cheap and must never block.

use crate::dispatcher::RequestId;
use crate::node::NodeId;
use std::time::Duration;
use tracing::{debug, warn};

/// Something observable happened to a request or a node.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A slot was reserved on `node_id`; `load` is the node's load right after.
    Admitted {
        request_id: RequestId,
        node_id: NodeId,
        load: usize,
        capacity: usize,
    },
    /// The least-loaded node was full when admission was attempted.
    Rejected {
        request_id: RequestId,
        node_id: NodeId,
    },
    /// The dispatcher has no nodes at all.
    NoNodesAvailable { request_id: RequestId },
    /// Admitted work finished and its slot was released.
    Completed {
        request_id: RequestId,
        node_id: NodeId,
        elapsed: Duration,
        success: bool,
    },
    /// A node's load fraction rose strictly above the alert threshold.
    HighLoad { node_id: NodeId, fraction: f64 },
}

impl DispatchEvent {
    /// Node the event refers to, if any.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            DispatchEvent::Admitted { node_id, .. }
            | DispatchEvent::Rejected { node_id, .. }
            | DispatchEvent::Completed { node_id, .. }
            | DispatchEvent::HighLoad { node_id, .. } => Some(node_id),
            DispatchEvent::NoNodesAvailable { .. } => None,
        }
    }
}

/// Receiver of [`DispatchEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &DispatchEvent);
}

/// Logs every event through `tracing`.
///
/// Admissions and completions are logged at `debug`, rejections and
/// high-load alerts at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Admitted {
                request_id,
                node_id,
                load,
                capacity,
            } => {
                debug!(%request_id, node = %node_id, load, capacity, "Request admitted");
            }
            DispatchEvent::Rejected { request_id, node_id } => {
                warn!(%request_id, node = %node_id, "Request rejected, node at capacity");
            }
            DispatchEvent::NoNodesAvailable { request_id } => {
                warn!(%request_id, "Request rejected, no nodes configured");
            }
            DispatchEvent::Completed {
                request_id,
                node_id,
                elapsed,
                success,
            } => {
                debug!(
                    %request_id,
                    node = %node_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    success,
                    "Request completed"
                );
            }
            DispatchEvent::HighLoad { node_id, fraction } => {
                warn!(node = %node_id, fraction, "Node load above alert threshold");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records every event for later inspection.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<DispatchEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<DispatchEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &DispatchEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
