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

use crate::registry::MetricsRegistry;
use crate::snapshot::MetricsSnapshot;
use capdispatch_core::{DispatchEvent, EventSink};
use std::sync::Arc;

/// Event sink that folds dispatch events into a [`MetricsRegistry`].
///
/// Attach it to a dispatcher with `with_event_sink` and read the aggregated
/// numbers back with [`snapshot`](DispatchMetricsCollector::snapshot).
///
/// # Example
///
/// ```rust
/// use capdispatch_core::{Dispatcher, Node};
/// use capdispatch_metrics::DispatchMetricsCollector;
/// use std::sync::Arc;
///
/// let collector = Arc::new(DispatchMetricsCollector::new());
/// let dispatcher = Dispatcher::new(vec![Arc::new(Node::new("node-a", 4).unwrap())])
///     .with_event_sink(collector.clone());
///
/// let snapshot = collector.snapshot();
/// assert_eq!(snapshot.total_requests, 0);
/// # drop(dispatcher);
/// ```
#[derive(Debug, Clone)]
pub struct DispatchMetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl DispatchMetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Creates a collector over an existing registry.
    ///
    /// Useful for sharing one registry between several dispatchers.
    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    /// Snapshot rendered as a JSON value.
    pub fn snapshot_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.snapshot())
    }
}

impl Default for DispatchMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for DispatchMetricsCollector {
    fn emit(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Admitted { node_id, load, .. } => {
                self.registry.record_admitted(node_id.as_str(), *load as u64);
            }
            DispatchEvent::Rejected { node_id, .. } => {
                self.registry.record_rejected(node_id.as_str());
            }
            DispatchEvent::NoNodesAvailable { .. } => {
                self.registry.record_no_nodes_available();
            }
            DispatchEvent::Completed {
                node_id,
                elapsed,
                success,
                ..
            } => {
                self.registry.record_completed(
                    node_id.as_str(),
                    elapsed.as_micros() as u64,
                    *success,
                );
            }
            DispatchEvent::HighLoad { node_id, .. } => {
                self.registry.record_high_load(node_id.as_str());
            }
        }
    }
}
