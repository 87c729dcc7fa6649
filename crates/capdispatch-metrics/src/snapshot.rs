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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dispatch statistics for a single node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: String,
    pub admitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub high_load_alerts: u64,
    /// Highest active count reported at admission time
    pub peak_load: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

impl NodeMetrics {
    pub fn new(node_id: String) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Admitted requests whose completion has not been seen yet
    pub fn in_flight(&self) -> u64 {
        self.admitted.saturating_sub(self.completed())
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub no_nodes_available: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub uptime_ms: u64,
    pub nodes: BTreeMap<String, NodeMetrics>,
}

impl MetricsSnapshot {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            uptime_ms,
            ..Default::default()
        }
    }

    /// Fraction of requests that were admitted, 0.0 when nothing was routed
    pub fn admission_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.admitted as f64 / self.total_requests as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_metrics_in_flight() {
        let metrics = NodeMetrics {
            admitted: 5,
            succeeded: 2,
            failed: 1,
            ..NodeMetrics::new("node-a".to_string())
        };
        assert_eq!(metrics.completed(), 3);
        assert_eq!(metrics.in_flight(), 2);
    }

    #[test]
    fn test_admission_rate() {
        let mut snapshot = MetricsSnapshot::new(0);
        assert_eq!(snapshot.admission_rate(), 0.0);

        snapshot.total_requests = 4;
        snapshot.admitted = 3;
        assert_eq!(snapshot.admission_rate(), 0.75);
    }

    #[test]
    fn test_snapshot_serializes_nodes_by_id() {
        let mut snapshot = MetricsSnapshot::new(10);
        snapshot
            .nodes
            .insert("b".to_string(), NodeMetrics::new("b".to_string()));
        snapshot
            .nodes
            .insert("a".to_string(), NodeMetrics::new("a".to_string()));

        let json = serde_json::to_value(&snapshot).unwrap();
        let keys: Vec<_> = json["nodes"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(json["uptime_ms"], 10);
    }
}
