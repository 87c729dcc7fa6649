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

use crate::snapshot::{MetricsSnapshot, NodeMetrics};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Decades covered by the histogram: 1us up to 10^10us (~2.8h).
const NUM_DECADES: usize = 10;
/// Each decade is split by its leading digit (1..=9).
const BINS_PER_DECADE: usize = 9;
const NUM_HISTOGRAM_BINS: usize = NUM_DECADES * BINS_PER_DECADE;

/// Log-linear histogram for completion latencies.
///
/// A sample lands in the bin of its decade and leading digit, so 1234us and
/// 1999us share the `[1000, 2000)` bin. Percentiles report the lower bound
/// of the bin they fall in, which keeps them within one leading digit of the
/// true value.
///
/// Recording is a handful of relaxed atomic adds. Samples of 0us are counted
/// as 1us; samples beyond the last decade land in the last bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        let bin = Self::latency_to_bin(latency_us);
        self.bins[bin].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        let value = latency_us.max(1);
        let decade = value.ilog10() as usize;
        if decade >= NUM_DECADES {
            return NUM_HISTOGRAM_BINS - 1;
        }

        let leading_digit = (value / 10u64.pow(decade as u32)) as usize;
        decade * BINS_PER_DECADE + (leading_digit - 1)
    }

    /// Lower bound of a bin, in microseconds.
    fn bin_to_latency(bin: usize) -> u64 {
        let decade = bin / BINS_PER_DECADE;
        let leading_digit = (bin % BINS_PER_DECADE) as u64 + 1;
        leading_digit * 10u64.pow(decade as u32)
    }

    /// Estimates the latency at `percentile` (0-100), 0 if empty.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        // rank of the sample we are looking for, at least the first one
        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;

        for (bin_idx, bin) in self.bins.iter().enumerate() {
            cumulative += bin.load(Ordering::Relaxed);
            if cumulative >= target {
                return Self::bin_to_latency(bin_idx);
            }
        }

        // concurrent recording can leave bins behind sample_count
        Self::bin_to_latency(NUM_HISTOGRAM_BINS - 1)
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds.
    fn calculate_percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }

        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

/// Counters for one node.
///
/// Each counter is independent and updated with relaxed ordering; snapshots
/// are best-effort and may be momentarily inconsistent with each other.
#[derive(Debug)]
struct NodeStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    high_load_alerts: AtomicU64,
    peak_load: AtomicU64,
    latencies: LatencyHistogram,
}

impl NodeStats {
    fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            high_load_alerts: AtomicU64::new(0),
            peak_load: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self, node_id: &str) -> NodeMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.calculate_percentiles();

        NodeMetrics {
            node_id: node_id.to_string(),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            high_load_alerts: self.high_load_alerts.load(Ordering::Relaxed),
            peak_load: self.peak_load.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Thread-safe store of dispatch metrics.
///
/// Global counters are plain atomics. Per-node counters live behind an
/// `RwLock<HashMap>` that is only write-locked the first time a node is
/// seen; every later update takes the read lock and bumps atomics.
#[derive(Debug)]
pub struct MetricsRegistry {
    total_requests: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    no_nodes_available: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    nodes: RwLock<HashMap<String, Arc<NodeStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            no_nodes_available: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            nodes: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    fn node_stats(&self, node_id: &str) -> Arc<NodeStats> {
        // A poisoned lock only means a panic elsewhere mid-insert; the map
        // itself is still usable.
        if let Some(stats) = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
        {
            return Arc::clone(stats);
        }

        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            nodes
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(NodeStats::new())),
        )
    }

    pub fn record_admitted(&self, node_id: &str, load: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.admitted.fetch_add(1, Ordering::Relaxed);

        let stats = self.node_stats(node_id);
        stats.admitted.fetch_add(1, Ordering::Relaxed);
        stats.peak_load.fetch_max(load, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, node_id: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.node_stats(node_id)
            .rejected
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_nodes_available(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.no_nodes_available.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, node_id: &str, latency_us: u64, success: bool) {
        let stats = self.node_stats(node_id);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        stats.latencies.record(latency_us);
    }

    pub fn record_high_load(&self, node_id: &str) {
        self.node_stats(node_id)
            .high_load_alerts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let nodes = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot(id)))
            .collect();

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            no_nodes_available: self.no_nodes_available.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            nodes,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_bins() {
        assert_eq!(LatencyHistogram::latency_to_bin(0), 0);
        assert_eq!(LatencyHistogram::latency_to_bin(1), 0);
        assert_eq!(LatencyHistogram::latency_to_bin(9), 8);
        assert_eq!(LatencyHistogram::latency_to_bin(10), 9);
        assert_eq!(LatencyHistogram::latency_to_bin(1999), 27);
        assert_eq!(LatencyHistogram::bin_to_latency(27), 1000);
        assert_eq!(
            LatencyHistogram::latency_to_bin(u64::MAX),
            NUM_HISTOGRAM_BINS - 1
        );
    }

    #[test]
    fn test_bin_round_trip_lower_bound() {
        for value in [1u64, 7, 10, 55, 999, 1000, 123_456, 9_999_999_999] {
            let bin = LatencyHistogram::latency_to_bin(value);
            assert!(LatencyHistogram::bin_to_latency(bin) <= value);
        }
    }

    #[test]
    fn test_percentiles_uniform_samples() {
        let histogram = LatencyHistogram::new();
        for value in 1..=100 {
            histogram.record(value);
        }

        let (avg, p50, p95, p99) = histogram.calculate_percentiles();
        assert_eq!(avg, 50);
        assert_eq!(p50, 50);
        assert_eq!(p95, 90);
        assert_eq!(p99, 90);
    }

    #[test]
    fn test_percentiles_empty() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.calculate_percentiles(), (0, 0, 0, 0));
    }

    #[test]
    fn test_percentiles_single_value() {
        let histogram = LatencyHistogram::new();
        for _ in 0..10 {
            histogram.record(2500);
        }
        let (avg, p50, _, p99) = histogram.calculate_percentiles();
        assert_eq!(avg, 2500);
        assert_eq!(p50, 2000);
        assert_eq!(p99, 2000);
    }

    #[test]
    fn test_registry_counts() {
        let registry = MetricsRegistry::new();
        registry.record_admitted("a", 1);
        registry.record_admitted("a", 2);
        registry.record_admitted("b", 1);
        registry.record_rejected("a");
        registry.record_no_nodes_available();
        registry.record_completed("a", 100, true);
        registry.record_completed("b", 300, false);
        registry.record_high_load("a");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.admitted, 3);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.no_nodes_available, 1);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 1);

        let a = &snapshot.nodes["a"];
        assert_eq!(a.admitted, 2);
        assert_eq!(a.rejected, 1);
        assert_eq!(a.succeeded, 1);
        assert_eq!(a.peak_load, 2);
        assert_eq!(a.high_load_alerts, 1);
        assert_eq!(a.in_flight(), 1);
        assert_eq!(a.avg_latency_us, 100);

        let b = &snapshot.nodes["b"];
        assert_eq!(b.failed, 1);
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn test_registry_concurrent_updates() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let node = format!("node{}", t % 2);
                    for _ in 0..500 {
                        registry.record_admitted(&node, 1);
                        registry.record_completed(&node, 10, true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.admitted, 4000);
        assert_eq!(snapshot.succeeded, 4000);
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.nodes["node0"].admitted, 2000);
    }
}
