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

//! capdispatch metrics
//!
//! Aggregates the dispatcher's advisory events into counters and latency
//! percentiles. The dispatcher never depends on this crate; it is attached
//! as one more [`EventSink`](capdispatch_core::EventSink).
//!
//! # Components
//!
//! - [`MetricsRegistry`]: lock-free counters per node plus a latency histogram
//! - [`DispatchMetricsCollector`]: the event sink feeding the registry
//! - [`MetricsSnapshot`]: serialisable point-in-time view
//!
//! # Usage Example
//!
//! ```rust
//! use capdispatch_core::{DispatchEvent, EventSink, NodeId, RequestId};
//! use capdispatch_metrics::DispatchMetricsCollector;
//!
//! let collector = DispatchMetricsCollector::new();
//! collector.emit(&DispatchEvent::Rejected {
//!     request_id: RequestId(1),
//!     node_id: NodeId::from("node-a"),
//! });
//!
//! let snapshot = collector.snapshot();
//! assert_eq!(snapshot.rejected, 1);
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::DispatchMetricsCollector;
pub use registry::MetricsRegistry;
pub use snapshot::{MetricsSnapshot, NodeMetrics};
