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

//! capdispatch core
//!
//! Admission control and least-loaded selection for a fixed set of
//! capacity-bounded nodes.
//!
//! # Components
//!
//! - [`Node`]: an atomic in-flight counter with a fixed capacity and
//!   try-acquire / release semantics, plus the [`SlotGuard`] that releases
//!   on drop
//! - [`Dispatcher`]: picks the least-loaded node from a fresh
//!   [`LoadSnapshot`] and admits or rejects the request there
//! - [`DispatcherConfig`]: node set and limits, buildable in code or from JSON
//! - [`EventSink`]: fire-and-forget receiver of [`DispatchEvent`]s
//!
//! # Guarantees
//!
//! - A node's active count never exceeds its capacity.
//! - Every admitted request releases its slot exactly once, whether its work
//!   succeeds, fails, panics, times out or is aborted.
//! - Given the same snapshot, selection always picks the same node; ties go
//!   to the node that was added first.
//! - A rejected request changes no node's state.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod node;

pub use config::{DispatcherConfig, NodeConfig};
pub use dispatcher::{
    least_loaded, Admission, Dispatcher, LoadSnapshot, NodeLoad, RequestId, RouteOutcome,
    RouteResult,
};
pub use error::{BoxError, DispatchError, Result};
pub use events::{DispatchEvent, EventSink, TracingEventSink};
pub use node::{Node, NodeId, SlotGuard, DEFAULT_HIGH_LOAD_THRESHOLD};
