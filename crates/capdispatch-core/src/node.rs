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

//! Capacity-bounded worker nodes.
//!
//! A [`Node`] owns a single atomic counter of in-flight requests and a fixed
//! capacity. Admission is a compare-and-increment on that counter, so two
//! callers racing for the last slot can never both succeed. No lock is ever
//! held while admitted work runs.

use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Load fraction above which a node is reported as highly loaded.
///
/// The comparison is strict: a node at exactly 90% does not alert.
pub const DEFAULT_HIGH_LOAD_THRESHOLD: f64 = 0.9;

/// Unique, immutable identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A worker with a bounded number of concurrently active requests.
///
/// `Node` is shared between the dispatcher and every in-flight request via
/// `Arc<Node>`. The only mutable state is the active counter, which always
/// satisfies `0 <= active <= capacity`.
///
/// # Example
///
/// ```
/// use capdispatch_core::Node;
///
/// let node = Node::new("node-a", 2).unwrap();
/// assert!(node.try_acquire());
/// assert!(node.try_acquire());
/// assert!(!node.try_acquire()); // at capacity
/// node.release();
/// assert_eq!(node.current_load(), 1);
/// ```
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    capacity: usize,
    active: AtomicUsize,
}

impl Node {
    /// Creates an idle node.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidConfig`] if `capacity` is zero.
    pub fn new(id: impl Into<NodeId>, capacity: usize) -> Result<Self> {
        let id = id.into();
        if capacity == 0 {
            return Err(DispatchError::InvalidConfig(format!(
                "node {} must have a capacity greater than zero",
                id
            )));
        }

        Ok(Self {
            id,
            capacity,
            active: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves one slot if the node is below capacity.
    ///
    /// The check and the increment happen in a single compare-exchange, so
    /// there is no window in which a concurrent caller can observe the same
    /// free slot. Returns `false` without side effects when the node is full.
    ///
    /// Every `true` result must be paired with exactly one [`release`].
    /// Prefer [`try_acquire_slot`], which makes the pairing automatic.
    ///
    /// [`release`]: Node::release
    /// [`try_acquire_slot`]: Node::try_acquire_slot
    pub fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return false;
            }

            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns one previously acquired slot.
    ///
    /// A release with no outstanding acquisition is refused and logged; the
    /// counter never underflows.
    pub fn release(&self) {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current == 0 {
                warn!(node = %self.id, "Release without a matching acquire ignored");
                return;
            }

            match self.active.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Reserves one slot and returns a guard that releases it on drop.
    ///
    /// The guard releases exactly once however the protected work ends:
    /// normal return, error, panic unwinding, or the owning task being
    /// cancelled.
    pub fn try_acquire_slot(self: &Arc<Self>) -> Option<SlotGuard> {
        if self.try_acquire() {
            Some(SlotGuard { node: Arc::clone(self) })
        } else {
            None
        }
    }

    /// Number of currently active requests.
    ///
    /// Advisory only: the value may be stale as soon as it is returned and
    /// does not reserve anything.
    pub fn current_load(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// `current_load() / capacity()` in `[0.0, 1.0]`.
    pub fn load_fraction(&self) -> f64 {
        self.current_load() as f64 / self.capacity as f64
    }

    /// Whether the load fraction is strictly above `threshold`.
    pub fn is_high_load(&self, threshold: f64) -> bool {
        self.load_fraction() > threshold
    }

    /// Free slots at the time of the read.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.current_load())
    }
}

/// Holds one admitted slot on a node for as long as it lives.
///
/// Dropping the guard calls [`Node::release`] exactly once. The guard keeps
/// the node alive through its `Arc`, so a node is never destroyed while a
/// request admitted on it is in flight.
#[must_use = "dropping the guard immediately releases the slot"]
#[derive(Debug)]
pub struct SlotGuard {
    node: Arc<Node>,
}

impl SlotGuard {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn node_id(&self) -> &NodeId {
        self.node.id()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.node.release();
    }
}
