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

use crate::node::NodeId;
use thiserror::Error;

/// Boxed error produced by a unit of dispatched work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the dispatcher and its configuration layer.
///
/// Capacity exhaustion is deliberately absent: a node at capacity and a
/// rejected request are ordinary results (`bool` from
/// [`Node::try_acquire`](crate::Node::try_acquire) and
/// [`RouteResult::Rejected`](crate::RouteResult::Rejected)), not errors.
/// Every variant here affects a single request or a single setup call.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Work on node {node_id} failed: {source}")]
    WorkFailed {
        node_id: NodeId,
        #[source]
        source: BoxError,
    },

    #[error("Work on node {node_id} panicked")]
    WorkPanicked { node_id: NodeId },

    #[error("Work on node {node_id} was cancelled")]
    WorkCancelled { node_id: NodeId },

    #[error("Work on node {node_id} timed out after {timeout_ms}ms")]
    WorkTimedOut { node_id: NodeId, timeout_ms: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// Node the failed work was admitted on, if the error concerns work.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            DispatchError::WorkFailed { node_id, .. }
            | DispatchError::WorkPanicked { node_id }
            | DispatchError::WorkCancelled { node_id }
            | DispatchError::WorkTimedOut { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Returns `true` for errors raised by admitted work rather than setup.
    pub fn is_work_error(&self) -> bool {
        self.node_id().is_some()
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
