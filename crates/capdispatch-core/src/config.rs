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

//! Dispatcher configuration.
//!
//! The node set, each node's capacity, the high-load alert threshold and an
//! optional work timeout are fixed when the dispatcher is built. They can be
//! assembled in code or loaded from a JSON file:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "id": "node-a", "capacity": 2 },
//!     { "id": "node-b", "capacity": 4 }
//!   ],
//!   "high_load_threshold": 0.9,
//!   "work_timeout_ms": 30000
//! }
//! ```

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::node::{NodeId, DEFAULT_HIGH_LOAD_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Identity and capacity of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub capacity: usize,
}

impl NodeConfig {
    pub fn new(id: impl Into<NodeId>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity,
        }
    }
}

/// Parses `id:capacity`, e.g. `node-a:4`.
impl FromStr for NodeConfig {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        let (id, capacity) = s.rsplit_once(':').ok_or_else(|| {
            DispatchError::InvalidConfig(format!(
                "node '{}' must be written as id:capacity",
                s
            ))
        })?;

        let capacity = capacity.trim().parse::<usize>().map_err(|e| {
            DispatchError::InvalidConfig(format!("node '{}' has an invalid capacity: {}", s, e))
        })?;

        Ok(Self::new(id.trim(), capacity))
    }
}

fn default_high_load_threshold() -> f64 {
    DEFAULT_HIGH_LOAD_THRESHOLD
}

/// Everything needed to build a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Nodes in tie-break order.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Load fraction strictly above which a high-load alert is emitted.
    ///
    /// Default: 0.9
    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: f64,
    /// Maximum run time of admitted work in milliseconds.
    ///
    /// Default: unlimited
    #[serde(default)]
    pub work_timeout_ms: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            high_load_threshold: DEFAULT_HIGH_LOAD_THRESHOLD,
            work_timeout_ms: None,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node.
    pub fn with_node(mut self, id: impl Into<NodeId>, capacity: usize) -> Self {
        self.nodes.push(NodeConfig::new(id, capacity));
        self
    }

    pub fn with_high_load_threshold(mut self, threshold: f64) -> Self {
        self.high_load_threshold = threshold;
        self
    }

    pub fn with_work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn work_timeout(&self) -> Option<Duration> {
        self.work_timeout_ms.map(Duration::from_millis)
    }

    pub fn total_capacity(&self) -> usize {
        self.nodes.iter().map(|n| n.capacity).sum()
    }

    /// Checks the configuration for values the dispatcher cannot honour.
    ///
    /// An empty node list is valid; such a dispatcher answers every request
    /// with `NoNodesAvailable`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidConfig`] if:
    /// - a node id is empty or appears twice
    /// - a node has capacity zero
    /// - the high-load threshold is not in `(0, 1]`
    /// - the work timeout is zero
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());

        for node in &self.nodes {
            if node.id.as_str().trim().is_empty() {
                return Err(DispatchError::InvalidConfig(
                    "node id must not be empty".to_string(),
                ));
            }

            if !seen.insert(&node.id) {
                return Err(DispatchError::InvalidConfig(format!(
                    "node id {} appears more than once",
                    node.id
                )));
            }

            if node.capacity == 0 {
                return Err(DispatchError::InvalidConfig(format!(
                    "node {} must have a capacity greater than zero",
                    node.id
                )));
            }
        }

        if !(self.high_load_threshold > 0.0 && self.high_load_threshold <= 1.0) {
            return Err(DispatchError::InvalidConfig(format!(
                "high load threshold must be in (0, 1] (got {})",
                self.high_load_threshold
            )));
        }

        if self.work_timeout_ms == Some(0) {
            return Err(DispatchError::InvalidConfig(
                "work timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Builds a dispatcher. Shorthand for [`Dispatcher::from_config`].
    pub fn build(&self) -> Result<Dispatcher> {
        Dispatcher::from_config(self)
    }
}
