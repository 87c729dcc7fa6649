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

//! Synthetic load generator.
//!
//! Drives a [`Dispatcher`] with a fixed number of requests arriving at a
//! steady interval. Each request sleeps for a processing time drawn from a
//! seeded RNG and optionally fails, so a given seed always produces the same
//! request plan.

use capdispatch_core::{Dispatcher, RequestId, RouteResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on `SimulationConfig::requests`.
pub const MAX_REQUESTS: u64 = 10_000_000;

/// Parameters of a simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Number of requests to generate
    pub requests: u64,
    /// Delay between consecutive arrivals; zero sends them back to back
    pub arrival_interval: Duration,
    /// Shortest synthetic processing time
    pub min_processing: Duration,
    /// Longest synthetic processing time (inclusive)
    pub max_processing: Duration,
    /// Probability in `[0, 1]` that a request's work fails
    pub failure_rate: f64,
    /// RNG seed for processing times and failures
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            arrival_interval: Duration::from_millis(10),
            min_processing: Duration::from_millis(50),
            max_processing: Duration::from_millis(500),
            failure_rate: 0.0,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    /// Validates the simulation parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `requests` exceeds [`MAX_REQUESTS`]
    /// - `min_processing` is greater than `max_processing`
    /// - `failure_rate` is outside `[0, 1]`
    pub fn validate(&self) -> Result<(), String> {
        if self.requests > MAX_REQUESTS {
            return Err(format!(
                "request count {} exceeds the maximum of {}",
                self.requests, MAX_REQUESTS
            ));
        }

        if self.min_processing > self.max_processing {
            return Err(format!(
                "minimum processing time ({}ms) exceeds maximum ({}ms)",
                self.min_processing.as_millis(),
                self.max_processing.as_millis()
            ));
        }

        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(format!(
                "failure rate must be between 0 and 1 (got {})",
                self.failure_rate
            ));
        }

        Ok(())
    }
}

/// One generated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRequest {
    pub id: RequestId,
    pub processing: Duration,
    pub fails: bool,
}

/// Error returned by work that was planned to fail.
#[derive(Debug, thiserror::Error)]
#[error("simulated failure of request {0}")]
pub struct SimulatedFailure(pub RequestId);

/// Totals of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub requests: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub no_nodes_available: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct Simulation {
    dispatcher: Arc<Dispatcher>,
    config: SimulationConfig,
}

impl Simulation {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SimulationConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Lazily generates the request plan for the configured seed.
    ///
    /// The configuration must be valid; an out-of-range failure rate panics
    /// when the first request is drawn.
    pub fn plan(&self) -> impl Iterator<Item = PlannedRequest> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let min_ms = self.config.min_processing.as_millis() as u64;
        let max_ms = self.config.max_processing.as_millis() as u64;
        let failure_rate = self.config.failure_rate;

        (0..self.config.requests).map(move |id| PlannedRequest {
            id: RequestId(id),
            processing: Duration::from_millis(rng.gen_range(min_ms..=max_ms)),
            fails: rng.gen_bool(failure_rate),
        })
    }

    /// Routes every planned request and waits for all admitted work.
    ///
    /// # Errors
    ///
    /// Returns the validation message if the configuration is invalid.
    pub async fn run(&self) -> Result<SimulationReport, String> {
        self.config.validate()?;

        let mut report = SimulationReport {
            requests: self.config.requests,
            ..Default::default()
        };
        let mut admissions = Vec::new();

        info!(
            requests = report.requests,
            nodes = self.dispatcher.node_count(),
            total_capacity = self.dispatcher.total_capacity(),
            "Starting simulation"
        );

        for (index, request) in self.plan().enumerate() {
            if index > 0 && !self.config.arrival_interval.is_zero() {
                tokio::time::sleep(self.config.arrival_interval).await;
            }

            let PlannedRequest {
                id,
                processing,
                fails,
            } = request;
            let result = self.dispatcher.route(id, move || async move {
                tokio::time::sleep(processing).await;
                if fails {
                    Err(SimulatedFailure(id))
                } else {
                    Ok(processing)
                }
            });

            match result {
                RouteResult::Admitted(admission) => {
                    report.admitted += 1;
                    admissions.push(admission);
                }
                RouteResult::Rejected(node_id) => {
                    debug!(request_id = %id, node = %node_id, "Simulated request rejected");
                    report.rejected += 1;
                }
                RouteResult::NoNodesAvailable => {
                    report.no_nodes_available += 1;
                }
                RouteResult::NoRuntime => {
                    warn!(request_id = %id, "Simulated request not routed, no runtime");
                }
            }
        }

        for outcome in futures::future::join_all(admissions.into_iter().map(|a| a.wait())).await {
            match outcome {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
        }

        info!(
            admitted = report.admitted,
            rejected = report.rejected,
            succeeded = report.succeeded,
            failed = report.failed,
            "Simulation finished"
        );
        Ok(report)
    }
}
