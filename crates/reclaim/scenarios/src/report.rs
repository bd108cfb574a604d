//! Step recording and scenario results.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use reclaim_context::{ContextResult, TeardownReport};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ScenarioError, ScenarioResult};

/// One completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub elapsed: Duration,
}

/// Outcome of a scenario that passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub namespace: String,
    pub steps: Vec<Step>,
    pub teardown: TeardownReport,
}

impl ScenarioReport {
    pub fn step_descriptions(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.description.as_str()).collect()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed in {} steps ({})",
            self.scenario,
            self.steps.len(),
            self.teardown
        )
    }
}

/// Ordered record of the steps a scenario completed.
#[derive(Debug, Default)]
pub struct Steps {
    steps: Vec<Step>,
}

impl Steps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await one step, recording it on success and attributing a failure
    /// to it.
    pub async fn run<T, Fut>(&mut self, description: impl Into<String>, step: Fut) -> ScenarioResult<T>
    where
        Fut: Future<Output = ContextResult<T>>,
    {
        let description = description.into();
        debug!(step = %description, "Step started");
        let started = Instant::now();
        match step.await {
            Ok(value) => {
                self.record(description, started.elapsed());
                Ok(value)
            }
            Err(err) => Err(ScenarioError::at_step(description, err)),
        }
    }

    pub fn record(&mut self, description: impl Into<String>, elapsed: Duration) {
        let description = description.into();
        info!(step = %description, elapsed_ms = elapsed.as_millis() as u64, "Step done");
        self.steps.push(Step {
            description,
            elapsed,
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_inner(self) -> Vec<Step> {
        self.steps
    }
}
