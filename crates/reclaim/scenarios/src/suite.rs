//! Sequential suite runner.

use std::fmt;
use std::sync::Arc;

use reclaim_context::ClusterApi;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::ScenarioConfig;
use crate::reclaim::{run_case, ReclaimCase};
use crate::report::ScenarioReport;

/// Result of one case in a suite run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub case: ReclaimCase,
    pub report: Option<ScenarioReport>,
    pub error: Option<String>,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.report, &self.error) {
            (_, Some(err)) => write!(f, "FAIL {}: {}", self.case, err),
            (Some(report), None) => write!(f, "PASS {}", report),
            (None, None) => write!(f, "PASS {}", self.case),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub outcomes: Vec<CaseOutcome>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Run `cases` one after another; a failing case does not stop the rest.
#[instrument(skip(cluster, config, cases), fields(cases = cases.len()))]
pub async fn run_suite(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
    cases: &[ReclaimCase],
) -> SuiteReport {
    let mut report = SuiteReport::default();
    for &case in cases {
        let outcome = match run_case(case, cluster.clone(), config).await {
            Ok(scenario) => CaseOutcome {
                case,
                report: Some(scenario),
                error: None,
            },
            Err(err) => CaseOutcome {
                case,
                report: None,
                error: Some(err.to_string()),
            },
        };
        report.outcomes.push(outcome);
    }
    info!(
        passed = report.passed(),
        failed = report.failed(),
        "Suite finished"
    );
    report
}
