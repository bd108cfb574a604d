//! # Reclaim Scenarios
//!
//! End-to-end scenarios for the reclaim behavior of a batch scheduler.
//! Every scenario submits jobs through a
//! [`TestContext`](reclaim_context::TestContext), then waits for queue and
//! job status to converge:
//!
//! | Case | Asserts |
//! |---|---|
//! | `resources-suffice` | no reclaim when capacity covers every queue |
//! | `claimant-pending` | no reclaim for a claimant whose pods are gone |
//! | `missing-queue` | submission to a queue never created fails |
//! | `low-priority-claimant` | a low-priority claimant displaces nobody |
//! | `donor-overused` | a queue at its share is not reclaimed from |
//! | `claimant-exceeds-reclaimable` | an oversized claimant stays pending |
//! | `priority-reclaim` | a high-priority claimant takes half the cluster |
//!
//! Scenarios run one at a time; see [`run_suite`].

pub mod config;
pub mod error;
pub mod reclaim;
pub mod report;
pub mod suite;

pub use config::ScenarioConfig;
pub use error::{ScenarioError, ScenarioResult};
pub use reclaim::{
    no_reclaim_for_low_priority_claimant, no_reclaim_for_missing_queue,
    no_reclaim_for_pending_claimant, no_reclaim_from_overused_donor,
    no_reclaim_when_claimant_exceeds_reclaimable, no_reclaim_when_resources_suffice,
    reclaim_by_priority, reclaim_target, run_case, ReclaimCase,
};
pub use report::{ScenarioReport, Step, Steps};
pub use suite::{run_suite, CaseOutcome, SuiteReport};
