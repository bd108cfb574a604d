//! # Reclaim Poller - Condition Polling
//!
//! A bounded retry primitive for waiting on eventually consistent state.
//!
//! A wait ends in exactly one of three ways:
//!
//! - **Satisfied**: the predicate held on an observation
//! - **Structural**: an observation failed in a way that can never recover
//!   (permission denial, malformed query, object deleted after being seen)
//! - **Timed out**: the deadline passed, reporting the last observed state
//!
//! "Not found" before the first sighting is treated as "not yet true", so a
//! wait can be started right after submitting an object an asynchronous
//! controller has yet to create.
//!
//! ## Example
//!
//! ```rust,no_run
//! use reclaim_poller::{ConditionPoller, PollConfig};
//! # use reclaim_poller::{Classify, ErrorClass};
//! # #[derive(Debug)] struct E;
//! # impl std::fmt::Display for E { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "e") } }
//! # impl Classify for E { fn class(&self) -> ErrorClass { ErrorClass::Structural } }
//! # async fn running_groups() -> Result<u32, E> { Ok(1) }
//!
//! # async fn example() {
//! let poller = ConditionPoller::new(PollConfig::one_minute());
//! let outcome = poller.poll_until(running_groups, |running| *running == 1).await;
//! assert!(outcome.is_satisfied());
//! # }
//! ```

pub mod config;
pub mod error;
pub mod poller;

pub use config::PollConfig;
pub use error::{Classify, ErrorClass, PollError, PollResult};
pub use poller::{ConditionPoller, PollOutcome, StateSource};
