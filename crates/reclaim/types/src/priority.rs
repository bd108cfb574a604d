//! Priority classes.

use serde::{Deserialize, Serialize};

/// Logical name of the low priority class used by the reclaim scenarios.
pub const LOW_PRIORITY: &str = "low-priority";

/// Logical name of the high priority class used by the reclaim scenarios.
pub const HIGH_PRIORITY: &str = "high-priority";

/// Named integer weight; higher wins contested capacity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriorityClass {
    pub name: String,
    pub value: i32,
}

impl PriorityClass {
    pub fn new(name: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

