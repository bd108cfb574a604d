//! Resource requests and capacities.
//!
//! Only the two dimensions the scenarios contend on are modelled: CPU in
//! millicores and memory in bytes. A zero dimension means "not requested".

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::error::{SpecError, SpecResult};

const MIB: u64 = 1024 * 1024;

/// Suffix multipliers accepted in quantity strings. Binary suffixes come
/// first so `Mi` is never mistaken for `M`.
const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// A CPU/memory pair used both for task requests and node capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceList {
    /// CPU in millicores.
    pub cpu_millis: u64,

    /// Memory in bytes.
    pub memory_bytes: u64,
}

impl ResourceList {
    /// One full core, no memory request.
    pub const ONE_CPU: Self = Self::new(1000, 0);

    /// Half a core, no memory request.
    pub const HALF_CPU: Self = Self::new(500, 0);

    /// One core and 1024Mi of memory.
    pub const CPU1_MEM1: Self = Self::new(1000, 1024 * MIB);

    /// Four cores and 4096Mi of memory.
    pub const CPU4_MEM4: Self = Self::new(4000, 4096 * MIB);

    pub const fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    /// Build from Kubernetes quantity strings; a missing dimension is zero.
    pub fn from_quantities(cpu: Option<&str>, memory: Option<&str>) -> SpecResult<Self> {
        let cpu_millis = match cpu {
            Some(q) => (parse_quantity(q)? * 1000.0).round() as u64,
            None => 0,
        };
        let memory_bytes = match memory {
            Some(q) => parse_quantity(q)?.round() as u64,
            None => 0,
        };
        Ok(Self::new(cpu_millis, memory_bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0
    }

    /// Per-dimension subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        ResourceList::new(
            self.cpu_millis.saturating_sub(other.cpu_millis),
            self.memory_bytes.saturating_sub(other.memory_bytes),
        )
    }

    /// How many copies of this request fit into `capacity`.
    ///
    /// Only requested dimensions constrain the count; an empty request
    /// fits zero times.
    pub fn slots_in(&self, capacity: &ResourceList) -> u64 {
        let mut slots: Option<u64> = None;
        if self.cpu_millis > 0 {
            slots = Some(capacity.cpu_millis / self.cpu_millis);
        }
        if self.memory_bytes > 0 {
            let by_memory = capacity.memory_bytes / self.memory_bytes;
            slots = Some(slots.map_or(by_memory, |s| s.min(by_memory)));
        }
        slots.unwrap_or(0)
    }

    /// CPU rendered as a millicore quantity.
    pub fn cpu_quantity(&self) -> String {
        format!("{}m", self.cpu_millis)
    }

    /// Memory rendered as `Mi` when exact, bytes otherwise.
    pub fn memory_quantity(&self) -> String {
        if self.memory_bytes % MIB == 0 {
            format!("{}Mi", self.memory_bytes / MIB)
        } else {
            self.memory_bytes.to_string()
        }
    }

    /// Kubernetes `ResourceList` map, omitting unrequested dimensions.
    pub fn to_quantity_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if self.cpu_millis > 0 {
            map.insert("cpu".to_string(), self.cpu_quantity());
        }
        if self.memory_bytes > 0 {
            map.insert("memory".to_string(), self.memory_quantity());
        }
        map
    }
}

impl Add for ResourceList {
    type Output = ResourceList;

    fn add(self, rhs: ResourceList) -> ResourceList {
        ResourceList::new(
            self.cpu_millis.saturating_add(rhs.cpu_millis),
            self.memory_bytes.saturating_add(rhs.memory_bytes),
        )
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={},memory={}", self.cpu_quantity(), self.memory_quantity())
    }
}

/// Parse a Kubernetes quantity (`500m`, `2`, `1.5`, `1024Mi`, `1e3`) into
/// its base-unit value.
pub fn parse_quantity(value: &str) -> SpecResult<f64> {
    let invalid = |reason: &str| SpecError::InvalidQuantity {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }

    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| trimmed.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((trimmed, 1.0));

    let parsed: f64 = number
        .parse()
        .map_err(|_| invalid("not a number"))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(invalid("must be a finite non-negative number"));
    }

    Ok(parsed * multiplier)
}
