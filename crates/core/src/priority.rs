//! Business priority tiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Dispatch precedence of a job. Higher level dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl Priority {
    /// Tiers in the order the dispatcher drains them.
    pub const DISPATCH_ORDER: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Numeric level (HIGH=2, MEDIUM=1, LOW=0).
    pub const fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Priority::Low),
            1 => Some(Priority::Medium),
            2 => Some(Priority::High),
            _ => None,
        }
    }

    /// Index into per-tier arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "2" => Ok(Priority::High),
            "medium" | "1" => Ok(Priority::Medium),
            "low" | "0" => Ok(Priority::Low),
            other => Err(QueueError::InvalidId(format!("Priority: unknown tier '{other}'"))),
        }
    }
}
