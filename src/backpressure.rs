// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage pressure relative to the declared space budget.
//!
//! The budget is the sum of `min_required_space_mb` over all retention
//! configs that declare one. The evaluator computes the level before and
//! after each pass; anything above 1.0 triggers emergency eviction.
//!
//! # Example
//!
//! ```
//! use loom_store::StoragePressure;
//!
//! let level = StoragePressure::from_usage(50, Some(100));
//! assert_eq!(level, StoragePressure::Normal);
//! assert!(!level.needs_eviction());
//!
//! let level = StoragePressure::from_usage(120, Some(100));
//! assert_eq!(level, StoragePressure::OverBudget);
//! assert!(level.needs_eviction());
//!
//! // No budget declared: never under pressure
//! assert_eq!(StoragePressure::from_usage(u64::MAX, None), StoragePressure::Unbounded);
//! ```

use serde::Serialize;

/// Pressure tiers:
/// - **Unbounded**: no table declares a space budget
/// - **Normal** (< 70%)
/// - **Warn** (70-90%): log, nothing evicted yet
/// - **Critical** (90-100%): at the edge of the budget
/// - **OverBudget** (> 100%): emergency eviction runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePressure {
    #[default]
    Unbounded = 0,
    Normal = 1,
    Warn = 2,
    Critical = 3,
    OverBudget = 4,
}

impl StoragePressure {
    /// Calculate pressure level from pressure ratio (footprint / budget)
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 0.90 => Self::Warn,
            p if p <= 1.0 => Self::Critical,
            _ => Self::OverBudget,
        }
    }

    #[must_use]
    pub fn from_usage(footprint_bytes: u64, budget_bytes: Option<u64>) -> Self {
        match budget_bytes {
            None => Self::Unbounded,
            Some(0) if footprint_bytes == 0 => Self::Normal,
            Some(0) => Self::OverBudget,
            Some(budget) => Self::from_pressure(ratio(footprint_bytes, budget)),
        }
    }

    #[must_use]
    pub fn needs_eviction(&self) -> bool {
        matches!(self, Self::OverBudget)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Unbounded => "No space budget declared",
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - storage filling up",
            Self::Critical => "Critical - at space budget",
            Self::OverBudget => "Over budget - emergency eviction",
        }
    }
}

impl std::fmt::Display for StoragePressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Footprint over budget, 0.0 when no budget applies.
#[must_use]
pub fn ratio(footprint_bytes: u64, budget_bytes: u64) -> f64 {
    if budget_bytes == 0 {
        return 0.0;
    }
    footprint_bytes as f64 / budget_bytes as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_tiers() {
        assert_eq!(StoragePressure::from_pressure(0.0), StoragePressure::Normal);
        assert_eq!(StoragePressure::from_pressure(0.69), StoragePressure::Normal);
        assert_eq!(StoragePressure::from_pressure(0.70), StoragePressure::Warn);
        assert_eq!(StoragePressure::from_pressure(0.95), StoragePressure::Critical);
        assert_eq!(StoragePressure::from_pressure(1.0), StoragePressure::Critical);
        assert_eq!(StoragePressure::from_pressure(1.01), StoragePressure::OverBudget);
    }

    #[test]
    fn test_exactly_at_budget_is_not_evicted() {
        let level = StoragePressure::from_usage(100, Some(100));
        assert!(!level.needs_eviction());
    }

    #[test]
    fn test_ordering() {
        assert!(StoragePressure::Normal < StoragePressure::Warn);
        assert!(StoragePressure::Critical < StoragePressure::OverBudget);
    }

    #[test]
    fn test_zero_budget() {
        assert_eq!(StoragePressure::from_usage(0, Some(0)), StoragePressure::Normal);
        assert_eq!(StoragePressure::from_usage(1, Some(0)), StoragePressure::OverBudget);
    }
}
