//! Pure points math.
//!
//! This module is organized into focused submodules:
//!
//! - [`twa`] - Time-weighted average balance calculation
//! - [`curve`] - Holding-multiplier S-curve and cumulative positions
//! - [`bands`] - Banded season-points pool distribution

mod bands;
mod curve;
mod twa;

// ============================================
// Re-exports
// ============================================

// Time-weighted averages
pub use twa::{
    add_period_end_event, calculate_interval_seconds, calculate_time_weighted_average,
    calculate_weighted_sum_and_time, create_time_intervals, sort_events_by_timestamp,
    BalanceChangeEvent, TimeInterval, WeightedTotals,
};

// Multiplier curve
pub use curve::{
    cumulative_positions, CurvePosition, MultiplierCurve, SCurve, MAX_MULTIPLIER, MIN_MULTIPLIER,
};

// Season-points distribution
pub use bands::{BandedDistribution, PointsDistribution};
