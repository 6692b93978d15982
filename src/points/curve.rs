//! Holding-multiplier curve.
//!
//! Maps a user's position in the TWA-balance distribution (the cumulative
//! share `q` of the summed balances at and below theirs) to a season-points
//! multiplier. The campaign's curve is logistic with hard caps at both
//! tails.

use uuid::Uuid;

pub const MIN_MULTIPLIER: f64 = 0.5;
pub const MAX_MULTIPLIER: f64 = 3.0;

/// Seam for the multiplier curve shape.
pub trait MultiplierCurve {
    /// `q` is the cumulative balance share in `[0, 1]`.
    fn multiplier(&self, q: f64) -> f64;
}

/// Logistic S-curve with tail caps.
#[derive(Debug, Clone)]
pub struct SCurve {
    pub steepness: f64,
    pub midpoint: f64,
    pub lower_cap: f64,
    pub upper_cap: f64,
}

impl Default for SCurve {
    fn default() -> Self {
        Self {
            steepness: 15.0,
            midpoint: 0.18,
            lower_cap: 0.02,
            upper_cap: 0.50,
        }
    }
}

impl MultiplierCurve for SCurve {
    fn multiplier(&self, q: f64) -> f64 {
        if q < self.lower_cap {
            MIN_MULTIPLIER
        } else if q < self.upper_cap {
            MIN_MULTIPLIER
                + (MAX_MULTIPLIER - MIN_MULTIPLIER)
                    / (1.0 + (-self.steepness * (q - self.midpoint)).exp())
        } else {
            MAX_MULTIPLIER
        }
    }
}

/// One user's place in the ascending TWA-balance ordering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePosition {
    pub user_id: Uuid,
    pub twa_balance: f64,
    pub cumulative_balance: f64,
    pub total_balance: f64,
}

impl CurvePosition {
    pub fn quantile(&self) -> f64 {
        if self.total_balance == 0.0 {
            return 0.0;
        }
        self.cumulative_balance / self.total_balance
    }
}

/// Sorts users ascending by TWA balance and computes each user's running
/// cumulative balance against the total. Users with equal balances keep
/// their input order.
pub fn cumulative_positions(mut balances: Vec<(Uuid, f64)>) -> Vec<CurvePosition> {
    balances.sort_by(|a, b| a.1.total_cmp(&b.1));
    let total: f64 = balances.iter().map(|(_, b)| b).sum();

    let mut cumulative = 0.0;
    balances
        .into_iter()
        .map(|(user_id, twa_balance)| {
            cumulative += twa_balance;
            CurvePosition {
                user_id,
                twa_balance,
                cumulative_balance: cumulative,
                total_balance: total,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_tail_is_min_multiplier() {
        let curve = SCurve::default();
        assert_eq!(curve.multiplier(0.0), MIN_MULTIPLIER);
        assert_eq!(curve.multiplier(0.019), MIN_MULTIPLIER);
    }

    #[test]
    fn test_upper_tail_is_max_multiplier() {
        let curve = SCurve::default();
        assert_eq!(curve.multiplier(0.50), MAX_MULTIPLIER);
        assert_eq!(curve.multiplier(1.0), MAX_MULTIPLIER);
    }

    #[test]
    fn test_midpoint_is_curve_center() {
        let curve = SCurve::default();
        let mid = curve.multiplier(0.18);
        assert!((mid - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_curve_is_monotonic() {
        let curve = SCurve::default();
        let mut last = 0.0;
        for i in 0..=100 {
            let q = i as f64 / 100.0;
            let m = curve.multiplier(q);
            assert!(m >= last);
            assert!((MIN_MULTIPLIER..=MAX_MULTIPLIER).contains(&m));
            last = m;
        }
    }

    #[test]
    fn test_cumulative_positions_ascending() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let positions = cumulative_positions(vec![(a, 3000.0), (b, 1000.0), (c, 2000.0)]);

        assert_eq!(positions[0].user_id, b);
        assert_eq!(positions[1].user_id, c);
        assert_eq!(positions[2].user_id, a);

        assert_eq!(positions[0].cumulative_balance, 1000.0);
        assert_eq!(positions[1].cumulative_balance, 3000.0);
        assert_eq!(positions[2].cumulative_balance, 6000.0);
        assert!(positions.iter().all(|p| p.total_balance == 6000.0));
    }

    #[test]
    fn test_quantile_of_equal_holders() {
        let users: Vec<_> = (0..3).map(|_| (Uuid::new_v4(), 500.0)).collect();
        let positions = cumulative_positions(users);

        assert!((positions[0].quantile() - 1.0 / 3.0).abs() < 1e-9);
        assert!((positions[1].quantile() - 2.0 / 3.0).abs() < 1e-9);
        assert!((positions[2].quantile() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_zero_total() {
        let positions = cumulative_positions(vec![(Uuid::new_v4(), 0.0)]);
        assert_eq!(positions[0].quantile(), 0.0);
    }
}
