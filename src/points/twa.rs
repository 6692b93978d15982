//! Time-weighted average balance calculator.
//!
//! Pure functions turning a chronological sequence of balance-change events
//! into a single holding-duration-weighted score. No storage or queue
//! dependencies; callers assemble events and pick the period end.

use chrono::{DateTime, Utc};

/// A balance observed at a point in time, for one account/token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceChangeEvent {
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
}

/// Half-open interval `[start_time, end_time)` during which `balance` held.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInterval {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub balance: f64,
}

/// Interval totals: `weighted_sum = Σ balance_i * seconds_i` and the summed
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeightedTotals {
    pub weighted_sum: f64,
    pub total_seconds: f64,
}

/// Stable chronological sort. Events with identical timestamps keep their
/// input order.
pub fn sort_events_by_timestamp(mut events: Vec<BalanceChangeEvent>) -> Vec<BalanceChangeEvent> {
    events.sort_by_key(|e| e.timestamp);
    events
}

/// Appends a synthetic event carrying the last balance forward to
/// `period_end`, so the final holding stretch is counted. No-op when the
/// last event is at or after `period_end`, or on empty input.
pub fn add_period_end_event(
    mut events: Vec<BalanceChangeEvent>,
    period_end: DateTime<Utc>,
) -> Vec<BalanceChangeEvent> {
    if let Some(last) = events.last().copied() {
        if last.timestamp < period_end {
            events.push(BalanceChangeEvent {
                timestamp: period_end,
                balance: last.balance,
            });
        }
    }
    events
}

/// For `n >= 2` sorted events, emits the `n - 1` intervals between
/// consecutive events, each carrying the earlier event's balance. Fewer
/// than 2 events yields no intervals.
pub fn create_time_intervals(events: &[BalanceChangeEvent]) -> Vec<TimeInterval> {
    events
        .windows(2)
        .map(|pair| TimeInterval {
            start_time: pair[0].timestamp,
            end_time: pair[1].timestamp,
            balance: pair[0].balance,
        })
        .collect()
}

/// Interval length in seconds, millisecond precision preserved.
pub fn calculate_interval_seconds(interval: &TimeInterval) -> f64 {
    let millis = interval
        .end_time
        .signed_duration_since(interval.start_time)
        .num_milliseconds();
    millis as f64 / 1000.0
}

pub fn calculate_weighted_sum_and_time(intervals: &[TimeInterval]) -> WeightedTotals {
    intervals.iter().fold(WeightedTotals::default(), |acc, iv| {
        let seconds = calculate_interval_seconds(iv);
        WeightedTotals {
            weighted_sum: acc.weighted_sum + iv.balance * seconds,
            total_seconds: acc.total_seconds + seconds,
        }
    })
}

/// Composes the full pipeline: sort, extend to `period_end`, build
/// intervals, weight by duration. Returns 0 when no time elapsed (no
/// events, or every event sits at/after `period_end`).
pub fn calculate_time_weighted_average(
    events: Vec<BalanceChangeEvent>,
    period_end: DateTime<Utc>,
) -> f64 {
    let sorted = sort_events_by_timestamp(events);
    let extended = add_period_end_event(sorted, period_end);
    let intervals = create_time_intervals(&extended);
    let totals = calculate_weighted_sum_and_time(&intervals);

    if totals.total_seconds == 0.0 {
        return 0.0;
    }
    totals.weighted_sum / totals.total_seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn ev(timestamp: DateTime<Utc>, balance: f64) -> BalanceChangeEvent {
        BalanceChangeEvent { timestamp, balance }
    }

    #[test]
    fn test_sort_orders_any_permutation() {
        let base = vec![ev(at(1, 0), 1.0), ev(at(2, 0), 2.0), ev(at(3, 0), 3.0)];
        let permutations = [
            vec![base[0], base[1], base[2]],
            vec![base[2], base[0], base[1]],
            vec![base[1], base[2], base[0]],
            vec![base[2], base[1], base[0]],
        ];
        for perm in permutations {
            let sorted = sort_events_by_timestamp(perm);
            for pair in sorted.windows(2) {
                assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }
    }

    #[test]
    fn test_sort_is_stable_for_identical_timestamps() {
        let events = vec![ev(at(1, 0), 1.0), ev(at(1, 0), 2.0), ev(at(1, 0), 3.0)];
        let sorted = sort_events_by_timestamp(events);
        assert_eq!(sorted[0].balance, 1.0);
        assert_eq!(sorted[1].balance, 2.0);
        assert_eq!(sorted[2].balance, 3.0);
    }

    #[test]
    fn test_sort_empty_returns_empty() {
        assert!(sort_events_by_timestamp(vec![]).is_empty());
    }

    #[test]
    fn test_period_end_appended_when_last_event_earlier() {
        let events = vec![ev(at(1, 0), 500.0)];
        let extended = add_period_end_event(events, at(3, 0));
        assert_eq!(extended.len(), 2);
        assert_eq!(extended[1].timestamp, at(3, 0));
        assert_eq!(extended[1].balance, 500.0);
    }

    #[test]
    fn test_period_end_not_appended_when_last_event_at_or_after() {
        let at_end = add_period_end_event(vec![ev(at(3, 0), 500.0)], at(3, 0));
        assert_eq!(at_end.len(), 1);

        let after_end = add_period_end_event(vec![ev(at(4, 0), 500.0)], at(3, 0));
        assert_eq!(after_end.len(), 1);
    }

    #[test]
    fn test_period_end_noop_on_empty() {
        assert!(add_period_end_event(vec![], at(3, 0)).is_empty());
    }

    #[test]
    fn test_intervals_carry_earlier_balance() {
        let events = vec![ev(at(1, 0), 100.0), ev(at(2, 0), 200.0), ev(at(3, 0), 300.0)];
        let intervals = create_time_intervals(&events);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].balance, 100.0);
        assert_eq!(intervals[0].end_time, at(2, 0));
        assert_eq!(intervals[1].balance, 200.0);
    }

    #[test]
    fn test_fewer_than_two_events_yield_no_intervals() {
        assert!(create_time_intervals(&[]).is_empty());
        assert!(create_time_intervals(&[ev(at(1, 0), 100.0)]).is_empty());
    }

    #[test]
    fn test_interval_seconds_one_hour() {
        let iv = TimeInterval {
            start_time: at(1, 0),
            end_time: at(1, 1),
            balance: 0.0,
        };
        assert_eq!(calculate_interval_seconds(&iv), 3600.0);
    }

    #[test]
    fn test_interval_seconds_zero_for_identical_bounds() {
        let iv = TimeInterval {
            start_time: at(1, 0),
            end_time: at(1, 0),
            balance: 0.0,
        };
        assert_eq!(calculate_interval_seconds(&iv), 0.0);
    }

    #[test]
    fn test_interval_seconds_keeps_millisecond_precision() {
        let iv = TimeInterval {
            start_time: at(1, 0),
            end_time: at(1, 0) + Duration::milliseconds(500),
            balance: 0.0,
        };
        assert_eq!(calculate_interval_seconds(&iv), 0.5);
    }

    #[test]
    fn test_weighted_sum_over_two_half_days() {
        // 12h at 1000 plus 12h at 2000 over one day
        let intervals = vec![
            TimeInterval {
                start_time: at(1, 0),
                end_time: at(1, 12),
                balance: 1000.0,
            },
            TimeInterval {
                start_time: at(1, 12),
                end_time: at(2, 0),
                balance: 2000.0,
            },
        ];
        let totals = calculate_weighted_sum_and_time(&intervals);
        assert_eq!(totals.weighted_sum, 1000.0 * 43200.0 + 2000.0 * 43200.0);
        assert_eq!(totals.total_seconds, 86400.0);
    }

    #[test]
    fn test_weighted_sum_empty_is_zero() {
        let totals = calculate_weighted_sum_and_time(&[]);
        assert_eq!(totals.weighted_sum, 0.0);
        assert_eq!(totals.total_seconds, 0.0);
    }

    #[test]
    fn test_average_of_empty_is_zero() {
        assert_eq!(calculate_time_weighted_average(vec![], at(7, 0)), 0.0);
    }

    #[test]
    fn test_average_of_single_event_is_its_balance() {
        let avg = calculate_time_weighted_average(vec![ev(at(1, 0), 1234.5)], at(7, 0));
        assert_eq!(avg, 1234.5);
    }

    #[test]
    fn test_average_zero_when_all_events_at_period_end() {
        let events = vec![ev(at(7, 0), 100.0), ev(at(7, 0), 200.0)];
        assert_eq!(calculate_time_weighted_average(events, at(7, 0)), 0.0);
    }

    #[test]
    fn test_average_weighs_balances_by_holding_time() {
        // 36h at 5000, 60h at 10000, 48h at 2000 over Jan 1 - Jan 7
        let events = vec![
            ev(at(1, 0), 5000.0),
            ev(at(2, 12), 10000.0),
            ev(at(5, 0), 2000.0),
        ];
        let avg = calculate_time_weighted_average(events, at(7, 0));

        let expected = (5000.0 * 129_600.0 + 10000.0 * 216_000.0 + 2000.0 * 172_800.0) / 518_400.0;
        assert!((avg - expected).abs() < 1e-9);
        assert!((avg - 6083.33).abs() < 0.1);
    }

    #[test]
    fn test_average_ignores_input_order() {
        let events = vec![
            ev(at(5, 0), 2000.0),
            ev(at(1, 0), 5000.0),
            ev(at(2, 12), 10000.0),
        ];
        let avg = calculate_time_weighted_average(events, at(7, 0));
        assert!((avg - 6083.33).abs() < 0.1);
    }
}
