//! Deterministic synthetic balances.

use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use rustc_hash::FxHasher;
use serde_json::{Map, Number, Value};

use crate::gateway::{AccountBalances, BalanceSource};

/// Balance source that fabricates balances from a hash of the address,
/// resource and hour. The same inputs always produce the same balances,
/// so repeated snapshot runs stay idempotent and TWA results are stable
/// across reruns.
#[derive(Debug, Default)]
pub struct DummyBalanceSource;

fn dummy_balance(address: &str, resource: &str, at: DateTime<Utc>) -> f64 {
    let mut hasher = FxHasher::default();
    address.hash(&mut hasher);
    resource.hash(&mut hasher);
    // Hour granularity: the balance "changes" at most once per hour
    (at.timestamp() - at.minute() as i64 * 60 - at.second() as i64).hash(&mut hasher);

    // Spread into [0, 100_000) with two decimals
    (hasher.finish() % 10_000_000) as f64 / 100.0
}

#[async_trait]
impl BalanceSource for DummyBalanceSource {
    async fn fetch_balances(
        &self,
        addresses: &[String],
        resources: &[String],
        at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AccountBalances>> {
        let results = addresses
            .iter()
            .map(|address| {
                let mut balances = Map::new();
                for resource in resources {
                    let value = dummy_balance(address, resource, at);
                    let number = Number::from_f64(value).unwrap_or_else(|| Number::from(0));
                    balances.insert(resource.clone(), Value::Number(number));
                }
                AccountBalances {
                    account_address: address.clone(),
                    balances: Value::Object(balances),
                }
            })
            .collect();

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_dummy_balances_are_deterministic() {
        let source = DummyBalanceSource;
        let addresses = vec!["account_abc".to_string(), "account_def".to_string()];
        let resources = vec!["xrd".to_string()];
        let at = Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap();

        let first = source
            .fetch_balances(&addresses, &resources, at)
            .await
            .unwrap();
        let second = source
            .fetch_balances(&addresses, &resources, at)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.account_address, b.account_address);
            assert_eq!(a.balances, b.balances);
        }
    }

    #[tokio::test]
    async fn test_dummy_balances_ignore_sub_hour_time() {
        let source = DummyBalanceSource;
        let addresses = vec!["account_abc".to_string()];
        let resources = vec!["xrd".to_string()];

        let on_the_hour = Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap();
        let mid_hour = Utc.with_ymd_and_hms(2025, 1, 6, 12, 37, 15).unwrap();

        let a = source
            .fetch_balances(&addresses, &resources, on_the_hour)
            .await
            .unwrap();
        let b = source
            .fetch_balances(&addresses, &resources, mid_hour)
            .await
            .unwrap();
        assert_eq!(a[0].balances, b[0].balances);
    }

    #[tokio::test]
    async fn test_dummy_balances_differ_per_address() {
        let source = DummyBalanceSource;
        let addresses = vec!["account_abc".to_string(), "account_def".to_string()];
        let resources = vec!["xrd".to_string()];
        let at = Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap();

        let results = source
            .fetch_balances(&addresses, &resources, at)
            .await
            .unwrap();
        assert_ne!(results[0].balances, results[1].balances);
    }
}
