//! Balance source seam.
//!
//! The snapshot producer only needs one question answered: what did these
//! accounts hold at this ledger timestamp? In production that is the
//! network gateway; for local runs and tests the deterministic dummy
//! source serves synthetic balances with the same shape.

mod client;
mod dummy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use client::GatewayClient;
pub use dummy::DummyBalanceSource;

/// Per-account balances at a ledger timestamp, keyed by token resource.
#[derive(Debug, Clone)]
pub struct AccountBalances {
    pub account_address: String,
    pub balances: Value,
}

#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Fetch the balances of `addresses` for the given `resources` as of
    /// `at`. Implementations return one entry per address that exists on
    /// ledger; unknown addresses are simply absent from the result.
    async fn fetch_balances(
        &self,
        addresses: &[String],
        resources: &[String],
        at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AccountBalances>>;
}
