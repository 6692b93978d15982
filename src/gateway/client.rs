//! HTTP gateway client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::GatewaySettings;
use crate::gateway::{AccountBalances, BalanceSource};

/// How many addresses go into one gateway request.
const REQUEST_CHUNK_SIZE: usize = 100;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalancesRequest<'a> {
    addresses: &'a [String],
    resources: &'a [String],
    at_ledger_state: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalancesResponse {
    items: Vec<BalanceItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceItem {
    address: String,
    balances: serde_json::Value,
}

/// Balance source backed by the network gateway's state API.
pub struct GatewayClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl GatewayClient {
    pub fn new(settings: &GatewaySettings) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&settings.url)?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint,
        })
    }
}

#[async_trait]
impl BalanceSource for GatewayClient {
    async fn fetch_balances(
        &self,
        addresses: &[String],
        resources: &[String],
        at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AccountBalances>> {
        let mut results = Vec::with_capacity(addresses.len());

        for chunk in addresses.chunks(REQUEST_CHUNK_SIZE) {
            let request = BalancesRequest {
                addresses: chunk,
                resources,
                at_ledger_state: at,
            };

            let response = self
                .http
                .post(self.endpoint.clone())
                .json(&request)
                .send()
                .await?
                .error_for_status()?
                .json::<BalancesResponse>()
                .await?;

            if response.items.len() < chunk.len() {
                warn!(
                    "Gateway returned {} of {} requested accounts",
                    response.items.len(),
                    chunk.len()
                );
            }

            results.extend(response.items.into_iter().map(|item| AccountBalances {
                account_address: item.address,
                balances: item.balances,
            }));
        }

        Ok(results)
    }
}
