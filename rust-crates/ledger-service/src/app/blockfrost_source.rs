//! Ownership lookups against a Blockfrost-compatible chain indexer.

use crate::Result;
use accrual_ledger::{
    reconcile::{
        ExternalSourceUnavailable,
        OwnershipSource,
    },
    resource::{
        AssetId,
        WalletAddress,
    },
};
use anyhow::Context;
use reqwest::StatusCode;
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use std::{
    collections::BTreeSet,
    time::Duration,
};
use url::Url;

const PAGE_SIZE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct AmountDto {
    unit: String,
    quantity: String,
}

#[derive(Debug, Deserialize)]
struct AddressDto {
    #[serde(default)]
    amount: Vec<AmountDto>,
}

pub struct BlockfrostSource {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    policy_id: String,
}

impl BlockfrostSource {
    pub fn new(base_url: &Url, project_id: &str, policy_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build indexer HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            policy_id: policy_id.trim().to_ascii_lowercase(),
        })
    }

    /// `Ok(None)` when the indexer has never seen the resource.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<Option<T>, ExternalSourceUnavailable> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("project_id", &self.project_id)
            .query(query)
            .send()
            .await
            .map_err(|e| ExternalSourceUnavailable::new(format!("request to {url} failed: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if status.is_success() => {}
            status => {
                return Err(ExternalSourceUnavailable::new(format!(
                    "{url} answered {status}"
                )));
            }
        }
        response.json::<T>().await.map(Some).map_err(|e| {
            ExternalSourceUnavailable::new(format!("unreadable response from {url}: {e}"))
        })
    }

    fn tracked_assets(
        &self,
        amounts: impl IntoIterator<Item = AmountDto>,
    ) -> BTreeSet<AssetId> {
        amounts
            .into_iter()
            .filter(|amount| {
                amount.unit.len() > self.policy_id.len()
                    && amount.unit.to_ascii_lowercase().starts_with(&self.policy_id)
                    && amount.quantity.trim().parse::<u128>().is_ok_and(|q| q > 0)
            })
            .filter_map(|amount| match AssetId::new(amount.unit) {
                Ok(asset) => Some(asset),
                Err(e) => {
                    tracing::warn!("ignoring indexer asset: {e}");
                    None
                }
            })
            .collect()
    }

    async fn stake_assets(
        &self,
        wallet: &WalletAddress,
    ) -> std::result::Result<BTreeSet<AssetId>, ExternalSourceUnavailable> {
        let path = format!("accounts/{wallet}/addresses/assets");
        let mut owned = BTreeSet::new();
        let mut page = 1u32;
        loop {
            let query = [("page", page.to_string()), ("count", PAGE_SIZE.to_string())];
            let Some(amounts) = self.get_json::<Vec<AmountDto>>(&path, &query).await? else {
                break;
            };
            let complete = amounts.len() < PAGE_SIZE;
            owned.extend(self.tracked_assets(amounts));
            if complete {
                break;
            }
            page += 1;
        }
        Ok(owned)
    }

    async fn address_assets(
        &self,
        wallet: &WalletAddress,
    ) -> std::result::Result<BTreeSet<AssetId>, ExternalSourceUnavailable> {
        let path = format!("addresses/{wallet}");
        let address = self.get_json::<AddressDto>(&path, &[]).await?;
        Ok(address
            .map(|address| self.tracked_assets(address.amount))
            .unwrap_or_default())
    }
}

impl OwnershipSource for BlockfrostSource {
    async fn owned_assets(
        &self,
        wallet: &WalletAddress,
    ) -> std::result::Result<BTreeSet<AssetId>, ExternalSourceUnavailable> {
        let owned = if wallet.is_stake_address() {
            self.stake_assets(wallet).await?
        } else {
            self.address_assets(wallet).await?
        };
        tracing::debug!("indexer reports {} tracked asset(s) for {wallet}", owned.len());
        Ok(owned)
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        Mock,
        MockServer,
        ResponseTemplate,
        matchers::{
            header,
            method,
            path,
            query_param,
        },
    };

    const POLICY: &str = "d5e6bf0500378d4f0da4e8dde6becec7621cd8cbf5cbb9b87013d4cc";
    const OTHER_POLICY: &str = "f0ff48bbb7bbe9d59a40f1ce90e9e9d0ff5002ec48f232b49ca0fb9a";
    const PROJECT: &str = "mainnetTestProject";

    fn unit(policy: &str, name: &str) -> String {
        format!("{policy}{}", hex::encode(name))
    }

    fn source(server: &MockServer) -> BlockfrostSource {
        let url = Url::parse(&server.uri()).unwrap();
        BlockfrostSource::new(&url, PROJECT, POLICY).unwrap()
    }

    fn wallet(raw: &str) -> WalletAddress {
        WalletAddress::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn owned_assets__stake_address__pages_and_keeps_only_held_policy_assets() {
        // given
        let server = MockServer::start().await;
        let first_page: Vec<_> = (0..PAGE_SIZE)
            .map(|index| json!({ "unit": unit(POLICY, &format!("Hero{index}")), "quantity": "1" }))
            .collect();
        let second_page = json!([
            { "unit": unit(POLICY, "Hero500"), "quantity": "1" },
            { "unit": unit(POLICY, "Hero501"), "quantity": "0" },
            { "unit": unit(OTHER_POLICY, "Hero502"), "quantity": "1" },
            { "unit": "lovelace", "quantity": "5000000" },
        ]);
        Mock::given(method("GET"))
            .and(path("/accounts/stake1uxowner/addresses/assets"))
            .and(query_param("page", "1"))
            .and(header("project_id", PROJECT))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/accounts/stake1uxowner/addresses/assets"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(second_page))
            .mount(&server)
            .await;

        // when
        let owned = source(&server)
            .owned_assets(&wallet("stake1uxowner"))
            .await
            .unwrap();

        // then
        assert_eq!(owned.len(), PAGE_SIZE + 1);
        assert!(owned.contains(&AssetId::new(unit(POLICY, "Hero500")).unwrap()));
        assert!(!owned.contains(&AssetId::new(unit(POLICY, "Hero501")).unwrap()));
    }

    #[tokio::test]
    async fn owned_assets__payment_address__reads_address_amounts() {
        // given
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/addresses/addr1qxwallet"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "address": "addr1qxwallet",
                "amount": [
                    { "unit": "lovelace", "quantity": "42" },
                    { "unit": unit(POLICY, "Hero7"), "quantity": "1" },
                ],
            })))
            .mount(&server)
            .await;

        // when
        let owned = source(&server)
            .owned_assets(&wallet("addr1qxwallet"))
            .await
            .unwrap();

        // then
        let expected: BTreeSet<AssetId> = [AssetId::new(unit(POLICY, "Hero7")).unwrap()].into();
        assert_eq!(owned, expected);
    }

    #[tokio::test]
    async fn owned_assets__unknown_account__is_an_empty_set() {
        // given
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        // when
        let owned = source(&server)
            .owned_assets(&wallet("stake1uxfresh"))
            .await
            .unwrap();

        // then
        assert!(owned.is_empty());
    }

    #[tokio::test]
    async fn owned_assets__rate_limited__is_unavailable() {
        // given
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        // when
        let result = source(&server).owned_assets(&wallet("stake1uxbusy")).await;

        // then
        let unavailable = result.unwrap_err();
        assert!(unavailable.reason.contains("429"));
    }

    #[tokio::test]
    async fn owned_assets__server_error_on_later_page__is_unavailable() {
        // given
        let server = MockServer::start().await;
        let first_page: Vec<_> = (0..PAGE_SIZE)
            .map(|index| json!({ "unit": unit(POLICY, &format!("Hero{index}")), "quantity": "1" }))
            .collect();
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        // when
        let result = source(&server).owned_assets(&wallet("stake1uxhalf")).await;

        // then
        assert!(result.is_err());
    }
}
