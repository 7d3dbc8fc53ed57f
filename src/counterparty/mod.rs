//! Client for the counterparty server that executes the other half of a trade

use crate::config::CounterpartyConfig;
use crate::error::{ForwarderError, ForwarderResult};
use crate::types::SwapHash;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterpartyServer: Send + Sync {
    /// Ask the server to pay `destination_address` under `hash`, to be
    /// reimbursed at `source_address`
    async fn execute(
        &self,
        hash: &SwapHash,
        source_address: &str,
        destination_address: &str,
    ) -> ForwarderResult<()>;

    /// The server's payment network address for `asset`
    async fn get_address(&self, asset: &str) -> ForwarderResult<String>;
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    hash: &'a SwapHash,
    source_address: &'a str,
    destination_address: &'a str,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

/// JSON-over-HTTP counterparty
pub struct HttpCounterparty {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCounterparty {
    pub fn new(config: &CounterpartyConfig) -> ForwarderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ForwarderError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

async fn failure(path: &str, response: reqwest::Response) -> ForwarderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ForwarderError::Counterparty(format!("{} {}: {}", status, path, body))
}

fn transport(e: reqwest::Error) -> ForwarderError {
    ForwarderError::Counterparty(e.to_string())
}

#[async_trait]
impl CounterpartyServer for HttpCounterparty {
    async fn execute(
        &self,
        hash: &SwapHash,
        source_address: &str,
        destination_address: &str,
    ) -> ForwarderResult<()> {
        let path = "/v1/swaps/execute";
        debug!(hash = %hash, "Requesting counterparty execution");

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&ExecuteRequest {
                hash,
                source_address,
                destination_address,
            })
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(failure(path, response).await);
        }
        Ok(())
    }

    async fn get_address(&self, asset: &str) -> ForwarderResult<String> {
        let path = format!("/v1/addresses/{}", asset);

        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(failure(&path, response).await);
        }
        let body: AddressResponse = response.json().await.map_err(transport)?;
        Ok(body.address)
    }
}
