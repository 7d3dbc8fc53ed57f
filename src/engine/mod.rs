//! Payment rail engines
//!
//! This module provides:
//! - The capability contract every rail implements ([`SwapEngine`])
//! - A ledger-channel engine driving hold invoices on a channel node
//! - A custodial-escrow engine driving a polled escrow service
//! - The in-flight preparation registry that makes `prepare_swap` idempotent

pub mod channel;
pub mod escrow;
pub mod prepared;

#[cfg(test)]
pub mod fake;

pub use channel::{ChannelEngine, RestChannelNode};
pub use escrow::{EscrowEngine, RestEscrowApi};

use crate::config::{EngineConfig, EngineKindConfig, Settings};
use crate::error::{ForwarderError, ForwarderResult, SwapResult};
use crate::timelock::HopTiming;
use crate::types::{Amount, SwapHash, SwapPreimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Closed set of rail variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    LedgerChannel,
    CustodialEscrow,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::LedgerChannel => write!(f, "ledger-channel"),
            EngineKind::CustodialEscrow => write!(f, "custodial-escrow"),
        }
    }
}

/// Rail-side status of the outbound obligation an engine holds for a hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    NotFound,
    Created,
    Committed,
    Complete,
    Canceled,
    Expired,
}

impl SwapStatus {
    /// Whether the inbound leg may be canceled without desynchronizing the legs
    pub fn allows_inbound_cancel(&self) -> bool {
        matches!(
            self,
            SwapStatus::NotFound | SwapStatus::Created | SwapStatus::Canceled
        )
    }
}

/// Capability contract of a payment rail
///
/// Every call may suspend on network I/O. Errors follow the
/// [`SwapError`](crate::error::SwapError) taxonomy: anything other than the
/// settled/canceled/expired/permanent variants is temporary.
#[async_trait]
pub trait SwapEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Asset symbol this engine moves
    fn asset(&self) -> &str;

    fn time_lock_params(&self) -> HopTiming;

    fn is_validated(&self) -> bool;

    /// Check connectivity and credentials, updating `is_validated`
    async fn validate(&self) -> SwapResult<()>;

    /// Register an inbound obligation. Repeating it with identical terms is a
    /// no-op; different terms fail with `TermsMismatch`.
    async fn prepare_swap(
        &self,
        hash: &SwapHash,
        amount: &Amount,
        expiration: DateTime<Utc>,
        timelock_delta: u64,
    ) -> SwapResult<()>;

    /// Suspend until the inbound leg is committed; returns the commitment time
    async fn wait_for_swap_commitment(&self, hash: &SwapHash) -> SwapResult<DateTime<Utc>>;

    /// Pay `amount` to `address` under `hash`, resolving with the preimage
    async fn translate_swap(
        &self,
        address: &str,
        hash: &SwapHash,
        amount: &Amount,
        max_time: DateTime<Utc>,
    ) -> SwapResult<SwapPreimage>;

    async fn get_settled_swap_preimage(&self, hash: &SwapHash) -> SwapResult<SwapPreimage>;

    /// Cancel the inbound obligation; already canceled is success
    async fn cancel_swap(&self, hash: &SwapHash) -> SwapResult<()>;

    /// Complete the inbound obligation; already settled is success
    async fn settle_swap(&self, preimage: &SwapPreimage) -> SwapResult<()>;

    async fn get_payment_channel_network_address(&self) -> SwapResult<String>;

    /// Status of the outbound obligation this engine holds for `hash`
    async fn swap_status(&self, hash: &SwapHash) -> SwapResult<SwapStatus>;
}

/// Configured engines indexed by asset
pub struct EngineSet {
    engines: HashMap<String, Arc<dyn SwapEngine>>,
}

impl EngineSet {
    pub fn new(engines: Vec<Arc<dyn SwapEngine>>) -> Self {
        let engines = engines
            .into_iter()
            .map(|e| (e.asset().to_string(), e))
            .collect();
        Self { engines }
    }

    /// Build every configured engine
    pub fn from_settings(settings: &Settings) -> ForwarderResult<Self> {
        let mut engines: Vec<Arc<dyn SwapEngine>> = Vec::new();

        for (name, config) in &settings.engines {
            info!(
                "Initializing {:?} engine {} for {}",
                config.kind, name, config.asset
            );
            engines.push(build_engine(config)?);
        }

        Ok(Self::new(engines))
    }

    /// Get the engine for an asset
    pub fn get(&self, asset: &str) -> ForwarderResult<Arc<dyn SwapEngine>> {
        self.engines
            .get(asset)
            .cloned()
            .ok_or_else(|| ForwarderError::EngineNotFound {
                asset: asset.to_string(),
            })
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn SwapEngine>> {
        self.engines.values()
    }

    pub fn all_validated(&self) -> bool {
        self.engines.values().all(|e| e.is_validated())
    }

    /// Keep re-validating every engine at a fixed interval
    pub async fn run_validation(&self, interval: Duration) {
        let handles = self.engines.values().cloned().map(|engine| {
            tokio::spawn(async move {
                loop {
                    let was_validated = engine.is_validated();
                    match engine.validate().await {
                        Ok(()) if !was_validated => {
                            info!("Engine for {} validated", engine.asset());
                        }
                        Ok(()) => debug!("Engine for {} still valid", engine.asset()),
                        Err(e) => warn!("Engine for {} failed validation: {}", engine.asset(), e),
                    }
                    crate::metrics::record_engine_validated(engine.asset(), engine.is_validated());
                    tokio::time::sleep(interval).await;
                }
            })
        });

        futures::future::join_all(handles).await;
    }
}

fn build_engine(config: &EngineConfig) -> ForwarderResult<Arc<dyn SwapEngine>> {
    let engine: Arc<dyn SwapEngine> = match config.kind {
        EngineKindConfig::Channel => Arc::new(ChannelEngine::new(
            RestChannelNode::new(config)?,
            &config.asset,
            &config.unit,
            config.timing(),
            config.poll_interval(),
        )),
        EngineKindConfig::Escrow => Arc::new(EscrowEngine::new(
            RestEscrowApi::new(config)?,
            &config.asset,
            &config.unit,
            config.timing(),
            config.poll_interval(),
        )),
    };
    Ok(engine)
}

/// Shared HTTP client construction for the REST rail clients
pub(crate) fn http_client(config: &EngineConfig) -> ForwarderResult<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| ForwarderError::Config(format!("Invalid API key: {}", e)))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| ForwarderError::Config(format!("HTTP client: {}", e)))
}

/// Turn a non-success HTTP response into a temporary rail error
pub(crate) async fn rail_error(path: &str, response: reqwest::Response) -> crate::error::SwapError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    crate::error::SwapError::Rail(format!("{} {}: {}", status, path, body))
}

#[cfg(test)]
mod tests {
    use super::fake::FakeEngine;
    use super::*;

    #[test]
    fn test_engine_set_lookup_by_asset() {
        let btc: Arc<dyn SwapEngine> = Arc::new(FakeEngine::new("BTC"));
        let usd: Arc<dyn SwapEngine> = Arc::new(FakeEngine::new("USD"));
        let set = EngineSet::new(vec![btc, usd]);

        assert_eq!(set.get("BTC").unwrap().asset(), "BTC");
        assert!(matches!(
            set.get("ETH"),
            Err(ForwarderError::EngineNotFound { .. })
        ));
    }

    #[test]
    fn test_all_validated_requires_every_engine() {
        let btc = Arc::new(FakeEngine::new("BTC"));
        let usd = Arc::new(FakeEngine::new("USD"));
        let set = EngineSet::new(vec![
            btc.clone() as Arc<dyn SwapEngine>,
            usd.clone() as Arc<dyn SwapEngine>,
        ]);

        assert!(!set.all_validated());
        btc.set_validated(true);
        assert!(!set.all_validated());
        usd.set_validated(true);
        assert!(set.all_validated());
    }

    #[test]
    fn test_inbound_cancel_only_when_outbound_uncommitted() {
        assert!(SwapStatus::NotFound.allows_inbound_cancel());
        assert!(SwapStatus::Created.allows_inbound_cancel());
        assert!(SwapStatus::Canceled.allows_inbound_cancel());
        assert!(!SwapStatus::Committed.allows_inbound_cancel());
        assert!(!SwapStatus::Complete.allows_inbound_cancel());
        assert!(!SwapStatus::Expired.allows_inbound_cancel());
    }
}
