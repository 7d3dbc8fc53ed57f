//! Ledger-channel engine
//!
//! Inbound legs are hold invoices: the node accepts the HTLC but only settles
//! once we hand it the preimage. Outbound legs are ordinary payments locked to
//! the swap hash; a successful payment reveals the preimage.

use super::prepared::{Preparation, PreparedSwap, PreparedSwaps};
use super::{http_client, rail_error, EngineKind, SwapEngine, SwapStatus};
use crate::config::EngineConfig;
use crate::error::{ForwarderResult, SwapError, SwapResult};
use crate::timelock::HopTiming;
use crate::types::{Amount, SwapHash, SwapPreimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub identity_pubkey: String,
    pub synced_to_chain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    Open,
    Accepted,
    Settled,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub hash: SwapHash,
    pub value: u64,
    pub state: InvoiceState,
    pub expires_at: DateTime<Utc>,
    pub cltv_expiry_secs: u64,
    pub accepted_at: Option<DateTime<Utc>>,
    pub preimage: Option<SwapPreimage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldInvoiceRequest {
    pub hash: SwapHash,
    pub value: u64,
    pub expires_at: DateTime<Utc>,
    pub cltv_expiry_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentFailure {
    Timeout,
    NoRoute,
    IncorrectPaymentDetails,
    InsufficientBalance,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub hash: SwapHash,
    pub status: PaymentStatus,
    pub preimage: Option<SwapPreimage>,
    pub failure: Option<PaymentFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub destination: String,
    pub hash: SwapHash,
    pub value: u64,
    pub final_cltv_delta_secs: u64,
    pub timeout_secs: u64,
}

/// Client for a channel node's REST gateway
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelNode: Send + Sync {
    async fn get_info(&self) -> SwapResult<NodeInfo>;
    async fn add_hold_invoice(&self, request: &HoldInvoiceRequest) -> SwapResult<()>;
    async fn lookup_invoice(&self, hash: &SwapHash) -> SwapResult<Option<Invoice>>;
    async fn settle_invoice(&self, preimage: &SwapPreimage) -> SwapResult<()>;
    async fn cancel_invoice(&self, hash: &SwapHash) -> SwapResult<()>;
    async fn send_payment(&self, request: &PaymentRequest) -> SwapResult<Payment>;
    async fn lookup_payment(&self, hash: &SwapHash) -> SwapResult<Option<Payment>>;
}

pub struct RestChannelNode {
    client: reqwest::Client,
    base_url: String,
}

impl RestChannelNode {
    pub fn new(config: &EngineConfig) -> ForwarderResult<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> SwapResult<Option<T>> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(rail_error(path, response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> SwapResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rail_error(path, response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChannelNode for RestChannelNode {
    async fn get_info(&self) -> SwapResult<NodeInfo> {
        self.get("/v1/getinfo")
            .await?
            .ok_or_else(|| SwapError::Rail("node info unavailable".to_string()))
    }

    async fn add_hold_invoice(&self, request: &HoldInvoiceRequest) -> SwapResult<()> {
        self.post("/v1/invoices/hold", request).await?;
        Ok(())
    }

    async fn lookup_invoice(&self, hash: &SwapHash) -> SwapResult<Option<Invoice>> {
        self.get(&format!("/v1/invoices/{}", hash)).await
    }

    async fn settle_invoice(&self, preimage: &SwapPreimage) -> SwapResult<()> {
        self.post(
            "/v1/invoices/settle",
            &serde_json::json!({ "preimage": preimage }),
        )
        .await?;
        Ok(())
    }

    async fn cancel_invoice(&self, hash: &SwapHash) -> SwapResult<()> {
        self.post(&format!("/v1/invoices/{}/cancel", hash), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn send_payment(&self, request: &PaymentRequest) -> SwapResult<Payment> {
        Ok(self.post("/v1/payments", request).await?.json().await?)
    }

    async fn lookup_payment(&self, hash: &SwapHash) -> SwapResult<Option<Payment>> {
        self.get(&format!("/v1/payments/{}", hash)).await
    }
}

pub struct ChannelEngine<N: ChannelNode> {
    node: N,
    asset: String,
    unit: String,
    timing: HopTiming,
    poll_interval: Duration,
    prepared: PreparedSwaps,
    validated: AtomicBool,
    identity: RwLock<Option<String>>,
}

impl<N: ChannelNode> ChannelEngine<N> {
    pub fn new(node: N, asset: &str, unit: &str, timing: HopTiming, poll_interval: Duration) -> Self {
        Self {
            node,
            asset: asset.to_string(),
            unit: unit.to_string(),
            timing,
            poll_interval,
            prepared: PreparedSwaps::new(),
            validated: AtomicBool::new(false),
            identity: RwLock::new(None),
        }
    }

    fn check_amount(&self, hash: &SwapHash, amount: &Amount) -> SwapResult<()> {
        if amount.asset() != self.asset || amount.unit() != self.unit {
            return Err(SwapError::permanent(
                *hash,
                format!("{} engine cannot move {}", self.asset, amount),
            ));
        }
        Ok(())
    }

    fn verified(&self, hash: &SwapHash, preimage: Option<SwapPreimage>) -> SwapResult<SwapPreimage> {
        match preimage {
            Some(p) if p.matches(hash) => Ok(p),
            Some(_) => Err(SwapError::permanent(*hash, "node returned a mismatched preimage")),
            None => Err(SwapError::Rail(format!("node returned no preimage for {}", hash))),
        }
    }

    /// Follow a payment until it leaves the in-flight state
    async fn resolve_payment(
        &self,
        mut payment: Payment,
        max_time: DateTime<Utc>,
    ) -> SwapResult<SwapPreimage> {
        let hash = payment.hash;
        loop {
            match payment.status {
                PaymentStatus::Succeeded => return self.verified(&hash, payment.preimage),
                PaymentStatus::Failed => {
                    return Err(classify_failure(&hash, payment.failure, max_time))
                }
                PaymentStatus::InFlight => {
                    debug!(hash = %hash, "Payment in flight");
                    tokio::time::sleep(self.poll_interval).await;
                    payment = self
                        .node
                        .lookup_payment(&hash)
                        .await?
                        .ok_or(SwapError::UnknownSwap(hash))?;
                }
            }
        }
    }
}

fn classify_failure(
    hash: &SwapHash,
    failure: Option<PaymentFailure>,
    max_time: DateTime<Utc>,
) -> SwapError {
    match failure {
        Some(PaymentFailure::IncorrectPaymentDetails) => {
            SwapError::permanent(*hash, "recipient rejected payment details")
        }
        Some(PaymentFailure::Timeout) if Utc::now() >= max_time => SwapError::Expired(*hash),
        other => SwapError::Rail(format!("payment for {} failed: {:?}", hash, other)),
    }
}

#[async_trait]
impl<N: ChannelNode> SwapEngine for ChannelEngine<N> {
    fn kind(&self) -> EngineKind {
        EngineKind::LedgerChannel
    }

    fn asset(&self) -> &str {
        &self.asset
    }

    fn time_lock_params(&self) -> HopTiming {
        self.timing
    }

    fn is_validated(&self) -> bool {
        self.validated.load(Ordering::SeqCst)
    }

    async fn validate(&self) -> SwapResult<()> {
        let result = self.node.get_info().await.and_then(|info| {
            if info.synced_to_chain {
                Ok(info)
            } else {
                Err(SwapError::Rail("node is not synced to chain".to_string()))
            }
        });

        match result {
            Ok(info) => {
                *self.identity.write().await = Some(info.identity_pubkey);
                self.validated.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.validated.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn prepare_swap(
        &self,
        hash: &SwapHash,
        amount: &Amount,
        expiration: DateTime<Utc>,
        timelock_delta: u64,
    ) -> SwapResult<()> {
        self.check_amount(hash, amount)?;
        let terms = PreparedSwap {
            amount: amount.clone(),
            expiration,
            timelock_delta,
        };

        if self.prepared.check(hash, &terms)? == Preparation::Duplicate {
            debug!(hash = %hash, "Invoice already prepared");
            return Ok(());
        }

        // A previous process may already have created the invoice.
        if let Some(invoice) = self.node.lookup_invoice(hash).await? {
            if invoice.value != amount.value() || invoice.cltv_expiry_secs != timelock_delta {
                return Err(SwapError::TermsMismatch {
                    hash: *hash,
                    detail: format!(
                        "existing invoice for {} sat, cltv {}",
                        invoice.value, invoice.cltv_expiry_secs
                    ),
                });
            }
            self.prepared.record(hash, terms)?;
            return Ok(());
        }

        if Utc::now() >= expiration {
            return Err(SwapError::Expired(*hash));
        }

        self.node
            .add_hold_invoice(&HoldInvoiceRequest {
                hash: *hash,
                value: amount.value(),
                expires_at: expiration,
                cltv_expiry_secs: timelock_delta,
            })
            .await?;
        self.prepared.record(hash, terms)?;

        info!(hash = %hash, amount = %amount, "Hold invoice created");
        Ok(())
    }

    async fn wait_for_swap_commitment(&self, hash: &SwapHash) -> SwapResult<DateTime<Utc>> {
        loop {
            let invoice = self
                .node
                .lookup_invoice(hash)
                .await?
                .ok_or(SwapError::UnknownSwap(*hash))?;

            match invoice.state {
                InvoiceState::Accepted => {
                    return Ok(invoice.accepted_at.unwrap_or_else(Utc::now));
                }
                InvoiceState::Settled => return Err(SwapError::Settled(*hash)),
                InvoiceState::Canceled => return Err(SwapError::Canceled(*hash)),
                InvoiceState::Open if Utc::now() >= invoice.expires_at => {
                    return Err(SwapError::Expired(*hash));
                }
                InvoiceState::Open => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn translate_swap(
        &self,
        address: &str,
        hash: &SwapHash,
        amount: &Amount,
        max_time: DateTime<Utc>,
    ) -> SwapResult<SwapPreimage> {
        self.check_amount(hash, amount)?;

        // Resume rather than double-pay when a prior attempt already paid.
        if let Some(payment) = self.node.lookup_payment(hash).await? {
            if payment.status != PaymentStatus::Failed {
                info!(hash = %hash, "Resuming existing payment");
                return self.resolve_payment(payment, max_time).await;
            }
        }

        let remaining = (max_time - Utc::now()).num_seconds();
        if remaining <= 0 {
            return Err(SwapError::Expired(*hash));
        }

        info!(hash = %hash, destination = address, amount = %amount, "Sending payment");
        let payment = self
            .node
            .send_payment(&PaymentRequest {
                destination: address.to_string(),
                hash: *hash,
                value: amount.value(),
                final_cltv_delta_secs: self.timing.final_hop_time_lock,
                timeout_secs: remaining as u64,
            })
            .await?;

        self.resolve_payment(payment, max_time).await
    }

    async fn get_settled_swap_preimage(&self, hash: &SwapHash) -> SwapResult<SwapPreimage> {
        let invoice = self
            .node
            .lookup_invoice(hash)
            .await?
            .ok_or(SwapError::UnknownSwap(*hash))?;

        if invoice.state != InvoiceState::Settled {
            return Err(SwapError::Rail(format!(
                "invoice {} is {:?}, not settled",
                hash, invoice.state
            )));
        }
        self.verified(hash, invoice.preimage)
    }

    async fn cancel_swap(&self, hash: &SwapHash) -> SwapResult<()> {
        if let Err(e) = self.node.cancel_invoice(hash).await {
            match self.node.lookup_invoice(hash).await {
                Ok(Some(invoice)) if invoice.state == InvoiceState::Canceled => {
                    debug!(hash = %hash, "Invoice was already canceled");
                }
                _ => return Err(e),
            }
        }
        info!(hash = %hash, "Hold invoice canceled");
        Ok(())
    }

    async fn settle_swap(&self, preimage: &SwapPreimage) -> SwapResult<()> {
        let hash = preimage.hash();
        if let Err(e) = self.node.settle_invoice(preimage).await {
            match self.node.lookup_invoice(&hash).await {
                Ok(Some(invoice)) if invoice.state == InvoiceState::Settled => {
                    debug!(hash = %hash, "Invoice was already settled");
                }
                _ => {
                    warn!(hash = %hash, "Failed to settle invoice: {}", e);
                    return Err(e);
                }
            }
        }
        info!(hash = %hash, "Hold invoice settled");
        Ok(())
    }

    async fn get_payment_channel_network_address(&self) -> SwapResult<String> {
        if let Some(identity) = self.identity.read().await.clone() {
            return Ok(identity);
        }
        let info = self.node.get_info().await?;
        *self.identity.write().await = Some(info.identity_pubkey.clone());
        Ok(info.identity_pubkey)
    }

    async fn swap_status(&self, hash: &SwapHash) -> SwapResult<SwapStatus> {
        let status = match self.node.lookup_payment(hash).await? {
            None => SwapStatus::NotFound,
            Some(payment) => match payment.status {
                PaymentStatus::InFlight => SwapStatus::Committed,
                PaymentStatus::Succeeded => SwapStatus::Complete,
                PaymentStatus::Failed => SwapStatus::Canceled,
            },
        };
        Ok(status)
    }
}
