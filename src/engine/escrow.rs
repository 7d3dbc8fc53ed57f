//! Custodial-escrow engine
//!
//! The escrow service only answers request/response calls, so every wait
//! here is a poll loop. Incoming escrows carry the inbound leg; outgoing
//! escrows carry the outbound payment and expire at a fixed timestamp.

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
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowDirection {
    Incoming,
    Outgoing,
}

impl EscrowDirection {
    fn as_path(&self) -> &'static str {
        match self {
            EscrowDirection::Incoming => "incoming",
            EscrowDirection::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    /// Awaiting funds
    Created,
    /// Funds held against the hash
    Committed,
    Complete,
    Canceled,
    Expired,
    /// Recipient refused the escrow terms
    Rejected,
}

impl From<EscrowStatus> for SwapStatus {
    fn from(status: EscrowStatus) -> Self {
        match status {
            EscrowStatus::Created => SwapStatus::Created,
            EscrowStatus::Committed => SwapStatus::Committed,
            EscrowStatus::Complete => SwapStatus::Complete,
            EscrowStatus::Canceled | EscrowStatus::Rejected => SwapStatus::Canceled,
            EscrowStatus::Expired => SwapStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub hash: SwapHash,
    pub amount: u64,
    pub status: EscrowStatus,
    pub expiration: DateTime<Utc>,
    pub timelock_delta_secs: Option<u64>,
    pub committed_at: Option<DateTime<Utc>>,
    pub preimage: Option<SwapPreimage>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEscrowRequest {
    pub hash: SwapHash,
    pub amount: u64,
    pub expiration: DateTime<Utc>,
    pub timelock_delta_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingEscrowRequest {
    pub recipient: String,
    pub hash: SwapHash,
    pub amount: u64,
    pub expiration: DateTime<Utc>,
}

/// Client for the custodial escrow service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EscrowApi: Send + Sync {
    async fn get_account(&self) -> SwapResult<Account>;
    async fn create_incoming(&self, request: &IncomingEscrowRequest) -> SwapResult<Escrow>;
    async fn create_outgoing(&self, request: &OutgoingEscrowRequest) -> SwapResult<Escrow>;
    async fn get_escrow(
        &self,
        direction: EscrowDirection,
        hash: &SwapHash,
    ) -> SwapResult<Option<Escrow>>;
    async fn complete_escrow(&self, preimage: &SwapPreimage) -> SwapResult<()>;
    async fn cancel_escrow(&self, hash: &SwapHash) -> SwapResult<()>;
}

pub struct RestEscrowApi {
    client: reqwest::Client,
    base_url: String,
}

impl RestEscrowApi {
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
impl EscrowApi for RestEscrowApi {
    async fn get_account(&self) -> SwapResult<Account> {
        self.get("/v1/account")
            .await?
            .ok_or_else(|| SwapError::Rail("escrow account unavailable".to_string()))
    }

    async fn create_incoming(&self, request: &IncomingEscrowRequest) -> SwapResult<Escrow> {
        Ok(self
            .post("/v1/escrows/incoming", request)
            .await?
            .json()
            .await?)
    }

    async fn create_outgoing(&self, request: &OutgoingEscrowRequest) -> SwapResult<Escrow> {
        Ok(self
            .post("/v1/escrows/outgoing", request)
            .await?
            .json()
            .await?)
    }

    async fn get_escrow(
        &self,
        direction: EscrowDirection,
        hash: &SwapHash,
    ) -> SwapResult<Option<Escrow>> {
        self.get(&format!("/v1/escrows/{}/{}", direction.as_path(), hash))
            .await
    }

    async fn complete_escrow(&self, preimage: &SwapPreimage) -> SwapResult<()> {
        self.post(
            &format!("/v1/escrows/incoming/{}/complete", preimage.hash()),
            &serde_json::json!({ "preimage": preimage }),
        )
        .await?;
        Ok(())
    }

    async fn cancel_escrow(&self, hash: &SwapHash) -> SwapResult<()> {
        self.post(
            &format!("/v1/escrows/incoming/{}/cancel", hash),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }
}

pub struct EscrowEngine<A: EscrowApi> {
    api: A,
    asset: String,
    unit: String,
    timing: HopTiming,
    poll_interval: Duration,
    prepared: PreparedSwaps,
    validated: AtomicBool,
    address: RwLock<Option<String>>,
}

impl<A: EscrowApi> EscrowEngine<A> {
    pub fn new(api: A, asset: &str, unit: &str, timing: HopTiming, poll_interval: Duration) -> Self {
        Self {
            api,
            asset: asset.to_string(),
            unit: unit.to_string(),
            timing,
            poll_interval,
            prepared: PreparedSwaps::new(),
            validated: AtomicBool::new(false),
            address: RwLock::new(None),
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

    async fn incoming(&self, hash: &SwapHash) -> SwapResult<Escrow> {
        self.api
            .get_escrow(EscrowDirection::Incoming, hash)
            .await?
            .ok_or(SwapError::UnknownSwap(*hash))
    }
}

#[async_trait]
impl<A: EscrowApi> SwapEngine for EscrowEngine<A> {
    fn kind(&self) -> EngineKind {
        EngineKind::CustodialEscrow
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
        let result = self.api.get_account().await.and_then(|account| {
            if account.verified {
                Ok(account)
            } else {
                Err(SwapError::Rail("escrow account is not verified".to_string()))
            }
        });

        match result {
            Ok(account) => {
                *self.address.write().await = Some(account.address);
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
            debug!(hash = %hash, "Escrow already prepared");
            return Ok(());
        }

        if let Some(escrow) = self.api.get_escrow(EscrowDirection::Incoming, hash).await? {
            let delta_differs = escrow
                .timelock_delta_secs
                .map_or(false, |delta| delta != timelock_delta);
            if escrow.amount != amount.value() || escrow.expiration != expiration || delta_differs
            {
                return Err(SwapError::TermsMismatch {
                    hash: *hash,
                    detail: format!(
                        "existing escrow for {} expiring {} with delta {:?}",
                        escrow.amount, escrow.expiration, escrow.timelock_delta_secs
                    ),
                });
            }
            self.prepared.record(hash, terms)?;
            return Ok(());
        }

        if Utc::now() >= expiration {
            return Err(SwapError::Expired(*hash));
        }

        self.api
            .create_incoming(&IncomingEscrowRequest {
                hash: *hash,
                amount: amount.value(),
                expiration,
                timelock_delta_secs: timelock_delta,
            })
            .await?;
        self.prepared.record(hash, terms)?;

        info!(hash = %hash, amount = %amount, "Incoming escrow created");
        Ok(())
    }

    async fn wait_for_swap_commitment(&self, hash: &SwapHash) -> SwapResult<DateTime<Utc>> {
        loop {
            let escrow = self.incoming(hash).await?;
            match escrow.status {
                EscrowStatus::Committed => {
                    return Ok(escrow.committed_at.unwrap_or_else(Utc::now));
                }
                EscrowStatus::Complete => return Err(SwapError::Settled(*hash)),
                EscrowStatus::Canceled | EscrowStatus::Rejected => {
                    return Err(SwapError::Canceled(*hash))
                }
                EscrowStatus::Expired => return Err(SwapError::Expired(*hash)),
                EscrowStatus::Created if Utc::now() >= escrow.expiration => {
                    return Err(SwapError::Expired(*hash));
                }
                EscrowStatus::Created => tokio::time::sleep(self.poll_interval).await,
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

        let mut escrow = match self.api.get_escrow(EscrowDirection::Outgoing, hash).await? {
            Some(existing) => {
                if existing.amount != amount.value() {
                    return Err(SwapError::permanent(
                        *hash,
                        format!("outgoing escrow exists for {}", existing.amount),
                    ));
                }
                info!(hash = %hash, "Resuming existing outgoing escrow");
                existing
            }
            None => {
                if Utc::now() >= max_time {
                    return Err(SwapError::Expired(*hash));
                }
                info!(hash = %hash, recipient = address, amount = %amount, "Creating outgoing escrow");
                self.api
                    .create_outgoing(&OutgoingEscrowRequest {
                        recipient: address.to_string(),
                        hash: *hash,
                        amount: amount.value(),
                        expiration: max_time,
                    })
                    .await?
            }
        };

        loop {
            match escrow.status {
                EscrowStatus::Complete => {
                    return match escrow.preimage {
                        Some(p) if p.matches(hash) => Ok(p),
                        Some(_) => Err(SwapError::permanent(
                            *hash,
                            "escrow completed with a mismatched preimage",
                        )),
                        None => Err(SwapError::Rail(format!(
                            "escrow {} completed without a preimage",
                            hash
                        ))),
                    };
                }
                EscrowStatus::Canceled => return Err(SwapError::Canceled(*hash)),
                EscrowStatus::Expired => return Err(SwapError::Expired(*hash)),
                EscrowStatus::Rejected => {
                    return Err(SwapError::permanent(
                        *hash,
                        escrow
                            .rejection_reason
                            .unwrap_or_else(|| "rejected by recipient".to_string()),
                    ))
                }
                EscrowStatus::Created | EscrowStatus::Committed => {
                    tokio::time::sleep(self.poll_interval).await;
                    escrow = self
                        .api
                        .get_escrow(EscrowDirection::Outgoing, hash)
                        .await?
                        .ok_or(SwapError::UnknownSwap(*hash))?;
                }
            }
        }
    }

    async fn get_settled_swap_preimage(&self, hash: &SwapHash) -> SwapResult<SwapPreimage> {
        let escrow = self.incoming(hash).await?;
        match (escrow.status, escrow.preimage) {
            (EscrowStatus::Complete, Some(p)) if p.matches(hash) => Ok(p),
            (EscrowStatus::Complete, Some(_)) => Err(SwapError::permanent(
                *hash,
                "escrow completed with a mismatched preimage",
            )),
            (status, _) => Err(SwapError::Rail(format!(
                "escrow {} is {:?}, not complete",
                hash, status
            ))),
        }
    }

    async fn cancel_swap(&self, hash: &SwapHash) -> SwapResult<()> {
        if let Err(e) = self.api.cancel_escrow(hash).await {
            match self.api.get_escrow(EscrowDirection::Incoming, hash).await {
                Ok(Some(escrow)) if escrow.status == EscrowStatus::Canceled => {
                    debug!(hash = %hash, "Escrow was already canceled");
                }
                _ => return Err(e),
            }
        }
        info!(hash = %hash, "Incoming escrow canceled");
        Ok(())
    }

    async fn settle_swap(&self, preimage: &SwapPreimage) -> SwapResult<()> {
        let hash = preimage.hash();
        if let Err(e) = self.api.complete_escrow(preimage).await {
            match self.api.get_escrow(EscrowDirection::Incoming, &hash).await {
                Ok(Some(escrow)) if escrow.status == EscrowStatus::Complete => {
                    debug!(hash = %hash, "Escrow was already complete");
                }
                _ => return Err(e),
            }
        }
        info!(hash = %hash, "Incoming escrow completed");
        Ok(())
    }

    async fn get_payment_channel_network_address(&self) -> SwapResult<String> {
        if let Some(address) = self.address.read().await.clone() {
            return Ok(address);
        }
        let account = self.api.get_account().await?;
        *self.address.write().await = Some(account.address.clone());
        Ok(account.address)
    }

    async fn swap_status(&self, hash: &SwapHash) -> SwapResult<SwapStatus> {
        Ok(self
            .api
            .get_escrow(EscrowDirection::Outgoing, hash)
            .await?
            .map_or(SwapStatus::NotFound, |escrow| escrow.status.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};

    fn engine(api: MockEscrowApi) -> EscrowEngine<MockEscrowApi> {
        let timing = HopTiming {
            final_hop_time_lock: 600,
            block_buffer: 60,
            retrieve_window: 120,
            claim_window: 300,
        };
        EscrowEngine::new(api, "USD", "cent", timing, Duration::from_millis(10))
    }

    fn preimage() -> SwapPreimage {
        SwapPreimage::from_bytes([5; 32])
    }

    fn escrow(status: EscrowStatus) -> Escrow {
        Escrow {
            hash: preimage().hash(),
            amount: 2500,
            status,
            expiration: Utc::now() + chrono::Duration::minutes(10),
            timelock_delta_secs: None,
            committed_at: None,
            preimage: None,
            rejection_reason: None,
        }
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let mut api = MockEscrowApi::new();
        api.expect_get_escrow().times(1).returning(|_, _| Ok(None));
        api.expect_create_incoming()
            .times(1)
            .returning(|_| Ok(escrow(EscrowStatus::Created)));
        let engine = engine(api);

        let hash = preimage().hash();
        let amount = Amount::new("USD", "cent", 2500);
        let expiration = Utc::now() + chrono::Duration::seconds(5);

        engine.prepare_swap(&hash, &amount, expiration, 900).await.unwrap();
        engine.prepare_swap(&hash, &amount, expiration, 900).await.unwrap();
        assert!(matches!(
            engine
                .prepare_swap(&hash, &Amount::new("USD", "cent", 1), expiration, 900)
                .await,
            Err(SwapError::TermsMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_prepare_adopts_existing_escrow_only_on_same_delta() {
        let expiration = Utc::now() + chrono::Duration::seconds(5);
        let existing = move || Escrow {
            expiration,
            timelock_delta_secs: Some(900),
            ..escrow(EscrowStatus::Created)
        };
        let mut api = MockEscrowApi::new();
        api.expect_get_escrow()
            .times(2)
            .returning(move |_, _| Ok(Some(existing())));
        api.expect_create_incoming().never();
        let hash = preimage().hash();
        let amount = Amount::new("USD", "cent", 2500);

        let engine = engine(api);

        let err = engine
            .prepare_swap(&hash, &amount, expiration, 1200)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::TermsMismatch { .. }));
        engine.prepare_swap(&hash, &amount, expiration, 900).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_commitment_statuses() {
        let cases = [
            (EscrowStatus::Complete, "settled"),
            (EscrowStatus::Canceled, "canceled"),
            (EscrowStatus::Rejected, "canceled"),
            (EscrowStatus::Expired, "expired"),
        ];
        for (status, expected) in cases {
            let mut api = MockEscrowApi::new();
            api.expect_get_escrow()
                .with(eq(EscrowDirection::Incoming), always())
                .returning(move |_, _| Ok(Some(escrow(status))));
            let err = engine(api)
                .wait_for_swap_commitment(&preimage().hash())
                .await
                .unwrap_err();
            let actual = match err {
                SwapError::Settled(_) => "settled",
                SwapError::Canceled(_) => "canceled",
                SwapError::Expired(_) => "expired",
                _ => "other",
            };
            assert_eq!(actual, expected, "status {:?}", status);
        }
    }

    #[tokio::test]
    async fn test_translate_polls_outgoing_escrow_to_completion() {
        let mut api = MockEscrowApi::new();
        let mut lookups = 0;
        api.expect_get_escrow()
            .with(eq(EscrowDirection::Outgoing), always())
            .returning(move |_, _| {
                lookups += 1;
                match lookups {
                    1 => Ok(None),
                    2 => Ok(Some(escrow(EscrowStatus::Committed))),
                    _ => {
                        let mut done = escrow(EscrowStatus::Complete);
                        done.preimage = Some(preimage());
                        Ok(Some(done))
                    }
                }
            });
        api.expect_create_outgoing()
            .withf(|req| req.recipient == "acct-42" && req.amount == 2500)
            .times(1)
            .returning(|_| Ok(escrow(EscrowStatus::Created)));

        let result = engine(api)
            .translate_swap(
                "acct-42",
                &preimage().hash(),
                &Amount::new("USD", "cent", 2500),
                Utc::now() + chrono::Duration::minutes(30),
            )
            .await
            .unwrap();
        assert_eq!(result, preimage());
    }

    #[tokio::test]
    async fn test_translate_rejected_escrow_is_permanent() {
        let mut api = MockEscrowApi::new();
        api.expect_get_escrow().returning(|_, _| {
            let mut rejected = escrow(EscrowStatus::Rejected);
            rejected.rejection_reason = Some("amount below minimum".into());
            Ok(Some(rejected))
        });

        let err = engine(api)
            .translate_swap(
                "acct-42",
                &preimage().hash(),
                &Amount::new("USD", "cent", 2500),
                Utc::now() + chrono::Duration::minutes(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::Permanent { reason, .. } if reason == "amount below minimum"));
    }

    #[tokio::test]
    async fn test_settled_preimage_must_match_hash() {
        let mut api = MockEscrowApi::new();
        api.expect_get_escrow().returning(|_, _| {
            let mut done = escrow(EscrowStatus::Complete);
            done.preimage = Some(SwapPreimage::from_bytes([9; 32]));
            Ok(Some(done))
        });

        let err = engine(api)
            .get_settled_swap_preimage(&preimage().hash())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::Permanent { .. }));
    }

    #[tokio::test]
    async fn test_swap_status_reflects_outgoing_escrow() {
        let mut api = MockEscrowApi::new();
        api.expect_get_escrow()
            .with(eq(EscrowDirection::Outgoing), always())
            .returning(|_, _| Ok(Some(escrow(EscrowStatus::Complete))));
        assert_eq!(
            engine(api).swap_status(&preimage().hash()).await.unwrap(),
            SwapStatus::Complete
        );

        let mut api = MockEscrowApi::new();
        api.expect_get_escrow().returning(|_, _| Ok(None));
        assert_eq!(
            engine(api).swap_status(&preimage().hash()).await.unwrap(),
            SwapStatus::NotFound
        );
    }

    #[tokio::test]
    async fn test_cancel_treats_already_canceled_as_success() {
        let mut api = MockEscrowApi::new();
        api.expect_cancel_escrow()
            .returning(|_| Err(SwapError::Rail("409 already canceled".into())));
        api.expect_get_escrow()
            .returning(|_, _| Ok(Some(escrow(EscrowStatus::Canceled))));

        engine(api).cancel_swap(&preimage().hash()).await.unwrap();
    }
}
