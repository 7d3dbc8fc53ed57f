//! Trade lifecycle orchestration
//!
//! A trade moves `Created → PreparingInbound → AwaitingResolution` and ends
//! either completed or failed. The destination-asset engine holds the inbound
//! leg; the source-asset engine pays the counterparty on the outbound leg.

use super::forwarder::{Forwarder, OutboundPayment};
use crate::config::ForwarderConfig;
use crate::counterparty::CounterpartyServer;
use crate::engine::{EngineSet, SwapEngine};
use crate::error::{ForwarderError, ForwarderResult, SwapError};
use crate::events::{TradeEvents, TradeUpdateKind};
use crate::retry::{cancel_with_retry, settle_all, CancelPolicy, Settled};
use crate::state::{FailureCode, Quote, Trade, TradeId, TradeStore};
use crate::timelock::{Hops, TimeLocks};
use crate::types::SwapPreimage;

use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStage {
    Created,
    PreparingInbound,
    AwaitingResolution,
    Completed,
    Failed,
}

impl fmt::Display for TradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TradeStage::Created => "created",
            TradeStage::PreparingInbound => "preparing_inbound",
            TradeStage::AwaitingResolution => "awaiting_resolution",
            TradeStage::Completed => "completed",
            TradeStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A failed attempt at a trade and the code it would be finalized with
#[derive(Debug)]
pub struct TradeFailure {
    pub code: FailureCode,
    pub error: ForwarderError,
}

impl TradeFailure {
    fn new(code: FailureCode, error: impl Into<ForwarderError>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }

    fn forward(error: SwapError) -> Self {
        let code = if error.is_terminal() {
            FailureCode::PermanentForwardError
        } else {
            FailureCode::Unknown
        };
        Self::new(code, error)
    }
}

/// Outcome counts of a startup replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Removes a trade from the active set when dropped
struct ActiveTrade<'a> {
    active: &'a DashSet<TradeId>,
    id: TradeId,
}

impl Drop for ActiveTrade<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

pub struct TradeOrchestrator {
    store: Arc<dyn TradeStore>,
    server: Arc<dyn CounterpartyServer>,
    engines: Arc<EngineSet>,
    forwarder: Forwarder,
    events: TradeEvents,
    config: ForwarderConfig,
    /// Trades currently being driven by this process
    active: DashSet<TradeId>,
    replayed: AtomicBool,
}

impl TradeOrchestrator {
    pub fn new(
        store: Arc<dyn TradeStore>,
        server: Arc<dyn CounterpartyServer>,
        engines: Arc<EngineSet>,
        events: TradeEvents,
        config: ForwarderConfig,
    ) -> Self {
        let forwarder = Forwarder::new(config.retry_delay(), cancel_policy(&config));
        Self {
            store,
            server,
            engines,
            forwarder,
            events,
            config,
            active: DashSet::new(),
            replayed: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &TradeEvents {
        &self.events
    }

    /// Persist a new trade for an accepted quote
    pub async fn create_trade(&self, quote: Quote) -> ForwarderResult<TradeId> {
        // Reject quotes for assets no engine handles before anything is stored.
        self.engines.get(quote.source_amount.asset())?;
        self.engines.get(quote.destination_amount.asset())?;

        let id = self.store.create_trade(&quote).await?;
        self.events.publish(id, TradeUpdateKind::Inserted);
        crate::metrics::record_trade_created(
            quote.source_amount.asset(),
            quote.destination_amount.asset(),
        );

        info!(
            trade_id = %id,
            hash = %quote.hash,
            stage = %TradeStage::Created,
            "Trade created: {} for {}",
            quote.source_amount,
            quote.destination_amount
        );
        Ok(id)
    }

    /// Drive a stored trade once; any failure finalizes it
    pub async fn execute_trade(&self, id: TradeId) -> ForwarderResult<SwapPreimage> {
        let trade = self.store.get_trade(id).await?;
        if trade.is_finalized() {
            return Err(ForwarderError::TradeFinalized {
                trade_id: id.to_string(),
            });
        }
        let _active = self.claim(id)?;

        match self.attempt(&trade).await {
            Ok(preimage) => {
                self.complete(&trade, &preimage).await?;
                Ok(preimage)
            }
            Err(failure) => {
                self.fail(&trade, failure.code).await?;
                Err(failure.error)
            }
        }
    }

    /// Re-drive every pending trade once the engines are ready.
    ///
    /// Runs at most once per process; later calls return `None`.
    pub async fn replay_pending_trades(&self) -> ForwarderResult<Option<ReplaySummary>> {
        if self.replayed.swap(true, Ordering::SeqCst) {
            debug!("Pending trades already replayed");
            return Ok(None);
        }

        while !self.engines.all_validated() {
            debug!("Waiting for engines to validate before replay");
            tokio::time::sleep(self.config.readiness_poll()).await;
        }

        let pending = self.store.get_pending_trades().await?;
        info!("Replaying {} pending trade(s)", pending.len());

        let outcomes = settle_all(pending.iter().map(|trade| self.replay_trade(trade))).await;

        let mut summary = ReplaySummary {
            replayed: outcomes.len(),
            ..Default::default()
        };
        for (trade, outcome) in pending.iter().zip(&outcomes) {
            match outcome {
                Settled::Fulfilled(_) => summary.completed += 1,
                Settled::Rejected(e) => {
                    warn!(trade_id = %trade.id, "Replayed trade did not complete: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Replay finished: {} completed, {} failed",
            summary.completed, summary.failed
        );
        Ok(Some(summary))
    }

    /// Retry a pending trade until it resolves or its outer window closes
    async fn replay_trade(&self, trade: &Trade) -> ForwarderResult<SwapPreimage> {
        let _active = self.claim(trade.id)?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            // Timing depends on live engine state, so recompute each pass.
            let (inbound, outbound) = self.legs(trade)?;
            let locks = time_locks(inbound.as_ref(), outbound.as_ref());
            if locks.outer_window_elapsed(trade.start_time, Utc::now()) {
                error!(
                    trade_id = %trade.id,
                    hash = %trade.hash,
                    "Outer time-lock window of {}s elapsed, giving up on trade",
                    locks.outer.send
                );
                self.abort(trade, FailureCode::PermanentForwardError, &inbound, &outbound)
                    .await?;
                return Err(SwapError::Expired(trade.hash).into());
            }

            match self.attempt(trade).await {
                Ok(preimage) => {
                    self.complete(trade, &preimage).await?;
                    return Ok(preimage);
                }
                Err(failure) if failure.error.is_retryable() => {
                    warn!(
                        trade_id = %trade.id,
                        "Replay attempt {} failed, retrying in {:?}: {}",
                        attempt,
                        self.config.replay_retry_delay(),
                        failure.error
                    );
                    tokio::time::sleep(self.config.replay_retry_delay()).await;
                }
                Err(failure) => {
                    self.fail(trade, failure.code).await?;
                    return Err(failure.error);
                }
            }
        }
    }

    /// One pass through preparation and resolution, with no persisted effects
    async fn attempt(&self, trade: &Trade) -> Result<SwapPreimage, TradeFailure> {
        let (inbound, outbound) = self
            .legs(trade)
            .map_err(|e| TradeFailure::new(FailureCode::PrepareSwapError, e))?;

        stage(trade, TradeStage::PreparingInbound);
        self.prepare_inbound(trade, inbound.as_ref(), outbound.as_ref())
            .await
            .map_err(|e| TradeFailure::new(FailureCode::PrepareSwapError, e))?;

        stage(trade, TradeStage::AwaitingResolution);
        self.resolve(trade, inbound, outbound).await
    }

    async fn prepare_inbound(
        &self,
        trade: &Trade,
        inbound: &dyn SwapEngine,
        outbound: &dyn SwapEngine,
    ) -> Result<(), SwapError> {
        // Derived from the persisted start time so a replay asks for identical terms.
        let expiration = trade.start_time + self.config.swap_timeout();
        let locks = time_locks(inbound, outbound);

        inbound
            .prepare_swap(
                &trade.hash,
                &trade.destination_amount,
                expiration,
                locks.outer.receive,
            )
            .await
    }

    async fn resolve(
        &self,
        trade: &Trade,
        inbound: Arc<dyn SwapEngine>,
        outbound: Arc<dyn SwapEngine>,
    ) -> Result<SwapPreimage, TradeFailure> {
        let server_failure = |e: ForwarderError| TradeFailure::new(FailureCode::ServerExecuteError, e);

        let destination_address = inbound
            .get_payment_channel_network_address()
            .await
            .map_err(|e| server_failure(e.into()))?;
        let source_address = self
            .server
            .get_address(trade.source_amount.asset())
            .await
            .map_err(server_failure)?;

        self.server
            .execute(&trade.hash, &source_address, &destination_address)
            .await
            .map_err(server_failure)?;
        debug!(trade_id = %trade.id, "Counterparty executing, forwarding swap");

        let payment = OutboundPayment {
            engine: outbound,
            address: source_address,
            amount: trade.source_amount.clone(),
        };
        self.forwarder
            .forward_swap(&trade.hash, inbound.as_ref(), &payment)
            .await
            .map_err(TradeFailure::forward)
    }

    async fn complete(&self, trade: &Trade, preimage: &SwapPreimage) -> ForwarderResult<()> {
        self.store
            .mark_complete(trade.id, &trade.hash, preimage)
            .await?;
        self.events.publish(trade.id, TradeUpdateKind::Updated);

        let latency = (Utc::now() - trade.start_time).num_milliseconds().max(0) as f64 / 1000.0;
        crate::metrics::record_trade_completed(
            trade.source_amount.asset(),
            trade.destination_amount.asset(),
            latency,
        );
        info!(trade_id = %trade.id, hash = %trade.hash, stage = %TradeStage::Completed, "Trade completed");
        Ok(())
    }

    async fn fail(&self, trade: &Trade, code: FailureCode) -> ForwarderResult<()> {
        let (inbound, outbound) = self.legs(trade)?;
        self.abort(trade, code, &inbound, &outbound).await
    }

    /// Finalize the trade as failed, then cancel the inbound leg only if the
    /// outbound leg is known not to be committed.
    async fn abort(
        &self,
        trade: &Trade,
        code: FailureCode,
        inbound: &Arc<dyn SwapEngine>,
        outbound: &Arc<dyn SwapEngine>,
    ) -> ForwarderResult<()> {
        self.store.mark_failed(trade.id, code).await?;
        self.events.publish(trade.id, TradeUpdateKind::Updated);
        crate::metrics::record_trade_failed(code);
        warn!(
            trade_id = %trade.id,
            hash = %trade.hash,
            stage = %TradeStage::Failed,
            failure_code = %code,
            "Trade failed"
        );

        match outbound.swap_status(&trade.hash).await {
            Ok(status) if status.allows_inbound_cancel() => {
                cancel_with_retry(inbound.as_ref(), &trade.hash, cancel_policy(&self.config)).await;
            }
            Ok(status) => {
                error!(
                    trade_id = %trade.id,
                    hash = %trade.hash,
                    "Outbound leg is {:?}, leaving inbound leg in place",
                    status
                );
            }
            Err(e) => {
                error!(
                    trade_id = %trade.id,
                    hash = %trade.hash,
                    "Could not read outbound status, leaving inbound leg in place: {}",
                    e
                );
            }
        }
        Ok(())
    }

    /// Inbound is the destination-asset engine, outbound the source-asset one
    fn legs(&self, trade: &Trade) -> ForwarderResult<(Arc<dyn SwapEngine>, Arc<dyn SwapEngine>)> {
        Ok((
            self.engines.get(trade.destination_amount.asset())?,
            self.engines.get(trade.source_amount.asset())?,
        ))
    }

    fn claim(&self, id: TradeId) -> ForwarderResult<ActiveTrade<'_>> {
        if !self.active.insert(id) {
            return Err(ForwarderError::Internal(format!(
                "trade {} is already being executed",
                id
            )));
        }
        Ok(ActiveTrade {
            active: &self.active,
            id,
        })
    }
}

fn cancel_policy(config: &ForwarderConfig) -> CancelPolicy {
    CancelPolicy {
        attempts: config.cancel_attempts,
        delay: config.cancel_delay(),
    }
}

/// Inbound is the outer hop, outbound the inner one
fn time_locks(inbound: &dyn SwapEngine, outbound: &dyn SwapEngine) -> TimeLocks {
    TimeLocks::compute(Hops {
        outer: &inbound.time_lock_params(),
        inner: &outbound.time_lock_params(),
    })
}

fn stage(trade: &Trade, stage: TradeStage) {
    debug!(trade_id = %trade.id, stage = %stage, "Trade stage");
}
