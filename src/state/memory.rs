//! In-memory trade store for orchestrator tests

use super::trade::{FailureCode, Quote, Trade, TradeId, TradeStats};
use super::TradeStore;
use crate::error::{ForwarderError, ForwarderResult};
use crate::types::{SwapHash, SwapPreimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryTradeStore {
    trades: RwLock<HashMap<TradeId, Trade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a trade with a fixed start time, as if left over from a previous run
    pub async fn insert(&self, quote: Quote, start_time: DateTime<Utc>) -> TradeId {
        let trade = Trade::new(quote, start_time);
        let id = trade.id;
        self.trades.write().await.insert(id, trade);
        id
    }

    async fn finalize<F>(&self, id: TradeId, apply: F) -> ForwarderResult<()>
    where
        F: FnOnce(&mut Trade),
    {
        let mut trades = self.trades.write().await;
        let trade = trades.get_mut(&id).ok_or(ForwarderError::TradeNotFound {
            trade_id: id.to_string(),
        })?;
        if trade.is_finalized() {
            return Err(ForwarderError::TradeFinalized {
                trade_id: id.to_string(),
            });
        }
        apply(trade);
        trade.end_time = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn create_trade(&self, quote: &Quote) -> ForwarderResult<TradeId> {
        let mut trades = self.trades.write().await;
        if trades.values().any(|t| t.hash == quote.hash) {
            return Err(ForwarderError::Internal(format!(
                "duplicate trade hash {}",
                quote.hash
            )));
        }
        let trade = Trade::new(quote.clone(), Utc::now());
        let id = trade.id;
        trades.insert(id, trade);
        Ok(id)
    }

    async fn get_trade(&self, id: TradeId) -> ForwarderResult<Trade> {
        self.trades
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ForwarderError::TradeNotFound {
                trade_id: id.to_string(),
            })
    }

    async fn get_pending_trades(&self) -> ForwarderResult<Vec<Trade>> {
        let mut pending: Vec<Trade> = self
            .trades
            .read()
            .await
            .values()
            .filter(|t| !t.is_finalized())
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.start_time);
        Ok(pending)
    }

    async fn list_trades(&self, limit: u32) -> ForwarderResult<Vec<Trade>> {
        let mut all: Vec<Trade> = self.trades.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn mark_complete(
        &self,
        id: TradeId,
        hash: &SwapHash,
        preimage: &SwapPreimage,
    ) -> ForwarderResult<()> {
        if !preimage.matches(hash) {
            return Err(ForwarderError::Internal(format!(
                "preimage does not match hash {}",
                hash
            )));
        }
        let preimage = *preimage;
        self.finalize(id, move |t| t.preimage = Some(preimage)).await
    }

    async fn mark_failed(&self, id: TradeId, failure_code: FailureCode) -> ForwarderResult<()> {
        self.finalize(id, move |t| t.failure_code = Some(failure_code))
            .await
    }

    async fn stats(&self) -> ForwarderResult<TradeStats> {
        let mut stats = TradeStats::default();
        for trade in self.trades.read().await.values() {
            stats.add(trade.status());
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TradeStatus;
    use crate::types::Amount;

    fn quote(preimage: &SwapPreimage) -> Quote {
        Quote {
            hash: preimage.hash(),
            source_amount: Amount::new("BTC", "sat", 10_000),
            destination_amount: Amount::new("USD", "cent", 400),
        }
    }

    #[tokio::test]
    async fn test_finalizing_writes_happen_once() {
        let store = MemoryTradeStore::new();
        let preimage = SwapPreimage::from_bytes([3; 32]);
        let id = store.create_trade(&quote(&preimage)).await.unwrap();

        tokio_test::assert_ok!(store.mark_complete(id, &preimage.hash(), &preimage).await);
        let err = store
            .mark_failed(id, FailureCode::Unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwarderError::TradeFinalized { .. }));

        let trade = store.get_trade(id).await.unwrap();
        assert_eq!(trade.status(), TradeStatus::Complete);
        assert!(store.get_pending_trades().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_preimage_is_rejected() {
        let store = MemoryTradeStore::new();
        let preimage = SwapPreimage::from_bytes([4; 32]);
        let id = store.create_trade(&quote(&preimage)).await.unwrap();

        let wrong = SwapPreimage::from_bytes([5; 32]);
        tokio_test::assert_err!(store.mark_complete(id, &preimage.hash(), &wrong).await);
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }
}
