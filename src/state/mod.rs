//! Trade persistence
//!
//! Rows are written once on creation and finalized once; every finalizing
//! write is gated on `end_time` still being unset.

pub mod manager;
pub mod trade;

#[cfg(test)]
pub mod memory;

pub use manager::StateManager;
pub use trade::{FailureCode, Quote, Trade, TradeId, TradeStats, TradeStatus};

use crate::error::ForwarderResult;
use crate::types::{SwapHash, SwapPreimage};

use async_trait::async_trait;

/// Store contract the orchestrator depends on
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn create_trade(&self, quote: &Quote) -> ForwarderResult<TradeId>;

    async fn get_trade(&self, id: TradeId) -> ForwarderResult<Trade>;

    /// Trades with no `end_time`
    async fn get_pending_trades(&self) -> ForwarderResult<Vec<Trade>>;

    /// Most recent trades first
    async fn list_trades(&self, limit: u32) -> ForwarderResult<Vec<Trade>>;

    async fn mark_complete(
        &self,
        id: TradeId,
        hash: &SwapHash,
        preimage: &SwapPreimage,
    ) -> ForwarderResult<()>;

    async fn mark_failed(&self, id: TradeId, failure_code: FailureCode) -> ForwarderResult<()>;

    async fn stats(&self) -> ForwarderResult<TradeStats>;

    async fn health_check(&self) -> ForwarderResult<()> {
        Ok(())
    }
}
