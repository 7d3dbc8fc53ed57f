//! Trade update notifications
//!
//! Every insert and every finalizing update of a trade is published here so
//! API subscribers can follow trades without polling the store.

use crate::state::TradeId;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeUpdateKind {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub id: TradeId,
    pub kind: TradeUpdateKind,
}

impl TradeUpdate {
    pub fn name(&self) -> &'static str {
        match self.kind {
            TradeUpdateKind::Inserted => "trade_inserted",
            TradeUpdateKind::Updated => "trade_updated",
        }
    }
}

/// Broadcast channel for trade updates
#[derive(Clone)]
pub struct TradeEvents {
    sender: broadcast::Sender<TradeUpdate>,
}

impl Default for TradeEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, id: TradeId, kind: TradeUpdateKind) {
        let update = TradeUpdate { id, kind };
        // No subscribers is fine.
        if self.sender.send(update.clone()).is_err() {
            trace!(trade_id = %id, event = update.name(), "No subscribers for trade update");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeUpdate> {
        self.sender.subscribe()
    }
}
