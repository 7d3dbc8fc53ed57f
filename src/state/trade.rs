//! Persisted trade records

use crate::types::{Amount, SwapHash, SwapPreimage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type TradeId = Uuid;

/// An accepted price quote, the input of a trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub hash: SwapHash,
    pub source_amount: Amount,
    pub destination_amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    PrepareSwapError,
    ServerExecuteError,
    PermanentForwardError,
    Unknown,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::PrepareSwapError => "PREPARE_SWAP_ERROR",
            FailureCode::ServerExecuteError => "SERVER_EXECUTE_ERROR",
            FailureCode::PermanentForwardError => "PERMANENT_FORWARD_ERROR",
            FailureCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARE_SWAP_ERROR" => Ok(FailureCode::PrepareSwapError),
            "SERVER_EXECUTE_ERROR" => Ok(FailureCode::ServerExecuteError),
            "PERMANENT_FORWARD_ERROR" => Ok(FailureCode::PermanentForwardError),
            "UNKNOWN" => Ok(FailureCode::Unknown),
            other => Err(format!("unknown failure code {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Complete,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub hash: SwapHash,
    pub source_amount: Amount,
    pub destination_amount: Amount,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub preimage: Option<SwapPreimage>,
    pub failure_code: Option<FailureCode>,
}

impl Trade {
    pub fn new(quote: Quote, start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            hash: quote.hash,
            source_amount: quote.source_amount,
            destination_amount: quote.destination_amount,
            start_time,
            end_time: None,
            preimage: None,
            failure_code: None,
        }
    }

    /// Status is derived from which fields are set, never stored
    pub fn status(&self) -> TradeStatus {
        if self.end_time.is_none() {
            TradeStatus::Pending
        } else if self.preimage.is_some() {
            TradeStatus::Complete
        } else if self.failure_code.is_some() {
            TradeStatus::Failed
        } else {
            TradeStatus::Unknown
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Counts of trades per derived status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TradeStats {
    pub pending: u64,
    pub complete: u64,
    pub failed: u64,
    pub unknown: u64,
}

impl TradeStats {
    pub fn add(&mut self, status: TradeStatus) {
        self.add_many(status, 1);
    }

    pub fn add_many(&mut self, status: TradeStatus, count: u64) {
        match status {
            TradeStatus::Pending => self.pending += count,
            TradeStatus::Complete => self.complete += count,
            TradeStatus::Failed => self.failed += count,
            TradeStatus::Unknown => self.unknown += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade() -> Trade {
        Trade::new(
            Quote {
                hash: SwapHash::from_bytes([1; 32]),
                source_amount: Amount::new("BTC", "sat", 10_000),
                destination_amount: Amount::new("USD", "cent", 400),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_status_is_derived() {
        let mut t = trade();
        assert_eq!(t.status(), TradeStatus::Pending);

        t.preimage = Some(SwapPreimage::from_bytes([2; 32]));
        assert_eq!(t.status(), TradeStatus::Pending);

        t.end_time = Some(Utc::now());
        assert_eq!(t.status(), TradeStatus::Complete);

        t.preimage = None;
        t.failure_code = Some(FailureCode::ServerExecuteError);
        assert_eq!(t.status(), TradeStatus::Failed);

        t.failure_code = None;
        assert_eq!(t.status(), TradeStatus::Unknown);
    }

    #[test]
    fn test_failure_code_strings() {
        for code in [
            FailureCode::PrepareSwapError,
            FailureCode::ServerExecuteError,
            FailureCode::PermanentForwardError,
            FailureCode::Unknown,
        ] {
            assert_eq!(code.as_str().parse::<FailureCode>().unwrap(), code);
            assert_eq!(
                serde_json::to_string(&code).unwrap(),
                format!("\"{}\"", code.as_str())
            );
        }
        assert!("TIMEOUT".parse::<FailureCode>().is_err());
    }
}
