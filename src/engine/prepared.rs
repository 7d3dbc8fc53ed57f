//! In-flight inbound preparations, keyed by swap hash
//!
//! Entries live for the lifetime of the process. After a restart the same
//! terms are re-derived from the persisted trade, so losing them is safe.

use crate::error::{SwapError, SwapResult};
use crate::types::{Amount, SwapHash};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Terms an inbound obligation was prepared with
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSwap {
    pub amount: Amount,
    pub expiration: DateTime<Utc>,
    pub timelock_delta: u64,
}

impl PreparedSwap {
    fn mismatch(&self, other: &PreparedSwap) -> Option<String> {
        if self.amount != other.amount {
            return Some(format!("amount {} != {}", other.amount, self.amount));
        }
        if self.expiration != other.expiration {
            return Some(format!(
                "expiration {} != {}",
                other.expiration, self.expiration
            ));
        }
        if self.timelock_delta != other.timelock_delta {
            return Some(format!(
                "timelock delta {} != {}",
                other.timelock_delta, self.timelock_delta
            ));
        }
        None
    }
}

/// Outcome of checking a preparation against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preparation {
    New,
    Duplicate,
}

#[derive(Default)]
pub struct PreparedSwaps {
    entries: DashMap<SwapHash, PreparedSwap>,
}

impl PreparedSwaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `terms` with any earlier preparation of `hash`
    pub fn check(&self, hash: &SwapHash, terms: &PreparedSwap) -> SwapResult<Preparation> {
        match self.entries.get(hash) {
            None => Ok(Preparation::New),
            Some(existing) => match existing.mismatch(terms) {
                None => Ok(Preparation::Duplicate),
                Some(detail) => Err(SwapError::TermsMismatch {
                    hash: *hash,
                    detail,
                }),
            },
        }
    }

    /// Record a preparation once the rail accepted it
    pub fn record(&self, hash: &SwapHash, terms: PreparedSwap) -> SwapResult<Preparation> {
        match self.entries.entry(*hash) {
            Entry::Vacant(slot) => {
                slot.insert(terms);
                Ok(Preparation::New)
            }
            Entry::Occupied(slot) => match slot.get().mismatch(&terms) {
                None => Ok(Preparation::Duplicate),
                Some(detail) => Err(SwapError::TermsMismatch {
                    hash: *hash,
                    detail,
                }),
            },
        }
    }

    pub fn get(&self, hash: &SwapHash) -> Option<PreparedSwap> {
        self.entries.get(hash).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
