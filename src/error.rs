//! Error types for the swap forwarder

use crate::types::SwapHash;
use thiserror::Error;

/// Errors raised by a payment rail engine
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Swap {0} is already settled")]
    Settled(SwapHash),

    #[error("Swap {0} was canceled")]
    Canceled(SwapHash),

    #[error("Swap {0} expired")]
    Expired(SwapHash),

    #[error("Swap {hash} failed permanently: {reason}")]
    Permanent { hash: SwapHash, reason: String },

    #[error("Swap {hash} already prepared with different terms: {detail}")]
    TermsMismatch { hash: SwapHash, detail: String },

    #[error("Swap {0} is unknown to the rail")]
    UnknownSwap(SwapHash),

    #[error("Rail error: {0}")]
    Rail(String),

    #[error("Rail transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// How the forwarding protocol reacts to a [`SwapError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Settled,
    Canceled,
    Expired,
    Permanent,
    /// State unknown; retry
    Temporary,
}

impl SwapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SwapError::Settled(_) => ErrorClass::Settled,
            SwapError::Canceled(_) => ErrorClass::Canceled,
            SwapError::Expired(_) => ErrorClass::Expired,
            SwapError::Permanent { .. } => ErrorClass::Permanent,
            _ => ErrorClass::Temporary,
        }
    }

    pub fn permanent(hash: SwapHash, reason: impl Into<String>) -> Self {
        SwapError::Permanent {
            hash,
            reason: reason.into(),
        }
    }

    /// Canceled, expired and permanent errors end a forwarding attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Canceled | ErrorClass::Expired | ErrorClass::Permanent
        )
    }
}

/// Main error type for the forwarder service
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error("Counterparty error: {0}")]
    Counterparty(String),

    #[error("No engine configured for asset {asset}")]
    EngineNotFound { asset: String },

    #[error("Trade {trade_id} not found")]
    TradeNotFound { trade_id: String },

    #[error("Trade {trade_id} is already finalized")]
    TradeFinalized { trade_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForwarderError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            // Same terms are asked for again on every attempt.
            ForwarderError::Swap(SwapError::TermsMismatch { .. }) => false,
            ForwarderError::Swap(e) => e.class() == ErrorClass::Temporary,
            ForwarderError::Database(_) | ForwarderError::Counterparty(_) => true,
            _ => false,
        }
    }
}

/// Result type for forwarder operations
pub type ForwarderResult<T> = Result<T, ForwarderError>;

/// Result type for rail engine operations
pub type SwapResult<T> = Result<T, SwapError>;
