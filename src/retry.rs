//! Retry helpers shared by the forwarder and the trade orchestrator

use crate::engine::SwapEngine;
use crate::types::SwapHash;

use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bounded retry policy for best-effort inbound cancellation
#[derive(Debug, Clone, Copy)]
pub struct CancelPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(10),
        }
    }
}

/// Try to cancel the inbound leg, giving up quietly after `policy.attempts`.
///
/// Never fails: the inbound leg's own expiration is the backstop. Returns
/// whether the cancel went through.
pub async fn cancel_with_retry(
    engine: &dyn SwapEngine,
    hash: &SwapHash,
    policy: CancelPolicy,
) -> bool {
    let mut attempts = 0;

    while attempts < policy.attempts {
        attempts += 1;
        crate::metrics::record_cancel_attempt(engine.asset());

        match engine.cancel_swap(hash).await {
            Ok(()) => {
                info!(hash = %hash, "Canceled inbound swap (attempt {}/{})", attempts, policy.attempts);
                return true;
            }
            Err(e) => {
                warn!(
                    hash = %hash,
                    "Failed to cancel inbound swap (attempt {}/{}): {}",
                    attempts, policy.attempts, e
                );
            }
        }

        if attempts < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    error!(
        hash = %hash,
        "Giving up on canceling inbound swap after {} attempts", policy.attempts
    );
    false
}

/// Outcome of one operation in [`settle_all`]
#[derive(Debug)]
pub enum Settled<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settled<T, E> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settled::Fulfilled(_))
    }
}

impl<T, E> From<Result<T, E>> for Settled<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Settled::Fulfilled(v),
            Err(e) => Settled::Rejected(e),
        }
    }
}

/// Run every operation to completion and report each outcome in input order
pub async fn settle_all<I, F, T, E>(operations: I) -> Vec<Settled<T, E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    join_all(operations)
        .await
        .into_iter()
        .map(Settled::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{CallCounts, FakeEngine};
    use crate::error::SwapError;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_on_first_success() {
        let engine = FakeEngine::new("BTC");
        engine.push_cancel(Err(SwapError::Rail("busy".into())));
        engine.push_cancel(Ok(()));

        let start = Instant::now();
        let hash = SwapHash::from_bytes([1; 32]);
        assert!(cancel_with_retry(&engine, &hash, CancelPolicy::default()).await);

        assert_eq!(CallCounts::get(&engine.calls.cancel), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_gives_up_silently() {
        let engine = FakeEngine::new("BTC");
        for _ in 0..10 {
            engine.push_cancel(Err(SwapError::Rail("down".into())));
        }

        let start = Instant::now();
        let hash = SwapHash::from_bytes([2; 32]);
        assert!(!cancel_with_retry(&engine, &hash, CancelPolicy::default()).await);

        assert_eq!(CallCounts::get(&engine.calls.cancel), 10);
        // No delay after the final attempt.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(90) && elapsed < Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_settle_all_keeps_going_past_failures() {
        let ops = (0..4).map(|i| async move {
            if i % 2 == 0 {
                Ok(i)
            } else {
                Err(format!("op {} failed", i))
            }
        });

        let outcomes = settle_all(ops).await;
        assert_eq!(outcomes.len(), 4);
        assert!(matches!(outcomes[0], Settled::Fulfilled(0)));
        assert!(matches!(&outcomes[1], Settled::Rejected(e) if e == "op 1 failed"));
        assert!(outcomes[2].is_fulfilled());
        assert!(!outcomes[3].is_fulfilled());
    }

    #[tokio::test]
    async fn test_settle_all_empty() {
        let ops: Vec<std::future::Ready<Result<(), ()>>> = Vec::new();
        assert!(settle_all(ops).await.is_empty());
    }
}
