//! Swap forwarding state machine
//!
//! Given a hash committed on an inbound rail, pay the outbound rail under the
//! same hash, and use the preimage that payment reveals to settle inbound.

use crate::engine::SwapEngine;
use crate::error::{ErrorClass, SwapError, SwapResult};
use crate::retry::{cancel_with_retry, CancelPolicy};
use crate::timelock::{Hops, TimeLocks};
use crate::types::{Amount, SwapHash, SwapPreimage};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where and how much to pay on the outbound rail
#[derive(Clone)]
pub struct OutboundPayment {
    pub engine: Arc<dyn SwapEngine>,
    pub address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    AwaitingCommitment,
    Translating,
    Settling,
    Complete,
    Retrying,
    Aborting,
    Failed,
}

impl fmt::Display for ForwardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForwardState::AwaitingCommitment => "awaiting_commitment",
            ForwardState::Translating => "translating",
            ForwardState::Settling => "settling",
            ForwardState::Complete => "complete",
            ForwardState::Retrying => "retrying",
            ForwardState::Aborting => "aborting",
            ForwardState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the preimage was obtained
enum Retrieved {
    /// Inbound was already settled by an earlier attempt
    AlreadySettled(SwapPreimage),
    /// The outbound payment revealed it; inbound still needs settling
    Translated(SwapPreimage),
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    retry_delay: Duration,
    cancel_policy: CancelPolicy,
}

impl Forwarder {
    pub fn new(retry_delay: Duration, cancel_policy: CancelPolicy) -> Self {
        Self {
            retry_delay,
            cancel_policy,
        }
    }

    /// Forward the swap identified by `hash` from `inbound` to `outbound`.
    ///
    /// Temporary errors are retried without bound; only a classified
    /// terminal error or success ends the call.
    pub async fn forward_swap(
        &self,
        hash: &SwapHash,
        inbound: &dyn SwapEngine,
        outbound: &OutboundPayment,
    ) -> SwapResult<SwapPreimage> {
        let mut attempt: u64 = 0;

        let retrieved = loop {
            attempt += 1;

            let err = match self.retrieve_preimage(hash, inbound, outbound).await {
                Ok(retrieved) => break retrieved,
                Err(e) => e,
            };

            match err.class() {
                ErrorClass::Permanent => {
                    transition(hash, ForwardState::Aborting);
                    error!(hash = %hash, "Permanent error while forwarding: {}", err);
                    cancel_with_retry(inbound, hash, self.cancel_policy).await;
                    transition(hash, ForwardState::Failed);
                    return Err(err);
                }
                ErrorClass::Canceled | ErrorClass::Expired => {
                    // May be a pre-existing non-atomic state; not ours to fix.
                    error!(hash = %hash, "Swap resolved without us while forwarding: {}", err);
                    transition(hash, ForwardState::Failed);
                    return Err(err);
                }
                ErrorClass::Settled | ErrorClass::Temporary => {
                    transition(hash, ForwardState::Retrying);
                    warn!(
                        hash = %hash,
                        "Temporary error forwarding swap (attempt {}), retrying in {:?}: {}",
                        attempt, self.retry_delay, err
                    );
                    crate::metrics::record_forward_retry(outbound.engine.asset());
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        };

        let preimage = match retrieved {
            Retrieved::AlreadySettled(preimage) => preimage,
            Retrieved::Translated(preimage) => {
                self.settle_inbound(hash, inbound, &preimage).await?;
                preimage
            }
        };

        transition(hash, ForwardState::Complete);
        info!(hash = %hash, "Swap forwarded after {} attempt(s)", attempt);
        Ok(preimage)
    }

    /// Settle the inbound leg once the outbound payment has revealed the
    /// preimage. The outbound leg has already paid, so temporary errors are
    /// retried until the rail answers.
    async fn settle_inbound(
        &self,
        hash: &SwapHash,
        inbound: &dyn SwapEngine,
        preimage: &SwapPreimage,
    ) -> SwapResult<()> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            transition(hash, ForwardState::Settling);

            let err = match inbound.settle_swap(preimage).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match err.class() {
                ErrorClass::Settled => {
                    info!(hash = %hash, "Inbound swap was already settled");
                    return Ok(());
                }
                ErrorClass::Temporary => {
                    transition(hash, ForwardState::Retrying);
                    warn!(
                        hash = %hash,
                        "Temporary error settling inbound swap (attempt {}), retrying in {:?}: {}",
                        attempt, self.retry_delay, err
                    );
                    crate::metrics::record_forward_retry(inbound.asset());
                    tokio::time::sleep(self.retry_delay).await;
                }
                ErrorClass::Permanent | ErrorClass::Canceled | ErrorClass::Expired => {
                    error!(
                        hash = %hash,
                        preimage = %preimage,
                        "Outbound paid but inbound swap could not be settled: {}",
                        err
                    );
                    transition(hash, ForwardState::Failed);
                    return Err(err);
                }
            }
        }
    }

    async fn retrieve_preimage(
        &self,
        hash: &SwapHash,
        inbound: &dyn SwapEngine,
        outbound: &OutboundPayment,
    ) -> SwapResult<Retrieved> {
        transition(hash, ForwardState::AwaitingCommitment);
        let commitment_time = match inbound.wait_for_swap_commitment(hash).await {
            Ok(time) => time,
            Err(SwapError::Settled(_)) => {
                info!(hash = %hash, "Inbound swap already settled, fetching preimage");
                let preimage = inbound.get_settled_swap_preimage(hash).await?;
                return Ok(Retrieved::AlreadySettled(preimage));
            }
            Err(e) => return Err(e),
        };

        // Inbound is the outer hop, outbound the inner one.
        let inbound_timing = inbound.time_lock_params();
        let outbound_timing = outbound.engine.time_lock_params();
        let time_locks = TimeLocks::compute(Hops {
            outer: &inbound_timing,
            inner: &outbound_timing,
        });
        let max_time = time_locks.max_forward_time(commitment_time);

        transition(hash, ForwardState::Translating);
        info!(
            hash = %hash,
            committed_at = %commitment_time,
            max_time = %max_time,
            "Inbound committed, paying {} to {}",
            outbound.amount,
            outbound.address
        );

        let preimage = outbound
            .engine
            .translate_swap(&outbound.address, hash, &outbound.amount, max_time)
            .await?;

        Ok(Retrieved::Translated(preimage))
    }
}

fn transition(hash: &SwapHash, state: ForwardState) {
    debug!(hash = %hash, state = %state, "Forward state");
}
