//! Time-lock derivation for a two-hop cross-rail swap
//!
//! The inner hop is where the preimage first surfaces (the outbound payment);
//! the outer hop is where the swap began and where it settles last (the
//! inbound leg). Every value here is in seconds.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Timing parameters a rail contributes to the time-lock computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopTiming {
    /// Minimum acceptance window of the rail's final hop
    pub final_hop_time_lock: u64,
    /// Margin for time that passes between commitment and evaluation
    pub block_buffer: u64,
    /// Worst-case time to retrieve a preimage from this rail
    pub retrieve_window: u64,
    /// Worst-case time to claim funds on this rail with a known preimage
    pub claim_window: u64,
}

impl HopTiming {
    pub fn is_valid(&self) -> bool {
        self.final_hop_time_lock > 0
            && self.block_buffer > 0
            && self.retrieve_window > 0
            && self.claim_window > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLock {
    pub send: u64,
    pub receive: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLocks {
    pub inner: TimeLock,
    pub outer: TimeLock,
    pub interchain_forward_delta: u64,
}

/// Explicit role assignment of the two rails in a swap
#[derive(Debug, Clone, Copy)]
pub struct Hops<'a> {
    pub outer: &'a HopTiming,
    pub inner: &'a HopTiming,
}

impl TimeLocks {
    /// Derive all four time-locks. Callers must recompute per swap attempt,
    /// engine timing can change between attempts.
    pub fn compute(hops: Hops<'_>) -> Self {
        let inner_receive = hops.inner.final_hop_time_lock;
        let inner_send = inner_receive + hops.inner.block_buffer;

        let interchain_forward_delta = hops.inner.retrieve_window + hops.outer.claim_window;

        let outer_receive = inner_send + interchain_forward_delta;
        let outer_send = outer_receive + hops.outer.block_buffer;

        Self {
            inner: TimeLock {
                send: inner_send,
                receive: inner_receive,
            },
            outer: TimeLock {
                send: outer_send,
                receive: outer_receive,
            },
            interchain_forward_delta,
        }
    }

    /// Latest time the outbound payment may resolve for a commitment at `commitment_time`.
    ///
    /// The inbound leg is held until at least `outer.send`, so settling it
    /// keeps `outer.block_buffer` of headroom past this bound.
    pub fn max_forward_time(&self, commitment_time: DateTime<Utc>) -> DateTime<Utc> {
        commitment_time + seconds(self.outer.receive)
    }

    /// Whether a trade started at `start_time` is past its outer window
    pub fn outer_window_elapsed(&self, start_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - start_time >= seconds(self.outer.send)
    }
}

fn seconds(secs: u64) -> ChronoDuration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    ChronoDuration::seconds(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(final_hop: u64, buffer: u64, retrieve: u64, claim: u64) -> HopTiming {
        HopTiming {
            final_hop_time_lock: final_hop,
            block_buffer: buffer,
            retrieve_window: retrieve,
            claim_window: claim,
        }
    }

    #[test]
    fn test_reference_scenario() {
        let outer = timing(5400, 1200, 3600, 1800);
        let inner = timing(5400, 1200, 3600, 1800);

        let locks = TimeLocks::compute(Hops {
            outer: &outer,
            inner: &inner,
        });

        assert_eq!(locks.inner.receive, 5400);
        assert_eq!(locks.inner.send, 6600);
        assert_eq!(locks.interchain_forward_delta, 5400);
        assert_eq!(locks.outer.receive, 12000);
        assert_eq!(locks.outer.send, 13200);
    }

    #[test]
    fn test_monotonic_for_many_pairs() {
        for a in [1u64, 7, 600, 5400, 86_400] {
            for b in [1u64, 30, 1200, 3600] {
                let outer = timing(a, b, a + b, b);
                let inner = timing(b, a, b, a + 1);
                let locks = TimeLocks::compute(Hops {
                    outer: &outer,
                    inner: &inner,
                });
                assert!(locks.outer.send > locks.outer.receive);
                assert!(locks.outer.receive >= locks.inner.send);
                assert!(locks.inner.send > locks.inner.receive);
                assert!(locks.inner.receive > 0);
                assert!(
                    locks.outer.receive >= locks.inner.send + locks.interchain_forward_delta
                );
            }
        }
    }

    #[test]
    fn test_roles_are_not_symmetric() {
        let channel = timing(5400, 1200, 3600, 1800);
        let escrow = timing(600, 60, 120, 300);

        let a = TimeLocks::compute(Hops {
            outer: &channel,
            inner: &escrow,
        });
        let b = TimeLocks::compute(Hops {
            outer: &escrow,
            inner: &channel,
        });
        assert_ne!(a, b);
        assert_eq!(a.inner.receive, 600);
        assert_eq!(b.inner.receive, 5400);
    }

    #[test]
    fn test_outer_window_elapsed() {
        let t = timing(10, 5, 5, 5);
        let locks = TimeLocks::compute(Hops { outer: &t, inner: &t });
        // inner.send = 15, delta = 10, outer.receive = 25, outer.send = 30
        let start = Utc::now();
        assert!(!locks.outer_window_elapsed(start, start + ChronoDuration::seconds(29)));
        assert!(locks.outer_window_elapsed(start, start + ChronoDuration::seconds(30)));
        assert_eq!(
            locks.max_forward_time(start),
            start + ChronoDuration::seconds(25)
        );
    }

    #[test]
    fn test_forward_deadline_leaves_settle_headroom() {
        let outer = timing(5400, 1200, 3600, 1800);
        let inner = timing(600, 60, 120, 300);
        let locks = TimeLocks::compute(Hops {
            outer: &outer,
            inner: &inner,
        });

        let committed = Utc::now();
        let held_until = committed + ChronoDuration::seconds(locks.outer.send as i64);
        assert_eq!(
            held_until - locks.max_forward_time(committed),
            ChronoDuration::seconds(1200)
        );
    }
}
