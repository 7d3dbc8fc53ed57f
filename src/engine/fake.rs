//! Scripted in-memory engine for protocol tests

use super::prepared::{Preparation, PreparedSwap, PreparedSwaps};
use super::{EngineKind, SwapEngine, SwapStatus};
use crate::error::{SwapError, SwapResult};
use crate::timelock::HopTiming;
use crate::types::{Amount, SwapHash, SwapPreimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct CallCounts {
    pub prepare: AtomicUsize,
    pub remote_prepare: AtomicUsize,
    pub wait: AtomicUsize,
    pub translate: AtomicUsize,
    pub settled_lookup: AtomicUsize,
    pub cancel: AtomicUsize,
    pub settle: AtomicUsize,
    pub status: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        [
            &self.prepare,
            &self.wait,
            &self.translate,
            &self.settled_lookup,
            &self.cancel,
            &self.settle,
            &self.status,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// Engine whose responses are queued up front by the test
pub struct FakeEngine {
    asset: String,
    timing: Mutex<HopTiming>,
    validated: AtomicBool,
    prepared: PreparedSwaps,
    pub calls: CallCounts,
    prepare_results: Mutex<VecDeque<SwapResult<()>>>,
    wait_results: Mutex<VecDeque<SwapResult<DateTime<Utc>>>>,
    translate_results: Mutex<VecDeque<SwapResult<SwapPreimage>>>,
    cancel_results: Mutex<VecDeque<SwapResult<()>>>,
    settle_results: Mutex<VecDeque<SwapResult<()>>>,
    settled_preimage: Mutex<Option<SwapPreimage>>,
    status: Mutex<SwapStatus>,
    settled: Mutex<Vec<SwapPreimage>>,
}

impl FakeEngine {
    pub fn new(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            timing: Mutex::new(HopTiming {
                final_hop_time_lock: 5400,
                block_buffer: 1200,
                retrieve_window: 3600,
                claim_window: 1800,
            }),
            validated: AtomicBool::new(false),
            prepared: PreparedSwaps::new(),
            calls: CallCounts::default(),
            prepare_results: Mutex::new(VecDeque::new()),
            wait_results: Mutex::new(VecDeque::new()),
            translate_results: Mutex::new(VecDeque::new()),
            cancel_results: Mutex::new(VecDeque::new()),
            settle_results: Mutex::new(VecDeque::new()),
            settled_preimage: Mutex::new(None),
            status: Mutex::new(SwapStatus::NotFound),
            settled: Mutex::new(Vec::new()),
        }
    }

    pub fn set_validated(&self, validated: bool) {
        self.validated.store(validated, Ordering::SeqCst);
    }

    pub fn set_timing(&self, timing: HopTiming) {
        *self.timing.lock().unwrap() = timing;
    }

    pub fn push_prepare(&self, result: SwapResult<()>) {
        self.prepare_results.lock().unwrap().push_back(result);
    }

    pub fn push_wait(&self, result: SwapResult<DateTime<Utc>>) {
        self.wait_results.lock().unwrap().push_back(result);
    }

    pub fn push_translate(&self, result: SwapResult<SwapPreimage>) {
        self.translate_results.lock().unwrap().push_back(result);
    }

    pub fn push_cancel(&self, result: SwapResult<()>) {
        self.cancel_results.lock().unwrap().push_back(result);
    }

    pub fn push_settle(&self, result: SwapResult<()>) {
        self.settle_results.lock().unwrap().push_back(result);
    }

    pub fn set_settled_preimage(&self, preimage: SwapPreimage) {
        *self.settled_preimage.lock().unwrap() = Some(preimage);
    }

    pub fn set_status(&self, status: SwapStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn settled(&self) -> Vec<SwapPreimage> {
        self.settled.lock().unwrap().clone()
    }
}

#[async_trait]
impl SwapEngine for FakeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::LedgerChannel
    }

    fn asset(&self) -> &str {
        &self.asset
    }

    fn time_lock_params(&self) -> HopTiming {
        *self.timing.lock().unwrap()
    }

    fn is_validated(&self) -> bool {
        self.validated.load(Ordering::SeqCst)
    }

    async fn validate(&self) -> SwapResult<()> {
        self.set_validated(true);
        Ok(())
    }

    async fn prepare_swap(
        &self,
        hash: &SwapHash,
        amount: &Amount,
        expiration: DateTime<Utc>,
        timelock_delta: u64,
    ) -> SwapResult<()> {
        self.calls.prepare.fetch_add(1, Ordering::SeqCst);
        let terms = PreparedSwap {
            amount: amount.clone(),
            expiration,
            timelock_delta,
        };
        if self.prepared.check(hash, &terms)? == Preparation::Duplicate {
            return Ok(());
        }
        self.calls.remote_prepare.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.prepare_results.lock().unwrap().pop_front() {
            result?;
        }
        self.prepared.record(hash, terms)?;
        Ok(())
    }

    async fn wait_for_swap_commitment(&self, _hash: &SwapHash) -> SwapResult<DateTime<Utc>> {
        self.calls.wait.fetch_add(1, Ordering::SeqCst);
        let next = self.wait_results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Utc::now()))
    }

    async fn translate_swap(
        &self,
        _address: &str,
        hash: &SwapHash,
        _amount: &Amount,
        _max_time: DateTime<Utc>,
    ) -> SwapResult<SwapPreimage> {
        self.calls.translate.fetch_add(1, Ordering::SeqCst);
        let next = self.translate_results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(SwapError::Rail(format!("no scripted result for {}", hash))))
    }

    async fn get_settled_swap_preimage(&self, hash: &SwapHash) -> SwapResult<SwapPreimage> {
        self.calls.settled_lookup.fetch_add(1, Ordering::SeqCst);
        let preimage = *self.settled_preimage.lock().unwrap();
        preimage.ok_or(SwapError::UnknownSwap(*hash))
    }

    async fn cancel_swap(&self, _hash: &SwapHash) -> SwapResult<()> {
        self.calls.cancel.fetch_add(1, Ordering::SeqCst);
        let next = self.cancel_results.lock().unwrap().pop_front();
        next.unwrap_or(Ok(()))
    }

    async fn settle_swap(&self, preimage: &SwapPreimage) -> SwapResult<()> {
        self.calls.settle.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.settle_results.lock().unwrap().pop_front() {
            result?;
        }
        self.settled.lock().unwrap().push(*preimage);
        Ok(())
    }

    async fn get_payment_channel_network_address(&self) -> SwapResult<String> {
        Ok(format!("{}-address", self.asset.to_lowercase()))
    }

    async fn swap_status(&self, _hash: &SwapHash) -> SwapResult<SwapStatus> {
        self.calls.status.fetch_add(1, Ordering::SeqCst);
        Ok(*self.status.lock().unwrap())
    }
}
