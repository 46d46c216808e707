//! HARQ Process Management
//!
//! One `HarqProcess` tracks a single transport block of one HARQ process of
//! one UE (TS 36.321 5.3.2 / 5.4.2). A `HarqEntity` groups the processes of a
//! UE in one direction: DL selection is asynchronous, UL is synchronous with
//! `pid = tti mod nof_proc`.

use crate::{HARQ_RTT_MS, MAX_TB};
use common::{LinkDirection, ResourceMask, Tti};
use thiserror::Error;
use tracing::{debug, trace};

/// State of one HARQ transport block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqState {
    /// Never used or force-cleared
    Empty,
    /// Transmitted, feedback outstanding
    AwaitingAck,
    /// Positively acknowledged; free for new data
    Acked,
    /// Negatively acknowledged; retransmission pending
    Nacked,
}

/// Illegal HARQ transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarqError {
    #[error("HARQ process {pid}/{tb} is busy ({state:?})")]
    Busy { pid: u8, tb: u8, state: HarqState },

    #[error("HARQ process {pid}/{tb} has no pending retransmission ({state:?})")]
    NoPendingRetx { pid: u8, tb: u8, state: HarqState },

    #[error("HARQ process {pid}/{tb} already used {max_retx} retransmissions")]
    RetxLimit { pid: u8, tb: u8, max_retx: u32 },

    #[error("HARQ process {pid}/{tb} is not waiting for feedback ({state:?})")]
    NotAwaitingAck { pid: u8, tb: u8, state: HarqState },
}

/// Result of applying HARQ feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Delivered; process is reusable
    Acked,
    /// Retransmission pending
    RetxPending,
    /// NACK after the last allowed retransmission; the process was cleared
    MaxRetxReached { retx_count: u32 },
}

/// HARQ state of one transport block
#[derive(Debug, Clone)]
pub struct HarqProcess {
    pid: u8,
    tb: u8,
    state: HarqState,
    max_retx: u32,
    retx_count: u32,
    ndi: bool,
    tti: Option<Tti>,
    mask: Option<ResourceMask>,
    mcs: u8,
    tbs: u32,
    deferrals: u32,
}

impl HarqProcess {
    pub fn new(pid: u8, tb: u8, max_retx: u32) -> Self {
        Self {
            pid,
            tb,
            state: HarqState::Empty,
            max_retx,
            retx_count: 0,
            ndi: false,
            tti: None,
            mask: None,
            mcs: 0,
            tbs: 0,
            deferrals: 0,
        }
    }

    pub fn pid(&self) -> u8 {
        self.pid
    }

    pub fn tb_index(&self) -> u8 {
        self.tb
    }

    pub fn state(&self) -> HarqState {
        self.state
    }

    pub fn retx_count(&self) -> u32 {
        self.retx_count
    }

    pub fn max_retx(&self) -> u32 {
        self.max_retx
    }

    pub fn ndi(&self) -> bool {
        self.ndi
    }

    /// TTI of the last (re)transmission
    pub fn tti(&self) -> Option<Tti> {
        self.tti
    }

    /// Resources of the last (re)transmission
    pub fn mask(&self) -> Option<ResourceMask> {
        self.mask
    }

    pub fn mcs(&self) -> u8 {
        self.mcs
    }

    /// Transport block size in bytes
    pub fn tbs(&self) -> u32 {
        self.tbs
    }

    /// Consecutive retransmission attempts that found no resources
    pub fn deferrals(&self) -> u32 {
        self.deferrals
    }

    /// Free for new data
    pub fn is_free(&self) -> bool {
        matches!(self.state, HarqState::Empty | HarqState::Acked)
    }

    /// Change the retransmission limit
    ///
    /// A NACKed TB that already used the new limit is discarded; its retx
    /// count is returned.
    pub fn set_max_retx(&mut self, max_retx: u32) -> Option<u32> {
        self.max_retx = max_retx;
        if self.state != HarqState::Nacked || self.retx_count < max_retx {
            return None;
        }
        let retx_count = self.retx_count;
        debug!(
            "HARQ {}/{} retx limit lowered to {} after {} retransmissions, discarding TB",
            self.pid, self.tb, max_retx, retx_count
        );
        self.reset();
        Some(retx_count)
    }

    /// Start a new transmission; toggles NDI and resets the retx counter
    pub fn start_new(&mut self, tti: Tti, mask: ResourceMask, mcs: u8, tbs: u32) -> Result<(), HarqError> {
        if !self.is_free() {
            return Err(HarqError::Busy { pid: self.pid, tb: self.tb, state: self.state });
        }
        self.state = HarqState::AwaitingAck;
        self.retx_count = 0;
        self.ndi = !self.ndi;
        self.tti = Some(tti);
        self.mask = Some(mask);
        self.mcs = mcs;
        self.tbs = tbs;
        self.deferrals = 0;
        trace!("HARQ {}/{} new tx at tti={} tbs={} ndi={}", self.pid, self.tb, tti, tbs, self.ndi);
        Ok(())
    }

    /// Retransmit the stored TB; MCS, TBS and NDI are kept
    ///
    /// Returns true when the retransmission is adaptive (different resources).
    pub fn start_retx(&mut self, tti: Tti, mask: ResourceMask) -> Result<bool, HarqError> {
        if self.state != HarqState::Nacked {
            return Err(HarqError::NoPendingRetx { pid: self.pid, tb: self.tb, state: self.state });
        }
        if self.retx_count >= self.max_retx {
            return Err(HarqError::RetxLimit { pid: self.pid, tb: self.tb, max_retx: self.max_retx });
        }
        let adaptive = self.mask != Some(mask);
        self.state = HarqState::AwaitingAck;
        self.retx_count += 1;
        self.tti = Some(tti);
        self.mask = Some(mask);
        self.deferrals = 0;
        trace!(
            "HARQ {}/{} retx {} at tti={} adaptive={}",
            self.pid,
            self.tb,
            self.retx_count,
            tti,
            adaptive
        );
        Ok(adaptive)
    }

    /// Apply ACK/NACK feedback to an outstanding transmission
    pub fn apply_ack(&mut self, ack: bool) -> Result<AckOutcome, HarqError> {
        if self.state != HarqState::AwaitingAck {
            return Err(HarqError::NotAwaitingAck { pid: self.pid, tb: self.tb, state: self.state });
        }
        if ack {
            self.state = HarqState::Acked;
            return Ok(AckOutcome::Acked);
        }
        if self.retx_count >= self.max_retx {
            let retx_count = self.retx_count;
            debug!(
                "HARQ {}/{} NACK after {} retransmissions, discarding TB",
                self.pid, self.tb, retx_count
            );
            self.reset();
            return Ok(AckOutcome::MaxRetxReached { retx_count });
        }
        self.state = HarqState::Nacked;
        Ok(AckOutcome::RetxPending)
    }

    /// A retransmission can go out in `tti`: NACKed and at least one round
    /// trip after the previous transmission
    pub fn has_pending_retx(&self, tti: Tti) -> bool {
        self.state == HarqState::Nacked
            && self.retx_count < self.max_retx
            && self.tti.map_or(false, |tx| tti.since(tx) >= HARQ_RTT_MS)
    }

    /// Treat feedback that is a full round trip late as NACK
    pub fn expire_overdue(&mut self, tti: Tti) -> Option<AckOutcome> {
        let overdue = self.state == HarqState::AwaitingAck
            && self.tti.map_or(false, |tx| tti.since(tx) >= HARQ_RTT_MS);
        if !overdue {
            return None;
        }
        debug!("HARQ {}/{} feedback overdue at tti={}, assuming NACK", self.pid, self.tb, tti);
        self.apply_ack(false).ok()
    }

    /// Count a retransmission attempt that found no resources
    pub fn record_deferral(&mut self) -> u32 {
        self.deferrals += 1;
        self.deferrals
    }

    /// Force-clear the process, dropping the stored TB
    pub fn reset(&mut self) {
        self.state = HarqState::Empty;
        self.retx_count = 0;
        self.mask = None;
        self.tbs = 0;
        self.deferrals = 0;
    }
}

/// HARQ processes of one UE in one direction
#[derive(Debug, Clone)]
pub struct HarqEntity {
    dir: LinkDirection,
    nof_tb: usize,
    procs: Vec<[HarqProcess; MAX_TB]>,
}

impl HarqEntity {
    pub fn new(dir: LinkDirection, nof_proc: usize, nof_tb: usize, max_retx: u32) -> Self {
        let procs = (0..nof_proc as u8)
            .map(|pid| [HarqProcess::new(pid, 0, max_retx), HarqProcess::new(pid, 1, max_retx)])
            .collect();
        Self {
            dir,
            nof_tb: nof_tb.clamp(1, MAX_TB),
            procs,
        }
    }

    pub fn direction(&self) -> LinkDirection {
        self.dir
    }

    pub fn nof_proc(&self) -> usize {
        self.procs.len()
    }

    pub fn nof_tb(&self) -> usize {
        self.nof_tb
    }

    pub fn set_nof_tb(&mut self, nof_tb: usize) {
        self.nof_tb = nof_tb.clamp(1, MAX_TB);
    }

    /// Apply a new retransmission limit; returns `(pid, tb, retx_count)` of
    /// every TB discarded because it already used the limit
    pub fn set_max_retx(&mut self, max_retx: u32) -> Vec<(u8, u8, u32)> {
        self.iter_mut()
            .filter_map(|h| h.set_max_retx(max_retx).map(|n| (h.pid(), h.tb_index(), n)))
            .collect()
    }

    pub fn process(&self, pid: u8, tb: usize) -> &HarqProcess {
        &self.procs[pid as usize][tb]
    }

    pub fn process_mut(&mut self, pid: u8, tb: usize) -> &mut HarqProcess {
        &mut self.procs[pid as usize][tb]
    }

    /// Active transport blocks of a process
    pub fn tbs(&self, pid: u8) -> &[HarqProcess] {
        &self.procs[pid as usize][..self.nof_tb]
    }

    pub fn tbs_mut(&mut self, pid: u8) -> &mut [HarqProcess] {
        let nof_tb = self.nof_tb;
        &mut self.procs[pid as usize][..nof_tb]
    }

    pub fn iter(&self) -> impl Iterator<Item = &HarqProcess> {
        let nof_tb = self.nof_tb;
        self.procs.iter().flat_map(move |p| p[..nof_tb].iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HarqProcess> {
        self.procs.iter_mut().flat_map(|p| p.iter_mut())
    }

    /// Synchronous UL process for a PUSCH TTI
    pub fn ul_pid(&self, tti: Tti) -> u8 {
        (tti.value() % self.procs.len() as u32) as u8
    }

    /// Process with a retransmission due in `tti`
    ///
    /// DL picks the process waiting longest; UL may only use `ul_pid(tti)`.
    pub fn pending_retx_pid(&self, tti: Tti) -> Option<u8> {
        match self.dir {
            LinkDirection::Uplink => {
                let pid = self.ul_pid(tti);
                self.tbs(pid).iter().any(|h| h.has_pending_retx(tti)).then_some(pid)
            }
            LinkDirection::Downlink => self
                .iter()
                .filter(|h| h.has_pending_retx(tti))
                .max_by_key(|h| h.tti().map_or(0, |tx| tti.since(tx)))
                .map(|h| h.pid()),
        }
    }

    /// DL process with every transport block free, lowest id first
    pub fn free_pid(&self) -> Option<u8> {
        (0..self.procs.len() as u8).find(|&pid| self.tbs(pid).iter().all(|h| h.is_free()))
    }

    /// UL process for `tti` if it is free
    pub fn free_ul_pid(&self, tti: Tti) -> Option<u8> {
        let pid = self.ul_pid(tti);
        self.tbs(pid).iter().all(|h| h.is_free()).then_some(pid)
    }

    /// Process whose transport block `tb` was last sent in `tx_tti` and is
    /// still waiting for feedback
    pub fn awaiting_pid(&self, tx_tti: Tti, tb: usize) -> Option<u8> {
        self.procs
            .iter()
            .map(|p| &p[tb])
            .find(|h| h.state() == HarqState::AwaitingAck && h.tti() == Some(tx_tti))
            .map(|h| h.pid())
    }

    /// Bytes granted to transmissions not yet acknowledged, except `exclude`
    pub fn in_flight_bytes(&self, exclude: Option<u8>) -> u32 {
        self.iter()
            .filter(|h| Some(h.pid()) != exclude)
            .filter(|h| matches!(h.state(), HarqState::AwaitingAck | HarqState::Nacked))
            .map(|h| h.tbs())
            .sum()
    }

    /// Expire overdue feedback; returns `(pid, tb, outcome)` per expired TB
    pub fn expire_overdue(&mut self, tti: Tti) -> Vec<(u8, u8, AckOutcome)> {
        self.iter_mut()
            .filter_map(|h| h.expire_overdue(tti).map(|o| (h.pid(), h.tb_index(), o)))
            .collect()
    }

    /// Discard every transport block
    pub fn reset(&mut self) {
        self.iter_mut().for_each(|h| h.reset());
    }
}
