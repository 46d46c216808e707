//! Broadcast Scheduling
//!
//! System information and paging on PDSCH (TS 36.331 5.2.1). SIB1 goes out
//! in subframe 5 of every even frame. SI message n is sent once inside its
//! SI window, which opens at `x = (n - 1) * w` TTIs into each period.

use crate::cell::CellContext;
use crate::events::SchedEvent;
use crate::grants::{BroadcastGrant, BroadcastKind};
use crate::pdcch::{allocate_dci, AggregationLevel};
use crate::tables;
use common::{LinkDirection, ResourceMask, Rnti, Tti};
use tracing::{debug, warn};

/// DCI aggregation level of broadcast assignments
const BROADCAST_LEVEL: AggregationLevel = AggregationLevel::L4;

#[derive(Debug, Clone, Copy, Default)]
struct SiWindow {
    start: Option<Tti>,
    sent: bool,
}

/// SI window tracking and paging queue
#[derive(Debug, Clone, Default)]
pub struct BroadcastScheduler {
    windows: Vec<SiWindow>,
    paging_bytes: Option<u32>,
}

impl BroadcastScheduler {
    pub fn new(nof_sibs: usize) -> Self {
        Self {
            windows: vec![SiWindow::default(); nof_sibs],
            paging_bytes: None,
        }
    }

    /// Forget window and paging state
    pub fn reset(&mut self, nof_sibs: usize) {
        *self = Self::new(nof_sibs);
    }

    /// Queue a paging message of `bytes` for the next opportunity
    pub fn set_paging_pending(&mut self, bytes: u32) {
        self.paging_bytes = Some(bytes);
    }

    pub fn paging_pending(&self) -> bool {
        self.paging_bytes.is_some()
    }

    fn window_opens(cell: &CellContext, idx: usize, tti: Tti) -> bool {
        let bc = &cell.config.broadcast;
        let x = (idx as u32 - 1) * bc.si_window_ms;
        let period = bc.sibs[idx].period_rf;
        period > 0
            && tti.sfn() % period == x / Tti::SUBFRAMES_PER_FRAME
            && tti.sf_idx() == x % Tti::SUBFRAMES_PER_FRAME
    }

    fn roll_windows(&mut self, cell: &CellContext, tti: Tti, events: &mut Vec<SchedEvent>) {
        let window_len = cell.config.broadcast.si_window_ms;
        for (idx, window) in self.windows.iter_mut().enumerate().skip(1) {
            if let Some(start) = window.start {
                if tti.since(start) >= window_len {
                    if !window.sent {
                        warn!("SI-{} window starting at tti={} closed unsent", idx, start);
                        events.push(SchedEvent::SiWindowMissed { si_index: idx, tti });
                    }
                    window.start = None;
                }
            }
            if Self::window_opens(cell, idx, tti) {
                if window.start.is_some() && !window.sent {
                    events.push(SchedEvent::SiWindowMissed { si_index: idx, tti });
                }
                *window = SiWindow { start: Some(tti), sent: false };
            }
        }
    }

    /// Broadcast grants for `tti`, reserving RBGs and common-space CCEs
    pub fn schedule(
        &mut self,
        cell: &CellContext,
        tti: Tti,
        rbgs: &mut ResourceMask,
        cces: &mut ResourceMask,
        events: &mut Vec<SchedEvent>,
    ) -> Vec<BroadcastGrant> {
        if self.windows.len() != cell.config.broadcast.sibs.len() {
            self.reset(cell.config.broadcast.sibs.len());
        }
        self.roll_windows(cell, tti, events);

        let mut grants = Vec::new();
        let sibs = &cell.config.broadcast.sibs;
        if cell.is_sib1_tti(tti) {
            let kind = BroadcastKind::SystemInformation { index: 0 };
            if let Some(grant) = allocate(cell, tti, Rnti::SI, kind, sibs[0].len, rbgs, cces) {
                grants.push(grant);
            } else {
                warn!("No resources for SIB1 at tti={}", tti);
            }
            return grants;
        }

        for (idx, window) in self.windows.iter_mut().enumerate().skip(1) {
            if window.start.is_none() || window.sent {
                continue;
            }
            let kind = BroadcastKind::SystemInformation { index: idx };
            if let Some(grant) = allocate(cell, tti, Rnti::SI, kind, sibs[idx].len, rbgs, cces) {
                window.sent = true;
                grants.push(grant);
            }
        }

        if let Some(bytes) = self.paging_bytes {
            if let Some(grant) = allocate(cell, tti, Rnti::P, BroadcastKind::Paging, bytes, rbgs, cces) {
                self.paging_bytes = None;
                grants.push(grant);
            } else if cell.dl_mask_for_bytes(&cell.empty_rbg_mask(), bytes, cell.config.broadcast.mcs).is_none() {
                warn!("Paging message of {} bytes exceeds the DL band, dropping", bytes);
                self.paging_bytes = None;
                events.push(SchedEvent::PagingDropped { bytes, tti });
            }
        }
        grants
    }
}

/// RBGs first, then a common-space DCI; nothing is reserved unless both fit
fn allocate(
    cell: &CellContext,
    tti: Tti,
    rnti: Rnti,
    kind: BroadcastKind,
    len: u32,
    rbgs: &mut ResourceMask,
    cces: &mut ResourceMask,
) -> Option<BroadcastGrant> {
    let mcs = cell.config.broadcast.mcs;
    let mask = cell.dl_mask_for_bytes(rbgs, len, mcs)?;
    let dci = allocate_dci(cces, &cell.common_dci, cell.cfi(), tti, BROADCAST_LEVEL)?;
    rbgs.reserve(&mask);
    let nof_prb = cell.rbg_mask_nof_prb(&mask);
    debug!("Broadcast {:?} tti={} rbgs={:?} cce={}", kind, tti, mask, dci.ncce);
    Some(BroadcastGrant {
        rnti,
        kind,
        rbg_mask: mask,
        nof_prb,
        dci,
        mcs,
        payload_len: len,
        tbs_bytes: tables::tbs_bytes_for_mcs(mcs, nof_prb, LinkDirection::Downlink),
    })
}
