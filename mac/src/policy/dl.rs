//! Downlink Round-Robin Policy
//!
//! Type 0 (RBG bitmap) allocation. Pending retransmissions of all UEs are
//! served before any new data, first on their previous RBGs, then on any
//! RBG set carrying the stored transport block.

use super::{visit_order, Allocation, AllocationKind, AllocationPolicy, Deferral, TtiScratch};
use crate::harq::HarqProcess;
use crate::tables;
use crate::ue::{UeSchedulingContext, MIN_PDU_BYTES};
use common::{ceil_div, LinkDirection, ResourceMask, Rnti, Tti};
use tracing::{debug, trace};

const DIR: LinkDirection = LinkDirection::Downlink;

/// Round-robin DL allocation
#[derive(Debug, Clone)]
pub struct RoundRobinDl {
    scratch: TtiScratch,
}

impl RoundRobinDl {
    pub fn new() -> Self {
        Self { scratch: TtiScratch::new() }
    }

    fn allocate_retx(&mut self, ue: &UeSchedulingContext, tti: Tti) {
        let Some(h) = ue.get_retransmission_harq(DIR, tti) else {
            return;
        };
        match self.retx_mask(ue, h) {
            Some((mask, adaptive, mcs)) => {
                trace!("DL rnti={} pid={} retx adaptive={}", ue.rnti(), h.pid(), adaptive);
                self.scratch.commit(Allocation {
                    rnti: ue.rnti(),
                    pid: h.pid(),
                    mask,
                    kind: AllocationKind::Retx { adaptive, mcs },
                });
            }
            None => {
                debug!("DL rnti={} pid={} retx deferred at tti={}", ue.rnti(), h.pid(), tti);
                self.scratch.deferrals.push(Deferral { rnti: ue.rnti(), pid: h.pid() });
            }
        }
    }

    fn allocate_new(&mut self, ue: &UeSchedulingContext, tti: Tti) {
        if self.scratch.used.free_count() == 0 || self.scratch.get(ue.rnti()).is_some() {
            return;
        }
        let Some(h) = ue.get_free_harq(DIR, tti) else {
            return;
        };
        let bytes = ue.pending_dl_bytes(tti);
        if bytes == 0 {
            return;
        }
        let nof_tb = ue.dl_nof_tb(tti);
        let cqi = ue.channel_quality(DIR, tti);
        let request = ue.required_resource_units(DIR, ceil_div(bytes, nof_tb as u32), cqi, self.scratch.used.free_count());
        if request.units == 0 {
            return;
        }
        let Some(mask) = self.scratch.used.first_free_units(request.units) else {
            return;
        };
        let tbs = tables::tbs_bytes_for_mcs(request.mcs, ue.cell().rbg_mask_nof_prb(&mask), DIR);
        if tbs < MIN_PDU_BYTES {
            trace!("DL rnti={} TBS of {} bytes too small", ue.rnti(), tbs);
            return;
        }
        self.scratch.commit(Allocation {
            rnti: ue.rnti(),
            pid: h.pid(),
            mask,
            kind: AllocationKind::NewTx { mcs: request.mcs, nof_tb },
        });
    }

    /// Same RBGs when free, else an RBG set of the same size, else the
    /// smallest RBG set carrying the TB at up to the maximum MCS
    fn retx_mask(&self, ue: &UeSchedulingContext, h: &HarqProcess) -> Option<(ResourceMask, bool, u8)> {
        let used = &self.scratch.used;
        let cell = ue.cell();
        let prev = h.mask()?;
        if !used.overlaps(&prev) {
            return Some((prev, false, h.mcs()));
        }
        let prev_prb = cell.rbg_mask_nof_prb(&prev);
        if let Some(mask) = used.first_free_units(prev.count()) {
            if cell.rbg_mask_nof_prb(&mask) == prev_prb {
                return Some((mask, true, h.mcs()));
            }
        }
        (1..=used.free_count()).find_map(|n| {
            let mask = used.first_free_units(n)?;
            let mcs = ue.mcs_for_tbs(DIR, h.tbs(), cell.rbg_mask_nof_prb(&mask))?;
            Some((mask, true, mcs))
        })
    }
}

impl Default for RoundRobinDl {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationPolicy for RoundRobinDl {
    fn direction(&self) -> LinkDirection {
        DIR
    }

    fn new_tti(&mut self, ues: &[&UeSchedulingContext], used: ResourceMask, tti: Tti) {
        self.scratch.reset(used);
        // Retransmissions of every UE go before any new data
        for idx in visit_order(ues.len(), tti) {
            self.allocate_retx(ues[idx], tti);
        }
        for idx in visit_order(ues.len(), tti) {
            self.allocate_new(ues[idx], tti);
        }
    }

    fn get_allocation(&self, rnti: Rnti) -> Option<&Allocation> {
        self.scratch.get(rnti)
    }

    fn allocations(&self) -> &[Allocation] {
        &self.scratch.allocations
    }

    fn deferrals(&self) -> &[Deferral] {
        &self.scratch.deferrals
    }

    fn release(&mut self, rnti: Rnti) -> Option<Allocation> {
        self.scratch.release(rnti)
    }

    fn used_mask(&self) -> ResourceMask {
        self.scratch.used
    }
}
