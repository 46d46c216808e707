//! Uplink Round-Robin Policy
//!
//! Contiguous PRB allocation on PUSCH with SC-FDMA length rounding. UL HARQ
//! is synchronous, so each UE can only use the process of the PUSCH TTI.

use super::{visit_order, Allocation, AllocationKind, AllocationPolicy, Deferral, TtiScratch};
use crate::harq::HarqProcess;
use crate::ue::{UeSchedulingContext, MIN_PDU_BYTES};
use common::{LengthRule, LinkDirection, ResourceMask, Rnti, Tti};
use tracing::{debug, trace};

const DIR: LinkDirection = LinkDirection::Uplink;

/// Round-robin UL allocation
#[derive(Debug, Clone)]
pub struct RoundRobinUl {
    scratch: TtiScratch,
}

impl RoundRobinUl {
    pub fn new() -> Self {
        Self { scratch: TtiScratch::new() }
    }

    fn allocate_retx(&mut self, ue: &UeSchedulingContext, tti: Tti) {
        let Some(h) = ue.get_retransmission_harq(DIR, tti) else {
            return;
        };
        match self.retx_mask(ue, h) {
            Some((mask, adaptive, mcs)) => {
                trace!("UL rnti={} pid={} retx adaptive={}", ue.rnti(), h.pid(), adaptive);
                self.scratch.commit(Allocation {
                    rnti: ue.rnti(),
                    pid: h.pid(),
                    mask,
                    kind: AllocationKind::Retx { adaptive, mcs },
                });
            }
            None => {
                debug!("UL rnti={} pid={} retx deferred at tti={}", ue.rnti(), h.pid(), tti);
                self.scratch.deferrals.push(Deferral { rnti: ue.rnti(), pid: h.pid() });
            }
        }
    }

    /// New data on the synchronous process of `tti`, if it is free
    fn allocate_new(&mut self, ue: &UeSchedulingContext, tti: Tti) {
        let Some(h) = ue.get_free_harq(DIR, tti) else {
            return;
        };
        let pid = h.pid();
        let bytes = ue.pending_ul_bytes(tti);
        if bytes == 0 {
            return;
        }
        let Some(run) = self.scratch.used.largest_free_run() else {
            return;
        };
        let max_units = ue.ul_prb_cap().map_or(run.length, |cap| cap.min(run.length));
        let cqi = ue.channel_quality(DIR, tti);
        let request = ue.required_resource_units(DIR, bytes, cqi, max_units);
        if request.units == 0 || request.tbs_bytes < MIN_PDU_BYTES {
            return;
        }
        let Some(range) = self.scratch.used.first_fit(request.units, LengthRule::UlWaveform) else {
            return;
        };
        self.scratch.commit(Allocation {
            rnti: ue.rnti(),
            pid,
            mask: ResourceMask::from_range(self.scratch.used.size(), range),
            kind: AllocationKind::NewTx { mcs: request.mcs, nof_tb: 1 },
        });
    }

    /// Same PRBs when free (no PDCCH needed), else a run of the same
    /// length, else the shortest run carrying the TB at up to the maximum MCS
    fn retx_mask(&self, ue: &UeSchedulingContext, h: &HarqProcess) -> Option<(ResourceMask, bool, u8)> {
        let used = &self.scratch.used;
        let prev = h.mask()?;
        if !used.overlaps(&prev) {
            return Some((prev, false, h.mcs()));
        }
        let size = used.size();
        if let Some(range) = used.first_fit(prev.count(), LengthRule::Any) {
            return Some((ResourceMask::from_range(size, range), true, h.mcs()));
        }
        let longest = used.largest_free_run()?.length;
        (1..=longest)
            .filter(|n| common::is_valid_ul_nof_prb(*n))
            .find_map(|n| {
                let mcs = ue.mcs_for_tbs(DIR, h.tbs(), n)?;
                let range = used.first_fit(n, LengthRule::UlWaveform)?;
                Some((ResourceMask::from_range(size, range), true, mcs))
            })
    }
}

impl Default for RoundRobinUl {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationPolicy for RoundRobinUl {
    fn direction(&self) -> LinkDirection {
        DIR
    }

    fn new_tti(&mut self, ues: &[&UeSchedulingContext], used: ResourceMask, tti: Tti) {
        self.scratch.reset(used);
        for idx in visit_order(ues.len(), tti) {
            self.allocate_retx(ues[idx], tti);
        }
        // A UE whose process is waiting for a retransmission has no free one
        for idx in visit_order(ues.len(), tti) {
            self.allocate_new(ues[idx], tti);
        }
        trace!(
            "UL pass tti={}: {} grants, used {:?}",
            tti,
            self.scratch.allocations.len(),
            self.scratch.used
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellContext;
    use crate::config::{default_cell_config, BearerConfig, UeConfig};
    use common::{Lcid, UnitRange};
    use std::sync::Arc;

    fn ue_with_bsr(rnti: u16, cell: &Arc<CellContext>, bytes: u32) -> UeSchedulingContext {
        let mut ue = UeSchedulingContext::new(Rnti(rnti), UeConfig::default(), cell.clone());
        ue.configure_bearer(Lcid(3), BearerConfig::default());
        ue.set_ul_bsr(Lcid(3), bytes, true).unwrap();
        ue
    }

    #[test]
    fn test_new_tx_avoids_reserved_regions() {
        let cell = Arc::new(CellContext::new(default_cell_config(25)));
        let ue = ue_with_bsr(0x46, &cell, 1_000_000);
        let tti = Tti::from_sfn_sf(3, 1);
        let base = cell.ul_base_mask(tti);
        let mut policy = RoundRobinUl::new();
        policy.new_tti(&[&ue], base, tti);

        let alloc = policy.get_allocation(Rnti(0x46)).unwrap();
        assert!(!alloc.mask.overlaps(&base));
        // PRBs 8..23 are free: 15 PRBs is a valid SC-FDMA length
        assert_eq!(alloc.mask.contiguous_range(), Some(UnitRange::new(8, 15)));
        assert_eq!(alloc.pid, (tti.value() % 8) as u8);
    }

    #[test]
    fn test_non_adaptive_retx() {
        let cell = Arc::new(CellContext::new(default_cell_config(25)));
        let mut ue = ue_with_bsr(0x46, &cell, 0);
        let prev = ResourceMask::from_range(25, UnitRange::new(10, 4));
        ue.start_ul_tx(Tti::new(2), prev, 8, 60).unwrap();
        ue.on_ul_crc(Tti::new(2), 0, false).unwrap();

        let mut policy = RoundRobinUl::new();
        policy.new_tti(&[&ue], cell.ul_base_mask(Tti::new(10)), Tti::new(10));
        let alloc = policy.get_allocation(Rnti(0x46)).unwrap();
        assert_eq!(alloc.mask, prev);
        assert_eq!(alloc.kind, AllocationKind::Retx { adaptive: false, mcs: 8 });
    }

    #[test]
    fn test_adaptive_retx_moves_out_of_prach() {
        let cell = Arc::new(CellContext::new(default_cell_config(25)));
        let mut ue = ue_with_bsr(0x46, &cell, 0);
        // Sent on PRBs 2..6, which are PRACH in subframe 1
        let prev = ResourceMask::from_range(25, UnitRange::new(2, 4));
        ue.start_ul_tx(Tti::new(3), prev, 8, 60).unwrap();
        ue.on_ul_crc(Tti::new(3), 0, false).unwrap();

        let tti = Tti::new(11);
        let base = cell.ul_base_mask(tti);
        let mut policy = RoundRobinUl::new();
        policy.new_tti(&[&ue], base, tti);
        let alloc = policy.get_allocation(Rnti(0x46)).unwrap();
        assert_eq!(alloc.mask.contiguous_range(), Some(UnitRange::new(8, 4)));
        assert_eq!(alloc.kind, AllocationKind::Retx { adaptive: true, mcs: 8 });
    }

    #[test]
    fn test_retx_deferred_without_room() {
        let cell = Arc::new(CellContext::new(default_cell_config(25)));
        let mut ue = ue_with_bsr(0x46, &cell, 1000);
        let prev = ResourceMask::from_range(25, UnitRange::new(2, 20));
        ue.start_ul_tx(Tti::new(0), prev, 20, 1200).unwrap();
        ue.on_ul_crc(Tti::new(0), 0, false).unwrap();

        let mut used = cell.ul_base_mask(Tti::new(8));
        used.reserve_range(UnitRange::new(2, 20));
        let mut policy = RoundRobinUl::new();
        policy.new_tti(&[&ue], used, Tti::new(8));
        assert_eq!(policy.deferrals(), &[Deferral { rnti: Rnti(0x46), pid: 0 }]);
        assert!(policy.allocations().is_empty());
    }

    #[test]
    fn test_two_ues_share_pusch() {
        let cell = Arc::new(CellContext::new(default_cell_config(25)));
        let a = ue_with_bsr(0x46, &cell, 100);
        let b = ue_with_bsr(0x47, &cell, 100);
        let mut policy = RoundRobinUl::new();
        let base = cell.ul_base_mask(Tti::new(2));
        policy.new_tti(&[&a, &b], base, Tti::new(2));
        let allocs = policy.allocations();
        assert_eq!(allocs.len(), 2);
        assert!(!allocs[0].mask.overlaps(&allocs[1].mask));
        assert!(allocs.iter().all(|a| !a.mask.overlaps(&base)));
    }
}
