//! Cell Context
//!
//! Tables derived once from a validated `CellConfig` and shared read-only
//! by every UE context and scheduler stage until the next reconfiguration.

use crate::config::CellConfig;
use crate::grants::{ReservedKind, ReservedRegion};
use crate::pdcch::{self, DciLocationTable};
use crate::tables;
use common::{LinkDirection, ResourceMask, Tti, UnitRange};

/// Derived per-cell parameters
#[derive(Debug, Clone)]
pub struct CellContext {
    /// Configuration as supplied by RRC
    pub config: CellConfig,
    /// RBG size P
    pub rbg_size: u16,
    /// RBGs in the DL band
    pub nof_rbg: u16,
    /// CCEs in the control region at the configured CFI
    pub nof_cce: u16,
    /// Common search space candidates
    pub common_dci: DciLocationTable,
}

impl CellContext {
    pub fn new(config: CellConfig) -> Self {
        let nof_prb = config.nof_prb;
        Self {
            rbg_size: common::rbg_size(nof_prb),
            nof_rbg: common::nof_rbg(nof_prb),
            nof_cce: pdcch::nof_cces(nof_prb, config.cfi, config.phich_resource),
            common_dci: DciLocationTable::common(nof_prb, config.phich_resource),
            config,
        }
    }

    pub fn nof_prb(&self) -> u16 {
        self.config.nof_prb
    }

    pub fn cfi(&self) -> u8 {
        self.config.cfi
    }

    /// Empty RBG mask of the DL band
    pub fn empty_rbg_mask(&self) -> ResourceMask {
        ResourceMask::new(self.nof_rbg)
    }

    /// Empty PRB mask of the UL band
    pub fn empty_prb_mask(&self) -> ResourceMask {
        ResourceMask::new(self.config.nof_prb)
    }

    /// Empty CCE mask of the control region
    pub fn empty_cce_mask(&self) -> ResourceMask {
        ResourceMask::new(self.nof_cce)
    }

    /// PRBs covered by a set of RBGs
    pub fn rbg_mask_nof_prb(&self, rbgs: &ResourceMask) -> u16 {
        rbgs.iter_units()
            .map(|rbg| common::rbg_nof_prb(self.config.nof_prb, rbg))
            .sum()
    }

    /// PRBs of `nof_rbg` groups, assuming full-size groups
    pub fn nominal_nof_prb(&self, nof_rbg: u16) -> u16 {
        (nof_rbg * self.rbg_size).min(self.config.nof_prb)
    }

    /// Lowest free RBGs carrying `bytes` at `mcs`, if the band has room
    pub fn dl_mask_for_bytes(&self, used: &ResourceMask, bytes: u32, mcs: u8) -> Option<ResourceMask> {
        (1..=used.free_count()).find_map(|n| {
            let mask = used.first_free_units(n)?;
            let tbs = tables::tbs_bytes_for_mcs(mcs, self.rbg_mask_nof_prb(&mask), LinkDirection::Downlink);
            (tbs >= bytes).then_some(mask)
        })
    }

    /// UL regions closed to PUSCH in `tti`: PUCCH at both band edges and,
    /// in PRACH occasions, the PRACH region
    pub fn ul_reserved(&self, tti: Tti) -> Vec<ReservedRegion> {
        let nof_prb = self.config.nof_prb;
        let nrb = self.config.pucch.nrb_pucch;
        let mut regions = Vec::with_capacity(3);
        if nrb > 0 {
            regions.push(ReservedRegion {
                kind: ReservedKind::Pucch,
                range: UnitRange::new(0, nrb),
            });
            regions.push(ReservedRegion {
                kind: ReservedKind::Pucch,
                range: UnitRange::new(nof_prb - nrb, nrb),
            });
        }
        if self.config.prach.is_prach_tti(tti) {
            regions.push(ReservedRegion {
                kind: ReservedKind::Prach,
                range: self.config.prach.region(),
            });
        }
        regions
    }

    /// UL PRB mask with the reserved regions of `tti` already taken
    pub fn ul_base_mask(&self, tti: Tti) -> ResourceMask {
        let mut mask = self.empty_prb_mask();
        for region in self.ul_reserved(tti) {
            mask.reserve_range(region.range);
        }
        mask
    }

    /// True when the DL subframe carries SIB1
    pub fn is_sib1_tti(&self, tti: Tti) -> bool {
        !self.config.broadcast.sibs.is_empty() && tti.sfn() % 2 == 0 && tti.sf_idx() == 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_cell_config;

    #[test]
    fn test_derived_tables() {
        let cell = CellContext::new(default_cell_config(25));
        assert_eq!(cell.rbg_size, 2);
        assert_eq!(cell.nof_rbg, 13);
        assert_eq!(cell.nof_cce, 21);
        assert_eq!(cell.nominal_nof_prb(13), 25);

        let all = ResourceMask::from_range(13, UnitRange::new(0, 13));
        assert_eq!(cell.rbg_mask_nof_prb(&all), 25);
        let last = ResourceMask::from_range(13, UnitRange::new(12, 1));
        assert_eq!(cell.rbg_mask_nof_prb(&last), 1);
    }

    #[test]
    fn test_dl_mask_for_bytes() {
        let cell = CellContext::new(default_cell_config(25));
        let mut used = cell.empty_rbg_mask();
        used.reserve_range(UnitRange::new(0, 2));
        // MCS 2 carries 9 bytes on 2 PRBs and 22 bytes on 4
        let mask = cell.dl_mask_for_bytes(&used, 18, 2).unwrap();
        assert_eq!(mask.iter_units().collect::<Vec<_>>(), vec![2, 3]);
        assert!(cell.dl_mask_for_bytes(&used, 100_000, 2).is_none());
    }

    #[test]
    fn test_ul_reserved_regions() {
        let cell = CellContext::new(default_cell_config(25));
        // Config index 3: PRACH in subframe 1 of every frame
        let prach_tti = Tti::from_sfn_sf(7, 1);
        let regions = cell.ul_reserved(prach_tti);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[1].range, UnitRange::new(23, 2));
        assert_eq!(regions[2].range, UnitRange::new(2, 6));
        assert_eq!(cell.ul_reserved(Tti::from_sfn_sf(7, 2)).len(), 2);
        assert_eq!(cell.ul_base_mask(prach_tti).count(), 10);
    }
}
