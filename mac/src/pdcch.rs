//! PDCCH Resource Handling
//!
//! CCE capacity of the control region and DCI candidate locations of the
//! common and UE-specific search spaces (TS 36.211 6.8, TS 36.213 9.1.1).

use crate::config::PhichResource;
use common::{ResourceMask, Rnti, Tti, UnitRange};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// REGs per CCE
const REG_PER_CCE: u32 = 9;

/// REGs taken by the PCFICH
const PCFICH_REGS: u32 = 4;

/// REGs per PHICH group (normal CP)
const PHICH_REGS_PER_GROUP: u32 = 3;

/// Size of the common search space in CCEs
const COMMON_SEARCH_SPACE_CCES: u16 = 16;

/// Hashing constants for the UE-specific search space
const HASH_A: u32 = 39827;
const HASH_D: u32 = 65537;

/// DCI aggregation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AggregationLevel {
    L1,
    L2,
    L4,
    L8,
}

impl AggregationLevel {
    pub const ALL: [AggregationLevel; 4] = [Self::L1, Self::L2, Self::L4, Self::L8];

    /// CCEs occupied by one DCI
    pub fn nof_cce(&self) -> u16 {
        match self {
            Self::L1 => 1,
            Self::L2 => 2,
            Self::L4 => 4,
            Self::L8 => 8,
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::L1 => 0,
            Self::L2 => 1,
            Self::L4 => 2,
            Self::L8 => 3,
        }
    }

    /// PDCCH candidates in the UE-specific search space
    fn ue_candidates(&self) -> u32 {
        match self {
            Self::L1 | Self::L2 => 6,
            Self::L4 | Self::L8 => 2,
        }
    }

    /// PDCCH candidates in the common search space (L4 and L8 only)
    fn common_candidates(&self) -> u32 {
        match self {
            Self::L4 => 4,
            Self::L8 => 2,
            _ => 0,
        }
    }

    /// Level giving a robust enough code rate for the reported CQI
    pub fn for_cqi(cqi: u8) -> Self {
        match cqi {
            10.. => Self::L1,
            7..=9 => Self::L2,
            4..=6 => Self::L4,
            _ => Self::L8,
        }
    }

    /// This level and the more robust ones above it
    pub fn and_above(self) -> impl Iterator<Item = AggregationLevel> {
        Self::ALL.into_iter().filter(move |l| *l >= self)
    }
}

/// CCEs of the control region for a given CFI (1 or 2 antenna ports)
pub fn nof_cces(nof_prb: u16, cfi: u8, phich: PhichResource) -> u16 {
    if cfi == 0 {
        return 0;
    }
    // First symbol: 2 REGs per PRB around the reference signals; others: 3
    let regs = nof_prb as u32 * 2 + (cfi as u32 - 1) * nof_prb as u32 * 3;
    let reserved = PCFICH_REGS + PHICH_REGS_PER_GROUP * phich.nof_groups(nof_prb);
    (regs.saturating_sub(reserved) / REG_PER_CCE) as u16
}

/// Placement of one DCI on the PDCCH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DciLocation {
    /// First CCE
    pub ncce: u16,
    pub level: AggregationLevel,
}

impl DciLocation {
    /// CCEs covered by this DCI
    pub fn range(&self) -> UnitRange {
        UnitRange::new(self.ncce, self.level.nof_cce())
    }
}

/// Candidate start CCEs per CFI, subframe and aggregation level
#[derive(Debug, Clone)]
pub struct DciLocationTable {
    // [cfi - 1][sf_idx][level]
    starts: Vec<[[Vec<u16>; 4]; 10]>,
}

impl DciLocationTable {
    /// UE-specific search space of `rnti`
    pub fn ue_specific(rnti: Rnti, nof_prb: u16, phich: PhichResource) -> Self {
        let mut starts = Vec::with_capacity(3);
        for cfi in 1..=3u8 {
            let nof_cce = nof_cces(nof_prb, cfi, phich) as u32;
            let mut per_sf: [[Vec<u16>; 4]; 10] = Default::default();
            let mut y = rnti.value() as u32;
            for sf in per_sf.iter_mut() {
                y = (HASH_A * y) % HASH_D;
                for level in AggregationLevel::ALL {
                    sf[level.index()] = search_space(y, nof_cce, nof_cce, level, level.ue_candidates());
                }
            }
            starts.push(per_sf);
        }
        Self { starts }
    }

    /// Common search space, identical in every subframe
    pub fn common(nof_prb: u16, phich: PhichResource) -> Self {
        let mut starts = Vec::with_capacity(3);
        for cfi in 1..=3u8 {
            let nof_cce = nof_cces(nof_prb, cfi, phich) as u32;
            let space = nof_cce.min(COMMON_SEARCH_SPACE_CCES as u32);
            let mut per_level: [Vec<u16>; 4] = Default::default();
            for level in AggregationLevel::ALL {
                per_level[level.index()] = search_space(0, space, nof_cce, level, level.common_candidates());
            }
            starts.push(std::array::from_fn(|_| per_level.clone()));
        }
        Self { starts }
    }

    /// Candidate start CCEs for a DCI sent in `tti`
    pub fn candidates(&self, cfi: u8, tti: Tti, level: AggregationLevel) -> &[u16] {
        match self.starts.get(cfi.saturating_sub(1) as usize) {
            Some(per_sf) => &per_sf[tti.sf_idx() as usize][level.index()],
            None => &[],
        }
    }
}

/// Candidate starts `L * ((Y + m) mod floor(space / L))` within `nof_cce`
fn search_space(y: u32, space: u32, nof_cce: u32, level: AggregationLevel, nof_candidates: u32) -> Vec<u16> {
    let l = level.nof_cce() as u32;
    let nof_positions = space / l;
    if nof_positions == 0 {
        return Vec::new();
    }
    let mut starts: Vec<u16> = Vec::new();
    for m in 0..nof_candidates.min(nof_positions) {
        let start = l * ((y + m) % nof_positions);
        if start + l <= nof_cce && !starts.contains(&(start as u16)) {
            starts.push(start as u16);
        }
    }
    starts
}

/// Place a DCI on the first free candidate of the first level that fits,
/// trying `level` and then the more robust levels
pub fn allocate_dci(
    cces: &mut ResourceMask,
    table: &DciLocationTable,
    cfi: u8,
    tti: Tti,
    level: AggregationLevel,
) -> Option<DciLocation> {
    for l in level.and_above() {
        let candidates = table.candidates(cfi, tti, l);
        if let Some(range) = cces.first_free_candidate(candidates, l.nof_cce()) {
            cces.reserve_range(range);
            trace!("DCI placed at CCE {} level {:?} tti={}", range.start, l, tti);
            return Some(DciLocation { ncce: range.start, level: l });
        }
    }
    None
}
