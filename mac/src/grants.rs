//! Scheduling Grants
//!
//! Owned result records returned by `schedule_downlink` and
//! `schedule_uplink`, sized to the grants actually committed in the TTI.

use crate::pdcch::DciLocation;
use common::{Lcid, ResourceMask, Rnti, Tti, UnitRange};
use serde::{Deserialize, Serialize};

/// Transport block part of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TbGrant {
    pub mcs: u8,
    /// Transport block size in bytes
    pub tbs_bytes: u32,
    /// New data indicator
    pub ndi: bool,
    /// False for retransmissions
    pub new_data: bool,
    pub retx_count: u32,
}

/// What a broadcast grant carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastKind {
    /// SIB1 (index 0) or an SI message
    SystemInformation { index: usize },
    Paging,
}

/// SI-RNTI or P-RNTI transmission on PDSCH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastGrant {
    pub rnti: Rnti,
    pub kind: BroadcastKind,
    pub rbg_mask: ResourceMask,
    pub nof_prb: u16,
    pub dci: DciLocation,
    pub mcs: u8,
    /// Payload size in bytes
    pub payload_len: u32,
    pub tbs_bytes: u32,
}

/// One random access response inside a RAR PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RarEntry {
    pub preamble_id: u8,
    pub timing_advance: u16,
    pub temp_rnti: Rnti,
    /// PRBs of the implicit Msg3 grant
    pub msg3_range: UnitRange,
    pub msg3_mcs: u8,
    /// PUSCH TTI of the Msg3
    pub msg3_tti: Tti,
}

/// RAR PDU addressed to one RA-RNTI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RarGrant {
    pub ra_rnti: Rnti,
    pub rbg_mask: ResourceMask,
    pub nof_prb: u16,
    pub dci: DciLocation,
    pub mcs: u8,
    pub tbs_bytes: u32,
    pub entries: Vec<RarEntry>,
}

/// PDSCH assignment for one UE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlGrant {
    pub rnti: Rnti,
    pub rbg_mask: ResourceMask,
    pub nof_prb: u16,
    pub dci: DciLocation,
    /// HARQ process id
    pub pid: u8,
    /// Per transport block parameters; `None` when the TB is not sent
    pub tbs: [Option<TbGrant>; 2],
    /// Contention resolution identity to send as MAC CE
    pub conres_id: Option<[u8; 6]>,
    /// Bytes to read from each logical channel, per TB
    pub pdu: [Vec<(Lcid, u32)>; 2],
}

impl DlGrant {
    /// True if any transport block carries new data
    pub fn has_new_data(&self) -> bool {
        self.tbs.iter().flatten().any(|tb| tb.new_data)
    }

    /// Sum of the transport block sizes
    pub fn total_tbs(&self) -> u32 {
        self.tbs.iter().flatten().map(|tb| tb.tbs_bytes).sum()
    }
}

/// DL scheduling decision for one TTI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlGrantSet {
    pub tti: Tti,
    pub cfi: u8,
    pub broadcast: Vec<BroadcastGrant>,
    pub rar: Vec<RarGrant>,
    pub data: Vec<DlGrant>,
}

impl DlGrantSet {
    pub fn new(tti: Tti, cfi: u8) -> Self {
        Self {
            tti,
            cfi,
            broadcast: Vec::new(),
            rar: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty() && self.rar.is_empty() && self.data.is_empty()
    }

    /// Every RBG mask committed in the TTI
    pub fn rbg_masks(&self) -> impl Iterator<Item = &ResourceMask> {
        self.broadcast
            .iter()
            .map(|g| &g.rbg_mask)
            .chain(self.rar.iter().map(|g| &g.rbg_mask))
            .chain(self.data.iter().map(|g| &g.rbg_mask))
    }

    /// Every DCI placed on the PDCCH for DL assignments
    pub fn dci_locations(&self) -> impl Iterator<Item = &DciLocation> {
        self.broadcast
            .iter()
            .map(|g| &g.dci)
            .chain(self.rar.iter().map(|g| &g.dci))
            .chain(self.data.iter().map(|g| &g.dci))
    }
}

/// Region closed to PUSCH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservedKind {
    Pucch,
    Prach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedRegion {
    pub kind: ReservedKind,
    pub range: UnitRange,
}

/// PUSCH grant for one UE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UlGrant {
    pub rnti: Rnti,
    pub range: UnitRange,
    pub mcs: u8,
    pub tbs_bytes: u32,
    pub pid: u8,
    pub ndi: bool,
    pub new_data: bool,
    pub retx_count: u32,
    /// False for Msg3 and non-adaptive retransmissions
    pub needs_pdcch: bool,
    /// DCI 0 location in the PDCCH of `UlGrantSet::pdcch_tti`
    pub dci: Option<DciLocation>,
    pub is_msg3: bool,
}

/// HARQ indicator sent on PHICH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhichAck {
    pub rnti: Rnti,
    pub ack: bool,
}

/// UL scheduling decision for one PUSCH TTI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UlGrantSet {
    /// PUSCH TTI
    pub tti: Tti,
    /// DL TTI carrying the DCI 0s and the PHICH
    pub pdcch_tti: Tti,
    pub reserved: Vec<ReservedRegion>,
    pub msg3: Vec<UlGrant>,
    pub data: Vec<UlGrant>,
    /// Feedback for the PUSCH of `tti - 8`
    pub phich: Vec<PhichAck>,
}

impl UlGrantSet {
    pub fn new(tti: Tti, pdcch_tti: Tti) -> Self {
        Self {
            tti,
            pdcch_tti,
            reserved: Vec::new(),
            msg3: Vec::new(),
            data: Vec::new(),
            phich: Vec::new(),
        }
    }

    /// True when no PUSCH was granted
    pub fn is_empty(&self) -> bool {
        self.msg3.is_empty() && self.data.is_empty()
    }

    /// Msg3 and data grants
    pub fn grants(&self) -> impl Iterator<Item = &UlGrant> {
        self.msg3.iter().chain(self.data.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdcch::AggregationLevel;

    #[test]
    fn test_dl_grant_totals() {
        let tb = TbGrant {
            mcs: 10,
            tbs_bytes: 300,
            ndi: true,
            new_data: false,
            retx_count: 1,
        };
        let grant = DlGrant {
            rnti: Rnti(0x46),
            rbg_mask: ResourceMask::from_range(13, UnitRange::new(0, 4)),
            nof_prb: 8,
            dci: DciLocation { ncce: 0, level: AggregationLevel::L2 },
            pid: 2,
            tbs: [Some(tb), Some(TbGrant { new_data: true, ..tb })],
            conres_id: None,
            pdu: [Vec::new(), Vec::new()],
        };
        assert_eq!(grant.total_tbs(), 600);
        assert!(grant.has_new_data());

        let mut set = DlGrantSet::new(Tti::new(3), 3);
        assert!(set.is_empty());
        set.data.push(grant);
        assert_eq!(set.rbg_masks().count(), 1);
        assert_eq!(set.dci_locations().next().map(|d| d.ncce), Some(0));
    }
}
