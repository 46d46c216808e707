//! Message Types for PHY-MAC Communication
//!
//! Defines the indications the PHY reports to the MAC and the PDUs the MAC
//! hands back for transmission

use bytes::Bytes;
use common::{Rnti, Tti};
use serde::{Deserialize, Serialize};

/// Per-TTI feedback reported by the PHY
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PhyIndication {
    /// Scheduling request on PUCCH
    SchedulingRequest { tti: Tti, rnti: Rnti },
    /// PRACH preamble detected
    Rach { tti: Tti, preamble_id: u8, timing_advance: u16 },
    /// PUSCH decoding result
    Crc { tti: Tti, rnti: Rnti, payload_len: u32, ok: bool },
    /// PDSCH HARQ feedback for one transport block
    Ack { tti: Tti, rnti: Rnti, tb_index: u8, ack: bool },
    /// Wideband channel quality indicator (0-15)
    Cqi { tti: Tti, rnti: Rnti, value: u8 },
    /// Rank indicator
    Ri { tti: Tti, rnti: Rnti, value: u8 },
    /// Precoding matrix indicator
    Pmi { tti: Tti, rnti: Rnti, value: u8 },
    /// Uplink channel quality derived from PUSCH SNR, on the CQI scale
    UlCqi { tti: Tti, rnti: Rnti, value: u8 },
}

impl PhyIndication {
    /// TTI in which the indication was received
    pub fn tti(&self) -> Tti {
        match *self {
            PhyIndication::SchedulingRequest { tti, .. }
            | PhyIndication::Rach { tti, .. }
            | PhyIndication::Crc { tti, .. }
            | PhyIndication::Ack { tti, .. }
            | PhyIndication::Cqi { tti, .. }
            | PhyIndication::Ri { tti, .. }
            | PhyIndication::Pmi { tti, .. }
            | PhyIndication::UlCqi { tti, .. } => tti,
        }
    }

    /// UE the indication refers to, if any (RACH has none yet)
    pub fn rnti(&self) -> Option<Rnti> {
        match *self {
            PhyIndication::Rach { .. } => None,
            PhyIndication::SchedulingRequest { rnti, .. }
            | PhyIndication::Crc { rnti, .. }
            | PhyIndication::Ack { rnti, .. }
            | PhyIndication::Cqi { rnti, .. }
            | PhyIndication::Ri { rnti, .. }
            | PhyIndication::Pmi { rnti, .. }
            | PhyIndication::UlCqi { rnti, .. } => Some(rnti),
        }
    }
}

/// Downlink transport block ready for PDSCH encoding
#[derive(Debug, Clone)]
pub struct DlPdu {
    /// TTI of transmission
    pub tti: Tti,
    /// Destination UE
    pub rnti: Rnti,
    /// HARQ process id
    pub pid: u8,
    /// Transport block index (0 or 1)
    pub tb_index: u8,
    /// True when the payload is a retransmission of a buffered TB
    pub retx: bool,
    /// Encoded MAC PDU, padded to the transport block size
    pub payload: Bytes,
}
