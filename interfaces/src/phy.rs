//! MAC-PHY Transmit Interface
//!
//! Assembled downlink transport blocks are submitted to the PHY through this
//! trait. Scheduling decisions themselves travel as grant records returned by
//! the scheduler; this path only carries payloads.

use async_trait::async_trait;

use crate::{message_types::DlPdu, InterfaceError};

/// PHY transmit path for PDSCH payloads
#[async_trait]
pub trait PhyTxInterface: Send + Sync {
    /// Queue a transport block for the TTI given in the PDU
    async fn send_dl_pdu(&self, pdu: DlPdu) -> Result<(), InterfaceError>;
}
