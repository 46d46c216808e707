//! MAC-RLC Interface
//!
//! The MAC pulls RLC PDUs when it assembles a transport block for a committed
//! grant, and pushes demultiplexed uplink SDUs back up.

use async_trait::async_trait;
use bytes::Bytes;
use common::{Lcid, Rnti};

use crate::InterfaceError;

/// Access to the RLC entities of all UEs
#[async_trait]
pub trait RlcInterface: Send + Sync {
    /// Read at most `max_bytes` of RLC PDU for the given bearer
    ///
    /// Returns an empty buffer when the bearer has nothing queued.
    async fn read_pdu(&self, rnti: Rnti, lcid: Lcid, max_bytes: usize) -> Result<Bytes, InterfaceError>;

    /// Deliver an uplink MAC SDU to the RLC entity of the bearer
    async fn write_pdu(&self, rnti: Rnti, lcid: Lcid, pdu: Bytes) -> Result<(), InterfaceError>;
}
