//! MAC External Interfaces Library
//!
//! This crate provides the narrow, typed contracts between the MAC scheduler
//! and its neighbours: PHY indications and transmit requests, and the RLC
//! buffer access used for PDU assembly.

pub mod message_types;
pub mod phy;
pub mod rlc;

pub use message_types::{DlPdu, PhyIndication};
pub use phy::PhyTxInterface;
pub use rlc::RlcInterface;

use common::Rnti;
use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Unknown RNTI {0}")]
    UnknownRnti(Rnti),

    #[error("Invalid message format")]
    InvalidMessage,

    #[error("Interface not initialized")]
    NotInitialized,

    #[error("Buffer full")]
    BufferFull,

    #[error("Transmission failed: {0}")]
    TransmissionFailed(String),
}
