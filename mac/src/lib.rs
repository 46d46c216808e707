//! LTE Medium Access Control (MAC) Scheduler
//!
//! Implements the eNodeB MAC resource scheduler according to 3GPP TS 36.321
//! and the resource allocation procedures of TS 36.213. Once per TTI the
//! scheduler decides which UEs get which RBGs/PRBs and CCEs, drives the HARQ
//! state machines of every in-flight transport block and runs the random
//! access procedure (RACH, RAR, Msg3, contention resolution).

pub mod adapter;
pub mod assembler;
pub mod broadcast;
pub mod cell;
pub mod config;
pub mod events;
pub mod grants;
pub mod harq;
pub mod pdcch;
pub mod pdu;
pub mod policy;
pub mod random_access;
pub mod scheduler;
pub mod tables;
pub mod ue;

pub use adapter::RadioLinkAdapter;
pub use assembler::{PduAssembler, PduAssemblyRequest};
pub use config::{BearerConfig, BearerDirection, CellConfig, PolicyKind, UeConfig};
pub use events::{HarqFailureCause, SchedEvent};
pub use grants::{DlGrant, DlGrantSet, UlGrant, UlGrantSet};
pub use harq::{HarqError, HarqProcess, HarqState};
pub use scheduler::CellScheduler;
pub use ue::UeSchedulingContext;

use common::{Lcid, Rnti};
use thiserror::Error;

/// FDD delay between a transmission and its HARQ feedback, and between an
/// UL grant and the PUSCH it schedules
pub const FDD_HARQ_DELAY_MS: u32 = 4;

/// HARQ round trip time in TTIs
pub const HARQ_RTT_MS: u32 = 2 * FDD_HARQ_DELAY_MS;

/// Maximum transport blocks per DL HARQ process
pub const MAX_TB: usize = 2;

/// Errors surfaced by configuration and control calls
#[derive(Error, Debug)]
pub enum MacError {
    #[error("Cell not configured")]
    NotConfigured,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown RNTI {0}")]
    UnknownRnti(Rnti),

    #[error("Invalid logical channel {0:?}")]
    InvalidLcid(Lcid),

    #[error("No free C-RNTI available")]
    RntiExhausted,

    #[error("HARQ error: {0}")]
    Harq(#[from] HarqError),

    #[error("Invalid protocol data unit: {0}")]
    InvalidPdu(String),

    #[error("Interface error: {0}")]
    Interface(#[from] interfaces::InterfaceError),
}

#[cfg(test)]
pub(crate) mod test_util {
    use tracing_subscriber::{fmt, EnvFilter};

    /// Route scheduler logs to the test harness; safe to call from every test
    pub fn init_logging() {
        let _ = fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    }
}
