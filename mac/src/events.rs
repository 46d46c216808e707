//! Scheduler Events
//!
//! Protocol-timing violations are not errors of the per-TTI entry points.
//! They are collected as events and drained by the upper layer, which
//! decides whether to fail the radio link.

use common::{LinkDirection, Rnti, Tti};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a HARQ process was given up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarqFailureCause {
    /// NACK after the last allowed retransmission
    MaxRetx,
    /// Retransmission found no resources too many TTIs in a row
    RetxStarved,
}

/// Event reported to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedEvent {
    /// A transport block was dropped; the process has been force-reset
    HarqFailure {
        rnti: Rnti,
        direction: LinkDirection,
        pid: u8,
        cause: HarqFailureCause,
    },
    /// A due retransmission could not be placed in this TTI
    RetxDeferred {
        rnti: Rnti,
        direction: LinkDirection,
        pid: u8,
        tti: Tti,
    },
    /// No RAR could be sent inside the response window
    RarWindowExpired {
        temp_rnti: Rnti,
        preamble_id: u8,
        prach_tti: Tti,
    },
    /// A Msg3 grant could not be issued in its TTI
    Msg3Expired { rnti: Rnti, tti: Tti },
    /// An SI message window closed without a transmission
    SiWindowMissed { si_index: usize, tti: Tti },
    /// A paging message too large for the DL band was discarded
    PagingDropped { bytes: u32, tti: Tti },
}

impl SchedEvent {
    /// Events after which the UE context is unlikely to recover on its own
    pub fn is_radio_link_failure_candidate(&self) -> bool {
        matches!(
            self,
            SchedEvent::HarqFailure { .. } | SchedEvent::Msg3Expired { .. }
        )
    }

    /// UE the event refers to, if any
    pub fn rnti(&self) -> Option<Rnti> {
        match *self {
            SchedEvent::HarqFailure { rnti, .. }
            | SchedEvent::RetxDeferred { rnti, .. }
            | SchedEvent::Msg3Expired { rnti, .. } => Some(rnti),
            SchedEvent::RarWindowExpired { temp_rnti, .. } => Some(temp_rnti),
            SchedEvent::SiWindowMissed { .. } | SchedEvent::PagingDropped { .. } => None,
        }
    }
}

impl fmt::Display for SchedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedEvent::HarqFailure { rnti, direction, pid, cause } => {
                write!(f, "{} HARQ failure rnti={} pid={} ({:?})", direction, rnti, pid, cause)
            }
            SchedEvent::RetxDeferred { rnti, direction, pid, tti } => {
                write!(f, "{} retx deferred rnti={} pid={} tti={}", direction, rnti, pid, tti)
            }
            SchedEvent::RarWindowExpired { temp_rnti, preamble_id, prach_tti } => write!(
                f,
                "RAR window expired temp_rnti={} preamble={} prach_tti={}",
                temp_rnti, preamble_id, prach_tti
            ),
            SchedEvent::Msg3Expired { rnti, tti } => write!(f, "Msg3 expired rnti={} tti={}", rnti, tti),
            SchedEvent::SiWindowMissed { si_index, tti } => {
                write!(f, "SI-{} window missed at tti={}", si_index, tti)
            }
            SchedEvent::PagingDropped { bytes, tti } => {
                write!(f, "Paging of {} bytes dropped at tti={}", bytes, tti)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlf_candidates() {
        let failure = SchedEvent::HarqFailure {
            rnti: Rnti(0x46),
            direction: LinkDirection::Downlink,
            pid: 3,
            cause: HarqFailureCause::MaxRetx,
        };
        assert!(failure.is_radio_link_failure_candidate());
        assert_eq!(failure.rnti(), Some(Rnti(0x46)));

        let deferred = SchedEvent::RetxDeferred {
            rnti: Rnti(0x46),
            direction: LinkDirection::Uplink,
            pid: 1,
            tti: Tti::new(9),
        };
        assert!(!deferred.is_radio_link_failure_candidate());
        assert_eq!(deferred.to_string(), "UL retx deferred rnti=0x0046 pid=1 tti=9");

        let missed = SchedEvent::SiWindowMissed { si_index: 1, tti: Tti::new(20) };
        assert_eq!(missed.rnti(), None);
    }
}
