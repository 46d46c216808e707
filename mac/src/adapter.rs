//! Radio Link Adapter
//!
//! Glue between the PHY and the scheduler. PHY indications are dispatched to
//! the scheduler feedback calls, uplink MAC PDUs are demultiplexed
//! (TS 36.321 6.1.2) and once per TTI the DL and UL decisions are taken and
//! handed to the PDU assembler. Nothing on this path blocks or awaits.

use crate::assembler::PduAssemblyRequest;
use crate::events::SchedEvent;
use crate::grants::{DlGrantSet, UlGrantSet};
use crate::pdu::{parse_ul_pdu, UlElement};
use crate::scheduler::CellScheduler;
use crate::{MacError, FDD_HARQ_DELAY_MS};
use bytes::Bytes;
use common::{Lcid, Rnti, Tti};
use interfaces::PhyIndication;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Depth of the queue toward the PDU assembler
pub const PDU_QUEUE_DEPTH: usize = 64;

/// Depth of the scheduler event queue toward the upper layer
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Length of the UE contention resolution identity
const CONRES_ID_LEN: usize = 6;

/// PHY-facing front end of one cell scheduler
pub struct RadioLinkAdapter {
    scheduler: Arc<CellScheduler>,
    pdu_tx: mpsc::Sender<PduAssemblyRequest>,
    event_tx: mpsc::Sender<SchedEvent>,
}

impl RadioLinkAdapter {
    pub fn new(
        scheduler: Arc<CellScheduler>,
        pdu_tx: mpsc::Sender<PduAssemblyRequest>,
        event_tx: mpsc::Sender<SchedEvent>,
    ) -> Self {
        Self { scheduler, pdu_tx, event_tx }
    }

    /// Adapter with fresh bounded queues; returns the receiving ends for the
    /// PDU assembler and the upper layer
    pub fn with_channels(
        scheduler: Arc<CellScheduler>,
    ) -> (Self, mpsc::Receiver<PduAssemblyRequest>, mpsc::Receiver<SchedEvent>) {
        let (pdu_tx, pdu_rx) = mpsc::channel(PDU_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (Self::new(scheduler, pdu_tx, event_tx), pdu_rx, event_rx)
    }

    pub fn scheduler(&self) -> &Arc<CellScheduler> {
        &self.scheduler
    }

    /// Apply one PHY indication
    pub fn handle_indication(&self, indication: PhyIndication) -> Result<(), MacError> {
        trace!("PHY indication {:?}", indication);
        match indication {
            PhyIndication::SchedulingRequest { tti, rnti } => self.scheduler.on_sr(tti, rnti),
            PhyIndication::Rach { tti, preamble_id, timing_advance } => {
                self.scheduler.on_rach(tti, preamble_id, timing_advance).map(|_| ())
            }
            PhyIndication::Crc { tti, rnti, payload_len, ok } => self.scheduler.on_crc(tti, rnti, payload_len, ok),
            PhyIndication::Ack { tti, rnti, tb_index, ack } => {
                self.scheduler.on_ack(tti, rnti, tb_index as usize, ack)
            }
            PhyIndication::Cqi { tti, rnti, value } => self.scheduler.on_cqi(tti, rnti, value),
            PhyIndication::Ri { tti, rnti, value } => self.scheduler.on_ri(tti, rnti, value),
            PhyIndication::Pmi { tti, rnti, value } => self.scheduler.on_pmi(tti, rnti, value),
            PhyIndication::UlCqi { tti, rnti, value } => self.scheduler.on_ul_cqi(tti, rnti, value),
        }
    }

    /// Demultiplex a decoded PUSCH payload
    ///
    /// Buffer status and power headroom reports go to the scheduler, a CCCH
    /// SDU sets the contention resolution identity. Returns the SDUs for RLC.
    pub fn handle_ul_pdu(&self, rnti: Rnti, pdu: &Bytes) -> Result<Vec<(Lcid, Bytes)>, MacError> {
        let mut sdus = Vec::new();
        for element in parse_ul_pdu(pdu)? {
            match element {
                UlElement::ShortBsr { lcg, bytes, truncated } => {
                    trace!("rnti={} BSR lcg={} bytes={} truncated={}", rnti, lcg, bytes, truncated);
                    self.scheduler.set_lcg_bsr(rnti, lcg as usize, bytes)?;
                }
                UlElement::LongBsr { bytes } => {
                    for (lcg, b) in bytes.iter().enumerate() {
                        self.scheduler.set_lcg_bsr(rnti, lcg, *b)?;
                    }
                }
                UlElement::PowerHeadroom { db } => self.scheduler.on_power_headroom(rnti, db)?,
                UlElement::CRnti(crnti) => {
                    debug!("rnti={} identified itself as {}", rnti, crnti);
                }
                UlElement::Sdu { lcid, data } => {
                    if lcid == Lcid::CCCH && data.len() >= CONRES_ID_LEN {
                        let mut id = [0; CONRES_ID_LEN];
                        id.copy_from_slice(&data[..CONRES_ID_LEN]);
                        self.scheduler.set_conres_id(rnti, id)?;
                    }
                    sdus.push((lcid, data));
                }
            }
        }
        Ok(sdus)
    }

    /// Schedule DL of `tti` and the PUSCH of `tti + 4`
    ///
    /// Committed RAR and data grants are queued for assembly and pending
    /// events are forwarded; a full queue drops the item with a warning.
    pub fn run_tti(&self, tti: Tti) -> (DlGrantSet, UlGrantSet) {
        let dl = self.scheduler.schedule_downlink(tti);
        let ul = self.scheduler.schedule_uplink(tti + FDD_HARQ_DELAY_MS);

        for grant in &dl.rar {
            self.submit(PduAssemblyRequest::Rar { tti, grant: grant.clone() });
        }
        for grant in &dl.data {
            self.submit(PduAssemblyRequest::Data { tti, grant: grant.clone() });
        }

        for event in self.scheduler.take_events() {
            if event.is_radio_link_failure_candidate() {
                warn!("Radio link failure candidate: {}", event);
            }
            if let Err(e) = self.event_tx.try_send(event) {
                warn!("Event not forwarded: {}", e);
            }
        }
        (dl, ul)
    }

    /// Remove a UE and drop its buffered transport blocks
    pub fn release_ue(&self, rnti: Rnti) -> Result<(), MacError> {
        self.scheduler.remove_ue(rnti)?;
        self.submit(PduAssemblyRequest::ReleaseUe(rnti));
        Ok(())
    }

    fn submit(&self, request: PduAssemblyRequest) {
        match self.pdu_tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => warn!("PDU assembly queue full, dropping {:?}", request),
            Err(TrySendError::Closed(_)) => warn!("PDU assembler gone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_cell_config, BearerConfig, UeConfig};
    use crate::test_util::init_logging;
    use common::LinkDirection;

    fn adapter() -> (RadioLinkAdapter, mpsc::Receiver<PduAssemblyRequest>, mpsc::Receiver<SchedEvent>) {
        init_logging();
        let scheduler = Arc::new(CellScheduler::new());
        scheduler.configure_cell(default_cell_config(25)).unwrap();
        RadioLinkAdapter::with_channels(scheduler)
    }

    #[test]
    fn test_indications_reach_scheduler() {
        let (adapter, _, _) = adapter();
        let rnti = Rnti(0x100);
        adapter.scheduler().add_ue(rnti, UeConfig::default()).unwrap();
        adapter
            .handle_indication(PhyIndication::Cqi { tti: Tti::new(3), rnti, value: 12 })
            .unwrap();
        adapter.handle_indication(PhyIndication::SchedulingRequest { tti: Tti::new(3), rnti }).unwrap();
        let (cqi, sr) = adapter
            .scheduler()
            .with_ue(rnti, |ue| (ue.channel_quality(LinkDirection::Downlink, Tti::new(4)), ue.sr_pending()))
            .unwrap();
        assert_eq!(cqi, 12);
        assert!(sr);

        let unknown = PhyIndication::Ack { tti: Tti::new(5), rnti: Rnti(0x200), tb_index: 0, ack: true };
        assert!(matches!(adapter.handle_indication(unknown), Err(MacError::UnknownRnti(_))));
    }

    #[test]
    fn test_ul_pdu_updates_buffers() {
        let (adapter, _, _) = adapter();
        let rnti = Rnti(0x100);
        adapter.scheduler().add_ue(rnti, UeConfig::default()).unwrap();
        adapter.scheduler().configure_bearer(rnti, Lcid(3), BearerConfig::new(crate::BearerDirection::BOTH, 3, 1)).unwrap();

        // Short BSR (LCG 1, 200 bytes), PHR, then a DRB SDU
        let pdu = Bytes::from(vec![0x3D, 0x3A, 0x03, 0x54, 30, 1, 2, 3]);
        let sdus = adapter.handle_ul_pdu(rnti, &pdu).unwrap();
        assert_eq!(sdus, vec![(Lcid(3), Bytes::from_static(&[1, 2, 3]))]);
        let pending = adapter
            .scheduler()
            .with_ue(rnti, |ue| ue.pending_ul_bytes(Tti::new(20)))
            .unwrap();
        assert_eq!(pending, 200);

        assert!(adapter.handle_ul_pdu(rnti, &Bytes::from_static(&[0x23, 40, 0x01])).is_err());
    }

    #[test]
    fn test_random_access_through_adapter() {
        let (adapter, mut pdu_rx, mut event_rx) = adapter();
        adapter
            .handle_indication(PhyIndication::Rach { tti: Tti::new(1), preamble_id: 5, timing_advance: 2 })
            .unwrap();
        let rnti = adapter.scheduler().ue_rntis()[0];

        let (dl, _) = adapter.run_tti(Tti::new(4));
        assert_eq!(dl.rar.len(), 1);
        assert!(matches!(pdu_rx.try_recv(), Ok(PduAssemblyRequest::Rar { .. })));

        adapter.run_tti(Tti::new(5));
        let (_, ul) = adapter.run_tti(Tti::new(6));
        assert_eq!(ul.tti, Tti::new(10));
        assert_eq!(ul.msg3.len(), 1);
        assert_eq!(ul.msg3[0].rnti, rnti);

        adapter
            .handle_indication(PhyIndication::Crc { tti: Tti::new(10), rnti, payload_len: 7, ok: true })
            .unwrap();
        // RRC connection request: the first 6 bytes are the identity
        let msg3 = Bytes::from_static(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let sdus = adapter.handle_ul_pdu(rnti, &msg3).unwrap();
        assert_eq!(sdus[0].0, Lcid::CCCH);

        adapter.scheduler().set_dl_buffer(rnti, Lcid::CCCH, 30, 0).unwrap();
        let (dl, _) = adapter.run_tti(Tti::new(11));
        assert_eq!(dl.data.len(), 1);
        assert_eq!(dl.data[0].conres_id, Some([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        match pdu_rx.try_recv() {
            Ok(PduAssemblyRequest::Data { tti, grant }) => {
                assert_eq!(tti, Tti::new(11));
                assert_eq!(grant.rnti, rnti);
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert!(event_rx.try_recv().is_err());
    }

    #[test]
    fn test_expiry_events_are_forwarded() {
        init_logging();
        let mut config = default_cell_config(25);
        config.prach.config_index = 14;
        config.msg3.nof_prb = 20;
        let scheduler = Arc::new(CellScheduler::new());
        scheduler.configure_cell(config).unwrap();
        let (adapter, _pdu_rx, mut event_rx) = RadioLinkAdapter::with_channels(scheduler);

        adapter
            .handle_indication(PhyIndication::Rach { tti: Tti::new(1), preamble_id: 9, timing_advance: 0 })
            .unwrap();
        for t in 1..=15 {
            adapter.run_tti(Tti::new(t));
        }
        assert!(matches!(
            event_rx.try_recv(),
            Ok(SchedEvent::RarWindowExpired { preamble_id: 9, .. })
        ));
    }
}
