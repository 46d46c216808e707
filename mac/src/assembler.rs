//! DL PDU Assembly
//!
//! Runs off the scheduling path as a tokio task. For every committed grant
//! it pulls RLC PDUs, multiplexes the transport blocks and submits them to
//! the PHY. The last transport block of each HARQ process is kept so that
//! retransmissions resend the same bits.

use crate::grants::{DlGrant, RarGrant};
use crate::pdu::{build_dl_pdu, build_rar_pdu, DlElement};
use crate::MacError;
use bytes::Bytes;
use common::{Rnti, Tti};
use interfaces::{DlPdu, PhyTxInterface, RlcInterface};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Work item handed over by the adapter once per committed grant
#[derive(Debug, Clone)]
pub enum PduAssemblyRequest {
    Data { tti: Tti, grant: DlGrant },
    Rar { tti: Tti, grant: RarGrant },
    /// Drop the buffered transport blocks of a released UE
    ReleaseUe(Rnti),
}

/// Builds and submits DL MAC PDUs
pub struct PduAssembler {
    rlc: Arc<dyn RlcInterface>,
    phy: Arc<dyn PhyTxInterface>,
    cell_nof_prb: u16,
    /// Last transport block per (RNTI, HARQ pid, TB index)
    soft_buffers: HashMap<(Rnti, u8, u8), Bytes>,
}

impl PduAssembler {
    pub fn new(rlc: Arc<dyn RlcInterface>, phy: Arc<dyn PhyTxInterface>, cell_nof_prb: u16) -> Self {
        Self {
            rlc,
            phy,
            cell_nof_prb,
            soft_buffers: HashMap::new(),
        }
    }

    /// Serve requests until every sender is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<PduAssemblyRequest>) {
        info!("PDU assembler started");
        while let Some(request) = rx.recv().await {
            if let Err(e) = self.handle(request).await {
                warn!("PDU assembly failed: {}", e);
            }
        }
        info!("PDU assembler stopped");
    }

    pub async fn handle(&mut self, request: PduAssemblyRequest) -> Result<(), MacError> {
        let pdus = match request {
            PduAssemblyRequest::Data { tti, grant } => self.assemble(tti, &grant).await?,
            PduAssemblyRequest::Rar { tti, grant } => {
                let payload = build_rar_pdu(&grant, tti, self.cell_nof_prb)?;
                vec![DlPdu {
                    tti,
                    rnti: grant.ra_rnti,
                    pid: 0,
                    tb_index: 0,
                    retx: false,
                    payload,
                }]
            }
            PduAssemblyRequest::ReleaseUe(rnti) => {
                self.soft_buffers.retain(|(r, _, _), _| *r != rnti);
                return Ok(());
            }
        };
        for pdu in pdus {
            self.phy.send_dl_pdu(pdu).await?;
        }
        Ok(())
    }

    /// Transport blocks of one DL grant
    ///
    /// New data is read from RLC within the byte budget the scheduler set per
    /// logical channel; retransmissions come from the soft buffer.
    pub async fn assemble(&mut self, tti: Tti, grant: &DlGrant) -> Result<Vec<DlPdu>, MacError> {
        let mut pdus = Vec::new();
        for (idx, tb) in grant.tbs.iter().enumerate() {
            let Some(tb) = tb else { continue };
            let key = (grant.rnti, grant.pid, idx as u8);

            let payload = if tb.new_data {
                let mut elements = Vec::with_capacity(grant.pdu[idx].len() + 1);
                if let Some(id) = grant.conres_id.filter(|_| idx == 0) {
                    elements.push(DlElement::ContentionResolution(id));
                }
                for &(lcid, bytes) in &grant.pdu[idx] {
                    let data = self.rlc.read_pdu(grant.rnti, lcid, bytes as usize).await?;
                    if !data.is_empty() {
                        elements.push(DlElement::Sdu { lcid, data });
                    }
                }
                let payload = build_dl_pdu(&elements, tb.tbs_bytes as usize)?;
                self.soft_buffers.insert(key, payload.clone());
                payload
            } else {
                match self.soft_buffers.get(&key) {
                    Some(payload) => payload.clone(),
                    None => {
                        warn!("No buffered TB for retx rnti={} pid={} tb={}", grant.rnti, grant.pid, idx);
                        continue;
                    }
                }
            };

            debug!(
                "DL PDU tti={} rnti={} pid={} tb={} len={} retx={}",
                tti,
                grant.rnti,
                grant.pid,
                idx,
                payload.len(),
                !tb.new_data
            );
            pdus.push(DlPdu {
                tti,
                rnti: grant.rnti,
                pid: grant.pid,
                tb_index: idx as u8,
                retx: !tb.new_data,
                payload,
            });
        }
        Ok(pdus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grants::TbGrant;
    use crate::pdcch::{AggregationLevel, DciLocation};
    use async_trait::async_trait;
    use common::{Lcid, ResourceMask, UnitRange};
    use interfaces::InterfaceError;
    use parking_lot::Mutex;

    /// RLC that hands out `fill` bytes up to the requested size
    struct FixedRlc {
        fill: u8,
    }

    #[async_trait]
    impl RlcInterface for FixedRlc {
        async fn read_pdu(&self, _rnti: Rnti, _lcid: Lcid, max_bytes: usize) -> Result<Bytes, InterfaceError> {
            Ok(Bytes::from(vec![self.fill; max_bytes]))
        }

        async fn write_pdu(&self, _rnti: Rnti, _lcid: Lcid, _pdu: Bytes) -> Result<(), InterfaceError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CapturePhy {
        sent: Mutex<Vec<DlPdu>>,
    }

    #[async_trait]
    impl PhyTxInterface for CapturePhy {
        async fn send_dl_pdu(&self, pdu: DlPdu) -> Result<(), InterfaceError> {
            self.sent.lock().push(pdu);
            Ok(())
        }
    }

    fn assembler() -> (PduAssembler, Arc<CapturePhy>) {
        let phy = Arc::new(CapturePhy::default());
        (PduAssembler::new(Arc::new(FixedRlc { fill: 0xAB }), phy.clone(), 25), phy)
    }

    fn grant(new_data: bool, conres_id: Option<[u8; 6]>, pdu: Vec<(Lcid, u32)>, tbs_bytes: u32) -> DlGrant {
        DlGrant {
            rnti: Rnti(0x46),
            rbg_mask: ResourceMask::from_range(13, UnitRange::new(0, 2)),
            nof_prb: 4,
            dci: DciLocation { ncce: 4, level: AggregationLevel::L4 },
            pid: 3,
            tbs: [
                Some(TbGrant {
                    mcs: 8,
                    tbs_bytes,
                    ndi: true,
                    new_data,
                    retx_count: if new_data { 0 } else { 1 },
                }),
                None,
            ],
            conres_id,
            pdu: [pdu, Vec::new()],
        }
    }

    #[tokio::test]
    async fn test_retx_resends_buffered_tb() {
        let (mut asm, _) = assembler();
        let first = asm.assemble(Tti::new(1), &grant(true, None, vec![(Lcid(3), 20)], 40)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload.len(), 40);
        assert_eq!(&first[0].payload[..3], &[0x23, 20, 0x1F]);
        assert!(!first[0].retx);

        let retx = asm.assemble(Tti::new(9), &grant(false, None, Vec::new(), 40)).await.unwrap();
        assert!(retx[0].retx);
        assert_eq!(retx[0].payload, first[0].payload);
    }

    #[tokio::test]
    async fn test_contention_resolution_goes_first() {
        let (mut asm, _) = assembler();
        let id = [9, 8, 7, 6, 5, 4];
        let pdus = asm.assemble(Tti::new(11), &grant(true, Some(id), vec![(Lcid::CCCH, 10)], 18)).await.unwrap();
        let payload = &pdus[0].payload;
        assert_eq!(&payload[..2], &[0x3C, 0x00]);
        assert_eq!(&payload[2..8], &id);
    }

    #[tokio::test]
    async fn test_retx_without_buffer_is_skipped() {
        let (mut asm, _) = assembler();
        let pdus = asm.assemble(Tti::new(9), &grant(false, None, Vec::new(), 40)).await.unwrap();
        assert!(pdus.is_empty());

        asm.assemble(Tti::new(1), &grant(true, None, vec![(Lcid(3), 20)], 40)).await.unwrap();
        asm.handle(PduAssemblyRequest::ReleaseUe(Rnti(0x46))).await.unwrap();
        assert!(asm.soft_buffers.is_empty());
    }

    #[tokio::test]
    async fn test_run_submits_to_phy() {
        let (asm, phy) = assembler();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(asm.run(rx));

        tx.send(PduAssemblyRequest::Data {
            tti: Tti::new(2),
            grant: grant(true, None, vec![(Lcid(3), 100)], 120),
        })
        .await
        .unwrap();
        // A grant whose SDUs overflow the TB is reported and skipped
        tx.send(PduAssemblyRequest::Data {
            tti: Tti::new(3),
            grant: grant(true, None, vec![(Lcid(3), 100)], 50),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let sent = phy.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tti, Tti::new(2));
        assert_eq!(sent[0].payload.len(), 120);
    }
}
