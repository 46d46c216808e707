//! UE Scheduling Context
//!
//! Per-UE scheduler state: bearer buffer occupancy, channel feedback,
//! HARQ entities for both directions, the UE-specific DCI location table and
//! the contention resolution bookkeeping of the random access procedure.

use crate::cell::CellContext;
use crate::config::{BearerConfig, BearerDirection, UeConfig};
use crate::grants::TbGrant;
use crate::harq::{AckOutcome, HarqEntity, HarqProcess, HarqState};
use crate::pdcch::{AggregationLevel, DciLocationTable};
use crate::{tables, MacError, FDD_HARQ_DELAY_MS, HARQ_RTT_MS};
use common::{Lcid, LinkDirection, ResourceMask, Rnti, Tti};
use std::sync::Arc;
use tracing::{debug, trace};

/// HARQ processes per direction (one FDD round trip)
pub const NOF_HARQ_PROC: usize = HARQ_RTT_MS as usize;

/// Logical channel groups reported by BSR
pub const NOF_LCG: usize = 4;

/// Bytes granted for a scheduling request before any BSR arrives
pub const SR_GRANT_BYTES: u32 = 256;

/// Worst-case MAC subheader of one SDU
pub const SDU_SUBHEADER_BYTES: u32 = 3;

/// Contention resolution identity CE including its subheader
pub const CONRES_CE_BYTES: u32 = 7;

/// Smallest transport block worth granting
pub const MIN_PDU_BYTES: u32 = 4;

/// DL RLC queue of one logical channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DlBuffer {
    queued: u32,
    retx: u32,
}

impl DlBuffer {
    fn total(&self) -> u32 {
        self.queued.saturating_add(self.retx)
    }
}

/// Timestamped channel feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelReport {
    value: u8,
    tti: Tti,
}

/// Outcome of sizing an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    /// RBGs (DL) or PRBs (UL)
    pub units: u16,
    pub mcs: u8,
    /// Transport block size at `units`, nominal for DL
    pub tbs_bytes: u32,
    /// The requested bytes do not fit; a later TTI must carry the rest
    pub truncated: bool,
}

/// Scheduler view of one UE
#[derive(Debug)]
pub struct UeSchedulingContext {
    rnti: Rnti,
    config: UeConfig,
    cell: Arc<CellContext>,
    bearers: [Option<BearerConfig>; Lcid::COUNT],
    dl_buffers: [DlBuffer; Lcid::COUNT],
    ul_bsr: [u32; NOF_LCG],
    sr_pending: bool,
    phr: Option<i8>,
    last_ul_nof_prb: u16,
    dl_cqi: Option<ChannelReport>,
    ri: Option<ChannelReport>,
    pmi: Option<ChannelReport>,
    ul_cqi: Option<ChannelReport>,
    dl_harq: HarqEntity,
    ul_harq: HarqEntity,
    ul_phich: Option<(Tti, bool)>,
    dci_table: DciLocationTable,
    awaiting_msg3: bool,
    msg3_rx_tti: Option<Tti>,
    conres_pending: bool,
    conres_id: Option<[u8; 6]>,
}

impl UeSchedulingContext {
    /// Create a context with only the CCCH configured
    pub fn new(rnti: Rnti, config: UeConfig, cell: Arc<CellContext>) -> Self {
        let mut bearers = [None; Lcid::COUNT];
        bearers[Lcid::CCCH.index()] = Some(BearerConfig::new(BearerDirection::BOTH, 0, 0));
        let nof_proc = cell.config.sched.nof_harq_proc;
        Self {
            rnti,
            dl_harq: HarqEntity::new(
                LinkDirection::Downlink,
                nof_proc,
                config.dl_nof_tb as usize,
                config.max_harq_retx,
            ),
            ul_harq: HarqEntity::new(LinkDirection::Uplink, nof_proc, 1, config.max_harq_retx),
            dci_table: DciLocationTable::ue_specific(rnti, cell.nof_prb(), cell.config.phich_resource),
            config,
            cell,
            bearers,
            dl_buffers: [DlBuffer::default(); Lcid::COUNT],
            ul_bsr: [0; NOF_LCG],
            sr_pending: false,
            phr: None,
            last_ul_nof_prb: 0,
            dl_cqi: None,
            ri: None,
            pmi: None,
            ul_cqi: None,
            ul_phich: None,
            awaiting_msg3: false,
            msg3_rx_tti: None,
            conres_pending: false,
            conres_id: None,
        }
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn config(&self) -> &UeConfig {
        &self.config
    }

    pub fn cell(&self) -> &CellContext {
        &self.cell
    }

    /// Apply a new UE configuration; in-flight HARQ processes are kept
    ///
    /// Returns the processes dropped because a lowered retransmission limit
    /// left them without a retransmission, as `(direction, pid, retx_count)`.
    pub fn reconfigure(&mut self, config: UeConfig) -> Vec<(LinkDirection, u8, u32)> {
        self.dl_harq.set_nof_tb(config.dl_nof_tb as usize);
        let mut dropped: Vec<(LinkDirection, u8, u32)> = Vec::new();
        for dir in [LinkDirection::Downlink, LinkDirection::Uplink] {
            for (pid, _, retx_count) in self.harq_mut(dir).set_max_retx(config.max_harq_retx) {
                if !dropped.iter().any(|&(d, p, _)| d == dir && p == pid) {
                    dropped.push((dir, pid, retx_count));
                }
            }
        }
        self.config = config;
        dropped
    }

    /// Move the UE to a reconfigured cell; HARQ state does not survive
    pub fn set_cell(&mut self, cell: Arc<CellContext>) {
        self.dci_table = DciLocationTable::ue_specific(self.rnti, cell.nof_prb(), cell.config.phich_resource);
        self.cell = cell;
        self.dl_harq.reset();
        self.ul_harq.reset();
        self.ul_phich = None;
        self.last_ul_nof_prb = 0;
    }

    pub fn configure_bearer(&mut self, lcid: Lcid, config: BearerConfig) {
        debug!("rnti={} bearer {} configured: {:?}", self.rnti, lcid.0, config);
        self.bearers[lcid.index()] = Some(config);
    }

    pub fn release_bearer(&mut self, lcid: Lcid) {
        self.bearers[lcid.index()] = None;
        self.dl_buffers[lcid.index()] = DlBuffer::default();
    }

    pub fn bearer(&self, lcid: Lcid) -> Option<&BearerConfig> {
        self.bearers[lcid.index()].as_ref()
    }

    fn bearer_for(&self, lcid: Lcid, direction: BearerDirection) -> Result<&BearerConfig, MacError> {
        self.bearers[lcid.index()]
            .as_ref()
            .filter(|b| b.direction.contains(direction))
            .ok_or(MacError::InvalidLcid(lcid))
    }

    // Buffer state

    /// Set the DL RLC queue of a bearer (new and retransmission bytes)
    pub fn set_dl_buffer(&mut self, lcid: Lcid, queued: u32, retx: u32) -> Result<(), MacError> {
        self.bearer_for(lcid, BearerDirection::DL)?;
        self.dl_buffers[lcid.index()] = DlBuffer { queued, retx };
        trace!("rnti={} DL buffer lcid={} queued={} retx={}", self.rnti, lcid.0, queued, retx);
        Ok(())
    }

    /// Add to the DL RLC queue of a bearer
    pub fn increment_dl_buffer(&mut self, lcid: Lcid, bytes: u32) -> Result<(), MacError> {
        self.bearer_for(lcid, BearerDirection::DL)?;
        let buf = &mut self.dl_buffers[lcid.index()];
        buf.queued = buf.queued.saturating_add(bytes);
        Ok(())
    }

    /// Report UL buffer occupancy of the group `lcid` belongs to; absolute
    /// reports replace the group's value, incremental ones add to it
    pub fn set_ul_bsr(&mut self, lcid: Lcid, bytes: u32, absolute: bool) -> Result<(), MacError> {
        let group = self.bearer_for(lcid, BearerDirection::UL)?.group as usize;
        let bsr = &mut self.ul_bsr[group];
        *bsr = if absolute { bytes } else { bsr.saturating_add(bytes) };
        trace!("rnti={} BSR lcg={} -> {}", self.rnti, group, *bsr);
        Ok(())
    }

    /// BSR control element for one logical channel group
    pub fn set_lcg_bsr(&mut self, lcg: usize, bytes: u32) {
        if let Some(bsr) = self.ul_bsr.get_mut(lcg) {
            *bsr = bytes;
        }
    }

    /// Account bytes received on PUSCH against the reported buffers
    pub fn ul_received(&mut self, bytes: u32) {
        let mut left = bytes;
        for bsr in self.ul_bsr.iter_mut() {
            let taken = left.min(*bsr);
            *bsr -= taken;
            left -= taken;
        }
    }

    pub fn set_sr(&mut self) {
        self.sr_pending = true;
    }

    pub fn sr_pending(&self) -> bool {
        self.sr_pending
    }

    /// Power headroom in dB
    pub fn set_power_headroom(&mut self, phr: i8) {
        self.phr = Some(phr);
    }

    // Channel feedback

    pub fn set_dl_cqi(&mut self, tti: Tti, cqi: u8) {
        self.dl_cqi = Some(ChannelReport { value: cqi.min(tables::MAX_CQI), tti });
    }

    pub fn set_ri(&mut self, tti: Tti, ri: u8) {
        self.ri = Some(ChannelReport { value: ri, tti });
    }

    pub fn set_pmi(&mut self, tti: Tti, pmi: u8) {
        self.pmi = Some(ChannelReport { value: pmi, tti });
    }

    pub fn set_ul_cqi(&mut self, tti: Tti, cqi: u8) {
        self.ul_cqi = Some(ChannelReport { value: cqi.min(tables::MAX_CQI), tti });
    }

    fn valid_report(&self, report: Option<ChannelReport>, tti: Tti) -> Option<u8> {
        report
            .filter(|r| tti.since(r.tti) <= self.cell.config.sched.cqi_validity_ms)
            .map(|r| r.value)
    }

    /// Channel quality to use in `tti`, falling back to the initial CQI
    /// when no recent report exists
    pub fn channel_quality(&self, dir: LinkDirection, tti: Tti) -> u8 {
        let report = match dir {
            LinkDirection::Downlink => self.dl_cqi,
            LinkDirection::Uplink => self.ul_cqi,
        };
        self.valid_report(report, tti).unwrap_or(self.cell.config.sched.initial_cqi)
    }

    /// Last precoding matrix indicator, if still valid
    pub fn pmi(&self, tti: Tti) -> Option<u8> {
        self.valid_report(self.pmi, tti)
    }

    /// Transport blocks for a new DL transmission in `tti`
    pub fn dl_nof_tb(&self, tti: Tti) -> usize {
        let rank = self.valid_report(self.ri, tti).unwrap_or(1);
        if self.config.dl_nof_tb >= 2 && rank >= 2 {
            2
        } else {
            1
        }
    }

    /// Highest MCS allowed by cell and UE configuration
    pub fn max_mcs(&self, dir: LinkDirection) -> u8 {
        let sched = &self.cell.config.sched;
        match dir {
            LinkDirection::Downlink => sched.max_mcs_dl.min(self.config.max_mcs_dl),
            LinkDirection::Uplink => sched.max_mcs_ul.min(self.config.max_mcs_ul),
        }
    }

    /// MCS for a channel quality, or the configured fixed MCS
    pub fn mcs_for_cqi(&self, dir: LinkDirection, cqi: u8) -> u8 {
        let max = self.max_mcs(dir);
        let fixed = match dir {
            LinkDirection::Downlink => self.cell.config.sched.fixed_mcs_dl,
            LinkDirection::Uplink => self.cell.config.sched.fixed_mcs_ul,
        };
        match fixed {
            Some(mcs) => mcs.min(max),
            None => tables::cqi_to_mcs(cqi, max),
        }
    }

    /// DCI aggregation level matching the DL channel quality
    pub fn dci_level(&self, tti: Tti) -> AggregationLevel {
        AggregationLevel::for_cqi(self.channel_quality(LinkDirection::Downlink, tti))
    }

    pub fn dci_table(&self) -> &DciLocationTable {
        &self.dci_table
    }

    // Demand

    /// DL bytes waiting, including MAC overhead
    pub fn pending_dl_bytes(&self, tti: Tti) -> u32 {
        let sdus: u32 = self
            .dl_buffers
            .iter()
            .filter(|b| b.total() > 0)
            .map(|b| b.total().saturating_add(SDU_SUBHEADER_BYTES))
            .fold(0, u32::saturating_add);
        let conres = if self.conres_ce_due(tti) { CONRES_CE_BYTES } else { 0 };
        sdus.saturating_add(conres)
    }

    fn conres_ce_due(&self, tti: Tti) -> bool {
        self.conres_pending
            && self.conres_id.is_some()
            && self.msg3_rx_tti.map_or(false, |rx| tti.is_after(rx))
    }

    /// UL bytes still to be granted for PUSCH in `tti`
    pub fn pending_ul_bytes(&self, tti: Tti) -> u32 {
        let reported = self.ul_bsr.iter().fold(0u32, |acc, b| acc.saturating_add(*b));
        let in_flight = self.ul_harq.in_flight_bytes(Some(self.ul_harq.ul_pid(tti)));
        let pending = reported.saturating_sub(in_flight);
        if pending == 0 && self.sr_pending {
            SR_GRANT_BYTES
        } else {
            pending
        }
    }

    /// UL PRB limit while the UE reports negative power headroom: every
    /// 3 dB below zero halves the previous allocation
    pub fn ul_prb_cap(&self) -> Option<u16> {
        let phr = self.phr.filter(|p| *p < 0)?;
        if self.last_ul_nof_prb == 0 {
            return None;
        }
        let halvings = ((-(phr as i32) + 2) / 3).min(15) as u32;
        Some((self.last_ul_nof_prb >> halvings).max(1))
    }

    /// Smallest allocation whose transport block carries `bytes` at the MCS
    /// for `cqi`, limited to `max_units`; the best achievable size when
    /// nothing fits
    pub fn required_resource_units(&self, dir: LinkDirection, bytes: u32, cqi: u8, max_units: u16) -> ResourceRequest {
        let mcs = self.mcs_for_cqi(dir, cqi);
        let nof_prb = |units: u16| match dir {
            LinkDirection::Downlink => self.cell.nominal_nof_prb(units),
            LinkDirection::Uplink => units,
        };
        let valid = |units: u16| dir == LinkDirection::Downlink || common::is_valid_ul_nof_prb(units);

        let mut best = ResourceRequest { units: 0, mcs, tbs_bytes: 0, truncated: true };
        for units in (1..=max_units).filter(|u| valid(*u)) {
            let tbs_bytes = tables::tbs_bytes_for_mcs(mcs, nof_prb(units), dir);
            best = ResourceRequest { units, mcs, tbs_bytes, truncated: tbs_bytes < bytes };
            if !best.truncated {
                break;
            }
        }
        best
    }

    /// Lowest MCS carrying `tbs` bytes on `nof_prb` PRBs, if any fits
    pub fn mcs_for_tbs(&self, dir: LinkDirection, tbs: u32, nof_prb: u16) -> Option<u8> {
        (0..=self.max_mcs(dir)).find(|&mcs| tables::tbs_bytes_for_mcs(mcs, nof_prb, dir) >= tbs)
    }

    // HARQ

    pub fn harq(&self, dir: LinkDirection) -> &HarqEntity {
        match dir {
            LinkDirection::Downlink => &self.dl_harq,
            LinkDirection::Uplink => &self.ul_harq,
        }
    }

    pub fn harq_mut(&mut self, dir: LinkDirection) -> &mut HarqEntity {
        match dir {
            LinkDirection::Downlink => &mut self.dl_harq,
            LinkDirection::Uplink => &mut self.ul_harq,
        }
    }

    /// Process with a retransmission due in `tti`
    pub fn get_retransmission_harq(&self, dir: LinkDirection, tti: Tti) -> Option<&HarqProcess> {
        let harq = self.harq(dir);
        let pid = harq.pending_retx_pid(tti)?;
        harq.tbs(pid).iter().find(|h| h.has_pending_retx(tti))
    }

    /// Free process for a new transmission in `tti`
    pub fn get_free_harq(&self, dir: LinkDirection, tti: Tti) -> Option<&HarqProcess> {
        let harq = self.harq(dir);
        let pid = match dir {
            LinkDirection::Downlink => harq.free_pid(),
            LinkDirection::Uplink => harq.free_ul_pid(tti),
        }?;
        Some(harq.process(pid, 0))
    }

    /// Start a new DL transmission on every TB in `nof_tb`
    pub fn start_dl_tx(
        &mut self,
        pid: u8,
        tti: Tti,
        mask: ResourceMask,
        mcs: u8,
        tbs: u32,
        nof_tb: usize,
    ) -> Result<[Option<TbGrant>; 2], MacError> {
        let mut grants = [None, None];
        for (tb, grant) in grants.iter_mut().enumerate().take(nof_tb.min(self.dl_harq.nof_tb())) {
            let h = self.dl_harq.process_mut(pid, tb);
            h.start_new(tti, mask, mcs, tbs)?;
            *grant = Some(TbGrant {
                mcs,
                tbs_bytes: tbs,
                ndi: h.ndi(),
                new_data: true,
                retx_count: 0,
            });
        }
        Ok(grants)
    }

    /// Start a new UL transmission on the synchronous process of `tti`
    pub fn start_ul_tx(&mut self, tti: Tti, range_mask: ResourceMask, mcs: u8, tbs: u32) -> Result<TbGrant, MacError> {
        let pid = self.ul_harq.ul_pid(tti);
        let max_retx = self.config.max_harq_retx;
        let h = self.ul_harq.process_mut(pid, 0);
        let _ = h.set_max_retx(max_retx);
        h.start_new(tti, range_mask, mcs, tbs)?;
        let grant = TbGrant {
            mcs,
            tbs_bytes: tbs,
            ndi: h.ndi(),
            new_data: true,
            retx_count: 0,
        };
        self.sr_pending = false;
        self.last_ul_nof_prb = range_mask.count();
        Ok(grant)
    }

    /// Start the implicit Msg3 transmission granted by a RAR
    pub fn start_msg3(&mut self, tti: Tti, range_mask: ResourceMask, mcs: u8, tbs: u32) -> Result<TbGrant, MacError> {
        let pid = self.ul_harq.ul_pid(tti);
        let max_retx = self.config.max_harq_msg3_retx;
        let h = self.ul_harq.process_mut(pid, 0);
        let _ = h.set_max_retx(max_retx);
        h.start_new(tti, range_mask, mcs, tbs)?;
        let grant = TbGrant {
            mcs,
            tbs_bytes: tbs,
            ndi: h.ndi(),
            new_data: true,
            retx_count: 0,
        };
        self.awaiting_msg3 = true;
        Ok(grant)
    }

    /// Retransmit every NACKed TB of `pid` on `mask`
    pub fn start_retx(
        &mut self,
        dir: LinkDirection,
        pid: u8,
        tti: Tti,
        mask: ResourceMask,
        mcs: u8,
    ) -> Result<[Option<TbGrant>; 2], MacError> {
        let mut grants = [None, None];
        for (tb, h) in self.harq_mut(dir).tbs_mut(pid).iter_mut().enumerate() {
            if h.state() != HarqState::Nacked {
                continue;
            }
            h.start_retx(tti, mask)?;
            grants[tb] = Some(TbGrant {
                mcs,
                tbs_bytes: h.tbs(),
                ndi: h.ndi(),
                new_data: false,
                retx_count: h.retx_count(),
            });
        }
        if dir == LinkDirection::Uplink {
            self.last_ul_nof_prb = mask.count();
        }
        Ok(grants)
    }

    /// Count a failed retransmission attempt of `pid`; returns the number of
    /// consecutive attempts that found no resources
    pub fn record_deferral(&mut self, dir: LinkDirection, pid: u8) -> u32 {
        self.harq_mut(dir)
            .tbs_mut(pid)
            .iter_mut()
            .filter(|h| h.state() == HarqState::Nacked)
            .map(|h| h.record_deferral())
            .max()
            .unwrap_or(0)
    }

    /// Drop every TB of `pid`
    pub fn reset_harq(&mut self, dir: LinkDirection, pid: u8) {
        self.harq_mut(dir).tbs_mut(pid).iter_mut().for_each(|h| h.reset());
    }

    /// Treat late feedback as NACK
    pub fn expire_overdue(&mut self, dir: LinkDirection, tti: Tti) -> Vec<(u8, AckOutcome)> {
        self.harq_mut(dir)
            .expire_overdue(tti)
            .into_iter()
            .map(|(pid, _, outcome)| (pid, outcome))
            .collect()
    }

    /// PDSCH HARQ feedback received in `tti` for the TB sent four TTIs earlier
    pub fn on_dl_ack(&mut self, tti: Tti, tb: usize, ack: bool) -> Option<(u8, AckOutcome)> {
        if tb >= self.dl_harq.nof_tb() {
            return None;
        }
        let tx_tti = tti - FDD_HARQ_DELAY_MS;
        let Some(pid) = self.dl_harq.awaiting_pid(tx_tti, tb) else {
            trace!("rnti={} no DL HARQ waiting for feedback of tti={} tb={}", self.rnti, tx_tti, tb);
            return None;
        };
        let outcome = self.dl_harq.process_mut(pid, tb).apply_ack(ack).ok()?;
        Some((pid, outcome))
    }

    /// PUSCH decoding result of `tti`
    pub fn on_ul_crc(&mut self, tti: Tti, payload_len: u32, ok: bool) -> Option<(u8, AckOutcome)> {
        let pid = self.ul_harq.ul_pid(tti);
        let h = self.ul_harq.process_mut(pid, 0);
        if h.state() != HarqState::AwaitingAck || h.tti() != Some(tti) {
            trace!("rnti={} unexpected CRC for tti={}", self.rnti, tti);
            return None;
        }
        let outcome = h.apply_ack(ok).ok()?;
        // PHICH stops the UE after the last retransmission as well
        let phich_ack = !matches!(outcome, AckOutcome::RetxPending);
        self.ul_phich = Some((tti, phich_ack));
        if ok {
            self.ul_received(payload_len);
            if self.awaiting_msg3 {
                self.awaiting_msg3 = false;
                self.msg3_rx_tti = Some(tti);
                self.conres_pending = true;
                debug!("rnti={} Msg3 received at tti={}", self.rnti, tti);
            }
        }
        Some((pid, outcome))
    }

    /// PHICH value for the PUSCH of `pusch_tti`, if its CRC was seen
    pub fn phich_for(&self, pusch_tti: Tti) -> Option<bool> {
        self.ul_phich.filter(|(t, _)| *t == pusch_tti).map(|(_, ack)| ack)
    }

    pub fn awaiting_msg3(&self) -> bool {
        self.awaiting_msg3
    }

    /// Contention resolution identity taken from the Msg3 CCCH SDU
    pub fn set_conres_id(&mut self, id: [u8; 6]) {
        self.conres_id = Some(id);
    }

    /// Split `tbs` bytes over the DL bearers in priority order; the
    /// contention resolution CE goes first when due and `with_ce` is set
    pub fn allocate_dl_payload(&mut self, tti: Tti, tbs: u32, with_ce: bool) -> (Option<[u8; 6]>, Vec<(Lcid, u32)>) {
        let mut left = tbs;
        let mut conres = None;
        if with_ce && self.conres_ce_due(tti) && left >= CONRES_CE_BYTES {
            conres = self.conres_id;
            self.conres_pending = false;
            left -= CONRES_CE_BYTES;
        }

        let mut order: Vec<(u8, Lcid)> = self
            .bearers
            .iter()
            .enumerate()
            .filter_map(|(idx, b)| {
                let b = b.as_ref().filter(|b| b.direction.contains(BearerDirection::DL))?;
                let lcid = Lcid(idx as u8);
                (self.dl_buffers[idx].total() > 0).then_some((b.priority, lcid))
            })
            .collect();
        order.sort();

        let mut pdu = Vec::new();
        for (_, lcid) in order {
            if left <= SDU_SUBHEADER_BYTES {
                break;
            }
            let buf = &mut self.dl_buffers[lcid.index()];
            let bytes = buf.total().min(left - SDU_SUBHEADER_BYTES);
            let from_retx = bytes.min(buf.retx);
            buf.retx -= from_retx;
            buf.queued -= bytes - from_retx;
            left -= bytes + SDU_SUBHEADER_BYTES;
            pdu.push((lcid, bytes));
        }
        (conres, pdu)
    }
}
