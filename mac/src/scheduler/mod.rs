//! Cell Scheduler Implementation
//!
//! Per-TTI orchestration of broadcast, random access and user-plane
//! allocation for one FDD cell (TS 36.321 5.1-5.4, TS 36.213 7.1 / 8).
//!
//! Locks are always taken in the order: TTI state, random access, UE table,
//! then individual UE contexts in RNTI order.

#[cfg(test)]
mod tests;

use crate::broadcast::BroadcastScheduler;
use crate::cell::CellContext;
use crate::config::{BearerConfig, CellConfig, UeConfig};
use crate::events::{HarqFailureCause, SchedEvent};
use crate::grants::{DlGrant, DlGrantSet, PhichAck, TbGrant, UlGrant, UlGrantSet};
use crate::harq::AckOutcome;
use crate::pdcch::{allocate_dci, DciLocation};
use crate::policy::{new_policy, Allocation, AllocationKind, AllocationPolicy, Deferral};
use crate::random_access::{PendingRandomAccess, RaScheduler};
use crate::ue::UeSchedulingContext;
use crate::{tables, MacError, FDD_HARQ_DELAY_MS, HARQ_RTT_MS};
use common::{Lcid, LinkDirection, ResourceMask, Rnti, Tti};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// PDCCH capacity is tracked for this many consecutive DL subframes
const PDCCH_RING_SIZE: usize = 10;

/// CCE usage of one DL subframe
#[derive(Debug, Clone, Copy)]
struct PdcchSlot {
    tti: Option<Tti>,
    cces: ResourceMask,
}

/// State written only by the scheduling thread
struct TtiState {
    dl_policy: Box<dyn AllocationPolicy>,
    ul_policy: Box<dyn AllocationPolicy>,
    pdcch: [PdcchSlot; PDCCH_RING_SIZE],
    broadcast: BroadcastScheduler,
}

impl TtiState {
    fn new(cell: &CellContext) -> Self {
        let policy = cell.config.sched.policy;
        Self {
            dl_policy: new_policy(policy, LinkDirection::Downlink),
            ul_policy: new_policy(policy, LinkDirection::Uplink),
            pdcch: [PdcchSlot { tti: None, cces: cell.empty_cce_mask() }; PDCCH_RING_SIZE],
            broadcast: BroadcastScheduler::new(cell.config.broadcast.sibs.len()),
        }
    }

    /// CCEs already taken in the PDCCH of `tti`
    fn cces(&mut self, cell: &CellContext, tti: Tti) -> ResourceMask {
        let slot = &mut self.pdcch[tti.value() as usize % PDCCH_RING_SIZE];
        if slot.tti != Some(tti) {
            *slot = PdcchSlot { tti: Some(tti), cces: cell.empty_cce_mask() };
        }
        slot.cces
    }

    fn store_cces(&mut self, tti: Tti, cces: ResourceMask) {
        self.pdcch[tti.value() as usize % PDCCH_RING_SIZE] = PdcchSlot { tti: Some(tti), cces };
    }
}

/// Random access tables and the temporary C-RNTI allocator
struct RaState {
    scheduler: RaScheduler,
    next_rnti: u16,
}

type UeTable = BTreeMap<Rnti, Mutex<UeSchedulingContext>>;

/// MAC scheduler of one cell
///
/// Every method takes `&self`: feedback and configuration calls may come
/// from any thread while one driver thread calls `schedule_downlink` and
/// `schedule_uplink` once per TTI.
pub struct CellScheduler {
    cell: RwLock<Option<Arc<CellContext>>>,
    tti_state: Mutex<Option<TtiState>>,
    ra: Mutex<RaState>,
    ues: RwLock<UeTable>,
    events: Mutex<Vec<SchedEvent>>,
}

impl Default for CellScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CellScheduler {
    /// Create an unconfigured scheduler
    pub fn new() -> Self {
        Self {
            cell: RwLock::new(None),
            tti_state: Mutex::new(None),
            ra: Mutex::new(RaState {
                scheduler: RaScheduler::new(),
                next_rnti: Rnti::FIRST_C_RNTI,
            }),
            ues: RwLock::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    // Configuration

    /// Validate and apply a cell configuration
    ///
    /// Existing UEs are kept but lose their HARQ state; pending random
    /// access attempts, broadcast windows and per-TTI state are reset.
    pub fn configure_cell(&self, config: CellConfig) -> Result<(), MacError> {
        config.validate()?;
        let cell = Arc::new(CellContext::new(config));

        let mut state = self.tti_state.lock();
        let mut ra = self.ra.lock();
        let mut ues = self.ues.write();
        for ue in ues.values_mut() {
            ue.get_mut().set_cell(cell.clone());
        }
        ra.scheduler.reset();
        *state = Some(TtiState::new(&cell));
        *self.cell.write() = Some(cell.clone());

        info!(
            "Cell {} configured: {} PRBs, {} RBGs of {}, {} CCEs at CFI {}",
            cell.config.cell_id.0,
            cell.nof_prb(),
            cell.nof_rbg,
            cell.rbg_size,
            cell.nof_cce,
            cell.cfi()
        );
        Ok(())
    }

    /// Current cell context, if configured
    pub fn cell(&self) -> Option<Arc<CellContext>> {
        self.cell.read().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.cell.read().is_some()
    }

    fn require_cell(&self) -> Result<Arc<CellContext>, MacError> {
        self.cell().ok_or(MacError::NotConfigured)
    }

    /// Create a UE context, or reconfigure it if the RNTI is known
    pub fn add_ue(&self, rnti: Rnti, config: UeConfig) -> Result<(), MacError> {
        config.validate()?;
        if !rnti.is_c_rnti() {
            return Err(MacError::InvalidConfiguration(format!("{} is not a C-RNTI", rnti)));
        }
        let cell = self.require_cell()?;
        let mut ues = self.ues.write();
        let dropped = if let Some(ue) = ues.get_mut(&rnti) {
            debug!("UE {} reconfigured", rnti);
            ue.get_mut().reconfigure(config)
        } else {
            ues.insert(rnti, Mutex::new(UeSchedulingContext::new(rnti, config, cell)));
            info!("UE {} added ({} UEs)", rnti, ues.len());
            Vec::new()
        };
        drop(ues);
        for (direction, pid, retx_count) in dropped {
            warn!("{} HARQ {} of {} dropped after {} retransmissions by reconfiguration", direction, pid, rnti, retx_count);
            self.push_event(SchedEvent::HarqFailure {
                rnti,
                direction,
                pid,
                cause: HarqFailureCause::MaxRetx,
            });
        }
        Ok(())
    }

    /// Drop a UE context; in-flight HARQ processes are discarded
    pub fn remove_ue(&self, rnti: Rnti) -> Result<(), MacError> {
        let mut ra = self.ra.lock();
        let mut ues = self.ues.write();
        if ues.remove(&rnti).is_none() {
            return Err(MacError::UnknownRnti(rnti));
        }
        ra.scheduler.remove_rnti(rnti);
        info!("UE {} removed ({} UEs)", rnti, ues.len());
        Ok(())
    }

    pub fn has_ue(&self, rnti: Rnti) -> bool {
        self.ues.read().contains_key(&rnti)
    }

    /// RNTIs of every UE context, in ascending order
    pub fn ue_rntis(&self) -> Vec<Rnti> {
        self.ues.read().keys().copied().collect()
    }

    /// Run `f` on one UE under the table read lock
    pub fn with_ue<R>(&self, rnti: Rnti, f: impl FnOnce(&mut UeSchedulingContext) -> R) -> Result<R, MacError> {
        let ues = self.ues.read();
        let ue = ues.get(&rnti).ok_or(MacError::UnknownRnti(rnti))?;
        let mut ue = ue.lock();
        Ok(f(&mut ue))
    }

    pub fn configure_bearer(&self, rnti: Rnti, lcid: Lcid, config: BearerConfig) -> Result<(), MacError> {
        config.validate()?;
        if lcid.0 > Lcid::MAX {
            return Err(MacError::InvalidLcid(lcid));
        }
        self.with_ue(rnti, |ue| ue.configure_bearer(lcid, config))
    }

    pub fn release_bearer(&self, rnti: Rnti, lcid: Lcid) -> Result<(), MacError> {
        if lcid.0 > Lcid::MAX {
            return Err(MacError::InvalidLcid(lcid));
        }
        self.with_ue(rnti, |ue| ue.release_bearer(lcid))
    }

    /// RLC queue state of a DL bearer
    pub fn set_dl_buffer(&self, rnti: Rnti, lcid: Lcid, queued: u32, retx: u32) -> Result<(), MacError> {
        if lcid.0 > Lcid::MAX {
            return Err(MacError::InvalidLcid(lcid));
        }
        self.with_ue(rnti, |ue| ue.set_dl_buffer(lcid, queued, retx))?
    }

    /// UL buffer report for the group of a bearer
    pub fn set_ul_bsr(&self, rnti: Rnti, lcid: Lcid, bytes: u32, absolute: bool) -> Result<(), MacError> {
        if lcid.0 > Lcid::MAX {
            return Err(MacError::InvalidLcid(lcid));
        }
        self.with_ue(rnti, |ue| ue.set_ul_bsr(lcid, bytes, absolute))?
    }

    /// UL buffer report for one logical channel group (BSR MAC CE)
    pub fn set_lcg_bsr(&self, rnti: Rnti, lcg: usize, bytes: u32) -> Result<(), MacError> {
        self.with_ue(rnti, |ue| ue.set_lcg_bsr(lcg, bytes))
    }

    /// Queue a paging message for the next free broadcast opportunity
    pub fn set_paging_pending(&self, bytes: u32) -> Result<(), MacError> {
        let mut state = self.tti_state.lock();
        let state = state.as_mut().ok_or(MacError::NotConfigured)?;
        state.broadcast.set_paging_pending(bytes);
        Ok(())
    }

    /// Contention resolution identity from the Msg3 CCCH SDU
    pub fn set_conres_id(&self, rnti: Rnti, id: [u8; 6]) -> Result<(), MacError> {
        self.with_ue(rnti, |ue| ue.set_conres_id(id))
    }

    // Feedback

    pub fn on_sr(&self, tti: Tti, rnti: Rnti) -> Result<(), MacError> {
        trace!("SR from {} at tti={}", rnti, tti);
        self.with_ue(rnti, |ue| ue.set_sr())
    }

    /// Register a detected preamble and create its temporary UE context
    ///
    /// Returns `None` when the pending RAR table is full; the preamble is
    /// ignored and the UE will retry.
    pub fn on_rach(&self, tti: Tti, preamble_id: u8, timing_advance: u16) -> Result<Option<Rnti>, MacError> {
        let cell = self.require_cell()?;
        let mut ra = self.ra.lock();
        if ra.scheduler.nof_pending_rar() >= crate::random_access::MAX_PENDING_RAR {
            warn!("Pending RAR table full, dropping preamble {} at tti={}", preamble_id, tti);
            return Ok(None);
        }
        let mut ues = self.ues.write();
        let rnti = allocate_rnti(&mut ra.next_rnti, &ues).ok_or(MacError::RntiExhausted)?;
        ues.insert(rnti, Mutex::new(UeSchedulingContext::new(rnti, UeConfig::default(), cell)));
        ra.scheduler.add_rach(PendingRandomAccess {
            prach_tti: tti,
            preamble_id,
            timing_advance,
            temp_rnti: rnti,
        });
        info!("RACH preamble {} at tti={} ta={}: temp C-RNTI {}", preamble_id, tti, timing_advance, rnti);
        Ok(Some(rnti))
    }

    /// PUSCH decoding result
    pub fn on_crc(&self, tti: Tti, rnti: Rnti, payload_len: u32, ok: bool) -> Result<(), MacError> {
        let result = self.with_ue(rnti, |ue| ue.on_ul_crc(tti, payload_len, ok))?;
        if let Some((pid, AckOutcome::MaxRetxReached { retx_count })) = result {
            warn!("UL HARQ {} of {} failed after {} retransmissions", pid, rnti, retx_count);
            self.push_event(SchedEvent::HarqFailure {
                rnti,
                direction: LinkDirection::Uplink,
                pid,
                cause: HarqFailureCause::MaxRetx,
            });
        }
        Ok(())
    }

    /// PDSCH HARQ feedback for one transport block
    pub fn on_ack(&self, tti: Tti, rnti: Rnti, tb: usize, ack: bool) -> Result<(), MacError> {
        let result = self.with_ue(rnti, |ue| ue.on_dl_ack(tti, tb, ack))?;
        if let Some((pid, AckOutcome::MaxRetxReached { retx_count })) = result {
            warn!("DL HARQ {} of {} failed after {} retransmissions", pid, rnti, retx_count);
            self.push_event(SchedEvent::HarqFailure {
                rnti,
                direction: LinkDirection::Downlink,
                pid,
                cause: HarqFailureCause::MaxRetx,
            });
        }
        Ok(())
    }

    pub fn on_cqi(&self, tti: Tti, rnti: Rnti, cqi: u8) -> Result<(), MacError> {
        self.with_ue(rnti, |ue| ue.set_dl_cqi(tti, cqi))
    }

    pub fn on_ri(&self, tti: Tti, rnti: Rnti, ri: u8) -> Result<(), MacError> {
        self.with_ue(rnti, |ue| ue.set_ri(tti, ri))
    }

    pub fn on_pmi(&self, tti: Tti, rnti: Rnti, pmi: u8) -> Result<(), MacError> {
        self.with_ue(rnti, |ue| ue.set_pmi(tti, pmi))
    }

    pub fn on_ul_cqi(&self, tti: Tti, rnti: Rnti, cqi: u8) -> Result<(), MacError> {
        self.with_ue(rnti, |ue| ue.set_ul_cqi(tti, cqi))
    }

    /// Power headroom in dB
    pub fn on_power_headroom(&self, rnti: Rnti, phr: i8) -> Result<(), MacError> {
        self.with_ue(rnti, |ue| ue.set_power_headroom(phr))
    }

    /// Drain the events reported since the last call
    pub fn take_events(&self) -> Vec<SchedEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push_event(&self, event: SchedEvent) {
        self.events.lock().push(event);
    }

    // Scheduling

    /// DL decision for `tti`: broadcast, then RAR, then user data
    pub fn schedule_downlink(&self, tti: Tti) -> DlGrantSet {
        const DIR: LinkDirection = LinkDirection::Downlink;
        let Some(cell) = self.cell() else {
            return DlGrantSet::new(tti, 0);
        };
        let mut result = DlGrantSet::new(tti, cell.cfi());
        let mut events = Vec::new();

        let mut state_guard = self.tti_state.lock();
        let Some(state) = state_guard.as_mut() else {
            return result;
        };
        let mut rbgs = cell.empty_rbg_mask();
        let mut cces = state.cces(&cell, tti);

        result.broadcast = state.broadcast.schedule(&cell, tti, &mut rbgs, &mut cces, &mut events);

        {
            let mut ra = self.ra.lock();
            let expired = ra.scheduler.expire(tti, cell.config.prach.rar_window, &mut events);
            if !expired.is_empty() {
                let mut ues = self.ues.write();
                for rnti in expired {
                    ues.remove(&rnti);
                }
            }
            result.rar = ra.scheduler.schedule_rar(&cell, tti, &mut rbgs, &mut cces);
        }

        let ues = self.ues.read();
        let mut guards = lock_all(&ues);
        for ue in guards.iter_mut() {
            report_expired(ue, DIR, tti, &mut events);
        }

        {
            let views: Vec<&UeSchedulingContext> = guards.iter().map(|g| &**g).collect();
            state.dl_policy.new_tti(&views, rbgs, tti);
        }
        let allocations: Vec<Allocation> = state.dl_policy.allocations().to_vec();
        let mut deferrals: Vec<Deferral> = state.dl_policy.deferrals().to_vec();

        for alloc in allocations {
            let Some(ue) = find_ue(&mut guards, alloc.rnti) else {
                state.dl_policy.release(alloc.rnti);
                continue;
            };
            let level = ue.dci_level(tti);
            let Some(dci) = allocate_dci(&mut cces, ue.dci_table(), cell.cfi(), tti, level) else {
                debug!("No CCEs for DL rnti={} at tti={}, releasing RBGs", alloc.rnti, tti);
                state.dl_policy.release(alloc.rnti);
                if alloc.is_retx() {
                    deferrals.push(Deferral { rnti: alloc.rnti, pid: alloc.pid });
                }
                continue;
            };

            let nof_prb = cell.rbg_mask_nof_prb(&alloc.mask);
            let committed = match alloc.kind {
                AllocationKind::NewTx { mcs, nof_tb } => {
                    let tbs = tables::tbs_bytes_for_mcs(mcs, nof_prb, DIR);
                    ue.start_dl_tx(alloc.pid, tti, alloc.mask, mcs, tbs, nof_tb)
                }
                AllocationKind::Retx { mcs, .. } => ue.start_retx(DIR, alloc.pid, tti, alloc.mask, mcs),
            };
            let tbs = match committed {
                Ok(tbs) => tbs,
                Err(e) => {
                    warn!("DL commit for rnti={} pid={} failed: {}", alloc.rnti, alloc.pid, e);
                    release_dci(&mut cces, &dci);
                    state.dl_policy.release(alloc.rnti);
                    continue;
                }
            };

            let mut conres_id = None;
            let mut pdu: [Vec<(Lcid, u32)>; 2] = [Vec::new(), Vec::new()];
            for (idx, tb) in tbs.iter().enumerate() {
                if let Some(tb) = tb.filter(|tb| tb.new_data) {
                    let (ce, sdus) = ue.allocate_dl_payload(tti, tb.tbs_bytes, idx == 0);
                    conres_id = conres_id.or(ce);
                    pdu[idx] = sdus;
                }
            }
            debug!(
                "DL rnti={} pid={} rbgs={:?} prb={} cce={}/{:?} tbs={:?}",
                alloc.rnti,
                alloc.pid,
                alloc.mask,
                nof_prb,
                dci.ncce,
                dci.level,
                tbs.iter().flatten().map(|tb| tb.tbs_bytes).collect::<Vec<_>>()
            );
            result.data.push(DlGrant {
                rnti: alloc.rnti,
                rbg_mask: alloc.mask,
                nof_prb,
                dci,
                pid: alloc.pid,
                tbs,
                conres_id,
                pdu,
            });
        }

        let max_deferrals = cell.config.sched.max_retx_deferrals;
        for deferral in deferrals {
            if let Some(ue) = find_ue(&mut guards, deferral.rnti) {
                record_deferral(ue, DIR, deferral.pid, tti, max_deferrals, &mut events);
            }
        }

        state.store_cces(tti, cces);
        drop(guards);
        drop(ues);
        drop(state_guard);

        if !result.is_empty() {
            trace!(
                "DL tti={}: {} broadcast, {} RAR, {} data grants",
                tti,
                result.broadcast.len(),
                result.rar.len(),
                result.data.len()
            );
        }
        self.events.lock().extend(events);
        result
    }

    /// UL decision for the PUSCH of `tti`; DCI 0s and PHICH go out in the
    /// PDCCH of `tti - 4`
    pub fn schedule_uplink(&self, tti: Tti) -> UlGrantSet {
        const DIR: LinkDirection = LinkDirection::Uplink;
        let pdcch_tti = tti - FDD_HARQ_DELAY_MS;
        let mut result = UlGrantSet::new(tti, pdcch_tti);
        let Some(cell) = self.cell() else {
            return result;
        };
        let mut events = Vec::new();

        let mut state_guard = self.tti_state.lock();
        let Some(state) = state_guard.as_mut() else {
            return result;
        };
        result.reserved = cell.ul_reserved(tti);
        let mut prbs = cell.ul_base_mask(tti);
        let mut cces = state.cces(&cell, pdcch_tti);

        let msg3 = self.ra.lock().scheduler.take_msg3(tti, &mut events);

        let ues = self.ues.read();
        let mut guards = lock_all(&ues);
        let phich_tti = tti - HARQ_RTT_MS;
        for ue in guards.iter_mut() {
            report_expired(ue, DIR, tti, &mut events);
            if let Some(ack) = ue.phich_for(phich_tti) {
                result.phich.push(PhichAck { rnti: ue.rnti(), ack });
            }
        }

        for m in msg3 {
            let Some(ue) = find_ue(&mut guards, m.rnti) else {
                debug!("Msg3 of removed UE {} dropped", m.rnti);
                continue;
            };
            let mask = ResourceMask::from_range(prbs.size(), m.range);
            if !prbs.try_reserve(&mask) {
                warn!("Msg3 PRBs {} of {} already taken at tti={}", m.range, m.rnti, tti);
                events.push(SchedEvent::Msg3Expired { rnti: m.rnti, tti });
                continue;
            }
            let tbs = tables::tbs_bytes_for_mcs(m.mcs, m.range.length, DIR);
            match ue.start_msg3(tti, mask, m.mcs, tbs) {
                Ok(tb) => {
                    debug!("Msg3 rnti={} tti={} prbs={}", m.rnti, tti, m.range);
                    result.msg3.push(ul_grant(m.rnti, m.range, ue.harq(DIR).ul_pid(tti), tb, None, true));
                }
                Err(e) => {
                    warn!("Msg3 commit for {} failed: {}", m.rnti, e);
                    prbs.release(&mask);
                }
            }
        }

        {
            let views: Vec<&UeSchedulingContext> = guards.iter().map(|g| &**g).collect();
            state.ul_policy.new_tti(&views, prbs, tti);
        }
        let allocations: Vec<Allocation> = state.ul_policy.allocations().to_vec();
        let mut deferrals: Vec<Deferral> = state.ul_policy.deferrals().to_vec();

        for alloc in allocations {
            let Some(ue) = find_ue(&mut guards, alloc.rnti) else {
                state.ul_policy.release(alloc.rnti);
                continue;
            };
            let Some(range) = alloc.mask.contiguous_range() else {
                warn!("Non-contiguous UL allocation for {} dropped", alloc.rnti);
                state.ul_policy.release(alloc.rnti);
                continue;
            };
            let needs_pdcch = !matches!(alloc.kind, AllocationKind::Retx { adaptive: false, .. });
            let dci = if needs_pdcch {
                let level = ue.dci_level(pdcch_tti);
                match allocate_dci(&mut cces, ue.dci_table(), cell.cfi(), pdcch_tti, level) {
                    Some(dci) => Some(dci),
                    None => {
                        debug!("No CCEs for DCI 0 of {} at tti={}, releasing PRBs", alloc.rnti, pdcch_tti);
                        state.ul_policy.release(alloc.rnti);
                        if alloc.is_retx() {
                            deferrals.push(Deferral { rnti: alloc.rnti, pid: alloc.pid });
                        }
                        continue;
                    }
                }
            } else {
                None
            };

            let is_msg3 = alloc.is_retx() && ue.awaiting_msg3();
            let committed = match alloc.kind {
                AllocationKind::NewTx { mcs, .. } => {
                    let tbs = tables::tbs_bytes_for_mcs(mcs, range.length, DIR);
                    ue.start_ul_tx(tti, alloc.mask, mcs, tbs).map(Some)
                }
                AllocationKind::Retx { mcs, .. } => {
                    ue.start_retx(DIR, alloc.pid, tti, alloc.mask, mcs).map(|tbs| tbs[0])
                }
            };
            match committed {
                Ok(Some(tb)) => {
                    debug!(
                        "UL rnti={} pid={} prbs={} mcs={} tbs={} retx={} pdcch={}",
                        alloc.rnti, alloc.pid, range, tb.mcs, tb.tbs_bytes, tb.retx_count, needs_pdcch
                    );
                    result.data.push(ul_grant(alloc.rnti, range, alloc.pid, tb, dci, is_msg3));
                }
                Ok(None) | Err(_) => {
                    warn!("UL commit for rnti={} pid={} failed: {:?}", alloc.rnti, alloc.pid, committed);
                    if let Some(dci) = dci {
                        release_dci(&mut cces, &dci);
                    }
                    state.ul_policy.release(alloc.rnti);
                }
            }
        }

        let max_deferrals = cell.config.sched.max_retx_deferrals;
        for deferral in deferrals {
            if let Some(ue) = find_ue(&mut guards, deferral.rnti) {
                record_deferral(ue, DIR, deferral.pid, tti, max_deferrals, &mut events);
            }
        }

        state.store_cces(pdcch_tti, cces);
        drop(guards);
        drop(ues);
        drop(state_guard);

        if !result.is_empty() {
            trace!("UL tti={}: {} Msg3, {} data grants", tti, result.msg3.len(), result.data.len());
        }
        self.events.lock().extend(events);
        result
    }
}

/// Next free C-RNTI after the last one handed out
fn allocate_rnti(next: &mut u16, ues: &UeTable) -> Option<Rnti> {
    let span = Rnti::LAST_C_RNTI - Rnti::FIRST_C_RNTI + 1;
    for _ in 0..span {
        let candidate = Rnti(*next);
        *next = if *next >= Rnti::LAST_C_RNTI { Rnti::FIRST_C_RNTI } else { *next + 1 };
        if !ues.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Lock every UE context in RNTI order
fn lock_all(ues: &UeTable) -> Vec<MutexGuard<'_, UeSchedulingContext>> {
    ues.values().map(|ue| ue.lock()).collect()
}

fn find_ue<'a, 'b>(
    guards: &'a mut [MutexGuard<'b, UeSchedulingContext>],
    rnti: Rnti,
) -> Option<&'a mut UeSchedulingContext> {
    let idx = guards.binary_search_by_key(&rnti, |ue| ue.rnti()).ok()?;
    Some(&mut *guards[idx])
}

fn release_dci(cces: &mut ResourceMask, dci: &DciLocation) {
    cces.release(&ResourceMask::from_range(cces.size(), dci.range()));
}

/// Treat feedback lost for a full round trip as NACK
fn report_expired(ue: &mut UeSchedulingContext, dir: LinkDirection, tti: Tti, events: &mut Vec<SchedEvent>) {
    for (pid, outcome) in ue.expire_overdue(dir, tti) {
        if let AckOutcome::MaxRetxReached { .. } = outcome {
            warn!("{} HARQ {} of {} failed, feedback lost", dir, pid, ue.rnti());
            events.push(SchedEvent::HarqFailure {
                rnti: ue.rnti(),
                direction: dir,
                pid,
                cause: HarqFailureCause::MaxRetx,
            });
        }
    }
}

/// Report a retransmission that found no resources; after `max_deferrals`
/// consecutive attempts the process is given up
fn record_deferral(
    ue: &mut UeSchedulingContext,
    dir: LinkDirection,
    pid: u8,
    tti: Tti,
    max_deferrals: u32,
    events: &mut Vec<SchedEvent>,
) {
    let rnti = ue.rnti();
    let count = ue.record_deferral(dir, pid);
    warn!("{} retx of {} pid={} deferred at tti={} ({} in a row)", dir, rnti, pid, tti, count);
    events.push(SchedEvent::RetxDeferred { rnti, direction: dir, pid, tti });
    if count >= max_deferrals {
        ue.reset_harq(dir, pid);
        events.push(SchedEvent::HarqFailure {
            rnti,
            direction: dir,
            pid,
            cause: HarqFailureCause::RetxStarved,
        });
    }
}

fn ul_grant(rnti: Rnti, range: common::UnitRange, pid: u8, tb: TbGrant, dci: Option<DciLocation>, is_msg3: bool) -> UlGrant {
    UlGrant {
        rnti,
        range,
        mcs: tb.mcs,
        tbs_bytes: tb.tbs_bytes,
        pid,
        ndi: tb.ndi,
        new_data: tb.new_data,
        retx_count: tb.retx_count,
        needs_pdcch: dci.is_some(),
        dci,
        is_msg3,
    }
}
