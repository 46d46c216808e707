//! Random Access Scheduling
//!
//! Tracks detected preambles until their RAR is sent inside the response
//! window, and the Msg3 grants promised by each RAR until their PUSCH TTI
//! (TS 36.321 5.1.4, TS 36.213 6.1.1).

use crate::cell::CellContext;
use crate::events::SchedEvent;
use crate::grants::{RarEntry, RarGrant};
use crate::pdcch::{allocate_dci, AggregationLevel};
use crate::{tables, FDD_HARQ_DELAY_MS};
use common::{LengthRule, LinkDirection, ResourceMask, Rnti, Tti, UnitRange};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Preambles waiting for a RAR at any time
pub const MAX_PENDING_RAR: usize = 16;

/// RAR window starts this many TTIs after the preamble
pub const RAR_WINDOW_OFFSET: u32 = 3;

/// E/T/RAPID subheader plus the 6-byte MAC RAR
pub const RAR_BYTES_PER_ENTRY: u32 = 7;

const RAR_LEVEL: AggregationLevel = AggregationLevel::L4;

/// Preamble waiting for its random access response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRandomAccess {
    pub prach_tti: Tti,
    pub preamble_id: u8,
    pub timing_advance: u16,
    pub temp_rnti: Rnti,
}

impl PendingRandomAccess {
    pub fn ra_rnti(&self) -> Rnti {
        Rnti::ra_rnti(self.prach_tti)
    }

    fn window_open(&self, tti: Tti, window: u32) -> bool {
        let d = tti.since(self.prach_tti);
        (RAR_WINDOW_OFFSET..=RAR_WINDOW_OFFSET + window).contains(&d)
    }
}

/// Non-wrapping count of the TTIs seen by `expire`
///
/// Starts one period in so that TTIs just before the first one seen still
/// have a position.
#[derive(Debug, Clone, Copy)]
struct TtiClock {
    last: Option<Tti>,
    elapsed: u64,
}

impl Default for TtiClock {
    fn default() -> Self {
        Self { last: None, elapsed: u64::from(Tti::PERIOD) }
    }
}

impl TtiClock {
    fn advance(&mut self, tti: Tti) -> u64 {
        if let Some(last) = self.last {
            self.elapsed += u64::from(tti.since(last));
        }
        self.last = Some(tti);
        self.elapsed
    }

    /// Position of `tti`, taken as the occurrence nearest the clock
    fn position(&self, tti: Tti) -> u64 {
        let Some(last) = self.last else {
            return self.elapsed;
        };
        let ahead = tti.since(last);
        if ahead < Tti::PERIOD / 2 {
            self.elapsed + u64::from(ahead)
        } else {
            self.elapsed.saturating_sub(u64::from(last.since(tti)))
        }
    }
}

/// Queued preamble with its expiry position on the clock, fixed on the
/// first `expire` after it arrives
#[derive(Debug, Clone, Copy)]
struct RarAttempt {
    rach: PendingRandomAccess,
    deadline: Option<u64>,
}

/// Msg3 grant promised by a transmitted RAR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMsg3 {
    pub rnti: Rnti,
    /// PUSCH TTI
    pub tti: Tti,
    pub range: UnitRange,
    pub mcs: u8,
}

/// Pending RAR and Msg3 tables
#[derive(Debug, Default)]
pub struct RaScheduler {
    pending_rar: Vec<RarAttempt>,
    pending_msg3: Vec<PendingMsg3>,
    clock: TtiClock,
}

impl RaScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every pending attempt
    pub fn reset(&mut self) {
        self.pending_rar.clear();
        self.pending_msg3.clear();
        self.clock = TtiClock::default();
    }

    /// Queue a detected preamble; false when the table is full
    pub fn add_rach(&mut self, rach: PendingRandomAccess) -> bool {
        if self.pending_rar.len() >= MAX_PENDING_RAR {
            return false;
        }
        self.pending_rar.push(RarAttempt { rach, deadline: None });
        true
    }

    pub fn nof_pending_rar(&self) -> usize {
        self.pending_rar.len()
    }

    pub fn pending_msg3(&self) -> &[PendingMsg3] {
        &self.pending_msg3
    }

    /// Forget everything about a removed UE
    pub fn remove_rnti(&mut self, rnti: Rnti) {
        self.pending_rar.retain(|a| a.rach.temp_rnti != rnti);
        self.pending_msg3.retain(|m| m.rnti != rnti);
    }

    /// Drop attempts whose window has closed; returns their temporary RNTIs
    ///
    /// Must run once per DL TTI before `schedule_rar`. Expiry is measured
    /// on a non-wrapping clock, so TTIs skipped by the caller still count.
    pub fn expire(&mut self, tti: Tti, window: u32, events: &mut Vec<SchedEvent>) -> Vec<Rnti> {
        let now = self.clock.advance(tti);
        let clock = self.clock;
        let mut expired = Vec::new();
        self.pending_rar.retain_mut(|a| {
            let prach_tti = a.rach.prach_tti;
            let deadline = *a
                .deadline
                .get_or_insert_with(|| clock.position(prach_tti) + u64::from(RAR_WINDOW_OFFSET + window));
            if now <= deadline {
                return true;
            }
            let r = &a.rach;
            warn!(
                "RAR window expired for preamble {} (prach tti={}, temp rnti={})",
                r.preamble_id, r.prach_tti, r.temp_rnti
            );
            events.push(SchedEvent::RarWindowExpired {
                temp_rnti: r.temp_rnti,
                preamble_id: r.preamble_id,
                prach_tti: r.prach_tti,
            });
            expired.push(r.temp_rnti);
            false
        });
        expired
    }

    /// Build RAR PDUs for every RA-RNTI with an open window, reserving DL
    /// RBGs, common-space CCEs and the Msg3 PRBs of `tti + 4 + delay`
    pub fn schedule_rar(
        &mut self,
        cell: &CellContext,
        tti: Tti,
        rbgs: &mut ResourceMask,
        cces: &mut ResourceMask,
    ) -> Vec<RarGrant> {
        let window = cell.config.prach.rar_window;
        let mut groups: BTreeMap<Rnti, Vec<PendingRandomAccess>> = BTreeMap::new();
        for rach in self.pending_rar.iter().map(|a| &a.rach).filter(|r| r.window_open(tti, window)) {
            groups.entry(rach.ra_rnti()).or_default().push(*rach);
        }

        let msg3_cfg = &cell.config.msg3;
        let msg3_tti = tti + FDD_HARQ_DELAY_MS + msg3_cfg.delay_ms;
        let mut ul_used = cell.ul_base_mask(msg3_tti);
        for m in self.pending_msg3.iter().filter(|m| m.tti == msg3_tti) {
            ul_used.reserve_range(m.range);
        }

        let mut grants = Vec::new();
        for (ra_rnti, attempts) in groups {
            let mut ul_candidate = ul_used;
            let mut entries = Vec::new();
            for rach in attempts.iter().take(cell.config.prach.max_rar_per_pdu) {
                let Some(range) = ul_candidate.first_fit(msg3_cfg.nof_prb, LengthRule::UlWaveform) else {
                    debug!("No PUSCH room for Msg3 at tti={}", msg3_tti);
                    break;
                };
                ul_candidate.reserve_range(range);
                entries.push(RarEntry {
                    preamble_id: rach.preamble_id,
                    timing_advance: rach.timing_advance,
                    temp_rnti: rach.temp_rnti,
                    msg3_range: range,
                    msg3_mcs: msg3_cfg.mcs,
                    msg3_tti,
                });
            }
            if entries.is_empty() {
                continue;
            }

            let mcs = cell.config.broadcast.mcs;
            let bytes = entries.len() as u32 * RAR_BYTES_PER_ENTRY;
            let Some(mask) = cell.dl_mask_for_bytes(rbgs, bytes, mcs) else {
                debug!("No RBGs for RAR {} at tti={}", ra_rnti, tti);
                continue;
            };
            let Some(dci) = allocate_dci(cces, &cell.common_dci, cell.cfi(), tti, RAR_LEVEL) else {
                debug!("No CCEs for RAR {} at tti={}", ra_rnti, tti);
                continue;
            };
            rbgs.reserve(&mask);
            ul_used = ul_candidate;

            for entry in &entries {
                self.pending_rar
                    .retain(|a| !(a.rach.temp_rnti == entry.temp_rnti && a.rach.preamble_id == entry.preamble_id));
                self.pending_msg3.push(PendingMsg3 {
                    rnti: entry.temp_rnti,
                    tti: entry.msg3_tti,
                    range: entry.msg3_range,
                    mcs: entry.msg3_mcs,
                });
            }
            info!("RAR {} at tti={} with {} responses, Msg3 at tti={}", ra_rnti, tti, entries.len(), msg3_tti);

            let nof_prb = cell.rbg_mask_nof_prb(&mask);
            grants.push(RarGrant {
                ra_rnti,
                rbg_mask: mask,
                nof_prb,
                dci,
                mcs,
                tbs_bytes: tables::tbs_bytes_for_mcs(mcs, nof_prb, LinkDirection::Downlink),
                entries,
            });
        }
        grants
    }

    /// Msg3 grants due on PUSCH in `tti`; stale ones are reported and dropped
    pub fn take_msg3(&mut self, tti: Tti, events: &mut Vec<SchedEvent>) -> Vec<PendingMsg3> {
        let mut due = Vec::new();
        self.pending_msg3.retain(|m| {
            if m.tti == tti {
                due.push(*m);
                return false;
            }
            if tti.is_after(m.tti) {
                warn!("Msg3 of rnti={} for tti={} was never granted", m.rnti, m.tti);
                events.push(SchedEvent::Msg3Expired { rnti: m.rnti, tti: m.tti });
                return false;
            }
            true
        });
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_cell_config;

    fn rach(prach_tti: u32, preamble_id: u8, rnti: u16) -> PendingRandomAccess {
        PendingRandomAccess {
            prach_tti: Tti::new(prach_tti),
            preamble_id,
            timing_advance: 12,
            temp_rnti: Rnti(rnti),
        }
    }

    fn schedule(ra: &mut RaScheduler, cell: &CellContext, tti: u32) -> Vec<RarGrant> {
        let mut rbgs = cell.empty_rbg_mask();
        let mut cces = cell.empty_cce_mask();
        ra.schedule_rar(cell, Tti::new(tti), &mut rbgs, &mut cces)
    }

    #[test]
    fn test_rar_waits_for_window() {
        let cell = CellContext::new(default_cell_config(25));
        let mut ra = RaScheduler::new();
        assert!(ra.add_rach(rach(11, 5, 0x46)));
        assert!(schedule(&mut ra, &cell, 13).is_empty());
        let grants = schedule(&mut ra, &cell, 14);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].ra_rnti, Rnti(2));
        assert_eq!(ra.nof_pending_rar(), 0);
        assert_eq!(ra.pending_msg3().len(), 1);
        assert_eq!(ra.pending_msg3()[0].tti, Tti::new(14 + 4 + 2));
    }

    #[test]
    fn test_rar_batches_same_ra_rnti() {
        let cell = CellContext::new(default_cell_config(25));
        let mut ra = RaScheduler::new();
        ra.add_rach(rach(11, 5, 0x46));
        ra.add_rach(rach(11, 9, 0x47));
        let grants = schedule(&mut ra, &cell, 15);
        assert_eq!(grants.len(), 1);
        let entries = &grants[0].entries;
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].msg3_range.overlaps(&entries[1].msg3_range));
        assert!(grants[0].tbs_bytes >= 2 * RAR_BYTES_PER_ENTRY);

        // Msg3 PRBs stay clear of PUCCH and, in PRACH TTIs, of PRACH
        let base = cell.ul_base_mask(entries[0].msg3_tti);
        for e in entries {
            assert!(!base.overlaps_range(e.msg3_range));
            assert_eq!(e.msg3_range.length, 3);
        }
    }

    #[test]
    fn test_window_expiry_reports_once() {
        let cell = CellContext::new(default_cell_config(25));
        let mut ra = RaScheduler::new();
        ra.add_rach(rach(11, 5, 0x46));
        let mut events = Vec::new();
        assert!(ra.expire(Tti::new(24), 10, &mut events).is_empty());
        assert_eq!(ra.expire(Tti::new(25), 10, &mut events), vec![Rnti(0x46)]);
        assert!(ra.expire(Tti::new(26), 10, &mut events).is_empty());
        assert_eq!(events.len(), 1);
        assert!(schedule(&mut ra, &cell, 25).is_empty());
    }

    #[test]
    fn test_expiry_survives_skipped_ttis() {
        let mut ra = RaScheduler::new();
        let mut events = Vec::new();
        assert!(ra.expire(Tti::new(10), 10, &mut events).is_empty());
        ra.add_rach(rach(11, 5, 0x46));
        assert!(ra.expire(Tti::new(12), 10, &mut events).is_empty());
        // Driver jumps more than half a period ahead
        let late = Tti::new(12) + Tti::PERIOD / 2 + 100;
        assert_eq!(ra.expire(late, 10, &mut events), vec![Rnti(0x46)]);
        assert_eq!(events.len(), 1);
        assert_eq!(ra.nof_pending_rar(), 0);
    }

    #[test]
    fn test_preamble_before_first_tti_uses_nearest_occurrence() {
        let mut ra = RaScheduler::new();
        let mut events = Vec::new();
        ra.add_rach(rach(10238, 5, 0x46));
        // The clock starts after the SFN wrap
        assert!(ra.expire(Tti::new(2), 10, &mut events).is_empty());
        assert!(ra.expire(Tti::new(11), 10, &mut events).is_empty());
        assert_eq!(ra.expire(Tti::new(12), 10, &mut events), vec![Rnti(0x46)]);
    }

    #[test]
    fn test_pending_table_limit() {
        let mut ra = RaScheduler::new();
        for i in 0..MAX_PENDING_RAR {
            assert!(ra.add_rach(rach(1, i as u8, 0x46 + i as u16)));
        }
        assert!(!ra.add_rach(rach(1, 63, 0x100)));
    }

    #[test]
    fn test_take_msg3() {
        let cell = CellContext::new(default_cell_config(25));
        let mut ra = RaScheduler::new();
        ra.add_rach(rach(1, 5, 0x46));
        ra.add_rach(rach(3, 7, 0x47));
        schedule(&mut ra, &cell, 5);
        schedule(&mut ra, &cell, 6);
        assert_eq!(ra.pending_msg3().len(), 2);

        let mut events = Vec::new();
        let due = ra.take_msg3(Tti::new(11), &mut events);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].rnti, Rnti(0x46));
        // Msg3 of 0x47 at tti 12 was skipped
        assert!(ra.take_msg3(Tti::new(13), &mut events).is_empty());
        assert_eq!(events, vec![SchedEvent::Msg3Expired { rnti: Rnti(0x47), tti: Tti::new(12) }]);
    }
}
