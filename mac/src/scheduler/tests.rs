use super::*;
use crate::config::default_cell_config;
use crate::test_util::init_logging;
use crate::ue::NOF_HARQ_PROC;
use common::UnitRange;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

const DRB: Lcid = Lcid(3);
const MAX_RETX: u32 = 4;

fn configured(config: CellConfig) -> CellScheduler {
    init_logging();
    let sched = CellScheduler::new();
    sched.configure_cell(config).unwrap();
    sched
}

fn add_loaded_ue(sched: &CellScheduler, rnti: u16, dl_bytes: u32, ul_bytes: u32) -> Rnti {
    let rnti = Rnti(rnti);
    sched.add_ue(rnti, UeConfig::default()).unwrap();
    sched.configure_bearer(rnti, DRB, BearerConfig::default()).unwrap();
    sched.set_dl_buffer(rnti, DRB, dl_bytes, 0).unwrap();
    sched.set_ul_bsr(rnti, DRB, ul_bytes, true).unwrap();
    rnti
}

fn assert_pairwise_disjoint<T: std::fmt::Debug>(items: &[T], overlaps: impl Fn(&T, &T) -> bool, what: &str, tti: u32) {
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            assert!(!overlaps(a, b), "{} collision at tti={}: {:?} / {:?}", what, tti, a, b);
        }
    }
}

/// PDSCH, PDCCH and PUSCH of one scheduling round never double-book a unit
fn assert_no_collisions(cell: &CellContext, t: u32, dl: &DlGrantSet, ul: &UlGrantSet) {
    let rbgs: Vec<ResourceMask> = dl.rbg_masks().copied().collect();
    assert_pairwise_disjoint(&rbgs, |a, b| a.overlaps(b), "RBG", t);

    // DL assignments and UL grants share the PDCCH of tti t
    let dcis: Vec<DciLocation> = dl
        .dci_locations()
        .copied()
        .chain(ul.grants().filter_map(|g| g.dci))
        .collect();
    assert!(dcis.iter().all(|d| d.range().end() <= cell.nof_cce));
    assert_pairwise_disjoint(&dcis, |a, b| a.range().overlaps(&b.range()), "CCE", t);

    let mut prbs: Vec<UnitRange> = ul.reserved.iter().map(|r| r.range).collect();
    prbs.extend(ul.grants().map(|g| g.range));
    assert_pairwise_disjoint(&prbs, |a, b| a.overlaps(b), "PRB", t + 4);
    assert!(ul.data.iter().all(|g| g.needs_pdcch == g.dci.is_some()));
}

#[test]
fn test_configuration_errors() {
    init_logging();
    let sched = CellScheduler::new();
    assert!(matches!(sched.add_ue(Rnti(0x46), UeConfig::default()), Err(MacError::NotConfigured)));
    assert!(sched.schedule_downlink(Tti::new(5)).is_empty());

    let mut bad = default_cell_config(25);
    bad.prach.freq_offset = 20;
    assert!(matches!(sched.configure_cell(bad), Err(MacError::InvalidConfiguration(_))));
    assert!(!sched.is_configured());

    sched.configure_cell(default_cell_config(25)).unwrap();
    assert!(matches!(sched.on_sr(Tti::new(1), Rnti(0x99)), Err(MacError::UnknownRnti(_))));
    assert!(matches!(sched.remove_ue(Rnti(0x99)), Err(MacError::UnknownRnti(_))));
    assert!(sched.add_ue(Rnti::SI, UeConfig::default()).is_err());

    let rnti = add_loaded_ue(&sched, 0x46, 0, 0);
    assert!(matches!(
        sched.set_dl_buffer(rnti, Lcid(5), 10, 0),
        Err(MacError::InvalidLcid(Lcid(5)))
    ));
    // Adding a known RNTI reconfigures it
    let two_tb = UeConfig { dl_nof_tb: 2, ..UeConfig::default() };
    sched.add_ue(rnti, two_tb).unwrap();
    assert_eq!(sched.with_ue(rnti, |ue| ue.config().dl_nof_tb).unwrap(), 2);
    assert_eq!(sched.ue_rntis(), vec![rnti]);
}

#[test]
fn test_single_ue_full_buffer_scenario() {
    let sched = configured(default_cell_config(25));
    let rnti = add_loaded_ue(&sched, 0x46, 1_000_000, 1_000_000);
    sched.on_cqi(Tti::new(0), rnti, 10).unwrap();

    let mut dl_sent: HashMap<u32, DlGrant> = HashMap::new();
    let mut ul_sent: HashMap<u32, UlGrant> = HashMap::new();
    let mut new_dl_pids = Vec::new();

    for t in 0..50u32 {
        let tti = Tti::new(t);
        // NACK everything until the last allowed retransmission
        if let Some(grant) = t.checked_sub(4).and_then(|tx| dl_sent.remove(&tx)) {
            let tb = grant.tbs[0].unwrap();
            sched.on_ack(tti, rnti, 0, tb.retx_count >= MAX_RETX).unwrap();
        }
        if let Some(grant) = ul_sent.remove(&t) {
            sched.on_crc(tti, rnti, grant.tbs_bytes, grant.retx_count >= MAX_RETX).unwrap();
        }

        let dl = sched.schedule_downlink(tti);
        let ul = sched.schedule_uplink(tti + 4);

        assert_eq!(dl.data.len(), 1, "no DL grant at tti={}", t);
        let grant = dl.data[0].clone();
        let tb = grant.tbs[0].unwrap();
        assert!((grant.pid as usize) < NOF_HARQ_PROC);
        assert!(tb.retx_count <= MAX_RETX);
        if tb.new_data {
            new_dl_pids.push(grant.pid);
        }
        dl_sent.insert(t, grant);

        assert_eq!(ul.data.len(), 1, "no UL grant for PUSCH tti={}", t + 4);
        let grant = ul.data[0];
        assert_eq!(grant.pid as u32, (t + 4) % NOF_HARQ_PROC as u32);
        assert!(grant.retx_count <= MAX_RETX);
        for region in &ul.reserved {
            assert!(!grant.range.overlaps(&region.range), "PUSCH on {:?} at tti={}", region, t + 4);
        }
        ul_sent.insert(t + 4, grant);
    }

    // Eight new transmissions fill the round trip, the next eight reuse the
    // processes freed after their last retransmission
    assert_eq!(new_dl_pids, vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(sched
        .take_events()
        .iter()
        .all(|e| !matches!(e, SchedEvent::HarqFailure { .. })));
}

#[test]
fn test_random_traffic_keeps_invariants() {
    let sched = configured(default_cell_config(25));
    let cell = sched.cell().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let ues: Vec<Rnti> = (0..5).map(|i| add_loaded_ue(&sched, 0x100 + i, 0, 0)).collect();

    let mut dl_sent: HashMap<u32, Vec<DlGrant>> = HashMap::new();
    let mut ul_sent: HashMap<u32, Vec<UlGrant>> = HashMap::new();
    let mut nacked: HashSet<(Rnti, LinkDirection, u8)> = HashSet::new();
    let mut last_retx: HashMap<(Rnti, LinkDirection, u8, usize), u32> = HashMap::new();
    let mut rach_log: Vec<(Rnti, u32)> = Vec::new();
    let mut rar_sent: HashMap<Rnti, u32> = HashMap::new();
    let mut rar_expired: HashSet<Rnti> = HashSet::new();
    let mut expected_msg3: HashMap<u32, Vec<(Rnti, UnitRange)>> = HashMap::new();
    const END: u32 = 800;

    let handle_events = |events: Vec<SchedEvent>,
                         nacked: &mut HashSet<(Rnti, LinkDirection, u8)>,
                         rar_expired: &mut HashSet<Rnti>| {
        for event in events {
            match event {
                SchedEvent::HarqFailure { rnti, direction, pid, .. } => {
                    nacked.remove(&(rnti, direction, pid));
                }
                SchedEvent::RarWindowExpired { temp_rnti, .. } => {
                    assert!(rar_expired.insert(temp_rnti), "expired twice");
                }
                SchedEvent::Msg3Expired { rnti, .. } => panic!("Msg3 of {} never granted", rnti),
                _ => {}
            }
        }
    };

    for t in 0..END {
        let tti = Tti::new(t);

        // HARQ feedback
        for grant in t.checked_sub(4).and_then(|tx| dl_sent.remove(&tx)).unwrap_or_default() {
            for (idx, tb) in grant.tbs.iter().enumerate() {
                let Some(tb) = tb else { continue };
                let ack = rng.gen_bool(0.7);
                sched.on_ack(tti, grant.rnti, idx, ack).unwrap();
                if !ack && tb.retx_count < MAX_RETX {
                    nacked.insert((grant.rnti, LinkDirection::Downlink, grant.pid));
                }
            }
        }
        for grant in ul_sent.remove(&t).unwrap_or_default() {
            let ok = rng.gen_bool(0.7);
            sched.on_crc(tti, grant.rnti, grant.tbs_bytes, ok).unwrap();
            if !ok && grant.retx_count < MAX_RETX {
                nacked.insert((grant.rnti, LinkDirection::Uplink, grant.pid));
            }
        }
        handle_events(sched.take_events(), &mut nacked, &mut rar_expired);

        // Traffic and channel reports
        for &rnti in &ues {
            if rng.gen_bool(0.2) {
                sched.set_dl_buffer(rnti, DRB, rng.gen_range(0..20_000), rng.gen_range(0..200)).unwrap();
            }
            if rng.gen_bool(0.1) {
                sched.set_ul_bsr(rnti, DRB, rng.gen_range(0..20_000), true).unwrap();
            }
            if rng.gen_bool(0.05) {
                sched.on_sr(tti, rnti).unwrap();
            }
            if rng.gen_bool(0.1) {
                sched.on_cqi(tti, rnti, rng.gen_range(1..=15)).unwrap();
            }
        }
        if cell.config.prach.is_prach_tti(tti) && rng.gen_bool(0.4) {
            for _ in 0..rng.gen_range(1..=3) {
                if let Some(rnti) = sched.on_rach(tti, rng.gen_range(0..64), rng.gen_range(0..100)).unwrap() {
                    rach_log.push((rnti, t));
                }
            }
        }
        if rng.gen_bool(0.02) {
            sched.set_paging_pending(rng.gen_range(10..60)).unwrap();
        }

        let dl = sched.schedule_downlink(tti);
        let ul = sched.schedule_uplink(tti + 4);
        assert_eq!(ul.pdcch_tti, tti);

        assert_no_collisions(&cell, t, &dl, &ul);

        // HARQ monotonicity
        for grant in &dl.data {
            for (idx, tb) in grant.tbs.iter().enumerate() {
                let Some(tb) = tb else { continue };
                let key = (grant.rnti, LinkDirection::Downlink, grant.pid, idx);
                check_harq_step(&mut nacked, &mut last_retx, key, tb.new_data, tb.retx_count, t);
            }
        }
        for grant in ul.grants() {
            let key = (grant.rnti, LinkDirection::Uplink, grant.pid, 0);
            check_harq_step(&mut nacked, &mut last_retx, key, grant.new_data, grant.retx_count, t + 4);
        }

        // Random access bookkeeping
        for rar in &dl.rar {
            for entry in &rar.entries {
                assert!(rar_sent.insert(entry.temp_rnti, t).is_none(), "RAR sent twice");
                assert_eq!(entry.msg3_tti, tti + 4 + cell.config.msg3.delay_ms);
                expected_msg3
                    .entry(entry.msg3_tti.value())
                    .or_default()
                    .push((entry.temp_rnti, entry.msg3_range));
            }
        }
        let mut granted: Vec<(Rnti, UnitRange)> = ul.msg3.iter().map(|g| (g.rnti, g.range)).collect();
        let mut expected = expected_msg3.remove(&(t + 4)).unwrap_or_default();
        granted.sort_by_key(|(rnti, _)| *rnti);
        expected.sort_by_key(|(rnti, _)| *rnti);
        assert_eq!(granted, expected, "Msg3 grants of tti={}", t + 4);
        assert!(ul.msg3.iter().all(|g| !g.needs_pdcch && g.dci.is_none() && g.is_msg3));

        handle_events(sched.take_events(), &mut nacked, &mut rar_expired);
        dl_sent.insert(t, dl.data);
        ul_sent.insert(t + 4, ul.grants().copied().collect());
    }

    // RAR window bound: granted inside the window xor reported expired
    let window = cell.config.prach.rar_window;
    let mut checked = 0;
    for (rnti, prach) in rach_log {
        if prach + 3 + window + 1 >= END {
            continue;
        }
        match rar_sent.get(&rnti) {
            Some(&rar_tti) => {
                assert!(!rar_expired.contains(&rnti));
                assert!((prach + 3..=prach + 3 + window).contains(&rar_tti));
            }
            None => assert!(rar_expired.contains(&rnti), "RACH of {} neither answered nor expired", rnti),
        }
        checked += 1;
    }
    assert!(checked > 10);
}

fn check_harq_step(
    nacked: &mut HashSet<(Rnti, LinkDirection, u8)>,
    last_retx: &mut HashMap<(Rnti, LinkDirection, u8, usize), u32>,
    key: (Rnti, LinkDirection, u8, usize),
    new_data: bool,
    retx_count: u32,
    tti: u32,
) {
    let (rnti, dir, pid, _) = key;
    if new_data {
        assert!(
            !nacked.contains(&(rnti, dir, pid)),
            "{} pid={} of {} overwritten with new data at tti={}",
            dir,
            pid,
            rnti,
            tti
        );
        assert_eq!(retx_count, 0);
    } else {
        let prev = last_retx.get(&key).copied().unwrap_or(0);
        assert_eq!(retx_count, prev + 1, "{} pid={} of {} at tti={}", dir, pid, rnti, tti);
        assert!(retx_count <= MAX_RETX);
        nacked.remove(&(rnti, dir, pid));
    }
    last_retx.insert(key, retx_count);
}

#[test]
fn test_retx_not_starved_by_new_data() {
    let sched = configured(default_cell_config(25));
    let a = add_loaded_ue(&sched, 0x46, 100, 0);
    let b = add_loaded_ue(&sched, 0x47, 0, 0);

    let first = sched.schedule_downlink(Tti::new(1));
    assert_eq!(first.data.len(), 1);
    let prev = first.data[0].clone();
    sched.on_ack(Tti::new(5), a, 0, false).unwrap();
    sched.set_dl_buffer(b, DRB, 1_000_000, 0).unwrap();

    let dl = sched.schedule_downlink(Tti::new(9));
    let retx = dl.data.iter().find(|g| g.rnti == a).expect("retransmission granted");
    assert_eq!(retx.pid, prev.pid);
    assert_eq!(retx.rbg_mask, prev.rbg_mask);
    let tb = retx.tbs[0].unwrap();
    assert!(!tb.new_data);
    assert_eq!(tb.retx_count, 1);
    assert_eq!(tb.ndi, prev.tbs[0].unwrap().ndi);
    assert!(dl.data.iter().any(|g| g.rnti == b));
}

#[test]
fn test_deferred_retx_escalates_to_failure() {
    // CFI 1 leaves room for a single L4 DCI, which paging takes first
    let mut config = default_cell_config(25);
    config.cfi = 1;
    let sched = configured(config);
    let a = add_loaded_ue(&sched, 0x46, 100, 0);

    let dl = sched.schedule_downlink(Tti::new(1));
    assert_eq!(dl.data.len(), 1);
    let pid = dl.data[0].pid;
    sched.on_ack(Tti::new(5), a, 0, false).unwrap();

    sched.set_paging_pending(20).unwrap();
    let dl = sched.schedule_downlink(Tti::new(9));
    assert_eq!(dl.broadcast.len(), 1);
    assert!(dl.data.is_empty());
    let deferred = SchedEvent::RetxDeferred { rnti: a, direction: LinkDirection::Downlink, pid, tti: Tti::new(9) };
    assert_eq!(sched.take_events(), vec![deferred]);

    sched.set_paging_pending(20).unwrap();
    assert!(sched.schedule_downlink(Tti::new(10)).data.is_empty());
    assert_eq!(
        sched.take_events(),
        vec![
            SchedEvent::RetxDeferred { rnti: a, direction: LinkDirection::Downlink, pid, tti: Tti::new(10) },
            SchedEvent::HarqFailure {
                rnti: a,
                direction: LinkDirection::Downlink,
                pid,
                cause: HarqFailureCause::RetxStarved,
            },
        ]
    );
    // The process is free again and nothing else is queued
    assert!(sched.schedule_downlink(Tti::new(11)).data.is_empty());
    assert!(sched.with_ue(a, |ue| ue.harq(LinkDirection::Downlink).tbs(pid)[0].is_free()).unwrap());
}

#[test]
fn test_rar_window_expiry_removes_temp_ue() {
    // PRACH in every subframe and Msg3 wider than the PUSCH left next to it:
    // no RAR can ever promise a Msg3
    let mut config = default_cell_config(25);
    config.prach.config_index = 14;
    config.msg3.nof_prb = 20;
    let sched = configured(config);

    let rnti = sched.on_rach(Tti::new(1), 7, 20).unwrap().unwrap();
    assert!(sched.has_ue(rnti));
    for t in 1..=20 {
        let dl = sched.schedule_downlink(Tti::new(t));
        assert!(dl.rar.is_empty());
        let events = sched.take_events();
        if t == 15 {
            assert_eq!(
                events,
                vec![SchedEvent::RarWindowExpired { temp_rnti: rnti, preamble_id: 7, prach_tti: Tti::new(1) }]
            );
        } else {
            assert!(events.is_empty(), "tti={}: {:?}", t, events);
        }
    }
    assert!(!sched.has_ue(rnti));
}

#[test]
fn test_random_access_to_contention_resolution() {
    let sched = configured(default_cell_config(25));
    let rnti = sched.on_rach(Tti::new(1), 12, 5).unwrap().unwrap();
    assert_eq!(rnti, Rnti(0x46));

    assert!(sched.schedule_downlink(Tti::new(3)).rar.is_empty());
    let dl = sched.schedule_downlink(Tti::new(4));
    assert_eq!(dl.rar.len(), 1);
    let rar = &dl.rar[0];
    assert_eq!(rar.ra_rnti, Rnti(2));
    let entry = rar.entries[0];
    assert_eq!(entry.temp_rnti, rnti);
    assert_eq!(entry.msg3_tti, Tti::new(10));

    let ul = sched.schedule_uplink(Tti::new(10));
    assert_eq!(ul.msg3.len(), 1);
    let msg3 = ul.msg3[0];
    assert_eq!(msg3.range, entry.msg3_range);
    assert!(msg3.is_msg3 && !msg3.needs_pdcch && msg3.dci.is_none());

    sched.on_crc(Tti::new(10), rnti, 10, true).unwrap();
    let id = [1, 2, 3, 4, 5, 6];
    sched.set_conres_id(rnti, id).unwrap();
    sched.set_dl_buffer(rnti, Lcid::CCCH, 30, 0).unwrap();

    let dl = sched.schedule_downlink(Tti::new(11));
    assert_eq!(dl.data.len(), 1);
    let msg4 = &dl.data[0];
    assert_eq!(msg4.rnti, rnti);
    assert_eq!(msg4.conres_id, Some(id));
    assert_eq!(msg4.pdu[0], vec![(Lcid::CCCH, 30)]);
    assert!(sched.take_events().is_empty());
}

#[test]
fn test_dci_shortage_keeps_grants_atomic() {
    let mut config = default_cell_config(25);
    config.cfi = 1;
    let sched = configured(config);
    for i in 0..3 {
        add_loaded_ue(&sched, 0x46 + i, 100, 5000);
    }
    // 4 CCEs carry one L4 DCI: one UE gets PDSCH, the others nothing
    let dl = sched.schedule_downlink(Tti::new(1));
    assert_eq!(dl.data.len(), 1);
    // DCI 0s of the PUSCH of tti 5 find the PDCCH of tti 1 full
    let ul = sched.schedule_uplink(Tti::new(5));
    assert!(ul.data.is_empty());
    assert!(sched.take_events().is_empty());
}

#[test]
fn test_reset_is_idempotent() {
    let sched = configured(default_cell_config(25));
    for i in 0..3 {
        add_loaded_ue(&sched, 0x46 + i, 50_000, 50_000);
    }
    sched.on_rach(Tti::new(991), 3, 0).unwrap();
    for t in 990..1000 {
        sched.schedule_downlink(Tti::new(t));
        sched.schedule_uplink(Tti::new(t + 4));
    }

    sched.configure_cell(default_cell_config(25)).unwrap();
    for rnti in sched.ue_rntis() {
        sched.remove_ue(rnti).unwrap();
    }
    assert!(sched.schedule_downlink(Tti::new(1001)).is_empty());
    assert!(sched.schedule_uplink(Tti::new(1005)).is_empty());
}

#[test]
fn test_phich_follows_crc() {
    let sched = configured(default_cell_config(25));
    let a = add_loaded_ue(&sched, 0x46, 0, 500);
    let ul = sched.schedule_uplink(Tti::new(4));
    assert_eq!(ul.data.len(), 1);
    sched.on_crc(Tti::new(4), a, 0, false).unwrap();

    // PUSCH of tti 12 is scheduled with the PDCCH and PHICH of tti 8
    let ul = sched.schedule_uplink(Tti::new(12));
    assert_eq!(ul.pdcch_tti, Tti::new(8));
    assert_eq!(ul.phich, vec![PhichAck { rnti: a, ack: false }]);
    assert_eq!(ul.data.len(), 1);
    assert!(!ul.data[0].needs_pdcch);
}

#[test]
fn test_lowered_retx_limit_releases_processes() {
    let sched = configured(default_cell_config(25));
    let a = add_loaded_ue(&sched, 0x46, 1_000_000, 0);

    // Eight first transmissions, then their first retransmissions, all NACKed
    for t in 0..20u32 {
        if t >= FDD_HARQ_DELAY_MS {
            sched.on_ack(Tti::new(t), a, 0, false).unwrap();
        }
        if t < 16 {
            let dl = sched.schedule_downlink(Tti::new(t));
            assert_eq!(dl.data.len(), 1);
            assert_eq!(dl.data[0].tbs[0].unwrap().retx_count, t / 8);
        }
    }
    assert!(sched.take_events().is_empty());

    sched.add_ue(a, UeConfig { max_harq_retx: 1, ..UeConfig::default() }).unwrap();
    let mut pids = Vec::new();
    for event in sched.take_events() {
        match event {
            SchedEvent::HarqFailure { rnti, direction: LinkDirection::Downlink, pid, cause: HarqFailureCause::MaxRetx } => {
                assert_eq!(rnti, a);
                pids.push(pid);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    pids.sort_unstable();
    assert_eq!(pids, (0..NOF_HARQ_PROC as u8).collect::<Vec<_>>());

    let all_free = sched
        .with_ue(a, |ue| (0..NOF_HARQ_PROC as u8).all(|pid| ue.harq(LinkDirection::Downlink).tbs(pid)[0].is_free()))
        .unwrap();
    assert!(all_free);
    let dl = sched.schedule_downlink(Tti::new(20));
    assert_eq!(dl.data.len(), 1);
    assert!(dl.data[0].tbs[0].unwrap().new_data);
}

#[test]
fn test_saturated_buffers_are_scheduled() {
    let sched = configured(default_cell_config(25));
    let a = add_loaded_ue(&sched, 0x46, 0, 0);
    sched.set_dl_buffer(a, DRB, u32::MAX, 5).unwrap();
    sched.set_lcg_bsr(a, 0, u32::MAX).unwrap();
    sched.set_lcg_bsr(a, 1, 10).unwrap();
    assert_eq!(sched.with_ue(a, |ue| ue.pending_ul_bytes(Tti::new(5))).unwrap(), u32::MAX);

    let dl = sched.schedule_downlink(Tti::new(1));
    assert_eq!(dl.data.len(), 1);
    assert_eq!(dl.data[0].rbg_mask.count(), 13);
    let ul = sched.schedule_uplink(Tti::new(5));
    assert_eq!(ul.data.len(), 1);
}

/// Raises the flag when dropped, so helper threads stop even if the
/// scheduling thread panics
struct SetOnDrop<'a>(&'a AtomicBool);

impl Drop for SetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

#[test]
fn test_concurrent_callbacks_keep_invariants() {
    const END: u32 = 2000;
    let sched = Arc::new(configured(default_cell_config(25)));
    let cell = sched.cell().unwrap();
    let ues: Vec<Rnti> = (0..4).map(|i| add_loaded_ue(&sched, 0x100 + i, 10_000, 10_000)).collect();

    let (finished_tx, finished_rx) = mpsc::channel();
    let worker = {
        let sched = sched.clone();
        let cell = cell.clone();
        let ues = ues.clone();
        thread::spawn(move || {
            let sched = &*sched;
            let ues = &ues;
            let now = AtomicU32::new(0);
            let done = AtomicBool::new(false);

            thread::scope(|s| {
                // Scheduling thread
                s.spawn(|| {
                    let _done = SetOnDrop(&done);
                    for t in 0..END {
                        now.store(t, Ordering::Relaxed);
                        let tti = Tti::new(t);
                        let dl = sched.schedule_downlink(tti);
                        let ul = sched.schedule_uplink(tti + 4);
                        assert_eq!(ul.pdcch_tti, tti);
                        assert_no_collisions(&cell, t, &dl, &ul);
                        assert!(dl.data.iter().all(|g| (g.pid as usize) < NOF_HARQ_PROC));
                        sched.take_events();
                    }
                });

                // HARQ feedback
                s.spawn(|| {
                    let mut rng = StdRng::seed_from_u64(1);
                    while !done.load(Ordering::Acquire) {
                        let tti = Tti::new(now.load(Ordering::Relaxed));
                        let rnti = ues[rng.gen_range(0..ues.len())];
                        if rng.gen_bool(0.5) {
                            sched.on_ack(tti, rnti, 0, rng.gen_bool(0.7)).unwrap();
                        } else {
                            sched.on_crc(tti, rnti, 100, rng.gen_bool(0.7)).unwrap();
                        }
                        thread::yield_now();
                    }
                });

                // Buffer and channel reports
                s.spawn(|| {
                    let mut rng = StdRng::seed_from_u64(2);
                    while !done.load(Ordering::Acquire) {
                        let tti = Tti::new(now.load(Ordering::Relaxed));
                        let rnti = ues[rng.gen_range(0..ues.len())];
                        match rng.gen_range(0..5) {
                            0 => sched.set_dl_buffer(rnti, DRB, rng.gen_range(0..20_000), rng.gen_range(0..200)).unwrap(),
                            1 => sched.set_ul_bsr(rnti, DRB, rng.gen_range(0..20_000), true).unwrap(),
                            2 => sched.on_cqi(tti, rnti, rng.gen_range(1..=15)).unwrap(),
                            3 => sched.on_sr(tti, rnti).unwrap(),
                            _ => sched.set_paging_pending(rng.gen_range(10..60)).unwrap(),
                        }
                        thread::yield_now();
                    }
                });

                // UE churn, reconfiguration and random access
                s.spawn(|| {
                    let mut rng = StdRng::seed_from_u64(3);
                    let mut last_rach = None;
                    while !done.load(Ordering::Acquire) {
                        let tti = Tti::new(now.load(Ordering::Relaxed));
                        let rnti = Rnti(0x300 + rng.gen_range(0..4));
                        match rng.gen_range(0..4) {
                            0 => {
                                let added = sched
                                    .add_ue(rnti, UeConfig::default())
                                    .and_then(|_| sched.configure_bearer(rnti, DRB, BearerConfig::default()))
                                    .and_then(|_| sched.set_dl_buffer(rnti, DRB, rng.gen_range(0..5000), 0));
                                assert!(added.is_ok(), "{:?}", added);
                            }
                            1 => {
                                // Already removed is fine
                                let _ = sched.remove_ue(rnti);
                            }
                            2 => {
                                let config = UeConfig { max_harq_retx: rng.gen_range(1..=4), ..UeConfig::default() };
                                sched.add_ue(ues[rng.gen_range(0..ues.len())], config).unwrap();
                            }
                            _ => {
                                if cell.config.prach.is_prach_tti(tti) && last_rach != Some(tti) {
                                    last_rach = Some(tti);
                                    sched.on_rach(tti, rng.gen_range(0..64), 0).unwrap();
                                }
                            }
                        }
                        thread::yield_now();
                    }
                });
            });
            let _ = finished_tx.send(());
        })
    };

    match finished_rx.recv_timeout(Duration::from_secs(120)) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if let Err(panic) = worker.join() {
                std::panic::resume_unwind(panic);
            }
        }
        Err(RecvTimeoutError::Timeout) => panic!("scheduler threads did not finish: deadlock"),
    }

    for rnti in &ues {
        assert!(sched.has_ue(*rnti));
    }
    let dl = sched.schedule_downlink(Tti::new(END));
    let ul = sched.schedule_uplink(Tti::new(END + 4));
    assert_no_collisions(&cell, END, &dl, &ul);
}
