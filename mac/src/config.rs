//! Scheduler Configuration
//!
//! Cell-wide parameters supplied once by the RRC layer through
//! `configure_cell`, and per-UE / per-bearer parameters supplied at
//! connection time. Cell configuration can also be loaded from TOML.

use crate::{pdcch, MacError};
use anyhow::Context;
use bitflags::bitflags;
use common::{Bandwidth, CellId, Tti, UnitRange};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// PRBs occupied by one PRACH occasion
pub const PRACH_NOF_PRB: u16 = 6;

/// Largest RAR window allowed by TS 36.331 (ra-ResponseWindowSize)
pub const MAX_RAR_WINDOW: u32 = 10;

/// PHICH resource Ng (TS 36.211 6.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhichResource {
    #[default]
    OneSixth,
    Half,
    One,
    Two,
}

impl PhichResource {
    /// Number of PHICH groups for normal cyclic prefix
    pub fn nof_groups(&self, nof_prb: u16) -> u32 {
        let (num, den) = match self {
            PhichResource::OneSixth => (1, 6),
            PhichResource::Half => (1, 2),
            PhichResource::One => (1, 1),
            PhichResource::Two => (2, 1),
        };
        common::ceil_div(num * nof_prb as u32, den * 8)
    }
}

/// PRACH configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrachConfig {
    /// PRACH configuration index (format 0, indices 0-15)
    #[serde(default = "default_prach_config_index")]
    pub config_index: u8,
    /// First PRB of the PRACH region
    #[serde(default = "default_prach_freq_offset")]
    pub freq_offset: u16,
    /// RAR window length in TTIs
    #[serde(default = "default_rar_window")]
    pub rar_window: u32,
    /// Maximum random access responses batched in one RAR PDU
    #[serde(default = "default_max_rar_per_pdu")]
    pub max_rar_per_pdu: usize,
}

fn default_prach_config_index() -> u8 {
    3
}

fn default_prach_freq_offset() -> u16 {
    2
}

fn default_rar_window() -> u32 {
    10
}

fn default_max_rar_per_pdu() -> usize {
    8
}

impl Default for PrachConfig {
    fn default() -> Self {
        Self {
            config_index: default_prach_config_index(),
            freq_offset: default_prach_freq_offset(),
            rar_window: default_rar_window(),
            max_rar_per_pdu: default_max_rar_per_pdu(),
        }
    }
}

impl PrachConfig {
    /// Frame parity and subframes of the PRACH occasions
    /// (TS 36.211 Table 5.7.1-2, preamble format 0)
    fn occasions(&self) -> Option<(bool, &'static [u32])> {
        let entry: (bool, &'static [u32]) = match self.config_index {
            0 => (true, &[1]),
            1 => (true, &[4]),
            2 => (true, &[7]),
            3 => (false, &[1]),
            4 => (false, &[4]),
            5 => (false, &[7]),
            6 => (false, &[1, 6]),
            7 => (false, &[2, 7]),
            8 => (false, &[3, 8]),
            9 => (false, &[1, 4, 7]),
            10 => (false, &[2, 5, 8]),
            11 => (false, &[3, 6, 9]),
            12 => (false, &[0, 2, 4, 6, 8]),
            13 => (false, &[1, 3, 5, 7, 9]),
            14 => (false, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]),
            15 => (true, &[9]),
            _ => return None,
        };
        Some(entry)
    }

    /// True if the given TTI carries a PRACH occasion
    pub fn is_prach_tti(&self, tti: Tti) -> bool {
        match self.occasions() {
            Some((even_only, subframes)) => {
                (!even_only || tti.sfn() % 2 == 0) && subframes.contains(&tti.sf_idx())
            }
            None => false,
        }
    }

    /// PRBs reserved for PRACH in occasion TTIs
    pub fn region(&self) -> UnitRange {
        UnitRange::new(self.freq_offset, PRACH_NOF_PRB)
    }
}

/// PUCCH reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PucchConfig {
    /// PRBs reserved at each edge of the UL band
    #[serde(default = "default_nrb_pucch")]
    pub nrb_pucch: u16,
}

fn default_nrb_pucch() -> u16 {
    2
}

impl Default for PucchConfig {
    fn default() -> Self {
        Self { nrb_pucch: default_nrb_pucch() }
    }
}

/// One system information block / SI message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SibConfig {
    /// Payload size in bytes
    pub len: u32,
    /// Periodicity in radio frames (ignored for SIB1, which repeats every 2 frames)
    pub period_rf: u32,
}

/// Broadcast schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// SIB1 first, then the SI messages in scheduling order
    #[serde(default = "default_sibs")]
    pub sibs: Vec<SibConfig>,
    /// SI window length in TTIs
    #[serde(default = "default_si_window_ms")]
    pub si_window_ms: u32,
    /// MCS used for SI, paging and RAR
    #[serde(default = "default_bc_mcs")]
    pub mcs: u8,
}

fn default_sibs() -> Vec<SibConfig> {
    vec![
        SibConfig { len: 18, period_rf: 8 },
        SibConfig { len: 41, period_rf: 16 },
    ]
}

fn default_si_window_ms() -> u32 {
    20
}

fn default_bc_mcs() -> u8 {
    2
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            sibs: default_sibs(),
            si_window_ms: default_si_window_ms(),
            mcs: default_bc_mcs(),
        }
    }
}

/// Msg3 grant parameters placed in every RAR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg3Config {
    #[serde(default = "default_msg3_nof_prb")]
    pub nof_prb: u16,
    #[serde(default)]
    pub mcs: u8,
    /// Extra delay on top of the UL grant delay (Msg3 at RAR TTI + 4 + delay)
    #[serde(default = "default_msg3_delay")]
    pub delay_ms: u32,
}

fn default_msg3_nof_prb() -> u16 {
    3
}

fn default_msg3_delay() -> u32 {
    2
}

impl Default for Msg3Config {
    fn default() -> Self {
        Self {
            nof_prb: default_msg3_nof_prb(),
            mcs: 0,
            delay_ms: default_msg3_delay(),
        }
    }
}

/// Allocation strategy selected at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    RoundRobin,
}

/// Tunables of the user-plane allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerParams {
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default = "default_max_mcs")]
    pub max_mcs_dl: u8,
    #[serde(default = "default_max_mcs")]
    pub max_mcs_ul: u8,
    /// Bypass CQI-based link adaptation in DL
    #[serde(default)]
    pub fixed_mcs_dl: Option<u8>,
    /// Bypass CQI-based link adaptation in UL
    #[serde(default)]
    pub fixed_mcs_ul: Option<u8>,
    /// CQI assumed before the first report or after it went stale
    #[serde(default = "default_initial_cqi")]
    pub initial_cqi: u8,
    /// Age in TTIs after which a CQI report is no longer trusted
    #[serde(default = "default_cqi_validity_ms")]
    pub cqi_validity_ms: u32,
    /// Consecutive failed retransmission attempts tolerated before the HARQ
    /// process is declared failed
    #[serde(default = "default_max_retx_deferrals")]
    pub max_retx_deferrals: u32,
    /// HARQ processes per direction; FDD needs one per TTI of the round trip
    #[serde(default = "default_nof_harq_proc")]
    pub nof_harq_proc: usize,
}

fn default_max_mcs() -> u8 {
    28
}

fn default_initial_cqi() -> u8 {
    6
}

fn default_cqi_validity_ms() -> u32 {
    80
}

fn default_max_retx_deferrals() -> u32 {
    2
}

fn default_nof_harq_proc() -> usize {
    crate::HARQ_RTT_MS as usize
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            max_mcs_dl: default_max_mcs(),
            max_mcs_ul: default_max_mcs(),
            fixed_mcs_dl: None,
            fixed_mcs_ul: None,
            initial_cqi: default_initial_cqi(),
            cqi_validity_ms: default_cqi_validity_ms(),
            max_retx_deferrals: default_max_retx_deferrals(),
            nof_harq_proc: default_nof_harq_proc(),
        }
    }
}

/// Static per-cell parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    /// Cell ID
    pub cell_id: CellId,
    /// Number of PRBs in DL and UL
    pub nof_prb: u16,
    /// Control format indicator (OFDM symbols of the control region)
    #[serde(default = "default_cfi")]
    pub cfi: u8,
    #[serde(default)]
    pub phich_resource: PhichResource,
    #[serde(default)]
    pub prach: PrachConfig,
    #[serde(default)]
    pub pucch: PucchConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub msg3: Msg3Config,
    #[serde(default)]
    pub sched: SchedulerParams,
}

fn default_cfi() -> u8 {
    3
}

/// Create default cell configuration for testing
pub fn default_cell_config(nof_prb: u16) -> CellConfig {
    CellConfig {
        cell_id: CellId(1),
        nof_prb,
        cfi: default_cfi(),
        phich_resource: PhichResource::default(),
        prach: PrachConfig::default(),
        pucch: PucchConfig::default(),
        broadcast: BroadcastConfig::default(),
        msg3: Msg3Config::default(),
        sched: SchedulerParams::default(),
    }
}

fn invalid(msg: String) -> MacError {
    MacError::InvalidConfiguration(msg)
}

impl CellConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(contents: &str) -> Result<Self, MacError> {
        let config: CellConfig =
            toml::from_str(contents).map_err(|e| invalid(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading cell configuration {}", path.display()))?;
        let config = Self::from_toml_str(&contents)
            .with_context(|| format!("parsing cell configuration {}", path.display()))?;
        info!("Loaded cell configuration from {}", path.display());
        Ok(config)
    }

    /// PRBs usable for PUSCH (between the PUCCH edges)
    pub fn pusch_region(&self) -> UnitRange {
        let edge = self.pucch.nrb_pucch;
        UnitRange::new(edge, self.nof_prb.saturating_sub(2 * edge))
    }

    /// Reject inconsistent parameter sets
    pub fn validate(&self) -> Result<(), MacError> {
        if Bandwidth::from_nof_prb(self.nof_prb).is_none() {
            return Err(invalid(format!("unsupported number of PRBs: {}", self.nof_prb)));
        }
        if !(1..=3).contains(&self.cfi) {
            return Err(invalid(format!("CFI must be 1-3, got {}", self.cfi)));
        }
        let nof_cce = pdcch::nof_cces(self.nof_prb, self.cfi, self.phich_resource);
        if nof_cce < pdcch::AggregationLevel::L4.nof_cce() {
            return Err(invalid(format!(
                "control region of {} CCEs cannot carry a common DCI",
                nof_cce
            )));
        }

        let pusch = self.pusch_region();
        if 2 * self.pucch.nrb_pucch >= self.nof_prb {
            return Err(invalid(format!(
                "PUCCH reservation of {} PRBs per edge leaves no PUSCH in {} PRBs",
                self.pucch.nrb_pucch, self.nof_prb
            )));
        }

        if self.prach.occasions().is_none() {
            return Err(invalid(format!(
                "unsupported PRACH configuration index {}",
                self.prach.config_index
            )));
        }
        let prach = self.prach.region();
        if prach.start < pusch.start || prach.end() > pusch.end() {
            return Err(invalid(format!(
                "PRACH region {} does not fit in the PUSCH region {}",
                prach, pusch
            )));
        }
        if !(2..=MAX_RAR_WINDOW).contains(&self.prach.rar_window) {
            return Err(invalid(format!("RAR window must be 2-10, got {}", self.prach.rar_window)));
        }
        if self.prach.max_rar_per_pdu == 0 {
            return Err(invalid("at least one RAR per PDU is required".into()));
        }

        if self.msg3.nof_prb == 0
            || !common::is_valid_ul_nof_prb(self.msg3.nof_prb)
            || self.msg3.nof_prb > pusch.length
        {
            return Err(invalid(format!("invalid Msg3 allocation of {} PRBs", self.msg3.nof_prb)));
        }
        if self.msg3.mcs > crate::tables::MAX_MCS {
            return Err(invalid(format!("invalid Msg3 MCS {}", self.msg3.mcs)));
        }

        let bc = &self.broadcast;
        if bc.mcs > crate::tables::MAX_MCS {
            return Err(invalid(format!("invalid broadcast MCS {}", bc.mcs)));
        }
        if !bc.sibs.is_empty() {
            if bc.si_window_ms == 0 || bc.si_window_ms > 40 {
                return Err(invalid(format!("SI window must be 1-40 ms, got {}", bc.si_window_ms)));
            }
            for (idx, sib) in bc.sibs.iter().enumerate() {
                if sib.len == 0 {
                    return Err(invalid(format!("SIB {} has zero length", idx)));
                }
                if idx > 0 {
                    if sib.period_rf == 0 {
                        return Err(invalid(format!("SI message {} has zero period", idx)));
                    }
                    // All SI windows of the message must fit in its period
                    let last_window_end = idx as u32 * bc.si_window_ms;
                    if last_window_end > sib.period_rf * Tti::SUBFRAMES_PER_FRAME {
                        return Err(invalid(format!(
                            "SI message {} window does not fit in its period of {} frames",
                            idx, sib.period_rf
                        )));
                    }
                }
            }
        }

        let sched = &self.sched;
        if sched.max_mcs_dl > crate::tables::MAX_MCS || sched.max_mcs_ul > crate::tables::MAX_MCS {
            return Err(invalid("maximum MCS above 28".into()));
        }
        if sched.fixed_mcs_dl.map_or(false, |m| m > sched.max_mcs_dl)
            || sched.fixed_mcs_ul.map_or(false, |m| m > sched.max_mcs_ul)
        {
            return Err(invalid("fixed MCS above the configured maximum".into()));
        }
        if sched.nof_harq_proc != crate::HARQ_RTT_MS as usize {
            return Err(invalid(format!(
                "FDD needs {} HARQ processes, got {}",
                crate::HARQ_RTT_MS,
                sched.nof_harq_proc
            )));
        }
        if !(1..=15).contains(&sched.initial_cqi) {
            return Err(invalid(format!("initial CQI must be 1-15, got {}", sched.initial_cqi)));
        }

        Ok(())
    }
}

/// Per-UE scheduling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UeConfig {
    /// Retransmissions allowed per transport block
    #[serde(default = "default_max_harq_retx")]
    pub max_harq_retx: u32,
    /// Retransmissions allowed for Msg3
    #[serde(default = "default_max_harq_retx")]
    pub max_harq_msg3_retx: u32,
    /// DL transport blocks per HARQ process (2 enables spatial multiplexing)
    #[serde(default = "default_dl_nof_tb")]
    pub dl_nof_tb: u8,
    /// UE-specific MCS caps, applied on top of the cell limits
    #[serde(default = "default_max_mcs")]
    pub max_mcs_dl: u8,
    #[serde(default = "default_max_mcs")]
    pub max_mcs_ul: u8,
}

fn default_max_harq_retx() -> u32 {
    4
}

fn default_dl_nof_tb() -> u8 {
    1
}

impl Default for UeConfig {
    fn default() -> Self {
        Self {
            max_harq_retx: default_max_harq_retx(),
            max_harq_msg3_retx: default_max_harq_retx(),
            dl_nof_tb: default_dl_nof_tb(),
            max_mcs_dl: default_max_mcs(),
            max_mcs_ul: default_max_mcs(),
        }
    }
}

impl UeConfig {
    pub fn validate(&self) -> Result<(), MacError> {
        if !(1..=crate::MAX_TB as u8).contains(&self.dl_nof_tb) {
            return Err(invalid(format!("UE supports 1-2 transport blocks, got {}", self.dl_nof_tb)));
        }
        if self.max_mcs_dl > crate::tables::MAX_MCS || self.max_mcs_ul > crate::tables::MAX_MCS {
            return Err(invalid("UE maximum MCS above 28".into()));
        }
        if self.max_harq_retx > 28 || self.max_harq_msg3_retx > 28 {
            return Err(invalid("HARQ retransmission limit above 28".into()));
        }
        Ok(())
    }
}

bitflags! {
    /// Directions a logical channel carries traffic in
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BearerDirection: u8 {
        const DL = 0b01;
        const UL = 0b10;
        const BOTH = Self::DL.bits() | Self::UL.bits();
    }
}

/// Per logical channel parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerConfig {
    pub direction: BearerDirection,
    /// Logical channel priority, lower value served first
    pub priority: u8,
    /// Logical channel group used by BSR reporting (0-3)
    pub group: u8,
}

impl BearerConfig {
    pub fn new(direction: BearerDirection, priority: u8, group: u8) -> Self {
        Self { direction, priority, group }
    }

    pub fn validate(&self) -> Result<(), MacError> {
        if self.direction.is_empty() {
            return Err(invalid("bearer without direction".into()));
        }
        if self.group > 3 {
            return Err(invalid(format!("logical channel group {} out of range", self.group)));
        }
        Ok(())
    }
}

impl Default for BearerConfig {
    fn default() -> Self {
        Self::new(BearerDirection::BOTH, 1, 0)
    }
}
