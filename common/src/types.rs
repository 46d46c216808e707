//! Common Types for the LTE eNodeB MAC
//!
//! Defines fundamental types used throughout the scheduler and its interfaces

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// System information RNTI
    pub const SI: Self = Self(0xFFFF);
    /// Paging RNTI
    pub const P: Self = Self(0xFFFE);
    /// First value handed out as (temporary) C-RNTI
    pub const FIRST_C_RNTI: u16 = 0x46;
    /// Last value handed out as (temporary) C-RNTI
    pub const LAST_C_RNTI: u16 = 0xFFF3;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// RA-RNTI for a PRACH received in the given TTI (FDD, single PRACH frequency)
    pub fn ra_rnti(prach_tti: Tti) -> Self {
        Self(1 + prach_tti.sf_idx() as u16)
    }

    /// True for values usable as a C-RNTI
    pub fn is_c_rnti(&self) -> bool {
        (Self::FIRST_C_RNTI..=Self::LAST_C_RNTI).contains(&self.0)
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Transmission Time Interval counter
///
/// Counts subframes and wraps with the system frame number, i.e. modulo
/// 1024 frames of 10 subframes. All arithmetic is modular.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tti(u32);

impl Tti {
    /// Number of subframes per radio frame
    pub const SUBFRAMES_PER_FRAME: u32 = 10;
    /// Wrap period in TTIs
    pub const PERIOD: u32 = 10240;

    /// Create a TTI, wrapping values beyond the period
    pub fn new(value: u32) -> Self {
        Self(value % Self::PERIOD)
    }

    /// Create a TTI from system frame number and subframe index
    pub fn from_sfn_sf(sfn: u32, sf_idx: u32) -> Self {
        Self::new(sfn * Self::SUBFRAMES_PER_FRAME + sf_idx)
    }

    /// Raw counter value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// System frame number (0-1023)
    pub fn sfn(&self) -> u32 {
        self.0 / Self::SUBFRAMES_PER_FRAME
    }

    /// Subframe index (0-9)
    pub fn sf_idx(&self) -> u32 {
        self.0 % Self::SUBFRAMES_PER_FRAME
    }

    /// Modular distance from `earlier` to `self`
    pub fn since(&self, earlier: Tti) -> u32 {
        (self.0 + Self::PERIOD - earlier.0) % Self::PERIOD
    }

    /// True if `self` lies in `[start, start + len]`
    pub fn is_in_window(&self, start: Tti, len: u32) -> bool {
        self.since(start) <= len
    }

    /// True if `self` is strictly later than `other`, within half a period
    pub fn is_after(&self, other: Tti) -> bool {
        let d = self.since(other);
        d != 0 && d < Self::PERIOD / 2
    }
}

impl Add<u32> for Tti {
    type Output = Tti;

    fn add(self, rhs: u32) -> Tti {
        Tti::new(self.0 + rhs % Self::PERIOD)
    }
}

impl Sub<u32> for Tti {
    type Output = Tti;

    fn sub(self, rhs: u32) -> Tti {
        Tti::new(self.0 + Self::PERIOD - rhs % Self::PERIOD)
    }
}

impl fmt::Display for Tti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical channel identity (LCID 0 is CCCH, 1-2 SRBs, 3-10 DRBs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lcid(pub u8);

impl Lcid {
    /// Common control channel
    pub const CCCH: Self = Self(0);
    /// Highest LCID usable for data
    pub const MAX: u8 = 10;
    /// Number of logical channels tracked per UE
    pub const COUNT: usize = Self::MAX as usize + 1;

    /// Create a new LCID with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Index into per-LCID arrays
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// LTE channel bandwidths, valued by their PRB count
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 1.4 MHz
    Bw1_4 = 6,
    /// 3 MHz
    Bw3 = 15,
    /// 5 MHz
    Bw5 = 25,
    /// 10 MHz
    Bw10 = 50,
    /// 15 MHz
    Bw15 = 75,
    /// 20 MHz
    Bw20 = 100,
}

impl Bandwidth {
    /// Look up the bandwidth with exactly `nof_prb` resource blocks
    pub fn from_nof_prb(nof_prb: u16) -> Option<Self> {
        FromPrimitive::from_u16(nof_prb)
    }

    /// Number of physical resource blocks
    pub fn nof_prb(&self) -> u16 {
        *self as u16
    }

    /// Get bandwidth in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            Bandwidth::Bw1_4 => 1_400_000,
            Bandwidth::Bw3 => 3_000_000,
            Bandwidth::Bw5 => 5_000_000,
            Bandwidth::Bw10 => 10_000_000,
            Bandwidth::Bw15 => 15_000_000,
            Bandwidth::Bw20 => 20_000_000,
        }
    }
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    Downlink,
    Uplink,
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkDirection::Downlink => write!(f, "DL"),
            LinkDirection::Uplink => write!(f, "UL"),
        }
    }
}
