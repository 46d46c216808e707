//! Resource Allocation Masks
//!
//! Bit-per-unit sets over PRBs, RBGs or CCEs. Every scheduler stage reserves
//! resources through this type, so the "no overlap" rule lives in one place:
//! `try_reserve` refuses overlaps, `reserve` panics on them.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Maximum number of units a mask can hold (covers 110 PRBs and 88 CCEs)
pub const MAX_UNITS: u16 = 128;

/// Contiguous run of resource units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitRange {
    /// First unit
    pub start: u16,
    /// Number of units
    pub length: u16,
}

impl UnitRange {
    pub fn new(start: u16, length: u16) -> Self {
        Self { start, length }
    }

    /// One past the last unit
    pub fn end(&self) -> u16 {
        self.start + self.length
    }

    pub fn overlaps(&self, other: &UnitRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for UnitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Length restriction applied by `first_fit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    /// Any length is allowed
    Any,
    /// SC-FDMA: length must factor as 2^a * 3^b * 5^c, rounded down otherwise
    UlWaveform,
}

impl LengthRule {
    /// Largest allowed length not above `length`
    pub fn round_down(&self, length: u16) -> u16 {
        match self {
            LengthRule::Any => length,
            LengthRule::UlWaveform => crate::utils::round_down_ul_nof_prb(length),
        }
    }
}

/// Set of reserved resource units
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceMask {
    bits: u128,
    size: u16,
}

impl ResourceMask {
    /// Empty mask over `size` units
    pub fn new(size: u16) -> Self {
        assert!(size <= MAX_UNITS, "mask size {} exceeds {}", size, MAX_UNITS);
        Self { bits: 0, size }
    }

    /// Mask over `size` units with `range` set
    pub fn from_range(size: u16, range: UnitRange) -> Self {
        let mut mask = Self::new(size);
        mask.reserve_range(range);
        mask
    }

    /// Mask over `size` units built from raw bits (bit `i` is unit `i`)
    pub fn from_bits(size: u16, bits: u128) -> Self {
        let mut mask = Self::new(size);
        mask.bits = bits & Self::full_bits(size);
        mask
    }

    fn full_bits(size: u16) -> u128 {
        if size >= 128 {
            u128::MAX
        } else {
            (1u128 << size) - 1
        }
    }

    fn range_bits(&self, range: UnitRange) -> u128 {
        assert!(
            range.end() <= self.size,
            "range {} outside mask of {} units",
            range,
            self.size
        );
        if range.length == 0 {
            return 0;
        }
        Self::full_bits(range.length) << range.start
    }

    /// Number of units covered by the mask
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Raw bits, unit `i` in bit `i`
    pub fn bits(&self) -> u128 {
        self.bits
    }

    /// Number of set units
    pub fn count(&self) -> u16 {
        self.bits.count_ones() as u16
    }

    /// Number of clear units
    pub fn free_count(&self) -> u16 {
        self.size - self.count()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn contains(&self, unit: u16) -> bool {
        unit < self.size && (self.bits >> unit) & 1 == 1
    }

    pub fn overlaps(&self, other: &ResourceMask) -> bool {
        self.bits & other.bits != 0
    }

    pub fn overlaps_range(&self, range: UnitRange) -> bool {
        self.bits & self.range_bits(range) != 0
    }

    /// The set units as a single range, if they are contiguous
    pub fn contiguous_range(&self) -> Option<UnitRange> {
        if self.bits == 0 {
            return None;
        }
        let start = self.bits.trailing_zeros() as u16;
        let length = self.count();
        let range = UnitRange::new(start, length);
        (self.bits == self.range_bits(range)).then_some(range)
    }

    /// Union of both masks
    pub fn union(&self, other: &ResourceMask) -> ResourceMask {
        Self {
            bits: self.bits | other.bits,
            size: self.size.max(other.size),
        }
    }

    /// Indices of set units in ascending order
    pub fn iter_units(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.size).filter(move |u| self.contains(*u))
    }

    /// Reserve `other` unless any unit is already taken
    pub fn try_reserve(&mut self, other: &ResourceMask) -> bool {
        if self.overlaps(other) {
            return false;
        }
        self.bits |= other.bits;
        true
    }

    /// Reserve `range` unless any unit is already taken
    pub fn try_reserve_range(&mut self, range: UnitRange) -> bool {
        let bits = self.range_bits(range);
        if self.bits & bits != 0 {
            return false;
        }
        self.bits |= bits;
        true
    }

    /// Reserve `other`; overlapping an existing reservation is a defect
    pub fn reserve(&mut self, other: &ResourceMask) {
        assert!(
            !self.overlaps(other),
            "double reservation: {:?} overlaps {:?}",
            other,
            self
        );
        self.bits |= other.bits;
    }

    /// Reserve `range`; overlapping an existing reservation is a defect
    pub fn reserve_range(&mut self, range: UnitRange) {
        let bits = self.range_bits(range);
        assert!(
            self.bits & bits == 0,
            "double reservation: {} overlaps {:?}",
            range,
            self
        );
        self.bits |= bits;
    }

    /// Clear every unit of `other`; releasing units that are not held is a defect
    pub fn release(&mut self, other: &ResourceMask) {
        assert!(
            self.bits & other.bits == other.bits,
            "releasing units that were never reserved: {:?} from {:?}",
            other,
            self
        );
        self.bits &= !other.bits;
    }

    /// First run of `length` contiguous free units, with `length` rounded
    /// down per `rule`
    pub fn first_fit(&self, length: u16, rule: LengthRule) -> Option<UnitRange> {
        let length = rule.round_down(length);
        if length == 0 || length > self.size {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for unit in 0..self.size {
            if self.contains(unit) {
                run_len = 0;
                run_start = unit + 1;
                continue;
            }
            run_len += 1;
            if run_len == length {
                trace!("first_fit({}) -> start {}", length, run_start);
                return Some(UnitRange::new(run_start, length));
            }
        }
        None
    }

    /// Longest run of contiguous free units, first one on ties
    pub fn largest_free_run(&self) -> Option<UnitRange> {
        let mut best: Option<UnitRange> = None;
        let mut run_start = 0;
        for unit in 0..=self.size {
            if unit == self.size || self.contains(unit) {
                let len = unit - run_start;
                if len > 0 && best.map_or(true, |b| len > b.length) {
                    best = Some(UnitRange::new(run_start, len));
                }
                run_start = unit + 1;
            }
        }
        best
    }

    /// Lowest `count` free units, not necessarily contiguous
    pub fn first_free_units(&self, count: u16) -> Option<ResourceMask> {
        if count == 0 || count > self.free_count() {
            return None;
        }
        let mut picked = ResourceMask::new(self.size);
        for unit in (0..self.size).filter(|u| !self.contains(*u)) {
            picked.bits |= 1u128 << unit;
            if picked.count() == count {
                return Some(picked);
            }
        }
        None
    }

    /// First free run of `length` units starting at one of `starts`
    ///
    /// Used for CCE allocation where only the search-space candidates of a
    /// DCI are legal start positions.
    pub fn first_free_candidate(&self, starts: &[u16], length: u16) -> Option<UnitRange> {
        starts
            .iter()
            .map(|&start| UnitRange::new(start, length))
            .filter(|range| range.end() <= self.size)
            .find(|range| !self.overlaps_range(*range))
    }
}

impl fmt::Debug for ResourceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0b")?;
        for unit in 0..self.size {
            write!(f, "{}", if self.contains(unit) { '1' } else { '0' })?;
        }
        Ok(())
    }
}
