//! Allocation Policies
//!
//! Strategy objects deciding, once per TTI, which UE gets which HARQ process
//! (re)activated on which resources. Policies keep only per-TTI scratch
//! state; PDCCH placement and HARQ commits are done by the cell scheduler.

pub mod dl;
pub mod ul;

pub use dl::RoundRobinDl;
pub use ul::RoundRobinUl;

use crate::config::PolicyKind;
use crate::ue::UeSchedulingContext;
use common::{LinkDirection, ResourceMask, Rnti, Tti};

/// What an allocation does with its HARQ process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// New data on a free process
    NewTx { mcs: u8, nof_tb: usize },
    /// Retransmission of the NACKed transport blocks
    Retx { adaptive: bool, mcs: u8 },
}

/// Resources chosen for one UE in one TTI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub rnti: Rnti,
    pub pid: u8,
    /// RBGs in DL, PRBs in UL
    pub mask: ResourceMask,
    pub kind: AllocationKind,
}

impl Allocation {
    pub fn is_retx(&self) -> bool {
        matches!(self.kind, AllocationKind::Retx { .. })
    }
}

/// Retransmission that found no resources this TTI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferral {
    pub rnti: Rnti,
    pub pid: u8,
}

/// Per-TTI allocation strategy
pub trait AllocationPolicy: Send {
    fn direction(&self) -> LinkDirection;

    /// Run the allocation pass over `ues` (sorted by RNTI) starting from the
    /// resources already taken in `used`
    fn new_tti(&mut self, ues: &[&UeSchedulingContext], used: ResourceMask, tti: Tti);

    /// Allocation chosen for `rnti` in the last pass
    fn get_allocation(&self, rnti: Rnti) -> Option<&Allocation>;

    /// Allocations of the last pass, in visit order
    fn allocations(&self) -> &[Allocation];

    /// Retransmissions the last pass could not place
    fn deferrals(&self) -> &[Deferral];

    /// Return the resources of `rnti` to the free pool
    fn release(&mut self, rnti: Rnti) -> Option<Allocation>;

    /// Resources taken after the pass
    fn used_mask(&self) -> ResourceMask;
}

/// Instantiate the configured strategy for one direction
pub fn new_policy(kind: PolicyKind, dir: LinkDirection) -> Box<dyn AllocationPolicy> {
    match (kind, dir) {
        (PolicyKind::RoundRobin, LinkDirection::Downlink) => Box::new(RoundRobinDl::new()),
        (PolicyKind::RoundRobin, LinkDirection::Uplink) => Box::new(RoundRobinUl::new()),
    }
}

/// Round-robin visit order, rotated by `tti mod ue_count`
pub(crate) fn visit_order(nof_ues: usize, tti: Tti) -> impl Iterator<Item = usize> {
    let start = if nof_ues == 0 { 0 } else { tti.value() as usize % nof_ues };
    (0..nof_ues).map(move |i| (start + i) % nof_ues)
}

/// Scratch state of one allocation pass
#[derive(Debug, Clone)]
pub(crate) struct TtiScratch {
    pub used: ResourceMask,
    pub allocations: Vec<Allocation>,
    pub deferrals: Vec<Deferral>,
}

impl TtiScratch {
    pub fn new() -> Self {
        Self {
            used: ResourceMask::new(0),
            allocations: Vec::new(),
            deferrals: Vec::new(),
        }
    }

    pub fn reset(&mut self, used: ResourceMask) {
        self.used = used;
        self.allocations.clear();
        self.deferrals.clear();
    }

    pub fn commit(&mut self, allocation: Allocation) {
        self.used.reserve(&allocation.mask);
        self.allocations.push(allocation);
    }

    pub fn get(&self, rnti: Rnti) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.rnti == rnti)
    }

    pub fn release(&mut self, rnti: Rnti) -> Option<Allocation> {
        let idx = self.allocations.iter().position(|a| a.rnti == rnti)?;
        let allocation = self.allocations.remove(idx);
        self.used.release(&allocation.mask);
        Some(allocation)
    }
}
