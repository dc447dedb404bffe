//! Per-TVM catalog of guest physical regions and the assignment-change state machine.

use heapless::Vec;

use crate::{config::MAX_MEMORY_REGIONS, RegionKind, TeeError};

use super::pages::{page_aligned, range_len};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Unpopulated,
    /// At least one page of the region is mapped.
    Populated,
    /// Pages were invalidated, the change waits for a TVM fence.
    PendingChange,
    /// The change is complete, the region still carries its old kind.
    Changed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionEvent {
    Populate,
    BeginChange,
    FenceCompleted,
    Settle,
}

/// The only legal region transitions. Anything else is a caller bug.
pub fn next_state(state: RegionState, event: RegionEvent) -> Option<RegionState> {
    use RegionEvent::*;
    use RegionState::*;

    match (state, event) {
        (Unpopulated, Populate) | (Populated, Populate) => Some(Populated),
        (Populated, BeginChange) => Some(PendingChange),
        (Unpopulated, BeginChange) => Some(Changed),
        (PendingChange, FenceCompleted) => Some(Changed),
        (Changed, Settle) => Some(Unpopulated),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub len: u64,
    pub kind: RegionKind,
    pub state: RegionState,
    /// Kind the region takes once a change settles.
    pub target: Option<RegionKind>,
    /// Vcpu that requested the pending change.
    pub initiator: Option<usize>,
}

impl Region {
    pub fn new(base: u64, len: u64, kind: RegionKind) -> Self {
        Self {
            base,
            len,
            kind,
            state: RegionState::Unpopulated,
            target: None,
            initiator: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.base && gpa < self.end()
    }

    pub fn covers(&self, base: u64, len: u64) -> bool {
        base >= self.base && base + len <= self.end()
    }

    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        base < self.end() && self.base < base + len
    }

    pub fn is_changing(&self) -> bool {
        matches!(self.state, RegionState::PendingChange | RegionState::Changed)
    }

    fn apply(&mut self, event: RegionEvent) {
        let next = next_state(self.state, event);
        assert!(
            next.is_some(),
            "illegal region transition {:?} on {:?} at {:#x}",
            event,
            self.state,
            self.base
        );
        if let Some(state) = next {
            self.state = state;
        }
    }

    pub fn populate(&mut self) {
        self.apply(RegionEvent::Populate);
    }

    /// Starts turning the region into `target`. Returns true when the change has to
    /// wait for a fence.
    pub fn begin_change(&mut self, target: RegionKind, initiator: usize) -> bool {
        self.apply(RegionEvent::BeginChange);
        self.target = Some(target);
        if self.state == RegionState::PendingChange {
            self.initiator = Some(initiator);
            true
        } else {
            self.settle();
            false
        }
    }

    pub fn fence_completed(&mut self) {
        self.apply(RegionEvent::FenceCompleted);
        self.settle();
    }

    fn settle(&mut self) {
        self.apply(RegionEvent::Settle);
        if let Some(kind) = self.target.take() {
            self.kind = kind;
        }
        self.initiator = None;
    }
}

pub fn check_range(base: u64, len: u64, limit: u64) -> Result<(), TeeError> {
    crate::ensure!(page_aligned(base), TeeError::InvalidAddress)?;
    crate::ensure!(len > 0 && page_aligned(len), TeeError::InvalidParam)?;
    let end = base.checked_add(len).ok_or(TeeError::InvalidAddress)?;
    crate::ensure!(end <= limit, TeeError::InvalidAddress)
}

/// Same as [`check_range`] for a page count.
pub fn check_pages(base: u64, count: u64, limit: u64) -> Result<u64, TeeError> {
    crate::ensure!(count > 0, TeeError::InvalidParam)?;
    let len = range_len(base, count)?;
    check_range(base, len, limit)?;
    Ok(len)
}

#[derive(Default)]
pub struct RegionCatalog {
    regions: Vec<Region, MAX_MEMORY_REGIONS>,
}

impl RegionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Region {
        &self.regions[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Region {
        &mut self.regions[idx]
    }

    /// Adds an unpopulated region. Overlap is an address error.
    pub fn add(&mut self, base: u64, len: u64, kind: RegionKind) -> Result<usize, TeeError> {
        crate::ensure_not!(
            self.regions.iter().any(|r| r.overlaps(base, len)),
            TeeError::InvalidAddress
        )?;
        self.regions
            .push(Region::new(base, len, kind))
            .map_err(|_| TeeError::InvalidParam)?;
        Ok(self.regions.len() - 1)
    }

    /// Removes the region that matches `(base, len, kind)` exactly.
    pub fn remove(&mut self, base: u64, len: u64, kind: RegionKind) -> Result<Region, TeeError> {
        let idx = self
            .regions
            .iter()
            .position(|r| r.base == base && r.len == len && r.kind == kind)
            .ok_or(TeeError::InvalidAddress)?;
        Ok(self.regions.swap_remove(idx))
    }

    pub fn find(&self, gpa: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(gpa))
    }

    /// Index of the region of `kind` that covers the whole range.
    pub fn covering(&self, base: u64, len: u64, kind: RegionKind) -> Result<usize, TeeError> {
        self.regions
            .iter()
            .position(|r| r.kind == kind && r.covers(base, len))
            .ok_or(TeeError::InvalidAddress)
    }

    pub fn any_pending(&self) -> bool {
        self.regions
            .iter()
            .any(|r| r.state == RegionState::PendingChange)
    }

    pub fn pending_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        self.regions
            .iter_mut()
            .filter(|r| r.state == RegionState::PendingChange)
    }

    /// Carves `(base, len)` out of region `idx` and returns the index of the carved piece.
    ///
    /// The pieces left around it keep the state of the original region; the carved
    /// piece is `Populated` only when `populated` is set.
    pub fn split(
        &mut self,
        idx: usize,
        base: u64,
        len: u64,
        populated: bool,
    ) -> Result<usize, TeeError> {
        let region = self.regions[idx];
        assert!(region.covers(base, len));
        assert!(matches!(
            region.state,
            RegionState::Unpopulated | RegionState::Populated
        ));

        let head = base - region.base;
        let tail = region.end() - (base + len);
        let extra = (head > 0) as usize + (tail > 0) as usize;
        crate::ensure!(
            self.regions.len() + extra <= MAX_MEMORY_REGIONS,
            TeeError::InvalidParam
        )?;

        let middle = &mut self.regions[idx];
        middle.base = base;
        middle.len = len;
        middle.state = if populated {
            RegionState::Populated
        } else {
            RegionState::Unpopulated
        };

        // capacity was checked above
        if head > 0 {
            let _ = self.regions.push(Region {
                len: head,
                ..region
            });
        }
        if tail > 0 {
            let _ = self.regions.push(Region {
                base: base + len,
                len: tail,
                ..region
            });
        }
        Ok(idx)
    }
}
