//! Host mirror of a running TVM's guest physical map.

use heapless::Vec;

use crate::{config::MAX_MEMORY_REGIONS, RegionKind, SbiError, PAGE_SIZE};

const PAGE: u64 = PAGE_SIZE as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestRange {
    pub base: u64,
    pub len: u64,
}

impl GuestRange {
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.base && gpa < self.end()
    }

    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        base < self.end() && self.base < base + len
    }
}

/// The shared buffer a guest declared, and the host pages backing it once faulted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedDeclaration {
    pub range: GuestRange,
    pub host_base: Option<u64>,
}

impl SharedDeclaration {
    pub fn pages(&self) -> u64 {
        self.range.len / PAGE
    }
}

pub struct HostRegions {
    confidential: Vec<GuestRange, MAX_MEMORY_REGIONS>,
    mmio: Vec<GuestRange, MAX_MEMORY_REGIONS>,
    shared: Option<SharedDeclaration>,
    limit: u64,
}

impl HostRegions {
    /// `limit` is the first guest physical address the guest may not claim.
    pub fn new(limit: u64) -> Self {
        Self {
            confidential: Vec::new(),
            mmio: Vec::new(),
            shared: None,
            limit,
        }
    }

    /// What the host knows about `gpa`. The shared buffer is carved out of
    /// confidential RAM, so it takes precedence.
    pub fn classify(&self, gpa: u64) -> Option<RegionKind> {
        if self.mmio.iter().any(|r| r.contains(gpa)) {
            return Some(RegionKind::EmulatedMmio);
        }
        if self.shared.is_some_and(|s| s.range.contains(gpa)) {
            return Some(RegionKind::Shared);
        }
        if self.confidential.iter().any(|r| r.contains(gpa)) {
            return Some(RegionKind::Confidential);
        }
        None
    }

    fn check_form(&self, base: u64, len: u64) -> Result<(), SbiError> {
        crate::ensure!(base % PAGE == 0, SbiError::InvalidAddress)?;
        crate::ensure!(len > 0 && len % PAGE == 0, SbiError::InvalidParam)?;
        let end = base.checked_add(len).ok_or(SbiError::InvalidAddress)?;
        crate::ensure!(end <= self.limit, SbiError::InvalidAddress)
    }

    fn overlaps_any(&self, base: u64, len: u64) -> bool {
        self.confidential
            .iter()
            .chain(self.mmio.iter())
            .chain(self.shared.iter().map(|s| &s.range))
            .any(|r| r.overlaps(base, len))
    }

    pub fn add_confidential(&mut self, base: u64, len: u64) -> Result<(), SbiError> {
        self.check_form(base, len)?;
        crate::ensure_not!(self.overlaps_any(base, len), SbiError::InvalidAddress)?;
        self.confidential
            .push(GuestRange { base, len })
            .map_err(|_| SbiError::InvalidParam)
    }

    pub fn add_mmio(&mut self, base: u64, len: u64) -> Result<(), SbiError> {
        self.check_form(base, len)?;
        crate::ensure_not!(self.overlaps_any(base, len), SbiError::InvalidAddress)?;
        self.mmio
            .push(GuestRange { base, len })
            .map_err(|_| SbiError::InvalidParam)
    }

    pub fn remove_mmio(&mut self, base: u64, len: u64) -> Result<(), SbiError> {
        let idx = self
            .mmio
            .iter()
            .position(|r| r.base == base && r.len == len)
            .ok_or(SbiError::InvalidAddress)?;
        self.mmio.swap_remove(idx);
        Ok(())
    }

    pub fn mmio(&self) -> impl Iterator<Item = &GuestRange> {
        self.mmio.iter()
    }

    /// Records the guest's shared buffer, capped to `max_len`. Returns the size kept.
    pub fn declare_shared(&mut self, base: u64, len: u64, max_len: u64) -> Result<u64, SbiError> {
        crate::ensure!(self.shared.is_none(), SbiError::AlreadyStarted)?;
        self.check_form(base, len)?;
        let len = len.min(max_len) & !(PAGE - 1);
        crate::ensure!(len > 0, SbiError::InvalidParam)?;
        self.shared = Some(SharedDeclaration {
            range: GuestRange { base, len },
            host_base: None,
        });
        Ok(len)
    }

    pub fn shared(&self) -> Option<&SharedDeclaration> {
        self.shared.as_ref()
    }

    pub fn set_shared_backing(&mut self, host_base: u64) {
        if let Some(shared) = self.shared.as_mut() {
            shared.host_base = Some(host_base);
        }
    }

    pub fn release_shared(&mut self) -> Option<SharedDeclaration> {
        self.shared.take()
    }
}
