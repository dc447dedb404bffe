//! Build-time constants and the small configuration records shared by the monitor,
//! the host driver and the MM partition.

use crate::{TeeError, PAGE_SIZE};

pub const PAGE_DIRECTORY_SIZE: usize = 16 * 1024;
pub const PAGE_DIRECTORY_PAGES: usize = PAGE_DIRECTORY_SIZE / PAGE_SIZE;

/// Highest guest physical address + 1 reachable with Sv48x4.
pub const GUEST_PHYS_LIMIT: u64 = 1 << 50;

pub const MAX_MEMORY_REGIONS: usize = 16; // per-TVM simple limit
pub const MAX_VCPU_PER_TVM: usize = 8;
pub const MAX_HARTS: usize = 64;

pub const SIZE_1MB: u64 = 0x10_0000;
pub const SIZE_32MB: u64 = 0x200_0000;

/// Monitor side configuration.
#[derive(Clone, Debug)]
pub struct TsmConfig {
    pub hart_count: usize,
    /// Physical window the host may convert to confidential memory, `[start, end)`.
    pub convertible_start: u64,
    pub convertible_end: u64,
    pub tvm_state_pages: usize,
    pub tvm_max_vcpus: usize,
    pub tvm_vcpu_state_pages: usize,
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            hart_count: 1,
            convertible_start: 0x8000_0000,
            convertible_end: 0x1_0000_0000,
            tvm_state_pages: 1,
            tvm_max_vcpus: 4,
            tvm_vcpu_state_pages: 1,
        }
    }
}

impl TsmConfig {
    pub fn validate(&self) -> Result<(), TeeError> {
        crate::ensure!(
            self.hart_count > 0 && self.hart_count <= MAX_HARTS,
            TeeError::InvalidParam
        )?;
        crate::ensure!(
            self.tvm_max_vcpus > 0 && self.tvm_max_vcpus <= MAX_VCPU_PER_TVM,
            TeeError::InvalidParam
        )?;
        crate::ensure!(
            self.convertible_start % PAGE_SIZE as u64 == 0
                && self.convertible_end % PAGE_SIZE as u64 == 0
                && self.convertible_start < self.convertible_end,
            TeeError::InvalidAddress
        )
    }
}

/// Guest physical layout of the MM partition. Offsets are relative to `ram_base`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MmLayout {
    pub ram_base: u64,
    pub ram_size: u64,
    pub boot_info_offset: u64,
    pub boot_info_size: u64,
    pub stack_offset: u64,
    pub stack_size: u64,
    pub heap_offset: u64,
    pub heap_size: u64,
    pub shared_buf_offset: u64,
    pub shared_buf_size: u64,
    pub image_offset: u64,
    pub mpxy_channel_id: u32,
}

impl Default for MmLayout {
    fn default() -> Self {
        Self {
            ram_base: 0x8000_0000,
            ram_size: SIZE_32MB,
            boot_info_offset: 0,
            boot_info_size: 0x10000,
            stack_offset: 0x10000,
            stack_size: 0x10000,
            heap_offset: 0x20000,
            heap_size: 0x10000,
            shared_buf_offset: 0x10_0000,
            shared_buf_size: SIZE_1MB,
            image_offset: 0x20_0000,
            mpxy_channel_id: 0,
        }
    }
}

impl MmLayout {
    pub fn boot_info_base(&self) -> u64 {
        self.ram_base + self.boot_info_offset
    }

    pub fn stack_base(&self) -> u64 {
        self.ram_base + self.stack_offset
    }

    pub fn heap_base(&self) -> u64 {
        self.ram_base + self.heap_offset
    }

    pub fn shared_buf_base(&self) -> u64 {
        self.ram_base + self.shared_buf_offset
    }

    pub fn image_base(&self) -> u64 {
        self.ram_base + self.image_offset
    }

    pub fn ram_end(&self) -> u64 {
        self.ram_base + self.ram_size
    }

    /// Checks alignment, the RAM minimum and that no two areas overlap or leave RAM.
    pub fn validate(&self) -> Result<(), TeeError> {
        let page = PAGE_SIZE as u64;
        crate::ensure!(self.ram_base % page == 0, TeeError::InvalidAddress)?;
        crate::ensure!(
            self.ram_size >= SIZE_32MB && self.ram_size % page == 0,
            TeeError::InvalidParam
        )?;
        crate::ensure!(
            self.ram_base.checked_add(self.ram_size).is_some(),
            TeeError::InvalidAddress
        )?;

        let areas = [
            (self.boot_info_offset, self.boot_info_size),
            (self.stack_offset, self.stack_size),
            (self.heap_offset, self.heap_size),
            (self.shared_buf_offset, self.shared_buf_size),
        ];
        for (i, &(off, size)) in areas.iter().enumerate() {
            crate::ensure!(off % page == 0, TeeError::InvalidAddress)?;
            crate::ensure!(size > 0 && size % page == 0, TeeError::InvalidParam)?;
            crate::ensure!(off + size <= self.image_offset, TeeError::InvalidParam)?;
            for &(other_off, other_size) in &areas[i + 1..] {
                crate::ensure!(
                    off + size <= other_off || other_off + other_size <= off,
                    TeeError::InvalidParam
                )?;
            }
        }
        crate::ensure!(self.image_offset % page == 0, TeeError::InvalidAddress)?;
        crate::ensure!(self.image_offset < self.ram_size, TeeError::InvalidParam)
    }
}

/// Host policy applied to requests coming from a running TVM.
#[derive(Clone, Debug)]
pub struct GuestRequestPolicy {
    /// Largest shared buffer the host mirrors; bigger declarations are capped.
    pub max_shared_size: u64,
    pub guest_phys_limit: u64,
}

impl Default for GuestRequestPolicy {
    fn default() -> Self {
        Self {
            max_shared_size: SIZE_1MB,
            guest_phys_limit: GUEST_PHYS_LIMIT,
        }
    }
}
