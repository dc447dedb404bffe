use alloc::vec::Vec;

use digest::Digest;
use sha2::Sha384;
use zeroize::Zeroize;

use crate::{config::MAX_VCPU_PER_TVM, TeeError};

use super::{
    pagetable::GuestPageTable,
    region::RegionCatalog,
    vcpu::{Vcpu, VcpuRunState},
    TvmId,
};

pub const MEASUREMENT_SIZE: usize = 48;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TvmState {
    Initializing,
    Runnable,
}

pub struct Tvm {
    pub id: TvmId,
    pub state: TvmState,
    pub page_table: GuestPageTable,
    pub state_addr: u64,
    pub regions: RegionCatalog,
    pub vcpus: heapless::Vec<Vcpu, MAX_VCPU_PER_TVM>,
    /// Donated pages not yet used as page tables.
    pub pt_pool: Vec<u64>,
    pub entry: u64,
    pub boot_arg: u64,
    measurement: [u8; MEASUREMENT_SIZE],
    /// Vcpus that still have to observe the pending TVM fence, one bit each.
    pub fence_observers: Option<u64>,
}

impl Tvm {
    pub fn new(id: TvmId, page_directory: u64, state_addr: u64) -> Result<Self, TeeError> {
        Ok(Self {
            id,
            state: TvmState::Initializing,
            page_table: GuestPageTable::new(page_directory)?,
            state_addr,
            regions: RegionCatalog::new(),
            vcpus: heapless::Vec::new(),
            pt_pool: Vec::new(),
            entry: 0,
            boot_arg: 0,
            measurement: [0; MEASUREMENT_SIZE],
            fence_observers: None,
        })
    }

    pub fn is_initializing(&self) -> bool {
        self.state == TvmState::Initializing
    }

    pub fn vcpu(&self, index: usize) -> Option<&Vcpu> {
        self.vcpus.iter().find(|v| v.index == index)
    }

    pub fn vcpu_mut(&mut self, index: usize) -> Option<&mut Vcpu> {
        self.vcpus.iter_mut().find(|v| v.index == index)
    }

    /// Extends the measurement with one page loaded at `gpa`:
    /// `m = SHA-384(m || gpa || page)`.
    pub fn extend_measurement(&mut self, gpa: u64, page: &[u8]) {
        let mut hasher = Sha384::new();
        hasher.update(self.measurement);
        hasher.update(gpa.to_le_bytes());
        hasher.update(page);
        self.measurement.copy_from_slice(&hasher.finalize());
    }

    pub fn measurement(&self) -> [u8; MEASUREMENT_SIZE] {
        self.measurement
    }

    /// Latches entry and argument for the boot vcpu and makes the TVM runnable.
    pub fn finalize(&mut self, entry: u64, boot_arg: u64) {
        self.entry = entry;
        self.boot_arg = boot_arg;
        self.state = TvmState::Runnable;

        if let Some(boot) = self.vcpus.first_mut() {
            boot.cpu.pc = entry;
            boot.cpu.gprs[10] = boot.index as u64;
            boot.cpu.gprs[11] = boot_arg;
        }
    }

    /// Vcpus that must observe a fence started now: they ran before and are neither
    /// blocked nor dead.
    pub fn fence_participants(&self) -> u64 {
        self.vcpus
            .iter()
            .filter(|v| v.has_run && v.is_runnable())
            .fold(0, |mask, v| mask | 1u64 << v.index)
    }

    pub fn complete_fence(&mut self) {
        self.fence_observers = None;
        let mut initiators: heapless::Vec<usize, MAX_VCPU_PER_TVM> = heapless::Vec::new();
        for region in self.regions.pending_mut() {
            if let Some(vcpu) = region.initiator {
                if !initiators.contains(&vcpu) {
                    let _ = initiators.push(vcpu);
                }
            }
            region.fence_completed();
        }
        for index in initiators {
            if let Some(vcpu) = self.vcpu_mut(index) {
                if vcpu.run_state == VcpuRunState::Blocked {
                    vcpu.run_state = VcpuRunState::Trapped;
                }
            }
        }
        log::debug!("tvm {} fence completed", self.id);
    }

    /// Records that vcpu `index` entered the guest. Returns true when this completed
    /// the pending fence.
    pub fn observe_fence(&mut self, index: usize) -> bool {
        let Some(mask) = self.fence_observers.as_mut() else {
            return false;
        };
        *mask &= !(1u64 << index);
        if *mask == 0 {
            self.complete_fence();
            return true;
        }
        false
    }
}

impl Drop for Tvm {
    fn drop(&mut self) {
        self.measurement.zeroize();
    }
}
