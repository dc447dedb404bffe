//! Typed access to the CoVE host interface.
//!
//! [`TsmHandle`] talks to the in-crate reference monitor; on riscv64 builds
//! [`SbiMonitor`] issues the same calls as `ecall`s to the real TSM.

use spin::Mutex;

use crate::{
    mem::PhysMemory,
    regs::VcpuSharedArea,
    tsm::{state::TsmInfo, state::TvmCreateParams, vcpu::GuestExecutor, Tsm, TvmId},
    RunExit, TeeError, TsmPageType,
};

/// Operations of the COVH extension as seen from one host hart.
pub trait Monitor {
    fn tsm_info(&mut self) -> Result<TsmInfo, TeeError>;
    fn convert_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError>;
    fn reclaim_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError>;
    fn global_fence(&mut self) -> Result<(), TeeError>;
    fn local_fence(&mut self) -> Result<(), TeeError>;

    fn create_tvm(&mut self, params: &TvmCreateParams) -> Result<TvmId, TeeError>;
    fn finalize_tvm(&mut self, tvm: TvmId, entry: u64, boot_arg: u64) -> Result<(), TeeError>;
    fn destroy_tvm(&mut self, tvm: TvmId) -> Result<(), TeeError>;

    fn add_memory_region(&mut self, tvm: TvmId, gpa: u64, len: u64) -> Result<(), TeeError>;
    /// Declares emulated MMIO the host backs itself. Only before finalize.
    fn add_mmio_region(&mut self, tvm: TvmId, gpa: u64, len: u64) -> Result<(), TeeError>;
    fn add_page_table_pages(&mut self, tvm: TvmId, base: u64, count: u64) -> Result<(), TeeError>;
    fn add_measured_pages(
        &mut self,
        tvm: TvmId,
        src: u64,
        dst: u64,
        page_type: TsmPageType,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError>;
    fn add_zero_pages(
        &mut self,
        tvm: TvmId,
        base: u64,
        page_type: TsmPageType,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError>;
    fn add_shared_pages(
        &mut self,
        tvm: TvmId,
        base: u64,
        page_type: TsmPageType,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError>;

    fn create_vcpu(&mut self, tvm: TvmId, index: usize, state_addr: u64) -> Result<(), TeeError>;
    fn run_vcpu(&mut self, tvm: TvmId, index: usize) -> Result<RunExit, TeeError>;
    fn tvm_fence(&mut self, tvm: TvmId) -> Result<(), TeeError>;

    /// The register exchange area the monitor fills on every vcpu exit.
    fn shared_area(&mut self) -> &mut VcpuSharedArea;
}

/// One hart's view of a reference monitor shared by every hart.
pub struct TsmHandle<'a, M: PhysMemory, E: GuestExecutor> {
    tsm: &'a Mutex<Tsm<M, E>>,
    hart: usize,
    area: VcpuSharedArea,
}

impl<'a, M: PhysMemory, E: GuestExecutor> TsmHandle<'a, M, E> {
    pub fn new(tsm: &'a Mutex<Tsm<M, E>>, hart: usize) -> Self {
        Self {
            tsm,
            hart,
            area: VcpuSharedArea::new(),
        }
    }

    pub fn hart(&self) -> usize {
        self.hart
    }

    pub fn tsm(&self) -> &'a Mutex<Tsm<M, E>> {
        self.tsm
    }
}

impl<M: PhysMemory, E: GuestExecutor> Monitor for TsmHandle<'_, M, E> {
    fn tsm_info(&mut self) -> Result<TsmInfo, TeeError> {
        Ok(self.tsm.lock().info())
    }

    fn convert_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
        self.tsm.lock().convert_pages(base, count)
    }

    fn reclaim_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
        self.tsm.lock().reclaim_pages(base, count)
    }

    fn global_fence(&mut self) -> Result<(), TeeError> {
        self.tsm.lock().global_fence(self.hart)
    }

    fn local_fence(&mut self) -> Result<(), TeeError> {
        self.tsm.lock().local_fence(self.hart)
    }

    fn create_tvm(&mut self, params: &TvmCreateParams) -> Result<TvmId, TeeError> {
        self.tsm.lock().create_tvm(*params)
    }

    fn finalize_tvm(&mut self, tvm: TvmId, entry: u64, boot_arg: u64) -> Result<(), TeeError> {
        self.tsm.lock().finalize_tvm(tvm, entry, boot_arg)
    }

    fn destroy_tvm(&mut self, tvm: TvmId) -> Result<(), TeeError> {
        self.tsm.lock().destroy_tvm(tvm)
    }

    fn add_memory_region(&mut self, tvm: TvmId, gpa: u64, len: u64) -> Result<(), TeeError> {
        self.tsm.lock().add_memory_region(tvm, gpa, len)
    }

    fn add_mmio_region(&mut self, tvm: TvmId, gpa: u64, len: u64) -> Result<(), TeeError> {
        self.tsm.lock().add_mmio_region(tvm, gpa, len)
    }

    fn add_page_table_pages(&mut self, tvm: TvmId, base: u64, count: u64) -> Result<(), TeeError> {
        self.tsm.lock().add_page_table_pages(tvm, base, count)
    }

    fn add_measured_pages(
        &mut self,
        tvm: TvmId,
        src: u64,
        dst: u64,
        page_type: TsmPageType,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError> {
        self.tsm
            .lock()
            .add_measured_pages(tvm, src, dst, page_type as usize, count, gpa)
    }

    fn add_zero_pages(
        &mut self,
        tvm: TvmId,
        base: u64,
        page_type: TsmPageType,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError> {
        self.tsm
            .lock()
            .add_zero_pages(tvm, base, page_type as usize, count, gpa)
    }

    fn add_shared_pages(
        &mut self,
        tvm: TvmId,
        base: u64,
        page_type: TsmPageType,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError> {
        self.tsm
            .lock()
            .add_shared_pages(tvm, base, page_type as usize, count, gpa)
    }

    fn create_vcpu(&mut self, tvm: TvmId, index: usize, state_addr: u64) -> Result<(), TeeError> {
        self.tsm.lock().create_vcpu(tvm, index, state_addr)
    }

    fn run_vcpu(&mut self, tvm: TvmId, index: usize) -> Result<RunExit, TeeError> {
        self.tsm
            .lock()
            .run_vcpu(self.hart, tvm, index, &mut self.area)
    }

    fn tvm_fence(&mut self, tvm: TvmId) -> Result<(), TeeError> {
        self.tsm.lock().tvm_fence(tvm)
    }

    fn shared_area(&mut self) -> &mut VcpuSharedArea {
        &mut self.area
    }
}

#[cfg(target_arch = "riscv64")]
pub use self::sbi::SbiMonitor;

#[cfg(target_arch = "riscv64")]
mod sbi {
    use alloc::boxed::Box;

    use common::{
        sbi::*,
        tee::tee_result,
    };

    use super::Monitor;
    use crate::{
        regs::VcpuSharedArea,
        tsm::{state::TsmInfo, state::TvmCreateParams, TvmId},
        RegionKind, RunExit, SbiError, TeeError, TsmPageType,
    };

    fn covh(fid: usize, args: [usize; 6]) -> Result<usize, TeeError> {
        tee_result(sbi_call(SBI_COVH_EXT_ID, fid, &args))
    }

    /// The COVH extension of the firmware below us. Addresses are physical and the
    /// host runs identity mapped.
    pub struct SbiMonitor {
        area: Box<VcpuSharedArea>,
    }

    impl SbiMonitor {
        /// Registers a fresh shared area for this hart through NACL.
        pub fn new() -> Result<Self, SbiError> {
            let area = Box::new(VcpuSharedArea::new());
            let addr = &*area as *const VcpuSharedArea as usize;
            sbi_call(SBI_NACL_EXT_ID, SBI_NACL_SET_SHMEM, &[addr, 0, 0, 0, 0, 0]).into_result()?;
            log::debug!("nacl shared area registered at {:#x}", addr);
            Ok(Self { area })
        }

        fn add_region(
            &mut self,
            tvm: TvmId,
            gpa: u64,
            len: u64,
            kind: RegionKind,
        ) -> Result<(), TeeError> {
            covh(
                SBI_COVH_ADD_TVM_MEMORY_REGION,
                [tvm as usize, gpa as usize, len as usize, kind as usize, 0, 0],
            )
            .map(|_| ())
        }
    }

    impl Drop for SbiMonitor {
        fn drop(&mut self) {
            let ret = sbi_call(
                SBI_NACL_EXT_ID,
                SBI_NACL_SET_SHMEM,
                &[INVAL_PHYS_ADDR, 0, 0, 0, 0, 0],
            );
            if let Err(err) = ret.into_result() {
                log::warn!("cannot unregister the nacl shared area: {}", err);
            }
        }
    }

    impl Monitor for SbiMonitor {
        fn tsm_info(&mut self) -> Result<TsmInfo, TeeError> {
            let mut raw = [0u8; TsmInfo::SIZE];
            covh(
                SBI_COVH_GET_TSM_INFO,
                [raw.as_mut_ptr() as usize, raw.len(), 0, 0, 0, 0],
            )?;
            TsmInfo::from_bytes(&raw).ok_or(TeeError::Failed)
        }

        fn convert_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
            covh(SBI_COVH_CONVERT_PAGES, [base as usize, count as usize, 0, 0, 0, 0]).map(|_| ())
        }

        fn reclaim_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
            covh(SBI_COVH_RECLAIM_PAGES, [base as usize, count as usize, 0, 0, 0, 0]).map(|_| ())
        }

        fn global_fence(&mut self) -> Result<(), TeeError> {
            covh(SBI_COVH_GLOBAL_FENCE, [0; 6]).map(|_| ())
        }

        fn local_fence(&mut self) -> Result<(), TeeError> {
            covh(SBI_COVH_LOCAL_FENCE, [0; 6]).map(|_| ())
        }

        fn create_tvm(&mut self, params: &TvmCreateParams) -> Result<TvmId, TeeError> {
            let raw = params.to_bytes();
            covh(
                SBI_COVH_CREATE_TVM,
                [raw.as_ptr() as usize, raw.len(), 0, 0, 0, 0],
            )
            .map(|id| id as TvmId)
        }

        fn finalize_tvm(&mut self, tvm: TvmId, entry: u64, boot_arg: u64) -> Result<(), TeeError> {
            covh(
                SBI_COVH_FINALIZE_TVM,
                [tvm as usize, entry as usize, boot_arg as usize, 0, 0, 0],
            )
            .map(|_| ())
        }

        fn destroy_tvm(&mut self, tvm: TvmId) -> Result<(), TeeError> {
            covh(SBI_COVH_DESTROY_TVM, [tvm as usize, 0, 0, 0, 0, 0]).map(|_| ())
        }

        fn add_memory_region(&mut self, tvm: TvmId, gpa: u64, len: u64) -> Result<(), TeeError> {
            self.add_region(tvm, gpa, len, RegionKind::Confidential)
        }

        fn add_mmio_region(&mut self, tvm: TvmId, gpa: u64, len: u64) -> Result<(), TeeError> {
            self.add_region(tvm, gpa, len, RegionKind::EmulatedMmio)
        }

        fn add_page_table_pages(
            &mut self,
            tvm: TvmId,
            base: u64,
            count: u64,
        ) -> Result<(), TeeError> {
            covh(
                SBI_COVH_ADD_TVM_PAGE_TABLE_PAGES,
                [tvm as usize, base as usize, count as usize, 0, 0, 0],
            )
            .map(|_| ())
        }

        fn add_measured_pages(
            &mut self,
            tvm: TvmId,
            src: u64,
            dst: u64,
            page_type: TsmPageType,
            count: u64,
            gpa: u64,
        ) -> Result<(), TeeError> {
            covh(
                SBI_COVH_ADD_TVM_MEASURED_PAGES,
                [
                    tvm as usize,
                    src as usize,
                    dst as usize,
                    page_type as usize,
                    count as usize,
                    gpa as usize,
                ],
            )
            .map(|_| ())
        }

        fn add_zero_pages(
            &mut self,
            tvm: TvmId,
            base: u64,
            page_type: TsmPageType,
            count: u64,
            gpa: u64,
        ) -> Result<(), TeeError> {
            covh(
                SBI_COVH_ADD_TVM_ZERO_PAGES,
                [
                    tvm as usize,
                    base as usize,
                    page_type as usize,
                    count as usize,
                    gpa as usize,
                    0,
                ],
            )
            .map(|_| ())
        }

        fn add_shared_pages(
            &mut self,
            tvm: TvmId,
            base: u64,
            page_type: TsmPageType,
            count: u64,
            gpa: u64,
        ) -> Result<(), TeeError> {
            covh(
                SBI_COVH_ADD_TVM_SHARED_PAGES,
                [
                    tvm as usize,
                    base as usize,
                    page_type as usize,
                    count as usize,
                    gpa as usize,
                    0,
                ],
            )
            .map(|_| ())
        }

        fn create_vcpu(&mut self, tvm: TvmId, index: usize, state_addr: u64) -> Result<(), TeeError> {
            covh(
                SBI_COVH_CREATE_TVM_VCPU,
                [tvm as usize, index, state_addr as usize, 0, 0, 0],
            )
            .map(|_| ())
        }

        fn run_vcpu(&mut self, tvm: TvmId, index: usize) -> Result<RunExit, TeeError> {
            let start = riscv::register::time::read();
            let ret = covh(SBI_COVH_RUN_TVM_VCPU, [tvm as usize, index, 0, 0, 0, 0]);
            log::trace!(
                "run_tvm_vcpu({}, {}) returned after {} ticks",
                tvm,
                index,
                riscv::register::time::read().wrapping_sub(start)
            );
            RunExit::from_usize(ret?).ok_or(TeeError::Failed)
        }

        fn tvm_fence(&mut self, tvm: TvmId) -> Result<(), TeeError> {
            covh(SBI_COVH_TVM_FENCE, [tvm as usize, 0, 0, 0, 0, 0]).map(|_| ())
        }

        fn shared_area(&mut self) -> &mut VcpuSharedArea {
            &mut self.area
        }
    }
}
