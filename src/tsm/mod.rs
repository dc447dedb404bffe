//! Reference TSM: the monitor side of the CoVE host and guest interfaces.
//!
//! The monitor owns the platform memory and every TVM. Hosts reach it through the
//! typed methods below, or through [`Tsm::handle_covh`] and [`Tsm::handle_nacl`] when
//! the call arrives as raw SBI registers.

use alloc::{collections::BTreeMap, vec, vec::Vec};

use common::sbi::{
    INVAL_PHYS_ADDR, SBI_COVG_ADD_MMIO_REGION, SBI_COVG_EXT_ID, SBI_COVG_REMOVE_MMIO_REGION,
    SBI_COVG_SHARE_MEMORY_REGION, SBI_COVG_UNSHARE_MEMORY_REGION,
    SBI_COVH_ADD_TVM_MEASURED_PAGES, SBI_COVH_ADD_TVM_MEMORY_REGION,
    SBI_COVH_ADD_TVM_PAGE_TABLE_PAGES, SBI_COVH_ADD_TVM_SHARED_PAGES,
    SBI_COVH_ADD_TVM_ZERO_PAGES, SBI_COVH_CONVERT_PAGES, SBI_COVH_CREATE_TVM,
    SBI_COVH_CREATE_TVM_VCPU, SBI_COVH_DESTROY_TVM, SBI_COVH_FINALIZE_TVM,
    SBI_COVH_GET_TSM_INFO, SBI_COVH_GLOBAL_FENCE, SBI_COVH_LOCAL_FENCE,
    SBI_COVH_RECLAIM_PAGES, SBI_COVH_RUN_TVM_VCPU, SBI_COVH_TVM_FENCE, SBI_NACL_SET_SHMEM,
};
use zeroize::Zeroize;

use crate::{
    config::{TsmConfig, GUEST_PHYS_LIMIT, PAGE_DIRECTORY_PAGES, PAGE_DIRECTORY_SIZE},
    insn::{decode_mmio, Direction},
    mem::PhysMemory,
    regs::{Gpr, VcpuSharedArea},
    RegionKind, RunExit, SbiError, SbiRet, TeeError, TsmPageType, TsmState, PAGE_SIZE,
};

use self::{
    pages::{page_aligned, range_len, PageAllocator, PageState},
    pagetable::{PTE_R, PTE_W, PTE_X},
    region::{check_pages, check_range, RegionState},
    state::{TsmInfo, TvmCreateParams, TSM_IMPL_ID, TSM_VERSION},
    tvm::{Tvm, TvmState, MEASUREMENT_SIZE},
    vcpu::{
        GuestEvent, GuestExecutor, PendingExit, StagedRequest, VcpuRunState, EXC_ILLEGAL_INSTRUCTION,
        EXC_INST_GUEST_PAGE_FAULT, EXC_LOAD_GUEST_PAGE_FAULT, EXC_STORE_GUEST_PAGE_FAULT,
    },
};

pub mod pages;
pub mod pagetable;
pub mod region;
pub mod state;
pub mod tvm;
pub mod vcpu;

pub type TvmId = u64;

const PAGE: u64 = PAGE_SIZE as u64;

pub struct Tsm<M: PhysMemory, E: GuestExecutor> {
    info: TsmInfo,
    config: TsmConfig,
    memory: M,
    pages: PageAllocator,
    tvms: BTreeMap<TvmId, Tvm>,
    next_id: TvmId,
    executor: E,
    nacl_shmem: Vec<Option<u64>>,
}

fn page_type_4k(page_type: usize) -> Result<(), TeeError> {
    crate::ensure!(
        TsmPageType::from_usize(page_type) == Some(TsmPageType::Page4k),
        TeeError::InvalidParam
    )
}

fn guest_error(err: TeeError) -> SbiError {
    match err {
        TeeError::InvalidAddress => SbiError::InvalidAddress,
        TeeError::InvalidParam => SbiError::InvalidParam,
        TeeError::AlreadyStarted => SbiError::AlreadyStarted,
        TeeError::Failed | TeeError::OutOfPtPages => SbiError::Failed,
    }
}

impl<M: PhysMemory, E: GuestExecutor> Tsm<M, E> {
    pub fn new(config: TsmConfig, memory: M, executor: E) -> Result<Self, TeeError> {
        config.validate()?;
        let info = TsmInfo {
            tsm_state: TsmState::Ready,
            tsm_impl_id: TSM_IMPL_ID,
            tsm_version: TSM_VERSION,
            _padding: 0,
            tsm_capabilities: 0,
            tvm_state_pages: config.tvm_state_pages as u64,
            tvm_max_vcpus: config.tvm_max_vcpus as u64,
            tvm_vcpu_state_pages: config.tvm_vcpu_state_pages as u64,
        };
        log::info!(
            "tsm ready: {} harts, convertible window [{:#x}, {:#x})",
            config.hart_count,
            config.convertible_start,
            config.convertible_end
        );
        Ok(Self {
            info,
            pages: PageAllocator::new(&config),
            nacl_shmem: vec![None; config.hart_count],
            config,
            memory,
            tvms: BTreeMap::new(),
            next_id: 1,
            executor,
        })
    }

    pub fn info(&self) -> TsmInfo {
        self.info
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn page_state(&self, addr: u64) -> Option<PageState> {
        self.pages.state(addr)
    }

    pub fn tvm(&self, id: TvmId) -> Option<&Tvm> {
        self.tvms.get(&id)
    }

    pub fn tvm_measurement(&self, id: TvmId) -> Option<[u8; MEASUREMENT_SIZE]> {
        self.tvms.get(&id).map(Tvm::measurement)
    }

    fn tvm_mut(&mut self, id: TvmId) -> Result<&mut Tvm, TeeError> {
        self.tvms.get_mut(&id).ok_or(TeeError::InvalidParam)
    }

    fn check_hart(&self, hart: usize) -> Result<(), TeeError> {
        crate::ensure!(hart < self.config.hart_count, TeeError::InvalidParam)
    }

    // Page conversion

    pub fn convert_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
        self.pages.convert(base, count)
    }

    pub fn reclaim_pages(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
        self.pages.reclaim(base, count)
    }

    pub fn global_fence(&mut self, hart: usize) -> Result<(), TeeError> {
        self.pages.global_fence(hart)
    }

    pub fn local_fence(&mut self, hart: usize) -> Result<(), TeeError> {
        self.pages.local_fence(hart)
    }

    fn all_confidential(&self, base: u64, count: u64) -> bool {
        (0..count).all(|i| self.pages.state(base + i * PAGE) == Some(PageState::Confidential))
    }

    // TVM lifecycle

    pub fn create_tvm(&mut self, params: TvmCreateParams) -> Result<TvmId, TeeError> {
        let pd = params.tvm_page_directory_addr;
        let state = params.tvm_state_addr;
        let state_pages = self.config.tvm_state_pages as u64;

        let tvm = Tvm::new(self.next_id, pd, state)?;
        crate::ensure!(page_aligned(state), TeeError::InvalidAddress)?;
        let state_len = range_len(state, state_pages)?;
        crate::ensure!(
            state + state_len <= pd || pd + PAGE_DIRECTORY_SIZE as u64 <= state,
            TeeError::InvalidParam
        )?;
        crate::ensure!(
            self.all_confidential(pd, PAGE_DIRECTORY_PAGES as u64),
            TeeError::InvalidAddress
        )?;
        crate::ensure!(
            self.all_confidential(state, state_pages),
            TeeError::InvalidAddress
        )?;

        let id = self.next_id;
        self.next_id += 1;
        self.pages.assign(pd, PAGE_DIRECTORY_PAGES as u64, id)?;
        self.pages.assign(state, state_pages, id)?;
        self.memory.fill(state, state_len as usize, 0);

        tvm.page_table.clear(&mut self.memory);
        self.tvms.insert(id, tvm);
        log::info!("created tvm {} (page directory {:#x})", id, pd);
        Ok(id)
    }

    pub fn finalize_tvm(&mut self, id: TvmId, entry: u64, boot_arg: u64) -> Result<(), TeeError> {
        let tvm = self.tvm_mut(id)?;
        crate::ensure!(tvm.is_initializing(), TeeError::InvalidParam)?;
        crate::ensure!(!tvm.vcpus.is_empty(), TeeError::InvalidParam)?;
        tvm.finalize(entry, boot_arg);
        log::info!("finalized tvm {}: entry {:#x} arg {:#x}", id, entry, boot_arg);
        Ok(())
    }

    /// Tears the TVM down. Its pages are scrubbed and stay confidential.
    pub fn destroy_tvm(&mut self, id: TvmId) -> Result<(), TeeError> {
        let tvm = self.tvms.remove(&id).ok_or(TeeError::InvalidParam)?;
        let released = self.pages.release_all(id);
        for addr in released.iter() {
            self.memory.fill(*addr, PAGE_SIZE, 0);
        }
        drop(tvm);
        log::info!("destroyed tvm {}, {} pages released", id, released.len());
        Ok(())
    }

    // Memory regions and population

    pub fn add_memory_region(&mut self, id: TvmId, gpa: u64, len: u64) -> Result<(), TeeError> {
        self.add_region(id, gpa, len, RegionKind::Confidential)
    }

    pub fn add_mmio_region(&mut self, id: TvmId, gpa: u64, len: u64) -> Result<(), TeeError> {
        self.add_region(id, gpa, len, RegionKind::EmulatedMmio)
    }

    fn add_region(&mut self, id: TvmId, gpa: u64, len: u64, kind: RegionKind) -> Result<(), TeeError> {
        let tvm = self.tvm_mut(id)?;
        crate::ensure!(tvm.is_initializing(), TeeError::InvalidParam)?;
        check_range(gpa, len, GUEST_PHYS_LIMIT)?;
        tvm.regions.add(gpa, len, kind)?;
        log::debug!("tvm {}: {:?} region [{:#x}, {:#x})", id, kind, gpa, gpa + len);
        Ok(())
    }

    pub fn add_page_table_pages(&mut self, id: TvmId, base: u64, count: u64) -> Result<(), TeeError> {
        crate::ensure!(self.tvms.contains_key(&id), TeeError::InvalidParam)?;
        self.pages.assign(base, count, id)?;
        let tvm = self.tvm_mut(id)?;
        for i in 0..count {
            tvm.pt_pool.push(base + i * PAGE);
        }
        self.memory.fill(base, (count * PAGE) as usize, 0);
        Ok(())
    }

    /// Common checks of the `add_*_pages` calls. Returns the index of the region that
    /// receives the pages.
    fn check_population(
        &self,
        id: TvmId,
        kind: RegionKind,
        page_type: usize,
        count: u64,
        gpa: u64,
    ) -> Result<usize, TeeError> {
        let tvm = self.tvms.get(&id).ok_or(TeeError::InvalidParam)?;
        page_type_4k(page_type)?;
        let len = check_pages(gpa, count, GUEST_PHYS_LIMIT)?;
        let idx = tvm.regions.covering(gpa, len, kind)?;
        crate::ensure!(
            matches!(
                tvm.regions.get(idx).state,
                RegionState::Unpopulated | RegionState::Populated
            ),
            TeeError::InvalidParam
        )?;
        for i in 0..count {
            crate::ensure!(
                tvm.page_table
                    .translate(&self.memory, gpa + i * PAGE)
                    .is_none(),
                TeeError::InvalidAddress
            )?;
        }
        let needed = tvm.page_table.missing_tables(&self.memory, gpa, count);
        crate::ensure!(needed <= tvm.pt_pool.len(), TeeError::OutOfPtPages)?;
        Ok(idx)
    }

    fn map_pages(
        &mut self,
        id: TvmId,
        region: usize,
        hpa: u64,
        count: u64,
        gpa: u64,
        flags: u64,
    ) -> Result<(), TeeError> {
        let tvm = self.tvms.get_mut(&id).ok_or(TeeError::InvalidParam)?;
        for i in 0..count {
            tvm.page_table.map(
                &mut self.memory,
                gpa + i * PAGE,
                hpa + i * PAGE,
                flags,
                &mut tvm.pt_pool,
            )?;
        }
        tvm.regions.get_mut(region).populate();
        Ok(())
    }

    pub fn add_measured_pages(
        &mut self,
        id: TvmId,
        src: u64,
        dst: u64,
        page_type: usize,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError> {
        let tvm = self.tvms.get(&id).ok_or(TeeError::InvalidParam)?;
        crate::ensure!(tvm.is_initializing(), TeeError::InvalidParam)?;
        crate::ensure!(page_aligned(src) && page_aligned(dst), TeeError::InvalidAddress)?;
        let region = self.check_population(id, RegionKind::Confidential, page_type, count, gpa)?;
        let len = range_len(src, count)?;
        crate::ensure!(
            self.pages.is_non_confidential(src, len),
            TeeError::InvalidAddress
        )?;
        crate::ensure!(self.all_confidential(dst, count), TeeError::InvalidAddress)?;

        self.pages.assign(dst, count, id)?;
        let mut page = [0u8; PAGE_SIZE];
        for i in 0..count {
            let off = i * PAGE;
            self.memory.read(src + off, &mut page);
            self.memory.write(dst + off, &page);
            if let Some(tvm) = self.tvms.get_mut(&id) {
                tvm.extend_measurement(gpa + off, &page);
            }
        }
        page.zeroize();

        self.map_pages(id, region, dst, count, gpa, PTE_R | PTE_W | PTE_X)?;
        log::debug!("tvm {}: {} measured pages at gpa {:#x}", id, count, gpa);
        Ok(())
    }

    pub fn add_zero_pages(
        &mut self,
        id: TvmId,
        base: u64,
        page_type: usize,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError> {
        let tvm = self.tvms.get(&id).ok_or(TeeError::InvalidParam)?;
        crate::ensure!(tvm.state == TvmState::Runnable, TeeError::InvalidParam)?;
        crate::ensure!(page_aligned(base), TeeError::InvalidAddress)?;
        let region = self.check_population(id, RegionKind::Confidential, page_type, count, gpa)?;
        crate::ensure!(self.all_confidential(base, count), TeeError::InvalidAddress)?;

        self.pages.assign(base, count, id)?;
        self.memory.fill(base, (count * PAGE) as usize, 0);
        self.map_pages(id, region, base, count, gpa, PTE_R | PTE_W | PTE_X)?;
        log::debug!("tvm {}: {} zero pages at gpa {:#x}", id, count, gpa);
        Ok(())
    }

    pub fn add_shared_pages(
        &mut self,
        id: TvmId,
        base: u64,
        page_type: usize,
        count: u64,
        gpa: u64,
    ) -> Result<(), TeeError> {
        let tvm = self.tvms.get(&id).ok_or(TeeError::InvalidParam)?;
        crate::ensure!(tvm.state == TvmState::Runnable, TeeError::InvalidParam)?;
        crate::ensure!(page_aligned(base), TeeError::InvalidAddress)?;
        let region = self.check_population(id, RegionKind::Shared, page_type, count, gpa)?;
        let len = range_len(base, count)?;
        crate::ensure!(
            self.pages.is_non_confidential(base, len),
            TeeError::InvalidAddress
        )?;

        self.map_pages(id, region, base, count, gpa, PTE_R | PTE_W)?;
        log::debug!("tvm {}: {} shared pages at gpa {:#x}", id, count, gpa);
        Ok(())
    }

    // Vcpus

    pub fn create_vcpu(&mut self, id: TvmId, index: usize, state_addr: u64) -> Result<(), TeeError> {
        let max_vcpus = self.config.tvm_max_vcpus;
        let state_pages = self.config.tvm_vcpu_state_pages as u64;
        let tvm = self.tvms.get(&id).ok_or(TeeError::InvalidParam)?;
        crate::ensure!(tvm.is_initializing(), TeeError::InvalidParam)?;
        crate::ensure!(index < max_vcpus, TeeError::InvalidParam)?;
        crate::ensure!(tvm.vcpu(index).is_none(), TeeError::InvalidParam)?;
        crate::ensure!(page_aligned(state_addr), TeeError::InvalidAddress)?;
        crate::ensure!(
            self.all_confidential(state_addr, state_pages),
            TeeError::InvalidAddress
        )?;

        self.pages.assign(state_addr, state_pages, id)?;
        self.memory
            .fill(state_addr, (state_pages * PAGE) as usize, 0);
        let tvm = self.tvm_mut(id)?;
        tvm.vcpus
            .push(vcpu::Vcpu::new(index, state_addr))
            .map_err(|_| TeeError::InvalidParam)?;
        log::debug!("tvm {}: created vcpu {}", id, index);
        Ok(())
    }

    /// Starts a per-TVM fence. Vcpus that ran before observe it on their next entry.
    pub fn tvm_fence(&mut self, id: TvmId) -> Result<(), TeeError> {
        let tvm = self.tvm_mut(id)?;
        crate::ensure!(tvm.fence_observers.is_none(), TeeError::AlreadyStarted)?;
        let observers = tvm.fence_participants();
        if observers == 0 {
            tvm.complete_fence();
        } else {
            log::debug!("tvm {} fence waits for vcpus {:#b}", id, observers);
            tvm.fence_observers = Some(observers);
        }
        Ok(())
    }

    /// Runs a vcpu until it exits with something the monitor cannot handle on its own.
    ///
    /// A resume that applies a guest's change over populated memory blocks the vcpu,
    /// and the call fails like any run of a blocked vcpu until the TVM is fenced.
    pub fn run_vcpu(
        &mut self,
        hart: usize,
        id: TvmId,
        index: usize,
        area: &mut VcpuSharedArea,
    ) -> Result<RunExit, TeeError> {
        self.check_hart(hart)?;
        let tvm = self.tvms.get_mut(&id).ok_or(TeeError::InvalidParam)?;
        crate::ensure!(tvm.state == TvmState::Runnable, TeeError::InvalidParam)?;
        let slot = tvm
            .vcpus
            .iter()
            .position(|v| v.index == index)
            .ok_or(TeeError::InvalidParam)?;
        crate::ensure!(tvm.vcpus[slot].is_runnable(), TeeError::InvalidParam)?;

        if let PendingExit::GuestRequest(request) = tvm.vcpus[slot].pending {
            if Self::apply_guest_request(&mut self.memory, &mut self.pages, tvm, slot, request, area)
            {
                // blocked until the host fences the TVM
                return Err(TeeError::InvalidParam);
            }
        }

        tvm.observe_fence(index);
        let vcpu = &mut tvm.vcpus[slot];
        vcpu.resume(area);
        vcpu.has_run = true;
        vcpu.run_state = VcpuRunState::Running;

        let exit = loop {
            let event = self.executor.next_event(id, index, &mut tvm.vcpus[slot].cpu);
            match event {
                GuestEvent::Access { gpa, insn } => {
                    let decoded = decode_mmio(insn as u64);
                    let scause = match decoded {
                        Ok(access) if access.direction == Direction::Store => {
                            EXC_STORE_GUEST_PAGE_FAULT
                        }
                        _ => EXC_LOAD_GUEST_PAGE_FAULT,
                    };
                    let region = tvm.regions.find(gpa).copied();

                    if let Some(r) = region {
                        if r.is_changing() {
                            log::warn!(
                                "tvm {} vcpu {} touched {:#x} during an assignment change",
                                id,
                                index,
                                gpa
                            );
                            tvm.vcpus[slot].exit_terminal(area, scause, gpa);
                            break RunExit::Terminal;
                        }
                    }

                    if let Some((hpa, _)) = tvm.page_table.translate(&self.memory, gpa) {
                        let Ok(access) = decoded else {
                            tvm.vcpus[slot].exit_terminal(area, EXC_ILLEGAL_INSTRUCTION, insn as u64);
                            break RunExit::Terminal;
                        };
                        let cpu = &mut tvm.vcpus[slot].cpu;
                        let width = access.width.bytes();
                        match access.direction {
                            Direction::Store => {
                                let value = cpu.gpr(access.reg).to_le_bytes();
                                self.memory.write(hpa, &value[..width]);
                            }
                            Direction::Load => {
                                let mut raw = [0u8; 8];
                                self.memory.read(hpa, &mut raw[..width]);
                                cpu.set_gpr(access.reg, access.extend(u64::from_le_bytes(raw)));
                            }
                        }
                        cpu.pc += access.len;
                        continue;
                    }

                    let mmio = match region {
                        Some(r) if r.kind == RegionKind::EmulatedMmio => decoded.ok(),
                        _ => None,
                    };
                    tvm.vcpus[slot].exit_fault(area, scause, gpa, insn, mmio);
                    break RunExit::Resumable;
                }
                GuestEvent::Fetch { gpa } => {
                    if tvm.regions.find(gpa).is_some_and(|r| r.is_changing()) {
                        log::warn!(
                            "tvm {} vcpu {} fetched from {:#x} during an assignment change",
                            id,
                            index,
                            gpa
                        );
                        tvm.vcpus[slot].exit_terminal(area, EXC_INST_GUEST_PAGE_FAULT, gpa);
                        break RunExit::Terminal;
                    }
                    if tvm.page_table.translate(&self.memory, gpa).is_some() {
                        tvm.vcpus[slot].cpu.pc = gpa;
                        continue;
                    }
                    tvm.vcpus[slot].exit_fault(area, EXC_INST_GUEST_PAGE_FAULT, gpa, 0, None);
                    break RunExit::Resumable;
                }
                GuestEvent::Ecall => {
                    let cpu = &tvm.vcpus[slot].cpu;
                    if cpu.gpr(Gpr::A7) != SBI_COVG_EXT_ID as u64 {
                        tvm.vcpus[slot].exit_ecall(area);
                        break RunExit::Resumable;
                    }
                    let request = StagedRequest {
                        fid: cpu.gpr(Gpr::A6) as usize,
                        base: cpu.gpr(Gpr::A0),
                        len: cpu.gpr(Gpr::A1),
                    };
                    if let Err(err) = Self::check_guest_request(tvm, &request) {
                        let cpu = &mut tvm.vcpus[slot].cpu;
                        cpu.set_gpr(Gpr::A0, guest_error(err).code() as u64);
                        cpu.set_gpr(Gpr::A1, 0);
                        cpu.pc += 4;
                        continue;
                    }
                    tvm.vcpus[slot].exit_guest_request(area, request);
                    break RunExit::Resumable;
                }
                GuestEvent::VirtualInstruction { insn } => {
                    tvm.vcpus[slot].exit_virtual_instruction(area, insn);
                    break RunExit::Resumable;
                }
                GuestEvent::Interrupt { code } => {
                    tvm.vcpus[slot].exit_interrupt(area, code);
                    break RunExit::Resumable;
                }
                GuestEvent::Halt => {
                    tvm.vcpus[slot].exit_terminal(area, 0, 0);
                    break RunExit::Terminal;
                }
            }
        };

        if exit == RunExit::Terminal {
            // a dead vcpu can no longer hold up a fence
            tvm.observe_fence(index);
        }
        Ok(exit)
    }

    /// Checked at the ecall. Nothing changes until the host accepted the request.
    fn check_guest_request(tvm: &Tvm, request: &StagedRequest) -> Result<(), TeeError> {
        let (base, len) = (request.base, request.len);
        match request.fid {
            SBI_COVG_ADD_MMIO_REGION => {
                check_range(base, len, GUEST_PHYS_LIMIT)?;
                crate::ensure_not!(
                    tvm.regions.iter().any(|r| r.overlaps(base, len)),
                    TeeError::InvalidAddress
                )
            }
            SBI_COVG_REMOVE_MMIO_REGION => crate::ensure!(
                tvm.regions
                    .iter()
                    .any(|r| r.base == base && r.len == len && r.kind == RegionKind::EmulatedMmio),
                TeeError::InvalidAddress
            ),
            SBI_COVG_SHARE_MEMORY_REGION => {
                Self::check_assignment(tvm, base, len, RegionKind::Confidential).map(|_| ())
            }
            SBI_COVG_UNSHARE_MEMORY_REGION => {
                Self::check_assignment(tvm, base, len, RegionKind::Shared).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    fn check_assignment(
        tvm: &Tvm,
        base: u64,
        len: u64,
        from: RegionKind,
    ) -> Result<usize, TeeError> {
        check_range(base, len, GUEST_PHYS_LIMIT)?;
        crate::ensure_not!(tvm.regions.any_pending(), TeeError::AlreadyStarted)?;
        tvm.regions.covering(base, len, from)
    }

    /// Delivers the host's reply to a staged request, applying the request first when
    /// the host accepted it. Returns true when the vcpu now waits for a TVM fence.
    fn apply_guest_request(
        memory: &mut M,
        pages: &mut PageAllocator,
        tvm: &mut Tvm,
        slot: usize,
        request: StagedRequest,
        area: &VcpuSharedArea,
    ) -> bool {
        let (mut a0, mut a1) = (area.gpr(Gpr::A0), area.gpr(Gpr::A1));
        let index = tvm.vcpus[slot].index;
        let ret = if a0 == 0 {
            Self::commit_guest_request(memory, pages, tvm, index, request, a1)
        } else {
            log::debug!(
                "tvm {}: host refused covg fid {} ({})",
                tvm.id,
                request.fid,
                a0 as i64
            );
            Ok(false)
        };
        let blocked = match ret {
            Ok(blocked) => blocked,
            Err(err) => {
                log::warn!("tvm {}: cannot apply covg fid {}: {}", tvm.id, request.fid, err);
                a0 = guest_error(err).code() as u64;
                a1 = 0;
                false
            }
        };

        let vcpu = &mut tvm.vcpus[slot];
        vcpu.cpu.set_gpr(Gpr::A0, a0);
        vcpu.cpu.set_gpr(Gpr::A1, a1);
        vcpu.cpu.pc += 4;
        vcpu.pending = PendingExit::None;
        if blocked {
            vcpu.run_state = VcpuRunState::Blocked;
        }
        blocked
    }

    /// `accepted` is the host's `a1`; for a share it is the length the host kept.
    fn commit_guest_request(
        memory: &mut M,
        pages: &mut PageAllocator,
        tvm: &mut Tvm,
        vcpu: usize,
        request: StagedRequest,
        accepted: u64,
    ) -> Result<bool, TeeError> {
        let (base, len) = (request.base, request.len);
        match request.fid {
            SBI_COVG_ADD_MMIO_REGION => {
                tvm.regions.add(base, len, RegionKind::EmulatedMmio)?;
                Ok(false)
            }
            SBI_COVG_REMOVE_MMIO_REGION => {
                tvm.regions.remove(base, len, RegionKind::EmulatedMmio)?;
                Ok(false)
            }
            SBI_COVG_SHARE_MEMORY_REGION => {
                crate::ensure!(
                    accepted > 0 && accepted <= len && page_aligned(accepted),
                    TeeError::InvalidParam
                )?;
                Self::change_assignment(
                    memory,
                    pages,
                    tvm,
                    vcpu,
                    base,
                    accepted,
                    RegionKind::Confidential,
                    RegionKind::Shared,
                )
            }
            SBI_COVG_UNSHARE_MEMORY_REGION => Self::change_assignment(
                memory,
                pages,
                tvm,
                vcpu,
                base,
                len,
                RegionKind::Shared,
                RegionKind::Confidential,
            ),
            _ => Ok(false),
        }
    }

    /// Populated pages are unmapped now and the region settles into `to` when the next
    /// TVM fence completes. Returns true in that case.
    #[allow(clippy::too_many_arguments)]
    fn change_assignment(
        memory: &mut M,
        pages: &mut PageAllocator,
        tvm: &mut Tvm,
        vcpu: usize,
        base: u64,
        len: u64,
        from: RegionKind,
        to: RegionKind,
    ) -> Result<bool, TeeError> {
        let idx = Self::check_assignment(tvm, base, len, from)?;

        let mapped: Vec<u64> = (0..len / PAGE)
            .map(|i| base + i * PAGE)
            .filter(|gpa| tvm.page_table.translate(&*memory, *gpa).is_some())
            .collect();
        let idx = tvm.regions.split(idx, base, len, !mapped.is_empty())?;

        for gpa in mapped.iter() {
            if let Some(hpa) = tvm.page_table.unmap(memory, *gpa) {
                if from == RegionKind::Confidential {
                    memory.fill(hpa, PAGE_SIZE, 0);
                    pages.release(hpa, tvm.id);
                }
            }
        }

        let blocked = tvm.regions.get_mut(idx).begin_change(to, vcpu);
        log::debug!(
            "tvm {}: [{:#x}, {:#x}) {:?} -> {:?}{}",
            tvm.id,
            base,
            base + len,
            from,
            to,
            if blocked { ", waiting for fence" } else { "" }
        );
        Ok(blocked)
    }

    // Raw SBI entry points

    fn covh(&mut self, hart: usize, fid: usize, args: &[usize; 6]) -> Result<usize, TeeError> {
        let arg = |i: usize| args[i] as u64;
        match fid {
            SBI_COVH_GET_TSM_INFO => {
                crate::ensure!(args[1] >= TsmInfo::SIZE, TeeError::InvalidParam)?;
                crate::ensure!(
                    self.pages.is_non_confidential(arg(0), TsmInfo::SIZE as u64),
                    TeeError::InvalidAddress
                )?;
                let raw = self.info.to_bytes();
                self.memory.write(arg(0), &raw);
                Ok(TsmInfo::SIZE)
            }
            SBI_COVH_CONVERT_PAGES => self.convert_pages(arg(0), arg(1)).map(|_| 0),
            SBI_COVH_RECLAIM_PAGES => self.reclaim_pages(arg(0), arg(1)).map(|_| 0),
            SBI_COVH_GLOBAL_FENCE => self.global_fence(hart).map(|_| 0),
            SBI_COVH_LOCAL_FENCE => self.local_fence(hart).map(|_| 0),
            SBI_COVH_CREATE_TVM => {
                crate::ensure!(args[1] >= TvmCreateParams::SIZE, TeeError::InvalidParam)?;
                let mut raw = [0u8; TvmCreateParams::SIZE];
                self.memory.read(arg(0), &mut raw);
                self.create_tvm(TvmCreateParams::from_bytes(&raw))
                    .map(|id| id as usize)
            }
            SBI_COVH_FINALIZE_TVM => self.finalize_tvm(arg(0), arg(1), arg(2)).map(|_| 0),
            SBI_COVH_DESTROY_TVM => self.destroy_tvm(arg(0)).map(|_| 0),
            SBI_COVH_ADD_TVM_MEMORY_REGION => match RegionKind::from_usize(args[3]) {
                Some(RegionKind::Confidential) => self.add_memory_region(arg(0), arg(1), arg(2)),
                Some(RegionKind::EmulatedMmio) => self.add_mmio_region(arg(0), arg(1), arg(2)),
                _ => Err(TeeError::InvalidParam),
            }
            .map(|_| 0),
            SBI_COVH_ADD_TVM_PAGE_TABLE_PAGES => {
                self.add_page_table_pages(arg(0), arg(1), arg(2)).map(|_| 0)
            }
            SBI_COVH_ADD_TVM_MEASURED_PAGES => self
                .add_measured_pages(arg(0), arg(1), arg(2), args[3], arg(4), arg(5))
                .map(|_| 0),
            SBI_COVH_ADD_TVM_ZERO_PAGES => self
                .add_zero_pages(arg(0), arg(1), args[2], arg(3), arg(4))
                .map(|_| 0),
            SBI_COVH_ADD_TVM_SHARED_PAGES => self
                .add_shared_pages(arg(0), arg(1), args[2], arg(3), arg(4))
                .map(|_| 0),
            SBI_COVH_CREATE_TVM_VCPU => self.create_vcpu(arg(0), args[1], arg(2)).map(|_| 0),
            SBI_COVH_RUN_TVM_VCPU => {
                self.check_hart(hart)?;
                let shmem = self.nacl_shmem[hart].ok_or(TeeError::Failed)?;
                let mut area = VcpuSharedArea::new();
                self.memory.read(shmem, area.as_bytes_mut());
                let exit = self.run_vcpu(hart, arg(0), args[1], &mut area);
                self.memory.write(shmem, area.as_bytes());
                exit.map(|e| e as usize)
            }
            SBI_COVH_TVM_FENCE => self.tvm_fence(arg(0)).map(|_| 0),
            _ => Err(TeeError::Failed),
        }
    }

    /// Dispatches a CoVH call arriving in registers `a0..a5` with function id `fid`.
    pub fn handle_covh(&mut self, hart: usize, fid: usize, args: &[usize; 6]) -> SbiRet {
        if fid > SBI_COVH_TVM_FENCE {
            return SbiRet::error(SbiError::NotSupported.code());
        }
        let ret = self.covh(hart, fid, args);
        if let Err(err) = ret {
            log::debug!("covh fid {} failed: {}", fid, err);
        }
        ret.into()
    }

    /// NACL: registers the shared area the hart uses for `run_tvm_vcpu()`.
    pub fn handle_nacl(&mut self, hart: usize, fid: usize, args: &[usize; 6]) -> SbiRet {
        let ret = match fid {
            SBI_NACL_SET_SHMEM => self.set_shmem(hart, args[0]),
            _ => Err(SbiError::NotSupported),
        };
        ret.into()
    }

    fn set_shmem(&mut self, hart: usize, addr: usize) -> Result<usize, SbiError> {
        crate::ensure!(hart < self.config.hart_count, SbiError::InvalidParam)?;
        if addr == INVAL_PHYS_ADDR {
            self.nacl_shmem[hart] = None;
            return Ok(0);
        }
        let addr = addr as u64;
        crate::ensure!(page_aligned(addr), SbiError::InvalidParam)?;
        crate::ensure!(
            self.pages.is_non_confidential(addr, PAGE),
            SbiError::InvalidAddress
        )?;
        self.nacl_shmem[hart] = Some(addr);
        Ok(0)
    }
}
