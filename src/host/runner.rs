//! Host run loop of one TVM vcpu: enter, classify the exit, service it, resume.

use alloc::vec::Vec;

use common::sbi::{SBI_COVG_EXT_ID, SBI_LEGACY_PUTCHAR_EXT_ID};

use crate::{
    config::GuestRequestPolicy,
    error::HostError,
    insn::{decode_mmio, AccessWidth, Direction, INSN_WFI},
    log::LineBuffer,
    regs::{Gpr, HypervisorCsr, SupervisorCsr},
    tsm::TvmId,
    RegionKind, RunExit, TeeError, TsmPageType, PAGE_SIZE,
};

use super::{
    guest_request,
    monitor::Monitor,
    pages::HostPages,
    regions::HostRegions,
    trap::{fault_address, Exception, Trap},
};

const PAGE: u64 = PAGE_SIZE as u64;

/// Devices behind the guest's emulated MMIO regions.
pub trait MmioBus {
    fn read(&mut self, addr: u64, width: AccessWidth) -> Result<u64, HostError>;
    fn write(&mut self, addr: u64, width: AccessWidth, value: u64) -> Result<(), HostError>;
}

pub struct TvmRunner<Mo: Monitor, B: MmioBus, P: HostPages> {
    monitor: Mo,
    bus: B,
    pages: P,
    tvm: TvmId,
    vcpu: usize,
    regions: HostRegions,
    policy: GuestRequestPolicy,
    /// Converted, unassigned pages used to populate confidential memory on demand.
    reserve: Vec<u64>,
    console: LineBuffer,
    /// A share was accepted; the resume that applies it may block the vcpu.
    fence_due: bool,
}

impl<Mo: Monitor, B: MmioBus, P: HostPages> TvmRunner<Mo, B, P> {
    pub fn new(
        monitor: Mo,
        bus: B,
        pages: P,
        tvm: TvmId,
        vcpu: usize,
        regions: HostRegions,
        policy: GuestRequestPolicy,
    ) -> Self {
        Self {
            monitor,
            bus,
            pages,
            tvm,
            vcpu,
            regions,
            policy,
            reserve: Vec::new(),
            console: LineBuffer::new(),
            fence_due: false,
        }
    }

    pub fn with_reserve(mut self, pages: Vec<u64>) -> Self {
        self.reserve = pages;
        self
    }

    pub fn tvm(&self) -> TvmId {
        self.tvm
    }

    pub fn regions(&self) -> &HostRegions {
        &self.regions
    }

    pub fn monitor_mut(&mut self) -> &mut Mo {
        &mut self.monitor
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn pages_mut(&mut self) -> &mut P {
        &mut self.pages
    }

    pub fn reserve_left(&self) -> usize {
        self.reserve.len()
    }

    pub fn into_parts(self) -> (Mo, B, P) {
        (self.monitor, self.bus, self.pages)
    }

    pub fn release_shared_memory(&mut self) {
        guest_request::release_shared_memory(&mut self.regions, &mut self.pages);
    }

    /// Runs the vcpu until the guest executes `wfi`. Returns the number of exits
    /// serviced on the way.
    pub fn run(&mut self) -> Result<usize, HostError> {
        let mut exits = 0;
        loop {
            let exit = match self.monitor.run_vcpu(self.tvm, self.vcpu) {
                Err(TeeError::InvalidParam) if self.fence_due => {
                    self.fence_due = false;
                    self.fence()?;
                    continue;
                }
                ret => {
                    self.fence_due = false;
                    ret?
                }
            };
            if exit == RunExit::Terminal {
                log::error!("tvm {} vcpu {} is no longer runnable", self.tvm, self.vcpu);
                return Err(HostError::VcpuTerminated);
            }

            let area = self.monitor.shared_area();
            let scause = area.csr(SupervisorCsr::Scause);
            match Trap::read(area) {
                Trap::Interrupt(code) => log::trace!("interrupt {} while in the guest", code),
                Trap::Exception(Exception::VirtualInstruction) => {
                    let insn = area.csr(SupervisorCsr::Stval) as u32;
                    if insn == INSN_WFI {
                        log::debug!("tvm {} paused after {} exits", self.tvm, exits);
                        return Ok(exits);
                    }
                    return Err(HostError::UnhandledException { scause });
                }
                Trap::Exception(Exception::VirtualSupervisorEcall) => self.handle_ecall()?,
                Trap::Exception(
                    kind @ (Exception::LoadGuestPageFault
                    | Exception::StoreGuestPageFault
                    | Exception::InstructionGuestPageFault),
                ) => self.handle_fault(kind, scause)?,
                Trap::Exception(Exception::Other(_)) => {
                    return Err(HostError::UnhandledException { scause })
                }
            }
            exits += 1;
        }
    }

    fn handle_ecall(&mut self) -> Result<(), HostError> {
        let area = self.monitor.shared_area();
        let extension = area.gpr(Gpr::A7);
        match extension as usize {
            SBI_COVG_EXT_ID => {
                self.fence_due = guest_request::service(&mut self.regions, &self.policy, area)?;
            }
            SBI_LEGACY_PUTCHAR_EXT_ID => {
                let byte = area.gpr(Gpr::A0) as u8;
                area.set_gpr(Gpr::A0, 0);
                if let Some(line) = self.console.push(byte) {
                    log::info!(target: "guest", "{}", line);
                }
            }
            _ => {
                log::error!("unhandled ecall from vs mode: {:#x}", extension);
                return Err(HostError::UnhandledEcall { extension });
            }
        }
        Ok(())
    }

    /// A fence already in flight covers this change too.
    fn fence(&mut self) -> Result<(), HostError> {
        match self.monitor.tvm_fence(self.tvm) {
            Ok(()) => Ok(()),
            Err(TeeError::AlreadyStarted) => {
                log::debug!("tvm {} fence already pending", self.tvm);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn handle_fault(&mut self, kind: Exception, scause: u64) -> Result<(), HostError> {
        let addr = fault_address(self.monitor.shared_area());
        match (self.regions.classify(addr), kind) {
            (Some(RegionKind::EmulatedMmio), Exception::InstructionGuestPageFault) | (None, _) => {
                log::error!("unhandled guest fault at {:#x}", addr);
                Err(HostError::UnhandledFault { addr, scause })
            }
            (Some(RegionKind::EmulatedMmio), _) => self.emulate_mmio(addr),
            (Some(RegionKind::Shared), _) => self.populate_shared(addr, scause),
            (Some(RegionKind::Confidential), _) => self.populate_confidential(addr),
        }
    }

    fn emulate_mmio(&mut self, addr: u64) -> Result<(), HostError> {
        let area = self.monitor.shared_area();
        let access = decode_mmio(area.hcsr(HypervisorCsr::Htinst))?;
        match access.direction {
            Direction::Load => {
                let raw = self.bus.read(addr, access.width)?;
                area.set_gpr(access.reg, access.extend(raw));
            }
            Direction::Store => {
                let value = area.gpr(access.reg) & access.width.mask();
                self.bus.write(addr, access.width, value)?;
            }
        }
        Ok(())
    }

    /// Backs the whole declared shared buffer with fresh host pages.
    fn populate_shared(&mut self, addr: u64, scause: u64) -> Result<(), HostError> {
        let shared = self
            .regions
            .shared()
            .copied()
            .ok_or(HostError::UnhandledFault { addr, scause })?;
        if shared.host_base.is_some() {
            return Err(HostError::UnhandledFault { addr, scause });
        }

        let count = shared.pages();
        let base = self
            .pages
            .alloc_pages(count, PAGE)
            .ok_or(HostError::OutOfHostPages)?;
        let zero = [0u8; PAGE_SIZE];
        for i in 0..count {
            self.pages.write(base + i * PAGE, &zero);
        }

        let ret = self.monitor.add_shared_pages(
            self.tvm,
            base,
            TsmPageType::Page4k,
            count,
            shared.range.base,
        );
        if let Err(err) = ret {
            self.pages.free_pages(base, count);
            return Err(err.into());
        }
        self.regions.set_shared_backing(base);
        log::info!(
            "shared buffer [{:#x}, {:#x}) backed by host {:#x}",
            shared.range.base,
            shared.range.end(),
            base
        );
        Ok(())
    }

    /// Maps one zero page at the faulting address, donating a page table page and
    /// retrying once when the monitor runs out of them.
    fn populate_confidential(&mut self, addr: u64) -> Result<(), HostError> {
        let gpa = addr & !(PAGE - 1);
        let page = self.reserve.pop().ok_or(HostError::OutOfReservePages)?;

        let mut ret = self
            .monitor
            .add_zero_pages(self.tvm, page, TsmPageType::Page4k, 1, gpa);
        if ret == Err(TeeError::OutOfPtPages) {
            let Some(table) = self.reserve.pop() else {
                self.reserve.push(page);
                return Err(HostError::OutOfReservePages);
            };
            log::debug!("tvm {}: donating page table page {:#x}", self.tvm, table);
            self.monitor.add_page_table_pages(self.tvm, table, 1)?;
            ret = self
                .monitor
                .add_zero_pages(self.tvm, page, TsmPageType::Page4k, 1, gpa);
        }
        if let Err(err) = ret {
            self.reserve.push(page);
            return Err(err.into());
        }
        log::trace!("tvm {}: zero page at {:#x}", self.tvm, gpa);
        Ok(())
    }
}
