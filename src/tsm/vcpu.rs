//! Virtual CPU state kept by the monitor and the exits it reports to the host.

use crate::{
    insn::{Direction, MmioAccess},
    regs::{Gpr, HypervisorCsr, SupervisorCsr, VcpuSharedArea},
};

pub const EXC_VIRTUAL_SUPERVISOR_ECALL: u64 = 10;
pub const EXC_INST_GUEST_PAGE_FAULT: u64 = 20;
pub const EXC_LOAD_GUEST_PAGE_FAULT: u64 = 21;
pub const EXC_VIRTUAL_INSTRUCTION: u64 = 22;
pub const EXC_STORE_GUEST_PAGE_FAULT: u64 = 23;
pub const EXC_ILLEGAL_INSTRUCTION: u64 = 2;
pub const SCAUSE_INTERRUPT: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuRunState {
    Created,
    Running,
    Trapped,
    /// Waits for the TVM fence of an assignment change it requested.
    Blocked,
    Unresumable,
}

/// Architectural state of a guest hart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuestCpu {
    pub gprs: [u64; 32],
    pub pc: u64,
}

impl GuestCpu {
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gprs[reg.index()]
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        if reg != Gpr::ZERO {
            self.gprs[reg.index()] = value;
        }
    }
}

/// What the guest does next, as produced by a [`GuestExecutor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestEvent {
    /// Load or store described by `insn` to `gpa`.
    Access { gpa: u64, insn: u32 },
    Fetch { gpa: u64 },
    Ecall,
    VirtualInstruction { insn: u32 },
    Interrupt { code: u64 },
    /// The guest stops for good.
    Halt,
}

/// Source of guest behaviour. The monitor asks for the next event at the current pc
/// and applies its effect; a faulting event is asked for again after the exit.
///
/// Instructions that never trap (arithmetic, register moves) are applied by the
/// executor itself through `cpu` before it returns the next event.
pub trait GuestExecutor {
    fn next_event(&mut self, tvm: u64, vcpu: usize, cpu: &mut GuestCpu) -> GuestEvent;
}

/// A guest request the monitor validated but has not applied yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedRequest {
    pub fid: usize,
    pub base: u64,
    pub len: u64,
}

/// Work left over from the last exit, completed on the next entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingExit {
    None,
    MmioLoad(MmioAccess),
    MmioStore { len: u64 },
    Ecall,
    /// A COVG request waiting for the host's verdict.
    GuestRequest(StagedRequest),
    Retry,
    Skip,
}

pub struct Vcpu {
    pub index: usize,
    pub state_addr: u64,
    pub run_state: VcpuRunState,
    pub cpu: GuestCpu,
    pub pending: PendingExit,
    pub has_run: bool,
}

impl Vcpu {
    pub fn new(index: usize, state_addr: u64) -> Self {
        Self {
            index,
            state_addr,
            run_state: VcpuRunState::Created,
            cpu: GuestCpu::default(),
            pending: PendingExit::None,
            has_run: false,
        }
    }

    pub fn is_runnable(&self) -> bool {
        !matches!(
            self.run_state,
            VcpuRunState::Blocked | VcpuRunState::Unresumable
        )
    }

    /// Applies the host's reply to the previous exit.
    pub fn resume(&mut self, area: &VcpuSharedArea) {
        match self.pending {
            PendingExit::None | PendingExit::Retry => {}
            PendingExit::MmioLoad(access) => {
                let value = area.gpr(access.reg);
                self.cpu.set_gpr(access.reg, value);
                self.cpu.pc += access.len;
            }
            PendingExit::MmioStore { len } => self.cpu.pc += len,
            PendingExit::Ecall | PendingExit::GuestRequest(_) => {
                self.cpu.set_gpr(Gpr::A0, area.gpr(Gpr::A0));
                self.cpu.set_gpr(Gpr::A1, area.gpr(Gpr::A1));
                self.cpu.pc += 4;
            }
            PendingExit::Skip => self.cpu.pc += 4,
        }
        self.pending = PendingExit::None;
    }

    fn trap_csrs(&self, area: &mut VcpuSharedArea, scause: u64, stval: u64) {
        for i in 0..32 {
            area.set_gpr(Gpr::from_field(i), 0);
        }
        area.set_csr(SupervisorCsr::Sepc, self.cpu.pc);
        area.set_csr(SupervisorCsr::Scause, scause);
        area.set_csr(SupervisorCsr::Stval, stval);
        area.set_hcsr(HypervisorCsr::Htval, 0);
        area.set_hcsr(HypervisorCsr::Htinst, 0);
    }

    /// Reports a guest page fault. Only the register an MMIO store reads from is
    /// exposed.
    pub fn exit_fault(
        &mut self,
        area: &mut VcpuSharedArea,
        scause: u64,
        gpa: u64,
        insn: u32,
        mmio: Option<MmioAccess>,
    ) {
        self.trap_csrs(area, scause, gpa);
        area.set_hcsr(HypervisorCsr::Htval, gpa >> 2);
        area.set_hcsr(HypervisorCsr::Htinst, insn as u64);
        self.pending = match mmio {
            Some(access) if access.direction == Direction::Store => {
                area.set_gpr(access.reg, self.cpu.gpr(access.reg));
                PendingExit::MmioStore { len: access.len }
            }
            Some(access) => PendingExit::MmioLoad(access),
            None => PendingExit::Retry,
        };
        self.run_state = VcpuRunState::Trapped;
    }

    pub fn exit_guest_request(&mut self, area: &mut VcpuSharedArea, request: StagedRequest) {
        self.exit_ecall(area);
        self.pending = PendingExit::GuestRequest(request);
    }

    /// Only the argument registers are exposed.
    pub fn exit_ecall(&mut self, area: &mut VcpuSharedArea) {
        self.trap_csrs(area, EXC_VIRTUAL_SUPERVISOR_ECALL, 0);
        for reg in [
            Gpr::A0,
            Gpr::A1,
            Gpr::A2,
            Gpr::A3,
            Gpr::A4,
            Gpr::A5,
            Gpr::A6,
            Gpr::A7,
        ] {
            area.set_gpr(reg, self.cpu.gpr(reg));
        }
        self.pending = PendingExit::Ecall;
        self.run_state = VcpuRunState::Trapped;
    }

    pub fn exit_virtual_instruction(&mut self, area: &mut VcpuSharedArea, insn: u32) {
        self.trap_csrs(area, EXC_VIRTUAL_INSTRUCTION, insn as u64);
        self.pending = PendingExit::Skip;
        self.run_state = VcpuRunState::Trapped;
    }

    pub fn exit_interrupt(&mut self, area: &mut VcpuSharedArea, code: u64) {
        self.trap_csrs(area, SCAUSE_INTERRUPT | code, 0);
        self.pending = PendingExit::None;
        self.run_state = VcpuRunState::Trapped;
    }

    /// Makes the vcpu unresumable; `scause` tells the host why.
    pub fn exit_terminal(&mut self, area: &mut VcpuSharedArea, scause: u64, stval: u64) {
        self.trap_csrs(area, scause, stval);
        self.pending = PendingExit::None;
        self.run_state = VcpuRunState::Unresumable;
    }
}
