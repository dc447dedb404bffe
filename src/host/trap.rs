//! Classification of vcpu exits from the CSRs the monitor reports.

use crate::{
    regs::{HypervisorCsr, SupervisorCsr, VcpuSharedArea},
    tsm::vcpu::{
        EXC_INST_GUEST_PAGE_FAULT, EXC_LOAD_GUEST_PAGE_FAULT, EXC_STORE_GUEST_PAGE_FAULT,
        EXC_VIRTUAL_INSTRUCTION, EXC_VIRTUAL_SUPERVISOR_ECALL, SCAUSE_INTERRUPT,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    InstructionGuestPageFault,
    LoadGuestPageFault,
    StoreGuestPageFault,
    VirtualSupervisorEcall,
    VirtualInstruction,
    Other(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Interrupt(u64),
    Exception(Exception),
}

impl Trap {
    pub fn from_scause(scause: u64) -> Self {
        if scause & SCAUSE_INTERRUPT != 0 {
            return Trap::Interrupt(scause & !SCAUSE_INTERRUPT);
        }
        let exception = match scause {
            EXC_INST_GUEST_PAGE_FAULT => Exception::InstructionGuestPageFault,
            EXC_LOAD_GUEST_PAGE_FAULT => Exception::LoadGuestPageFault,
            EXC_STORE_GUEST_PAGE_FAULT => Exception::StoreGuestPageFault,
            EXC_VIRTUAL_SUPERVISOR_ECALL => Exception::VirtualSupervisorEcall,
            EXC_VIRTUAL_INSTRUCTION => Exception::VirtualInstruction,
            other => Exception::Other(other),
        };
        Trap::Exception(exception)
    }

    pub fn read(area: &VcpuSharedArea) -> Self {
        Self::from_scause(area.csr(SupervisorCsr::Scause))
    }
}

/// Guest physical address of a guest page fault: `htval` holds it shifted right by two.
pub fn fault_address(area: &VcpuSharedArea) -> u64 {
    (area.hcsr(HypervisorCsr::Htval) << 2) | (area.csr(SupervisorCsr::Stval) & 0x3)
}
