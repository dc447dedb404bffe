//! Register exchange area shared between the monitor and the host for one hart.
//!
//! The area is a plain byte buffer. Every register set lives at a fixed offset and is
//! only reachable through its typed register names, so an out-of-bounds offset is a
//! compile error rather than a stray write.

pub const SHARED_AREA_SIZE: usize = 1024;

#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterSetId {
    Gprs = 0,
    SupervisorCsrs = 1,
    HypervisorCsrs = 2,
}

pub trait RegisterSet {
    const ID: RegisterSetId;
    const OFFSET: usize;
    const COUNT: usize;
    type Reg: Copy + Into<usize>;
}

/// General purpose register `x0..x31`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gpr(u8);

impl Gpr {
    pub const ZERO: Gpr = Gpr(0);
    pub const SP: Gpr = Gpr(2);
    pub const A0: Gpr = Gpr(10);
    pub const A1: Gpr = Gpr(11);
    pub const A2: Gpr = Gpr(12);
    pub const A3: Gpr = Gpr(13);
    pub const A4: Gpr = Gpr(14);
    pub const A5: Gpr = Gpr(15);
    pub const A6: Gpr = Gpr(16);
    pub const A7: Gpr = Gpr(17);

    /// Builds a register from a 5-bit instruction field; upper bits are ignored.
    pub const fn from_field(field: u32) -> Self {
        Self((field & 0x1f) as u8)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<Gpr> for usize {
    fn from(reg: Gpr) -> usize {
        reg.index()
    }
}

#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorCsr {
    Sepc = 0,
    Scause = 1,
    Stval = 2,
}

impl From<SupervisorCsr> for usize {
    fn from(reg: SupervisorCsr) -> usize {
        reg as usize
    }
}

#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypervisorCsr {
    Htval = 0,
    Htinst = 1,
}

impl From<HypervisorCsr> for usize {
    fn from(reg: HypervisorCsr) -> usize {
        reg as usize
    }
}

pub struct Gprs;
pub struct SupervisorCsrs;
pub struct HypervisorCsrs;

impl RegisterSet for Gprs {
    const ID: RegisterSetId = RegisterSetId::Gprs;
    const OFFSET: usize = 0;
    const COUNT: usize = 32;
    type Reg = Gpr;
}

impl RegisterSet for SupervisorCsrs {
    const ID: RegisterSetId = RegisterSetId::SupervisorCsrs;
    const OFFSET: usize = 0x100;
    const COUNT: usize = 3;
    type Reg = SupervisorCsr;
}

impl RegisterSet for HypervisorCsrs {
    const ID: RegisterSetId = RegisterSetId::HypervisorCsrs;
    const OFFSET: usize = 0x140;
    const COUNT: usize = 2;
    type Reg = HypervisorCsr;
}

const fn set_end<S: RegisterSet>() -> usize {
    S::OFFSET + S::COUNT * 8
}

const _: () = assert!(set_end::<Gprs>() <= SupervisorCsrs::OFFSET);
const _: () = assert!(set_end::<SupervisorCsrs>() <= HypervisorCsrs::OFFSET);
const _: () = assert!(set_end::<HypervisorCsrs>() <= SHARED_AREA_SIZE);
const _: () = assert!(Gprs::OFFSET % 8 == 0 && SupervisorCsrs::OFFSET % 8 == 0);
const _: () = assert!(HypervisorCsrs::OFFSET % 8 == 0);

/// Location of a register set inside the area, as reported to a peer.
pub fn register_set_location(id: RegisterSetId) -> (usize, usize) {
    match id {
        RegisterSetId::Gprs => (Gprs::OFFSET, Gprs::COUNT),
        RegisterSetId::SupervisorCsrs => (SupervisorCsrs::OFFSET, SupervisorCsrs::COUNT),
        RegisterSetId::HypervisorCsrs => (HypervisorCsrs::OFFSET, HypervisorCsrs::COUNT),
    }
}

#[repr(C, align(4096))]
#[derive(Clone)]
pub struct VcpuSharedArea {
    bytes: [u8; SHARED_AREA_SIZE],
}

impl Default for VcpuSharedArea {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpuSharedArea {
    pub const fn new() -> Self {
        Self {
            bytes: [0; SHARED_AREA_SIZE],
        }
    }

    pub fn read<S: RegisterSet>(&self, reg: S::Reg) -> u64 {
        let off = Self::offset::<S>(reg);
        let mut raw = [0; 8];
        raw.copy_from_slice(&self.bytes[off..off + 8]);
        u64::from_le_bytes(raw)
    }

    pub fn write<S: RegisterSet>(&mut self, reg: S::Reg, value: u64) {
        let off = Self::offset::<S>(reg);
        self.bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.read::<Gprs>(reg)
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        // x0 is hardwired to zero
        if reg != Gpr::ZERO {
            self.write::<Gprs>(reg, value);
        }
    }

    pub fn csr(&self, reg: SupervisorCsr) -> u64 {
        self.read::<SupervisorCsrs>(reg)
    }

    pub fn set_csr(&mut self, reg: SupervisorCsr, value: u64) {
        self.write::<SupervisorCsrs>(reg, value);
    }

    pub fn hcsr(&self, reg: HypervisorCsr) -> u64 {
        self.read::<HypervisorCsrs>(reg)
    }

    pub fn set_hcsr(&mut self, reg: HypervisorCsr, value: u64) {
        self.write::<HypervisorCsrs>(reg, value);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn offset<S: RegisterSet>(reg: S::Reg) -> usize {
        let index: usize = reg.into();
        // Gpr::from_field masks to 5 bits and the CSR enums are closed, so this holds.
        assert!(index < S::COUNT, "register index out of its set");
        S::OFFSET + index * 8
    }
}
