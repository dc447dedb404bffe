//! Decoding of trapped load/store instructions, as reported in `htinst`.
//!
//! Only plain integer loads and stores are emulated. A transformed compressed
//! instruction (bits [1:0] == 0b01) decodes like its 32-bit expansion but is two
//! bytes long.

use core::fmt::Display;

use crate::regs::Gpr;

const OPCODE_LOAD: u32 = 0b00000;
const OPCODE_STORE: u32 = 0b01000;

pub const INSN_WFI: u32 = 0x1050_0073;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Load,
    Store,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    Byte = 1,
    Half = 2,
    Word = 4,
    Double = 8,
}

impl AccessWidth {
    pub const fn bytes(self) -> usize {
        self as usize
    }

    pub const fn mask(self) -> u64 {
        match self {
            Self::Double => u64::MAX,
            _ => (1u64 << (self.bytes() * 8)) - 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// No transformed instruction was provided.
    Missing,
    /// Bits [1:0] do not describe a 16 or 32-bit instruction.
    BadLength(u32),
    UnsupportedOpcode(u32),
    UnsupportedWidth(u32),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Missing => write!(f, "no instruction"),
            Self::BadLength(bits) => write!(f, "bad length encoding {:#b}", bits),
            Self::UnsupportedOpcode(op) => write!(f, "unsupported opcode {:#07b}", op),
            Self::UnsupportedWidth(funct3) => write!(f, "unsupported funct3 {:#05b}", funct3),
        }
    }
}

impl core::error::Error for DecodeError {}

impl From<DecodeError> for crate::SbiError {
    fn from(_: DecodeError) -> Self {
        crate::SbiError::InvalidParam
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioAccess {
    pub direction: Direction,
    pub width: AccessWidth,
    /// `rd` for loads, `rs2` for stores.
    pub reg: Gpr,
    /// Loads only: sign-extend the value read into `reg`.
    pub signed: bool,
    /// Length of the trapped instruction in bytes.
    pub len: u64,
}

impl MmioAccess {
    /// Widens a raw value read from a device into the register value the guest expects.
    pub fn extend(&self, raw: u64) -> u64 {
        let value = raw & self.width.mask();
        if !self.signed || self.width == AccessWidth::Double {
            return value;
        }
        let shift = 64 - self.width.bytes() as u32 * 8;
        (((value << shift) as i64) >> shift) as u64
    }
}

pub fn decode_mmio(insn: u64) -> Result<MmioAccess, DecodeError> {
    let insn = insn as u32;
    if insn == 0 {
        return Err(DecodeError::Missing);
    }

    let len = match insn & 0b11 {
        0b11 => 4,
        0b01 => 2,
        other => return Err(DecodeError::BadLength(other)),
    };

    let opcode = (insn >> 2) & 0x1f;
    let funct3 = (insn >> 12) & 0b111;

    let direction = match opcode {
        OPCODE_LOAD => Direction::Load,
        OPCODE_STORE => Direction::Store,
        op => return Err(DecodeError::UnsupportedOpcode(op)),
    };

    let (width, signed) = match (direction, funct3) {
        (_, 0b000) => (AccessWidth::Byte, true),
        (_, 0b001) => (AccessWidth::Half, true),
        (_, 0b010) => (AccessWidth::Word, true),
        (_, 0b011) => (AccessWidth::Double, true),
        (Direction::Load, 0b100) => (AccessWidth::Byte, false),
        (Direction::Load, 0b101) => (AccessWidth::Half, false),
        (Direction::Load, 0b110) => (AccessWidth::Word, false),
        (_, f) => return Err(DecodeError::UnsupportedWidth(f)),
    };

    let reg = match direction {
        Direction::Load => Gpr::from_field(insn >> 7),
        Direction::Store => Gpr::from_field(insn >> 20),
    };

    Ok(MmioAccess {
        direction,
        width,
        reg,
        signed: direction == Direction::Load && signed,
        len,
    })
}

/// Encoders for the instruction fixtures used by tests and guest simulators.
pub mod encode {
    pub fn load(funct3: u32, rd: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | 0b000_0011
    }

    pub fn store(funct3: u32, rs2: u32, rs1: u32, imm: i32) -> u32 {
        let imm = imm as u32 & 0xfff;
        ((imm >> 5) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | ((imm & 0x1f) << 7)
            | 0b010_0011
    }

    pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
        store(0b010, rs2, rs1, imm)
    }

    pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
        load(0b010, rd, rs1, imm)
    }

    /// Clears bit 1, the marker of a transformed compressed instruction.
    pub fn as_transformed_compressed(insn: u32) -> u32 {
        insn & !0b10
    }
}
