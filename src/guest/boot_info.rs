//! Boot information record the host measures into the MM partition at
//! `ram_base + boot_info_offset`. The boot vcpu receives its address in `a1`.

use alloc::vec::Vec;
use core::fmt::Display;

use crate::config::MAX_VCPU_PER_TVM;

pub const BOOT_INFO_VERSION: u8 = 1;
pub const BOOT_INFO_ATTR_APTEE: u32 = 1;
pub const CPU_INFO_FLAG_PRIMARY: u32 = 1;

const HEADER_SIZE: usize = 8;
/// Header, twelve u64 fields and three u32 fields.
const FIXED_SIZE: usize = HEADER_SIZE + 12 * 8 + 3 * 4;
const CPU_INFO_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootInfoError {
    Truncated,
    Version(u8),
    NoCpus,
    TooManyCpus(u32),
}

impl Display for BootInfoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "boot info record is truncated"),
            Self::Version(v) => write!(
                f,
                "boot info version {} (expected {})",
                v, BOOT_INFO_VERSION
            ),
            Self::NoCpus => write!(f, "boot info describes no cpu"),
            Self::TooManyCpus(n) => write!(f, "boot info describes {} cpus", n),
        }
    }
}

impl core::error::Error for BootInfoError {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuInfo {
    pub processor_id: u32,
    pub package: u32,
    pub core: u32,
    pub flags: u32,
}

impl CpuInfo {
    pub fn is_primary(&self) -> bool {
        self.flags & CPU_INFO_FLAG_PRIMARY != 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootInfo {
    pub mem_base: u64,
    /// Last valid byte of MM memory.
    pub mem_limit: u64,
    pub image_base: u64,
    /// Top of the boot stack.
    pub stack_base: u64,
    pub heap_base: u64,
    pub ns_comm_buf_base: u64,
    pub shared_buf_base: u64,
    pub image_size: u64,
    pub pcpu_stack_size: u64,
    pub heap_size: u64,
    pub ns_comm_buf_size: u64,
    pub shared_buf_size: u64,
    pub num_mem_regions: u32,
    pub mpxy_channel_id: u32,
    pub cpus: heapless::Vec<CpuInfo, MAX_VCPU_PER_TVM>,
}

struct Reader<'a> {
    raw: &'a [u8],
    off: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> u32 {
        let mut buf = [0; 4];
        buf.copy_from_slice(&self.raw[self.off..self.off + 4]);
        self.off += 4;
        u32::from_le_bytes(buf)
    }

    fn u64(&mut self) -> u64 {
        let mut buf = [0; 8];
        buf.copy_from_slice(&self.raw[self.off..self.off + 8]);
        self.off += 8;
        u64::from_le_bytes(buf)
    }
}

impl BootInfo {
    pub fn size(&self) -> usize {
        FIXED_SIZE + self.cpus.len() * CPU_INFO_SIZE
    }

    pub fn primary_cpu(&self) -> Option<&CpuInfo> {
        self.cpus.iter().find(|c| c.is_primary())
    }

    pub fn parse(raw: &[u8]) -> Result<Self, BootInfoError> {
        crate::ensure!(raw.len() >= FIXED_SIZE, BootInfoError::Truncated)?;
        let version = raw[1];
        crate::ensure!(
            version == BOOT_INFO_VERSION,
            BootInfoError::Version(version)
        )?;

        let mut r = Reader {
            raw,
            off: HEADER_SIZE,
        };
        let mut info = BootInfo {
            mem_base: r.u64(),
            mem_limit: r.u64(),
            image_base: r.u64(),
            stack_base: r.u64(),
            heap_base: r.u64(),
            ns_comm_buf_base: r.u64(),
            shared_buf_base: r.u64(),
            image_size: r.u64(),
            pcpu_stack_size: r.u64(),
            heap_size: r.u64(),
            ns_comm_buf_size: r.u64(),
            shared_buf_size: r.u64(),
            ..BootInfo::default()
        };
        info.num_mem_regions = r.u32();
        let num_cpus = r.u32();
        info.mpxy_channel_id = r.u32();

        crate::ensure!(num_cpus > 0, BootInfoError::NoCpus)?;
        crate::ensure!(
            num_cpus as usize <= MAX_VCPU_PER_TVM,
            BootInfoError::TooManyCpus(num_cpus)
        )?;
        crate::ensure!(
            raw.len() >= FIXED_SIZE + num_cpus as usize * CPU_INFO_SIZE,
            BootInfoError::Truncated
        )?;
        for _ in 0..num_cpus {
            let cpu = CpuInfo {
                processor_id: r.u32(),
                package: r.u32(),
                core: r.u32(),
                flags: r.u32(),
            };
            // bounded by the check above
            let _ = info.cpus.push(cpu);
        }
        Ok(info)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.push(0);
        out.push(BOOT_INFO_VERSION);
        out.extend_from_slice(&(self.size() as u16).to_le_bytes());
        out.extend_from_slice(&BOOT_INFO_ATTR_APTEE.to_le_bytes());
        for value in [
            self.mem_base,
            self.mem_limit,
            self.image_base,
            self.stack_base,
            self.heap_base,
            self.ns_comm_buf_base,
            self.shared_buf_base,
            self.image_size,
            self.pcpu_stack_size,
            self.heap_size,
            self.ns_comm_buf_size,
            self.shared_buf_size,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for value in [
            self.num_mem_regions,
            self.cpus.len() as u32,
            self.mpxy_channel_id,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for cpu in self.cpus.iter() {
            for value in [cpu.processor_id, cpu.package, cpu.core, cpu.flags] {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }
}
