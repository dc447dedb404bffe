#![allow(dead_code)]

use std::collections::BTreeMap;

use covemm::{
    config::TsmConfig,
    error::HostError,
    host::{HostPages, Monitor},
    insn::AccessWidth,
    mem::SparseMemory,
    regs::Gpr,
    tsm::{
        state::TvmCreateParams,
        vcpu::{GuestCpu, GuestEvent, GuestExecutor},
        Tsm, TvmId,
    },
    TsmPageType,
};

pub const PAGE: u64 = 4096;
/// Host RAM the tests allocate from; it lies inside the convertible window.
pub const HOST_START: u64 = 0x9000_0000;
pub const HOST_END: u64 = 0xc000_0000;

/// One instruction slot of a [`ScriptedGuest`]: registers written before the event,
/// then the event itself.
#[derive(Clone, Debug)]
pub struct Step {
    pub regs: Vec<(Gpr, u64)>,
    pub event: GuestEvent,
}

impl Step {
    pub fn event(event: GuestEvent) -> Self {
        Self {
            regs: Vec::new(),
            event,
        }
    }

    pub fn ecall(regs: &[(Gpr, u64)]) -> Self {
        Self {
            regs: regs.to_vec(),
            event: GuestEvent::Ecall,
        }
    }

    pub fn access(gpa: u64, insn: u32, regs: &[(Gpr, u64)]) -> Self {
        Self {
            regs: regs.to_vec(),
            event: GuestEvent::Access { gpa, insn },
        }
    }

    pub fn wfi() -> Self {
        Self::event(GuestEvent::VirtualInstruction {
            insn: covemm::insn::INSN_WFI,
        })
    }
}

/// Guest whose program is a list of steps, one per 4-byte slot from `entry`. Each
/// vcpu of each TVM can get its own program; vcpus without one halt.
#[derive(Default)]
pub struct ScriptedGuest {
    programs: BTreeMap<(TvmId, usize), (u64, Vec<Step>)>,
    /// Every (tvm, vcpu, pc) the monitor asked about, in order.
    pub trace: Vec<(TvmId, usize, u64)>,
}

impl ScriptedGuest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, tvm: TvmId, vcpu: usize, entry: u64, steps: Vec<Step>) {
        self.programs.insert((tvm, vcpu), (entry, steps));
    }
}

impl GuestExecutor for ScriptedGuest {
    fn next_event(&mut self, tvm: u64, vcpu: usize, cpu: &mut GuestCpu) -> GuestEvent {
        self.trace.push((tvm, vcpu, cpu.pc));
        let Some((entry, steps)) = self.programs.get(&(tvm, vcpu)) else {
            return GuestEvent::Halt;
        };
        let Some(step) = cpu
            .pc
            .checked_sub(*entry)
            .and_then(|off| steps.get((off / 4) as usize))
        else {
            return GuestEvent::Halt;
        };
        for &(reg, value) in step.regs.iter() {
            cpu.set_gpr(reg, value);
        }
        step.event
    }
}

/// MMIO bus recording every access. Reads return `read_value`.
#[derive(Default)]
pub struct RecordingBus {
    pub writes: Vec<(u64, AccessWidth, u64)>,
    pub reads: Vec<(u64, AccessWidth)>,
    pub read_value: u64,
}

impl covemm::host::MmioBus for RecordingBus {
    fn read(&mut self, addr: u64, width: AccessWidth) -> Result<u64, HostError> {
        self.reads.push((addr, width));
        Ok(self.read_value)
    }

    fn write(&mut self, addr: u64, width: AccessWidth, value: u64) -> Result<(), HostError> {
        self.writes.push((addr, width, value));
        Ok(())
    }
}

pub type TestTsm = Tsm<SparseMemory, ScriptedGuest>;

pub fn config(harts: usize) -> TsmConfig {
    TsmConfig {
        hart_count: harts,
        ..TsmConfig::default()
    }
}

pub fn tsm(harts: usize) -> spin::Mutex<TestTsm> {
    let _ = covemm::log::init_with_sink(|_| {}, log::LevelFilter::Debug);
    spin::Mutex::new(
        Tsm::new(config(harts), SparseMemory::new(), ScriptedGuest::new())
            .expect("valid monitor configuration"),
    )
}

/// A TVM built by hand through the monitor interface.
pub struct ManualTvm {
    pub id: TvmId,
    /// Host staging copy of the measured contents.
    pub measured: u64,
    /// Confidential pages the measured contents were copied to.
    pub measured_dst: u64,
}

/// Converts `count` fresh host pages and completes the fence from the calling hart.
pub fn confidential<Mo: Monitor, P: HostPages>(
    monitor: &mut Mo,
    pages: &mut P,
    count: u64,
    align: u64,
) -> u64 {
    let base = pages.alloc_pages(count, align).expect("host pages");
    monitor.convert_pages(base, count).expect("convert");
    monitor.global_fence().expect("global fence");
    monitor.local_fence().expect("local fence");
    base
}

/// Shape of a TVM built by hand through the monitor interface.
pub struct TvmShape {
    pub gpa: u64,
    pub region_len: u64,
    pub measured: u64,
    pub entry: u64,
    pub vcpus: usize,
    pub pt_pages: u64,
    /// Emulated MMIO the host declares before finalize.
    pub mmio: Option<(u64, u64)>,
}

impl TvmShape {
    /// One vcpu, eight page table pages.
    pub fn new(gpa: u64, region_len: u64, measured: u64, entry: u64) -> Self {
        Self {
            gpa,
            region_len,
            measured,
            entry,
            vcpus: 1,
            pt_pages: 8,
            mmio: None,
        }
    }

    /// Creates the TVM with a confidential region `[gpa, gpa + region_len)` and
    /// `measured` measured pages at `gpa`, then finalizes it with `entry`. Page `i`
    /// is filled with the byte `i + 1`.
    pub fn build<Mo: Monitor, P: HostPages>(&self, monitor: &mut Mo, pages: &mut P) -> ManualTvm {
        let info = monitor.tsm_info().expect("tsm info");
        let pd = confidential(monitor, pages, 4 + info.tvm_state_pages, 0x4000);
        let id = monitor
            .create_tvm(&TvmCreateParams {
                tvm_page_directory_addr: pd,
                tvm_state_addr: pd + 0x4000,
            })
            .expect("create tvm");

        for index in 0..self.vcpus {
            let state = confidential(monitor, pages, info.tvm_vcpu_state_pages, PAGE);
            monitor.create_vcpu(id, index, state).expect("create vcpu");
        }

        if self.pt_pages > 0 {
            let pt = confidential(monitor, pages, self.pt_pages, PAGE);
            monitor
                .add_page_table_pages(id, pt, self.pt_pages)
                .expect("pt pages");
        }
        monitor
            .add_memory_region(id, self.gpa, self.region_len)
            .expect("memory region");
        if let Some((base, len)) = self.mmio {
            monitor.add_mmio_region(id, base, len).expect("mmio region");
        }

        let src = pages.alloc_pages(self.measured, PAGE).expect("staging pages");
        for i in 0..self.measured {
            pages.write(src + i * PAGE, &[i as u8 + 1; PAGE as usize]);
        }
        let dst = confidential(monitor, pages, self.measured, PAGE);
        monitor
            .add_measured_pages(id, src, dst, TsmPageType::Page4k, self.measured, self.gpa)
            .expect("measured pages");
        monitor.finalize_tvm(id, self.entry, 0).expect("finalize");
        ManualTvm {
            id,
            measured: src,
            measured_dst: dst,
        }
    }
}

/// Single-vcpu shorthand for [`TvmShape::build`].
pub fn manual_tvm<Mo: Monitor, P: HostPages>(
    monitor: &mut Mo,
    pages: &mut P,
    gpa: u64,
    region_len: u64,
    measured: u64,
    entry: u64,
) -> ManualTvm {
    TvmShape::new(gpa, region_len, measured, entry).build(monitor, pages)
}
