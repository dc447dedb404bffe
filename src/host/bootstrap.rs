//! Builds the Standalone MM TVM and tears it down again.
//!
//! Guest memory layout, offsets from `ram_base`:
//!
//! ```text
//! | boot info | stack | heap | ... | shared buffer | image | zero pages up to ram end |
//! ```
//!
//! The boot info and the image are measured. Stack, heap and everything after the
//! image are zero pages. The shared buffer stays unpopulated until the guest shares
//! it; any other gap is populated on demand from the confidential reserve.

use alloc::{format, vec::Vec};

use anyhow::{bail, ensure, Context};

use crate::{
    config::{MmLayout, PAGE_DIRECTORY_PAGES, PAGE_DIRECTORY_SIZE},
    guest::boot_info::{BootInfo, CpuInfo, CPU_INFO_FLAG_PRIMARY},
    tsm::{state::TsmInfo, state::TvmCreateParams, TvmId},
    TsmPageType, TsmState, PAGE_SIZE,
};

use super::{monitor::Monitor, pages::HostPages, regions::HostRegions};

const PAGE: u64 = PAGE_SIZE as u64;
const ENTRIES_PER_TABLE: u64 = 512;

/// Index of the only vcpu of the MM partition.
pub const MM_VCPU: usize = 0;
/// Converted pages kept aside for populating confidential memory on demand.
pub const RESERVE_PAGES: u64 = 16;
/// Memory regions the MM core is told about.
const MM_MEM_REGIONS: u32 = 6;
const PCPU_STACK_SIZE: u64 = 0x1000;

/// Worst-case number of Sv48 page table pages needed to map `size` bytes.
pub fn max_pte_pages(size: u64) -> u64 {
    let l1 = (size / PAGE) / ENTRIES_PER_TABLE + 1;
    let l2 = l1 / ENTRIES_PER_TABLE + 1;
    let l3 = l2 / ENTRIES_PER_TABLE + 1;
    l1 + l2 + l3 + 1
}

pub fn boot_info(layout: &MmLayout, image_size: u64) -> BootInfo {
    let mut info = BootInfo {
        mem_base: layout.ram_base,
        mem_limit: layout.ram_end() - 1,
        image_base: layout.image_base(),
        stack_base: layout.stack_base() + layout.stack_size,
        heap_base: layout.heap_base(),
        ns_comm_buf_base: layout.shared_buf_base(),
        image_size,
        pcpu_stack_size: PCPU_STACK_SIZE,
        heap_size: layout.heap_size,
        ns_comm_buf_size: layout.shared_buf_size,
        num_mem_regions: MM_MEM_REGIONS,
        mpxy_channel_id: layout.mpxy_channel_id,
        ..BootInfo::default()
    };
    // a fresh vec always has room for one cpu
    let _ = info.cpus.push(CpuInfo {
        processor_id: 0,
        package: 0,
        core: 0,
        flags: CPU_INFO_FLAG_PRIMARY,
    });
    info
}

/// A launched MM partition and the host memory it holds.
pub struct MmTvm {
    pub id: TvmId,
    pub vcpu: usize,
    pub layout: MmLayout,
    pub tsm_info: TsmInfo,
    /// Every range converted for this TVM, reclaimed on teardown.
    converted: Vec<(u64, u64)>,
    reserve: Vec<u64>,
}

impl MmTvm {
    /// Host mirror of the regions declared at launch.
    pub fn host_regions(&self, limit: u64) -> HostRegions {
        let mut regions = HostRegions::new(limit);
        // the layout was validated at launch
        let _ = regions.add_confidential(self.layout.ram_base, self.layout.ram_size);
        regions
    }

    pub fn take_reserve(&mut self) -> Vec<u64> {
        core::mem::take(&mut self.reserve)
    }

    pub fn converted(&self) -> &[(u64, u64)] {
        &self.converted
    }
}

struct Launcher<'a, Mo: Monitor, P: HostPages> {
    monitor: &'a mut Mo,
    pages: &'a mut P,
    converted: Vec<(u64, u64)>,
}

impl<Mo: Monitor, P: HostPages> Launcher<'_, Mo, P> {
    /// Allocates `count` host pages, converts them and waits for the fence.
    fn confidential(&mut self, count: u64, align: u64) -> anyhow::Result<u64> {
        let Some(base) = self.pages.alloc_pages(count, align) else {
            bail!("out of host memory for {} confidential pages", count);
        };
        self.monitor
            .convert_pages(base, count)
            .with_context(|| format!("converting {} pages at {:#x}", count, base))?;
        self.converted.push((base, count));
        self.monitor.global_fence().context("global fence")?;
        self.monitor.local_fence().context("local fence")?;
        Ok(base)
    }

    /// Copies `data` into host pages, measures them into the TVM at `gpa` and frees
    /// the staging copy.
    fn measure(&mut self, id: TvmId, data: &[u8], pages: u64, gpa: u64) -> anyhow::Result<()> {
        let Some(src) = self.pages.alloc_pages(pages, PAGE) else {
            bail!("out of host memory for {} staging pages", pages);
        };
        let zero = [0u8; PAGE_SIZE];
        for i in 0..pages {
            self.pages.write(src + i * PAGE, &zero);
        }
        self.pages.write(src, data);

        let ret = self.confidential(pages, PAGE).and_then(|dst| {
            self.monitor
                .add_measured_pages(id, src, dst, TsmPageType::Page4k, pages, gpa)
                .with_context(|| format!("measuring {} pages at gpa {:#x}", pages, gpa))
        });
        self.pages.free_pages(src, pages);
        ret
    }
}

/// Creates, measures and finalizes the MM partition described by `layout` with
/// `image` loaded at `layout.image_base()`.
pub fn launch<Mo: Monitor, P: HostPages>(
    monitor: &mut Mo,
    pages: &mut P,
    layout: &MmLayout,
    image: &[u8],
) -> anyhow::Result<MmTvm> {
    layout.validate().context("invalid MM layout")?;
    ensure!(!image.is_empty(), "empty MM image");
    let image_pages = (image.len() as u64).div_ceil(PAGE);
    let image_end = layout.image_base() + image_pages * PAGE;
    ensure!(
        image_end <= layout.ram_end(),
        "MM image of {:#x} bytes does not fit in RAM",
        image.len()
    );

    let info = monitor.tsm_info().context("querying TSM info")?;
    ensure!(
        info.tsm_state == TsmState::Ready,
        "TSM is not ready ({:?})",
        info.tsm_state
    );
    log::info!(
        "TSM impl {:#x} version {:#x}: {} state pages, {} vcpu state pages",
        info.tsm_impl_id,
        info.tsm_version,
        info.tvm_state_pages,
        info.tvm_vcpu_state_pages
    );

    let mut l = Launcher {
        monitor,
        pages,
        converted: Vec::new(),
    };

    let pd = l.confidential(
        PAGE_DIRECTORY_PAGES as u64 + info.tvm_state_pages,
        PAGE_DIRECTORY_SIZE as u64,
    )?;
    let params = TvmCreateParams {
        tvm_page_directory_addr: pd,
        tvm_state_addr: pd + PAGE_DIRECTORY_SIZE as u64,
    };
    let id = l.monitor.create_tvm(&params).context("creating the TVM")?;
    log::info!("MM TVM {} created", id);

    let vcpu_state = l.confidential(info.tvm_vcpu_state_pages, PAGE)?;
    l.monitor
        .create_vcpu(id, MM_VCPU, vcpu_state)
        .context("creating the MM vcpu")?;

    let pt_pages = max_pte_pages(layout.ram_size);
    let pt = l.confidential(pt_pages, PAGE)?;
    l.monitor
        .add_page_table_pages(id, pt, pt_pages)
        .context("donating page table pages")?;

    l.monitor
        .add_memory_region(id, layout.ram_base, layout.ram_size)
        .context("adding the MM RAM region")?;

    let boot = boot_info(layout, image_pages * PAGE).to_bytes();
    l.measure(id, &boot, layout.boot_info_size / PAGE, layout.boot_info_base())
        .context("adding the boot info")?;

    let stack = l.confidential(layout.stack_size / PAGE, PAGE)?;
    let heap = l.confidential(layout.heap_size / PAGE, PAGE)?;

    l.measure(id, image, image_pages, layout.image_base())
        .context("adding the MM image")?;

    let tail_pages = (layout.ram_end() - image_end) / PAGE;
    let tail = if tail_pages > 0 {
        Some(l.confidential(tail_pages, PAGE)?)
    } else {
        None
    };
    let reserve_base = l.confidential(RESERVE_PAGES, PAGE)?;

    l.monitor
        .finalize_tvm(id, layout.image_base(), layout.boot_info_base())
        .context("finalizing the TVM")?;

    if let Some(tail) = tail {
        l.monitor
            .add_zero_pages(id, tail, TsmPageType::Page4k, tail_pages, image_end)
            .context("adding zero pages after the image")?;
    }
    l.monitor
        .add_zero_pages(
            id,
            stack,
            TsmPageType::Page4k,
            layout.stack_size / PAGE,
            layout.stack_base(),
        )
        .context("adding the stack")?;
    l.monitor
        .add_zero_pages(
            id,
            heap,
            TsmPageType::Page4k,
            layout.heap_size / PAGE,
            layout.heap_base(),
        )
        .context("adding the heap")?;

    log::info!(
        "MM TVM {} finalized: entry {:#x}, boot info {:#x}",
        id,
        layout.image_base(),
        layout.boot_info_base()
    );
    Ok(MmTvm {
        id,
        vcpu: MM_VCPU,
        layout: layout.clone(),
        tsm_info: info,
        converted: l.converted,
        reserve: (0..RESERVE_PAGES).map(|i| reserve_base + i * PAGE).collect(),
    })
}

/// Destroys the TVM, reclaims every page converted for it and returns them to
/// the host allocator.
pub fn teardown<Mo: Monitor, P: HostPages>(
    monitor: &mut Mo,
    pages: &mut P,
    tvm: MmTvm,
) -> anyhow::Result<()> {
    monitor
        .destroy_tvm(tvm.id)
        .with_context(|| format!("destroying TVM {}", tvm.id))?;
    for &(base, count) in tvm.converted.iter() {
        monitor
            .reclaim_pages(base, count)
            .with_context(|| format!("reclaiming {} pages at {:#x}", count, base))?;
        pages.free_pages(base, count);
    }
    log::info!("MM TVM {} torn down", tvm.id);
    Ok(())
}
