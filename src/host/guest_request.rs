//! Requests a TVM sends to the host through the COVG extension.
//!
//! The request is read from the guest registers the monitor exposed on the ecall
//! exit (`a6` function id, `a0`/`a1` base and length) and the reply goes back in
//! `a0`/`a1`.

use common::sbi::{
    SBI_COVG_ADD_MMIO_REGION, SBI_COVG_REMOVE_MMIO_REGION, SBI_COVG_SHARE_MEMORY_REGION,
    SBI_COVG_UNSHARE_MEMORY_REGION,
};

use crate::{
    config::GuestRequestPolicy, error::HostError, regs::Gpr, regs::VcpuSharedArea, SbiError,
};

use super::{pages::HostPages, regions::HostRegions};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestRequest {
    AddMmioRegion { base: u64, len: u64 },
    RemoveMmioRegion { base: u64, len: u64 },
    ShareMemoryRegion { base: u64, len: u64 },
    UnshareMemoryRegion { base: u64, len: u64 },
    Unknown(u64),
}

impl GuestRequest {
    pub fn read(area: &VcpuSharedArea) -> Self {
        let base = area.gpr(Gpr::A0);
        let len = area.gpr(Gpr::A1);
        match area.gpr(Gpr::A6) as usize {
            SBI_COVG_ADD_MMIO_REGION => Self::AddMmioRegion { base, len },
            SBI_COVG_REMOVE_MMIO_REGION => Self::RemoveMmioRegion { base, len },
            SBI_COVG_SHARE_MEMORY_REGION => Self::ShareMemoryRegion { base, len },
            SBI_COVG_UNSHARE_MEMORY_REGION => Self::UnshareMemoryRegion { base, len },
            fid => Self::Unknown(fid as u64),
        }
    }
}

fn reply(area: &mut VcpuSharedArea, ret: Result<u64, SbiError>) {
    let (a0, a1) = match ret {
        Ok(value) => (0, value),
        Err(err) => (err.code() as u64, 0),
    };
    area.set_gpr(Gpr::A0, a0);
    area.set_gpr(Gpr::A1, a1);
}

/// Services the request found in `area` and writes the reply.
///
/// A share is answered with the length the host kept in `a1`. Returns true when the
/// boundary moves, in which case the monitor may ask for a TVM fence on the next run.
pub fn service(
    regions: &mut HostRegions,
    policy: &GuestRequestPolicy,
    area: &mut VcpuSharedArea,
) -> Result<bool, HostError> {
    let request = GuestRequest::read(area);
    log::debug!("guest request {:x?}", request);

    match request {
        GuestRequest::AddMmioRegion { base, len } => {
            let ret = regions.add_mmio(base, len).map(|_| 0);
            if let Err(err) = ret {
                log::warn!("rejecting mmio region [{:#x}, +{:#x}): {}", base, len, err);
            }
            reply(area, ret);
            Ok(false)
        }
        GuestRequest::RemoveMmioRegion { base, len } => {
            reply(area, regions.remove_mmio(base, len).map(|_| 0));
            Ok(false)
        }
        GuestRequest::ShareMemoryRegion { base, len } => {
            let ret = regions.declare_shared(base, len, policy.max_shared_size);
            match ret {
                Ok(kept) if kept < len => log::warn!(
                    "shared buffer at {:#x} capped from {:#x} to {:#x} bytes",
                    base,
                    len,
                    kept
                ),
                Ok(_) => log::info!("guest shares [{:#x}, +{:#x})", base, len),
                Err(err) => log::warn!("rejecting shared buffer at {:#x}: {}", base, err),
            }
            let changed = ret.is_ok();
            reply(area, ret);
            Ok(changed)
        }
        GuestRequest::UnshareMemoryRegion { .. } => {
            Err(HostError::GuestProtocol("guest asked to unshare memory"))
        }
        GuestRequest::Unknown(fid) => {
            log::warn!("unhandled guest request {}", fid);
            reply(area, Err(SbiError::NotSupported));
            Ok(false)
        }
    }
}

pub fn release_shared_memory<P: HostPages>(regions: &mut HostRegions, pages: &mut P) {
    if let Some(shared) = regions.release_shared() {
        if let Some(host_base) = shared.host_base {
            pages.free_pages(host_base, shared.pages());
        }
        log::debug!("released shared buffer at {:#x}", shared.range.base);
    }
}
