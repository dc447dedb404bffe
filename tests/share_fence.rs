mod common;

use common::*;
use covemm::{
    config::{GuestRequestPolicy, GUEST_PHYS_LIMIT},
    host::{HostPages, HostRegions, Monitor, PageWindow, TsmHandle, TvmRunner},
    insn::encode,
    regs::{Gpr, SupervisorCsr},
    tsm::{
        pages::PageState,
        region::{Region, RegionState},
        state::TvmCreateParams,
        vcpu::{GuestEvent, VcpuRunState},
        TvmId,
    },
    RegionKind, RunExit, SbiError, TeeError, TsmPageType,
};

const GPA: u64 = 0x8000_0000;
const REGION_LEN: u64 = 0x40_0000;
const COVG: u64 = 0x434F_5647;

fn share(base: u64, len: u64) -> Step {
    Step::ecall(&[(Gpr::A7, COVG), (Gpr::A6, 2), (Gpr::A0, base), (Gpr::A1, len)])
}

fn regions() -> HostRegions {
    let mut regions = HostRegions::new(GUEST_PHYS_LIMIT);
    regions.add_confidential(GPA, REGION_LEN).unwrap();
    regions
}

fn region_at(tsm: &spin::Mutex<TestTsm>, id: TvmId, gpa: u64) -> Region {
    *tsm.lock().tvm(id).unwrap().regions.find(gpa).unwrap()
}

/// Writes the host's reply to the request the vcpu exited with.
fn answer<Mo: Monitor>(monitor: &mut Mo, a0: u64, a1: u64) {
    let area = monitor.shared_area();
    area.set_gpr(Gpr::A0, a0);
    area.set_gpr(Gpr::A1, a1);
}

#[test]
fn populated_share_blocks_the_initiator_until_the_fence_completes() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = TvmShape {
        vcpus: 2,
        ..TvmShape::new(GPA, REGION_LEN, 4, GPA)
    }
    .build(&mut monitor, &mut pages);
    {
        let mut tsm = tsm.lock();
        let guest = tsm.executor_mut();
        guest.load(tvm.id, 0, GPA, vec![share(GPA, PAGE), Step::wfi()]);
        guest.load(tvm.id, 1, 0, vec![Step::wfi(), Step::wfi()]);
    }

    // vcpu 1 has run, so a later fence waits for it
    assert_eq!(monitor.run_vcpu(tvm.id, 1), Ok(RunExit::Resumable));
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Ok(RunExit::Resumable));
    assert_eq!(monitor.shared_area().gpr(Gpr::A6), 2);
    // nothing moves before the host answers
    assert_eq!(
        tsm.lock().page_state(tvm.measured_dst),
        Some(PageState::Assigned(tvm.id))
    );
    assert_eq!(region_at(&tsm, tvm.id, GPA).kind, RegionKind::Confidential);

    answer(&mut monitor, 0, PAGE);
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Err(TeeError::InvalidParam));
    // the populated page was scrubbed and handed back
    assert_eq!(
        tsm.lock().page_state(tvm.measured_dst),
        Some(PageState::Confidential)
    );
    assert_eq!(region_at(&tsm, tvm.id, GPA).state, RegionState::PendingChange);
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Err(TeeError::InvalidParam));

    assert_eq!(monitor.tvm_fence(tvm.id), Ok(()));
    assert_eq!(monitor.tvm_fence(tvm.id), Err(TeeError::AlreadyStarted));
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Err(TeeError::InvalidParam));

    // entering vcpu 1 completes the fence
    assert_eq!(monitor.run_vcpu(tvm.id, 1), Ok(RunExit::Resumable));
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Ok(RunExit::Resumable));
    assert_eq!(monitor.shared_area().csr(SupervisorCsr::Scause), 22);

    let region = region_at(&tsm, tvm.id, GPA);
    assert_eq!(region.kind, RegionKind::Shared);
    assert_eq!(region.len, PAGE);
    let tsm = tsm.lock();
    let vcpu = tsm.tvm(tvm.id).unwrap().vcpu(0).unwrap();
    assert_eq!(vcpu.cpu.gpr(Gpr::A0), 0);
    assert_eq!(vcpu.cpu.gpr(Gpr::A1), PAGE);
}

#[test]
fn refused_or_malformed_shares_leave_the_memory_assigned() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = TvmShape {
        vcpus: 2,
        ..TvmShape::new(GPA, REGION_LEN, 4, GPA)
    }
    .build(&mut monitor, &mut pages);
    {
        let mut tsm = tsm.lock();
        let guest = tsm.executor_mut();
        guest.load(tvm.id, 0, GPA, vec![share(GPA, PAGE), Step::wfi()]);
        guest.load(tvm.id, 1, 0, vec![share(GPA + PAGE, PAGE), Step::wfi()]);
    }
    let guest_a0 = |index: usize| {
        let tsm = tsm.lock();
        tsm.tvm(tvm.id).unwrap().vcpu(index).unwrap().cpu.gpr(Gpr::A0) as i64
    };

    assert_eq!(monitor.run_vcpu(tvm.id, 0), Ok(RunExit::Resumable));
    answer(&mut monitor, SbiError::Failed.code() as u64, 0);
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Ok(RunExit::Resumable));
    assert_eq!(monitor.shared_area().csr(SupervisorCsr::Scause), 22);
    assert_eq!(guest_a0(0), SbiError::Failed.code() as i64);

    // the host claims to keep more than the guest offered
    assert_eq!(monitor.run_vcpu(tvm.id, 1), Ok(RunExit::Resumable));
    answer(&mut monitor, 0, 2 * PAGE);
    assert_eq!(monitor.run_vcpu(tvm.id, 1), Ok(RunExit::Resumable));
    assert_eq!(monitor.shared_area().csr(SupervisorCsr::Scause), 22);
    assert_eq!(guest_a0(1), SbiError::InvalidParam.code() as i64);

    for page in 0..2 {
        let region = region_at(&tsm, tvm.id, GPA + page * PAGE);
        assert_eq!(region.kind, RegionKind::Confidential);
        assert!(!region.is_changing());
        assert_eq!(
            tsm.lock().page_state(tvm.measured_dst + page * PAGE),
            Some(PageState::Assigned(tvm.id))
        );
    }
    let tsm = tsm.lock();
    for index in 0..2 {
        let vcpu = tsm.tvm(tvm.id).unwrap().vcpu(index).unwrap();
        assert_ne!(vcpu.run_state, VcpuRunState::Blocked);
    }
}

#[test]
fn touching_a_pending_region_kills_the_other_vcpus() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = TvmShape {
        vcpus: 3,
        ..TvmShape::new(GPA, REGION_LEN, 4, GPA)
    }
    .build(&mut monitor, &mut pages);
    {
        let mut tsm = tsm.lock();
        let guest = tsm.executor_mut();
        guest.load(tvm.id, 0, GPA, vec![share(GPA, PAGE), Step::wfi()]);
        guest.load(
            tvm.id,
            1,
            0,
            vec![Step::access(GPA + 0x10, encode::lw(5, 0, 0), &[])],
        );
        guest.load(
            tvm.id,
            2,
            0,
            vec![Step::event(GuestEvent::Fetch { gpa: GPA + 0x10 })],
        );
    }

    assert_eq!(monitor.run_vcpu(tvm.id, 0), Ok(RunExit::Resumable));
    answer(&mut monitor, 0, PAGE);
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Err(TeeError::InvalidParam));

    assert_eq!(monitor.run_vcpu(tvm.id, 1), Ok(RunExit::Terminal));
    assert_eq!(monitor.shared_area().csr(SupervisorCsr::Scause), 21);
    assert_eq!(monitor.run_vcpu(tvm.id, 1), Err(TeeError::InvalidParam));
    assert_eq!(monitor.run_vcpu(tvm.id, 2), Ok(RunExit::Terminal));
    assert_eq!(monitor.shared_area().csr(SupervisorCsr::Scause), 20);

    // nobody is left to observe the fence
    assert_eq!(monitor.tvm_fence(tvm.id), Ok(()));
    assert_eq!(monitor.tvm_fence(tvm.id), Ok(()));
    assert_eq!(monitor.run_vcpu(tvm.id, 0), Ok(RunExit::Resumable));
    assert_eq!(monitor.shared_area().csr(SupervisorCsr::Scause), 22);
}

#[test]
fn runner_backs_the_shared_buffer_on_first_touch() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 4, GPA);
    let reserve = confidential(&mut monitor, &mut pages, 2, PAGE);

    let buffer = GPA + 0x10_0000;
    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        GPA,
        vec![
            share(buffer, 4 * PAGE),
            Step::access(
                buffer + PAGE + 8,
                encode::sw(5, 0, 0),
                &[(Gpr::from_field(5), 0x5eed)],
            ),
            // past the kept length the buffer is still confidential
            Step::access(buffer + 3 * PAGE, encode::sw(5, 0, 0), &[]),
            // a second declaration is refused while the first one stands
            share(buffer + 0x10_0000, PAGE),
            Step::wfi(),
        ],
    );

    let policy = GuestRequestPolicy {
        max_shared_size: 2 * PAGE,
        ..GuestRequestPolicy::default()
    };
    let mut runner = TvmRunner::new(
        monitor,
        RecordingBus::default(),
        pages,
        tvm.id,
        0,
        regions(),
        policy,
    )
    .with_reserve(vec![reserve, reserve + PAGE]);
    assert_eq!(runner.run(), Ok(4));
    assert_eq!(runner.reserve_left(), 1);

    let shared = *runner.regions().shared().unwrap();
    // capped to the policy size
    assert_eq!(shared.range.len, 2 * PAGE);
    let host = shared.host_base.unwrap();
    let mut word = [0u8; 4];
    runner.pages_mut().read(host + PAGE + 8, &mut word);
    assert_eq!(u32::from_le_bytes(word), 0x5eed);

    {
        let tsm = tsm.lock();
        let vcpu = tsm.tvm(tvm.id).unwrap().vcpu(0).unwrap();
        assert_eq!(vcpu.cpu.gpr(Gpr::A0) as i64, SbiError::AlreadyStarted.code() as i64);
    }
    // the monitor agrees with the host on where the buffer ends
    let shared = region_at(&tsm, tvm.id, buffer);
    assert_eq!(shared.kind, RegionKind::Shared);
    assert_eq!(shared.len, 2 * PAGE);
    assert_eq!(
        region_at(&tsm, tvm.id, buffer + 2 * PAGE).kind,
        RegionKind::Confidential
    );
    assert_eq!(
        region_at(&tsm, tvm.id, buffer + 0x10_0000).kind,
        RegionKind::Confidential
    );

    runner.release_shared_memory();
    assert!(runner.regions().shared().is_none());
}

#[test]
fn page_table_exhaustion_leaves_no_partial_mapping() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);

    let info = monitor.tsm_info().unwrap();
    let pd = confidential(&mut monitor, &mut pages, 4 + info.tvm_state_pages, 0x4000);
    let id = monitor
        .create_tvm(&TvmCreateParams {
            tvm_page_directory_addr: pd,
            tvm_state_addr: pd + 0x4000,
        })
        .unwrap();
    let state = confidential(&mut monitor, &mut pages, info.tvm_vcpu_state_pages, PAGE);
    monitor.create_vcpu(id, 0, state).unwrap();
    monitor.add_memory_region(id, GPA, REGION_LEN).unwrap();

    let src = pages.alloc_pages(2, PAGE).unwrap();
    pages.write(src, &[0xab; PAGE as usize]);
    let dst = confidential(&mut monitor, &mut pages, 2, PAGE);
    let before = tsm.lock().tvm_measurement(id);

    let add = |monitor: &mut TsmHandle<'_, _, _>| {
        monitor.add_measured_pages(id, src, dst, TsmPageType::Page4k, 2, GPA)
    };
    assert_eq!(add(&mut monitor), Err(TeeError::OutOfPtPages));
    assert_eq!(tsm.lock().page_state(dst), Some(PageState::Confidential));
    assert_eq!(tsm.lock().tvm_measurement(id), before);

    // three levels below the root are needed
    let pt = confidential(&mut monitor, &mut pages, 2, PAGE);
    monitor.add_page_table_pages(id, pt, 2).unwrap();
    assert_eq!(add(&mut monitor), Err(TeeError::OutOfPtPages));

    let pt = confidential(&mut monitor, &mut pages, 1, PAGE);
    monitor.add_page_table_pages(id, pt, 1).unwrap();
    assert_eq!(add(&mut monitor), Ok(()));
    assert_eq!(tsm.lock().page_state(dst), Some(PageState::Assigned(id)));
    assert_ne!(tsm.lock().tvm_measurement(id), before);
}

#[test]
fn runner_donates_a_table_page_and_retries_once() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = TvmShape {
        pt_pages: 3,
        ..TvmShape::new(GPA, REGION_LEN, 1, GPA)
    }
    .build(&mut monitor, &mut pages);
    let reserve = confidential(&mut monitor, &mut pages, 2, PAGE);

    // a different 2 MiB block needs a new leaf table
    let far = GPA + 0x20_0000;
    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        GPA,
        vec![
            Step::access(far, encode::sw(5, 0, 0), &[(Gpr::from_field(5), 9)]),
            Step::wfi(),
        ],
    );

    let mut runner = TvmRunner::new(
        monitor,
        RecordingBus::default(),
        pages,
        tvm.id,
        0,
        regions(),
        GuestRequestPolicy::default(),
    )
    .with_reserve(vec![reserve, reserve + PAGE]);
    assert_eq!(runner.run(), Ok(1));
    assert_eq!(runner.reserve_left(), 0);
}
