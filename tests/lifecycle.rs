mod common;

use common::*;
use covemm::{
    host::{HostPages, Monitor, PageWindow, TsmHandle},
    tsm::{pages::PageState, state::TvmCreateParams},
    RegionKind, RunExit, TeeError, TsmPageType,
};

const GPA: u64 = 0x8000_0000;
const REGION_LEN: u64 = 0x10_0000;

/// A created, not yet finalized TVM with one vcpu and a confidential region.
fn initializing<Mo: Monitor, P: HostPages>(monitor: &mut Mo, pages: &mut P) -> u64 {
    let info = monitor.tsm_info().unwrap();
    let pd = confidential(monitor, pages, 4 + info.tvm_state_pages, 0x4000);
    let id = monitor
        .create_tvm(&TvmCreateParams {
            tvm_page_directory_addr: pd,
            tvm_state_addr: pd + 0x4000,
        })
        .unwrap();
    let state = confidential(monitor, pages, info.tvm_vcpu_state_pages, PAGE);
    monitor.create_vcpu(id, 0, state).unwrap();
    let pt = confidential(monitor, pages, 4, PAGE);
    monitor.add_page_table_pages(id, pt, 4).unwrap();
    monitor.add_memory_region(id, GPA, REGION_LEN).unwrap();
    id
}

#[test]
fn lifecycle_only_moves_forward() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let id = initializing(&mut monitor, &mut pages);
    let page = confidential(&mut monitor, &mut pages, 1, PAGE);

    // zero pages and runs wait for finalize
    assert_eq!(
        monitor.add_zero_pages(id, page, TsmPageType::Page4k, 1, GPA),
        Err(TeeError::InvalidParam)
    );
    assert_eq!(monitor.run_vcpu(id, 0), Err(TeeError::InvalidParam));

    monitor.finalize_tvm(id, GPA, 0).unwrap();
    assert_eq!(monitor.finalize_tvm(id, GPA, 0), Err(TeeError::InvalidParam));
    assert_eq!(
        monitor.add_memory_region(id, GPA + REGION_LEN, REGION_LEN),
        Err(TeeError::InvalidParam)
    );
    let state = confidential(&mut monitor, &mut pages, 1, PAGE);
    assert_eq!(monitor.create_vcpu(id, 1, state), Err(TeeError::InvalidParam));
    let src = pages.alloc_pages(1, PAGE).unwrap();
    assert_eq!(
        monitor.add_measured_pages(id, src, page, TsmPageType::Page4k, 1, GPA),
        Err(TeeError::InvalidParam)
    );
    assert_eq!(
        monitor.add_zero_pages(id, page, TsmPageType::Page4k, 1, GPA),
        Ok(())
    );

    monitor.destroy_tvm(id).unwrap();
    assert_eq!(monitor.destroy_tvm(id), Err(TeeError::InvalidParam));
    assert_eq!(monitor.run_vcpu(id, 0), Err(TeeError::InvalidParam));
    assert_eq!(monitor.tvm_fence(id), Err(TeeError::InvalidParam));
}

#[test]
fn finalize_needs_a_vcpu_and_ids_are_not_reused() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let info = monitor.tsm_info().unwrap();

    let pd = confidential(&mut monitor, &mut pages, 4 + info.tvm_state_pages, 0x4000);
    let params = TvmCreateParams {
        tvm_page_directory_addr: pd,
        tvm_state_addr: pd + 0x4000,
    };
    let first = monitor.create_tvm(&params).unwrap();
    assert_eq!(monitor.finalize_tvm(first, GPA, 0), Err(TeeError::InvalidParam));
    // the directory now belongs to the first TVM
    assert_eq!(monitor.create_tvm(&params), Err(TeeError::InvalidAddress));

    monitor.destroy_tvm(first).unwrap();
    let second = monitor.create_tvm(&params).unwrap();
    assert_ne!(first, second);
}

#[test]
fn misaligned_addresses_and_lengths_are_rejected() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);

    let base = pages.alloc_pages(8, 0x4000).unwrap();
    assert_eq!(monitor.convert_pages(base + 8, 1), Err(TeeError::InvalidAddress));
    assert_eq!(monitor.convert_pages(base, 0), Err(TeeError::InvalidParam));
    // outside the convertible window
    assert_eq!(monitor.convert_pages(0x1000, 1), Err(TeeError::InvalidAddress));
    monitor.convert_pages(base, 8).unwrap();
    assert_eq!(monitor.convert_pages(base, 1), Err(TeeError::InvalidParam));
    monitor.global_fence().unwrap();
    monitor.local_fence().unwrap();

    // directories need 16 KiB alignment
    assert_eq!(
        monitor.create_tvm(&TvmCreateParams {
            tvm_page_directory_addr: base + PAGE,
            tvm_state_addr: base + 5 * PAGE,
        }),
        Err(TeeError::InvalidAddress)
    );
    // state overlapping the directory
    assert_eq!(
        monitor.create_tvm(&TvmCreateParams {
            tvm_page_directory_addr: base,
            tvm_state_addr: base + PAGE,
        }),
        Err(TeeError::InvalidParam)
    );

    let id = monitor
        .create_tvm(&TvmCreateParams {
            tvm_page_directory_addr: base,
            tvm_state_addr: base + 0x4000,
        })
        .unwrap();
    assert_eq!(
        monitor.add_memory_region(id, GPA + 0x800, PAGE),
        Err(TeeError::InvalidAddress)
    );
    assert_eq!(
        monitor.add_memory_region(id, GPA, PAGE + 1),
        Err(TeeError::InvalidParam)
    );
    assert_eq!(monitor.add_memory_region(id, GPA, 0), Err(TeeError::InvalidParam));
    assert_eq!(
        monitor.create_vcpu(id, 0, base + 5 * PAGE + 8),
        Err(TeeError::InvalidAddress)
    );
    // only 4 KiB pages
    let src = pages.alloc_pages(1, PAGE).unwrap();
    monitor.add_memory_region(id, GPA, REGION_LEN).unwrap();
    assert_eq!(
        monitor.add_measured_pages(id, src, base + 6 * PAGE, TsmPageType::Page2mb, 1, GPA),
        Err(TeeError::InvalidParam)
    );
}

#[test]
fn regions_of_a_tvm_never_overlap() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let id = initializing(&mut monitor, &mut pages);

    assert_eq!(
        monitor.add_memory_region(id, GPA + REGION_LEN - PAGE, 2 * PAGE),
        Err(TeeError::InvalidAddress)
    );
    assert_eq!(
        monitor.add_memory_region(id, GPA - PAGE, 2 * PAGE),
        Err(TeeError::InvalidAddress)
    );
    assert_eq!(
        monitor.add_memory_region(id, GPA + PAGE, PAGE),
        Err(TeeError::InvalidAddress)
    );
    // adjacent is fine
    monitor
        .add_memory_region(id, GPA + REGION_LEN, REGION_LEN)
        .unwrap();
}

#[test]
fn host_declares_mmio_only_while_initializing() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let id = initializing(&mut monitor, &mut pages);
    let uart = 0x1000_0000;

    monitor.add_mmio_region(id, uart, PAGE).unwrap();
    assert_eq!(
        monitor.add_mmio_region(id, GPA, PAGE),
        Err(TeeError::InvalidAddress)
    );
    assert_eq!(
        monitor.add_memory_region(id, uart, PAGE),
        Err(TeeError::InvalidAddress)
    );
    assert_eq!(
        monitor.add_mmio_region(id, uart + 0x10, PAGE),
        Err(TeeError::InvalidAddress)
    );

    monitor.finalize_tvm(id, GPA, 0).unwrap();
    assert_eq!(
        monitor.add_mmio_region(id, uart + PAGE, PAGE),
        Err(TeeError::InvalidParam)
    );
    let tsm = tsm.lock();
    let region = tsm.tvm(id).unwrap().regions.find(uart).copied().unwrap();
    assert_eq!(region.kind, RegionKind::EmulatedMmio);
}

#[test]
fn global_fence_is_exclusive_until_every_hart_fenced() {
    let tsm = tsm(3);
    let mut hart0 = TsmHandle::new(&tsm, 0);
    let mut hart1 = TsmHandle::new(&tsm, 1);
    let mut hart2 = TsmHandle::new(&tsm, 2);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);

    let base = pages.alloc_pages(2, PAGE).unwrap();
    hart0.convert_pages(base, 2).unwrap();
    assert!(matches!(
        tsm.lock().page_state(base),
        Some(PageState::Converting { .. })
    ));

    hart0.global_fence().unwrap();
    assert_eq!(hart1.global_fence(), Err(TeeError::AlreadyStarted));
    assert_eq!(hart0.global_fence(), Err(TeeError::AlreadyStarted));

    // pages converted while the fence is in flight need the next one
    let late = pages.alloc_pages(1, PAGE).unwrap();
    hart0.convert_pages(late, 1).unwrap();

    hart1.local_fence().unwrap();
    // a repeated local fence does not count for another hart
    hart1.local_fence().unwrap();
    assert!(matches!(
        tsm.lock().page_state(base),
        Some(PageState::Converting { .. })
    ));

    hart2.local_fence().unwrap();
    assert_eq!(tsm.lock().page_state(base), Some(PageState::Confidential));
    assert!(matches!(
        tsm.lock().page_state(late),
        Some(PageState::Converting { .. })
    ));

    // nothing outstanding: a no-op
    assert_eq!(hart0.local_fence(), Ok(()));
    hart2.global_fence().unwrap();
    hart0.local_fence().unwrap();
    hart1.local_fence().unwrap();
    assert_eq!(tsm.lock().page_state(late), Some(PageState::Confidential));
}

#[test]
fn tvm_fence_is_exclusive_per_tvm() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = TvmShape {
        vcpus: 2,
        ..TvmShape::new(GPA, REGION_LEN, 1, GPA)
    }
    .build(&mut monitor, &mut pages);
    let other = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 1, GPA);
    tsm.lock()
        .executor_mut()
        .load(tvm.id, 1, 0, vec![Step::wfi(), Step::wfi()]);

    assert_eq!(monitor.run_vcpu(tvm.id, 1), Ok(RunExit::Resumable));
    monitor.tvm_fence(tvm.id).unwrap();
    assert_eq!(monitor.tvm_fence(tvm.id), Err(TeeError::AlreadyStarted));
    // other TVMs are not held up
    assert_eq!(monitor.tvm_fence(other.id), Ok(()));

    assert_eq!(monitor.run_vcpu(tvm.id, 1), Ok(RunExit::Resumable));
    assert_eq!(monitor.tvm_fence(tvm.id), Ok(()));
}

#[test]
fn reclaim_waits_for_destroy() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 2, GPA);

    assert_eq!(
        tsm.lock().page_state(tvm.measured_dst),
        Some(PageState::Assigned(tvm.id))
    );
    assert_eq!(monitor.reclaim_pages(tvm.measured_dst, 2), Err(TeeError::Failed));
    assert_eq!(monitor.reclaim_pages(tvm.measured_dst + 1, 1), Err(TeeError::InvalidAddress));
    assert_eq!(monitor.reclaim_pages(tvm.measured_dst, 0), Err(TeeError::InvalidParam));
    // never converted
    assert_eq!(monitor.reclaim_pages(tvm.measured, 1), Err(TeeError::InvalidAddress));

    monitor.destroy_tvm(tvm.id).unwrap();
    assert_eq!(
        tsm.lock().page_state(tvm.measured_dst),
        Some(PageState::Confidential)
    );
    // scrubbed on release
    let mut page = [0xffu8; 64];
    pages.read(tvm.measured_dst, &mut page);
    assert!(page.iter().all(|&b| b == 0));

    monitor.reclaim_pages(tvm.measured_dst, 2).unwrap();
    assert_eq!(tsm.lock().page_state(tvm.measured_dst), None);
}
