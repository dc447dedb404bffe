mod common;

use common::*;
use covemm::{
    config::{GuestRequestPolicy, GUEST_PHYS_LIMIT},
    error::HostError,
    host::{HostRegions, PageWindow, TsmHandle, TvmRunner},
    insn::{encode, AccessWidth},
    regs::Gpr,
};

const GPA: u64 = 0x8000_0000;
const REGION_LEN: u64 = 0x10_0000;
const IMAGE_OFFSET: u64 = 0x4000;
const UART: u64 = 0x1000_0000;
const COVG: u64 = 0x434F_5647;

fn regions() -> HostRegions {
    let mut regions = HostRegions::new(GUEST_PHYS_LIMIT);
    regions.add_confidential(GPA, REGION_LEN).unwrap();
    regions
}

fn add_mmio(base: u64, len: u64) -> Step {
    Step::ecall(&[
        (Gpr::A7, COVG),
        (Gpr::A6, 0),
        (Gpr::A0, base),
        (Gpr::A1, len),
    ])
}

#[test]
fn mmio_store_reaches_the_bus_then_wfi_pauses() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let entry = GPA + IMAGE_OFFSET;
    let tvm = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 16, entry);

    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        entry,
        vec![
            add_mmio(UART, 0x1000),
            Step::access(
                UART,
                encode::sw(5, 6, 0),
                &[(Gpr::from_field(5), 0xcafe_f00d), (Gpr::from_field(6), UART)],
            ),
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
    );
    // the ecall and the store, then the wfi
    assert_eq!(runner.run(), Ok(2));
    assert_eq!(
        runner.bus_mut().writes,
        vec![(UART, AccessWidth::Word, 0xcafe_f00d)]
    );
    assert_eq!(runner.regions().mmio().count(), 1);

    let tsm = tsm.lock();
    let guest = tsm.tvm(tvm.id).unwrap();
    assert_eq!(guest.vcpu(0).unwrap().cpu.gpr(Gpr::A0), 0);
    assert_eq!(guest.vcpu(0).unwrap().cpu.pc, entry + 8);
}

#[test]
fn mmio_declared_by_the_host_needs_no_guest_request() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let entry = GPA + IMAGE_OFFSET;
    let tvm = TvmShape {
        mmio: Some((UART, 0x1000)),
        ..TvmShape::new(GPA, REGION_LEN, 16, entry)
    }
    .build(&mut monitor, &mut pages);

    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        entry,
        vec![
            Step::access(
                UART + 4,
                encode::store(0b000, 5, 6, 0),
                &[(Gpr::from_field(5), 0x41), (Gpr::from_field(6), UART + 4)],
            ),
            Step::wfi(),
        ],
    );

    let mut regions = regions();
    regions.add_mmio(UART, 0x1000).unwrap();
    let mut runner = TvmRunner::new(
        monitor,
        RecordingBus::default(),
        pages,
        tvm.id,
        0,
        regions,
        GuestRequestPolicy::default(),
    );
    assert_eq!(runner.run(), Ok(1));
    assert_eq!(runner.bus_mut().writes, vec![(UART + 4, AccessWidth::Byte, 0x41)]);
}

#[test]
fn mmio_load_lands_in_the_destination_register() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let entry = GPA + IMAGE_OFFSET;
    let tvm = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 16, entry);

    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        entry,
        vec![
            add_mmio(UART, 0x1000),
            Step::access(UART + 4, encode::lw(7, 6, 4), &[(Gpr::from_field(6), UART)]),
            Step::wfi(),
        ],
    );

    let bus = RecordingBus {
        read_value: 0xffff_fff0,
        ..RecordingBus::default()
    };
    let mut runner = TvmRunner::new(
        monitor,
        bus,
        pages,
        tvm.id,
        0,
        regions(),
        GuestRequestPolicy::default(),
    );
    assert_eq!(runner.run(), Ok(2));
    assert_eq!(runner.bus_mut().reads, vec![(UART + 4, AccessWidth::Word)]);
    // lw sign-extends
    let tsm = tsm.lock();
    let vcpu = tsm.tvm(tvm.id).unwrap().vcpu(0).unwrap();
    assert_eq!(vcpu.cpu.gprs[7], 0xffff_ffff_ffff_fff0);
}

#[test]
fn measured_code_runs_in_place_and_unknown_faults_stop_the_loop() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let entry = GPA + IMAGE_OFFSET;
    let tvm = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 16, entry);

    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        entry,
        vec![
            // measured page 2 holds 0x03 bytes
            Step::access(GPA + 2 * PAGE, encode::lw(5, 0, 0), &[]),
            // nothing is declared at this address
            Step::access(0x4000_0000, encode::lw(5, 0, 0), &[]),
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
    );
    assert!(matches!(
        runner.run(),
        Err(HostError::UnhandledFault { addr: 0x4000_0000, .. })
    ));
    let tsm = tsm.lock();
    let vcpu = tsm.tvm(tvm.id).unwrap().vcpu(0).unwrap();
    assert_eq!(vcpu.cpu.gprs[5], 0x0303_0303);
}

#[test]
fn unmapped_confidential_pages_are_populated_on_demand() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let entry = GPA + IMAGE_OFFSET;
    let tvm = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 16, entry);
    let reserve = confidential(&mut monitor, &mut pages, 4, PAGE);

    let heap = GPA + 0x8_0000;
    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        entry,
        vec![
            Step::access(heap, encode::sw(5, 0, 0), &[(Gpr::from_field(5), 0x77)]),
            Step::access(heap, encode::lw(8, 0, 0), &[]),
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
    .with_reserve((0..4).map(|i| reserve + i * PAGE).collect());
    assert_eq!(runner.run(), Ok(1));
    assert_eq!(runner.reserve_left(), 3);

    let tsm = tsm.lock();
    let vcpu = tsm.tvm(tvm.id).unwrap().vcpu(0).unwrap();
    assert_eq!(vcpu.cpu.gprs[8], 0x77);
}

#[test]
fn guest_console_output_is_acknowledged() {
    let tsm = tsm(1);
    let mut monitor = TsmHandle::new(&tsm, 0);
    let mut pages = PageWindow::new(&tsm, HOST_START, HOST_END);
    let tvm = manual_tvm(&mut monitor, &mut pages, GPA, REGION_LEN, 1, GPA);

    let putc = |byte: u8| Step::ecall(&[(Gpr::A7, 1), (Gpr::A0, byte as u64)]);
    tsm.lock().executor_mut().load(
        tvm.id,
        0,
        GPA,
        vec![putc(b'o'), putc(b'k'), putc(b'\n'), Step::wfi()],
    );

    let mut runner = TvmRunner::new(
        monitor,
        RecordingBus::default(),
        pages,
        tvm.id,
        0,
        regions(),
        GuestRequestPolicy::default(),
    );
    assert_eq!(runner.run(), Ok(3));
    let tsm = tsm.lock();
    assert_eq!(tsm.tvm(tvm.id).unwrap().vcpu(0).unwrap().cpu.gpr(Gpr::A0), 0);
}
