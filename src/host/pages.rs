//! Host memory the driver hands to the monitor: staging pages for measured
//! content, pages to convert, and the backing of the shared buffer.

use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    mem::PhysMemory,
    tsm::{vcpu::GuestExecutor, Tsm},
    PAGE_SIZE,
};

const PAGE: u64 = PAGE_SIZE as u64;

pub trait HostPages {
    /// `count` contiguous pages aligned to `align` bytes, or `None` when exhausted.
    fn alloc_pages(&mut self, count: u64, align: u64) -> Option<u64>;
    fn free_pages(&mut self, base: u64, count: u64);
    fn write(&mut self, addr: u64, data: &[u8]);
    fn read(&self, addr: u64, buf: &mut [u8]);
}

/// Pages carved out of a physical window of the reference monitor's memory.
///
/// Allocation bumps through the window; freed ranges are reused first-fit.
pub struct PageWindow<'a, M: PhysMemory, E: GuestExecutor> {
    tsm: &'a Mutex<Tsm<M, E>>,
    next: u64,
    end: u64,
    free: Vec<(u64, u64)>,
}

impl<'a, M: PhysMemory, E: GuestExecutor> PageWindow<'a, M, E> {
    pub fn new(tsm: &'a Mutex<Tsm<M, E>>, start: u64, end: u64) -> Self {
        assert!(start % PAGE == 0 && end % PAGE == 0 && start <= end);
        Self {
            tsm,
            next: start,
            end,
            free: Vec::new(),
        }
    }

    /// Pages never handed out plus freed ones.
    pub fn available(&self) -> u64 {
        (self.end - self.next) / PAGE + self.free.iter().map(|&(_, n)| n).sum::<u64>()
    }
}

impl<M: PhysMemory, E: GuestExecutor> HostPages for PageWindow<'_, M, E> {
    fn alloc_pages(&mut self, count: u64, align: u64) -> Option<u64> {
        if count == 0 {
            return None;
        }
        let align = align.max(PAGE);
        let len = count.checked_mul(PAGE)?;

        let reuse = self
            .free
            .iter()
            .position(|&(base, n)| base % align == 0 && n >= count);
        if let Some(i) = reuse {
            let (base, n) = self.free.swap_remove(i);
            if n > count {
                self.free.push((base + len, n - count));
            }
            return Some(base);
        }

        let base = self.next.checked_next_multiple_of(align)?;
        let end = base.checked_add(len)?;
        if end > self.end {
            return None;
        }
        if base > self.next {
            self.free.push((self.next, (base - self.next) / PAGE));
        }
        self.next = end;
        Some(base)
    }

    fn free_pages(&mut self, base: u64, count: u64) {
        if count > 0 {
            self.free.push((base, count));
        }
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        self.tsm.lock().memory_mut().write(addr, data);
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        self.tsm.lock().memory().read(addr, buf);
    }
}
