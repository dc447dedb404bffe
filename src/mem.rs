//! Physical memory as seen by the monitor and by the host.

use alloc::{boxed::Box, collections::BTreeMap};

use crate::PAGE_SIZE;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Byte-addressable physical memory.
///
/// Callers validate ranges before touching memory; implementations only move bytes.
pub trait PhysMemory {
    fn read(&self, addr: u64, buf: &mut [u8]);
    fn write(&mut self, addr: u64, data: &[u8]);

    fn fill(&mut self, addr: u64, len: usize, byte: u8) {
        let chunk = [byte; 256];
        let mut done = 0;
        while done < len {
            let n = core::cmp::min(chunk.len(), len - done);
            self.write(addr + done as u64, &chunk[..n]);
            done += n;
        }
    }

    fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0; 8];
        self.read(addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }
}

/// Sparse memory backing used to simulate a platform. Pages are allocated on first
/// write and read as zero until then.
#[derive(Default)]
pub struct SparseMemory {
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages that have been written at least once.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}

impl PhysMemory for SparseMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let offset = (cur & PAGE_MASK) as usize;
            let n = core::cmp::min(PAGE_SIZE - offset, buf.len() - done);
            match self.pages.get(&(cur & !PAGE_MASK)) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let cur = addr + done as u64;
            let offset = (cur & PAGE_MASK) as usize;
            let n = core::cmp::min(PAGE_SIZE - offset, data.len() - done);
            let page = self
                .pages
                .entry(cur & !PAGE_MASK)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }
}
