//! Sv48x4 G-stage page table kept in donated confidential pages.
//!
//! The 16KiB root holds 2048 entries indexed by GPA bits [49:39]; the three lower
//! levels are regular 4KiB tables taken from the TVM's page-table pool.

use alloc::{collections::BTreeSet, vec::Vec};

use crate::{config::PAGE_DIRECTORY_SIZE, mem::PhysMemory, TeeError, PAGE_SIZE};

pub const PTE_V: u64 = 1 << 0; /* Valid */
pub const PTE_R: u64 = 1 << 1; /* Readable */
pub const PTE_W: u64 = 1 << 2; /* Writable */
pub const PTE_X: u64 = 1 << 3; /* Executable */
pub const PTE_U: u64 = 1 << 4; /* User */
pub const PTE_A: u64 = 1 << 6; /* Accessed */
pub const PTE_D: u64 = 1 << 7; /* Dirty */

const PPN_SHIFT: u64 = 12;
const PTE_PPN_SHIFT: u64 = 10;
const PTE_SIZE: u64 = 8;
const ROOT_LEVEL: usize = 3;
const HGATP_MODE_SV48X4: u64 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct Entry(u64);

impl Entry {
    fn new(paddr: u64, flags: u64) -> Self {
        let ppn = paddr >> PPN_SHIFT;
        Self(ppn << PTE_PPN_SHIFT | flags)
    }

    fn is_valid(&self) -> bool {
        self.0 & PTE_V != 0
    }

    fn is_leaf(&self) -> bool {
        self.0 & (PTE_R | PTE_W | PTE_X) != 0
    }

    fn paddr(&self) -> u64 {
        (self.0 >> PTE_PPN_SHIFT) << PPN_SHIFT
    }

    fn flags(&self) -> u64 {
        self.0 & 0x3ff
    }
}

fn index(gpa: u64, level: usize) -> u64 {
    let shift = 12 + 9 * level as u64;
    if level == ROOT_LEVEL {
        (gpa >> shift) & 0x7ff
    } else {
        (gpa >> shift) & 0x1ff
    }
}

pub struct GuestPageTable {
    root: u64,
}

impl GuestPageTable {
    /// Wraps an existing root, which must be 16KiB aligned.
    pub fn new(root: u64) -> Result<Self, TeeError> {
        crate::ensure!(
            root % PAGE_DIRECTORY_SIZE as u64 == 0,
            TeeError::InvalidAddress
        )?;
        Ok(Self { root })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn hgatp(&self, vmid: u64) -> u64 {
        (HGATP_MODE_SV48X4 << 60) | ((vmid & 0x3fff) << 44) | (self.root >> PPN_SHIFT)
    }

    pub fn clear<M: PhysMemory>(&self, mem: &mut M) {
        mem.fill(self.root, PAGE_DIRECTORY_SIZE, 0);
    }

    fn entry_addr(table: u64, gpa: u64, level: usize) -> u64 {
        table + index(gpa, level) * PTE_SIZE
    }

    fn read_entry<M: PhysMemory>(mem: &M, addr: u64) -> Entry {
        Entry(mem.read_u64(addr))
    }

    /// Returns the host address and flags of the leaf mapping `gpa`.
    pub fn translate<M: PhysMemory>(&self, mem: &M, gpa: u64) -> Option<(u64, u64)> {
        let mut table = self.root;
        for level in (1..=ROOT_LEVEL).rev() {
            let entry = Self::read_entry(mem, Self::entry_addr(table, gpa, level));
            if !entry.is_valid() || entry.is_leaf() {
                return None;
            }
            table = entry.paddr();
        }
        let leaf = Self::read_entry(mem, Self::entry_addr(table, gpa, 0));
        if !leaf.is_valid() {
            return None;
        }
        Some((leaf.paddr() | (gpa & (PAGE_SIZE as u64 - 1)), leaf.flags()))
    }

    /// Number of table pages `map` would consume to map `count` pages from `gpa`.
    pub fn missing_tables<M: PhysMemory>(&self, mem: &M, gpa: u64, count: u64) -> usize {
        let mut missing = BTreeSet::new();
        for i in 0..count {
            let page = gpa + i * PAGE_SIZE as u64;
            let mut table = self.root;
            for level in (1..=ROOT_LEVEL).rev() {
                let entry = Self::read_entry(mem, Self::entry_addr(table, page, level));
                if !entry.is_valid() {
                    for l in 1..=level {
                        missing.insert((l, page >> (12 + 9 * l as u64)));
                    }
                    break;
                }
                table = entry.paddr();
            }
        }
        missing.len()
    }

    /// Maps one 4KiB page, allocating intermediate tables from `pool`.
    pub fn map<M: PhysMemory>(
        &mut self,
        mem: &mut M,
        gpa: u64,
        hpa: u64,
        flags: u64,
        pool: &mut Vec<u64>,
    ) -> Result<(), TeeError> {
        let mut table = self.root;
        for level in (1..=ROOT_LEVEL).rev() {
            let addr = Self::entry_addr(table, gpa, level);
            let mut entry = Self::read_entry(mem, addr);
            if !entry.is_valid() {
                let new_table = pool.pop().ok_or(TeeError::OutOfPtPages)?;
                mem.fill(new_table, PAGE_SIZE, 0);
                entry = Entry::new(new_table, PTE_V);
                mem.write_u64(addr, entry.0);
            }
            table = entry.paddr();
        }

        let addr = Self::entry_addr(table, gpa, 0);
        crate::ensure_not!(
            Self::read_entry(mem, addr).is_valid(),
            TeeError::InvalidAddress
        )?;
        mem.write_u64(addr, Entry::new(hpa, flags | PTE_V | PTE_U | PTE_A | PTE_D).0);
        Ok(())
    }

    pub fn unmap<M: PhysMemory>(&mut self, mem: &mut M, gpa: u64) -> Option<u64> {
        let mut table = self.root;
        for level in (1..=ROOT_LEVEL).rev() {
            let entry = Self::read_entry(mem, Self::entry_addr(table, gpa, level));
            if !entry.is_valid() {
                return None;
            }
            table = entry.paddr();
        }
        let addr = Self::entry_addr(table, gpa, 0);
        let leaf = Self::read_entry(mem, addr);
        if !leaf.is_valid() {
            return None;
        }
        mem.write_u64(addr, 0);
        Some(leaf.paddr())
    }
}
