//! Confidential page tracking and the global/local fence protocol.
//!
//! A converted page is not usable by a TVM until a global fence started after its
//! conversion has been acknowledged by a local fence on every other hart.

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{config::TsmConfig, TeeError, PAGE_SIZE};

use super::TvmId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Converted, waiting for the fence sequence tagged `epoch`.
    Converting { epoch: u64 },
    /// Confidential and free to donate.
    Confidential,
    Assigned(TvmId),
}

#[derive(Debug)]
struct FenceSequence {
    epoch: u64,
    // one bit per hart that still owes a local fence
    pending: u64,
}

pub struct PageAllocator {
    pages: BTreeMap<u64, PageState>,
    window_start: u64,
    window_end: u64,
    hart_count: usize,
    next_epoch: u64,
    fence: Option<FenceSequence>,
}

/// Turns `(base, count)` into the byte length of the range, rejecting overflow.
pub(crate) fn range_len(base: u64, count: u64) -> Result<u64, TeeError> {
    let len = count
        .checked_mul(PAGE_SIZE as u64)
        .ok_or(TeeError::InvalidParam)?;
    base.checked_add(len).ok_or(TeeError::InvalidParam)?;
    Ok(len)
}

pub(crate) fn page_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE as u64 == 0
}

impl PageAllocator {
    pub fn new(config: &TsmConfig) -> Self {
        Self {
            pages: BTreeMap::new(),
            window_start: config.convertible_start,
            window_end: config.convertible_end,
            hart_count: config.hart_count,
            next_epoch: 0,
            fence: None,
        }
    }

    fn addrs(base: u64, count: u64) -> impl Iterator<Item = u64> {
        (0..count).map(move |i| base + i * PAGE_SIZE as u64)
    }

    pub fn convert(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
        crate::ensure!(page_aligned(base), TeeError::InvalidAddress)?;
        crate::ensure!(
            base >= self.window_start && base < self.window_end,
            TeeError::InvalidAddress
        )?;
        crate::ensure!(count > 0, TeeError::InvalidParam)?;
        let len = range_len(base, count)?;
        crate::ensure!(base + len <= self.window_end, TeeError::InvalidParam)?;
        crate::ensure_not!(
            self.pages.range(base..base + len).next().is_some(),
            TeeError::InvalidParam
        )?;

        let epoch = self.next_epoch;
        for addr in Self::addrs(base, count) {
            self.pages.insert(addr, PageState::Converting { epoch });
        }
        log::debug!("converted {} pages at {:#x} (epoch {})", count, base, epoch);
        Ok(())
    }

    pub fn reclaim(&mut self, base: u64, count: u64) -> Result<(), TeeError> {
        crate::ensure!(page_aligned(base), TeeError::InvalidAddress)?;
        crate::ensure!(count > 0, TeeError::InvalidParam)?;
        range_len(base, count)?;

        for addr in Self::addrs(base, count) {
            match self.pages.get(&addr) {
                None => return Err(TeeError::InvalidAddress),
                Some(PageState::Assigned(_)) => return Err(TeeError::Failed),
                Some(_) => {}
            }
        }
        for addr in Self::addrs(base, count) {
            self.pages.remove(&addr);
        }
        log::debug!("reclaimed {} pages at {:#x}", count, base);
        Ok(())
    }

    pub fn global_fence(&mut self, hart: usize) -> Result<(), TeeError> {
        crate::ensure!(hart < self.hart_count, TeeError::InvalidParam)?;
        crate::ensure!(self.fence.is_none(), TeeError::AlreadyStarted)?;

        let all = if self.hart_count == 64 {
            u64::MAX
        } else {
            (1u64 << self.hart_count) - 1
        };
        let seq = FenceSequence {
            epoch: self.next_epoch,
            pending: all & !(1u64 << hart),
        };
        self.next_epoch += 1;
        log::debug!("hart {} started global fence epoch {}", hart, seq.epoch);

        if seq.pending == 0 {
            self.complete(seq.epoch);
        } else {
            self.fence = Some(seq);
        }
        Ok(())
    }

    pub fn local_fence(&mut self, hart: usize) -> Result<(), TeeError> {
        crate::ensure!(hart < self.hart_count, TeeError::InvalidParam)?;
        let Some(seq) = self.fence.as_mut() else {
            return Ok(());
        };
        seq.pending &= !(1u64 << hart);
        if seq.pending == 0 {
            let epoch = seq.epoch;
            self.fence = None;
            self.complete(epoch);
        }
        Ok(())
    }

    fn complete(&mut self, epoch: u64) {
        let mut n = 0;
        for state in self.pages.values_mut() {
            if let PageState::Converting { epoch: e } = *state {
                if e <= epoch {
                    *state = PageState::Confidential;
                    n += 1;
                }
            }
        }
        log::debug!("global fence epoch {} completed, {} pages confidential", epoch, n);
    }

    pub fn fence_pending(&self) -> bool {
        self.fence.is_some()
    }

    pub fn state(&self, addr: u64) -> Option<PageState> {
        self.pages.get(&addr).copied()
    }

    /// True when no page of the range is tracked as confidential in any state.
    pub fn is_non_confidential(&self, base: u64, len: u64) -> bool {
        self.pages.range(base..base + len).next().is_none()
    }

    /// Donates confidential, unassigned pages to `tvm`. Nothing changes on failure.
    pub fn assign(&mut self, base: u64, count: u64, tvm: TvmId) -> Result<(), TeeError> {
        crate::ensure!(page_aligned(base), TeeError::InvalidAddress)?;
        crate::ensure!(count > 0, TeeError::InvalidParam)?;
        range_len(base, count)?;
        for addr in Self::addrs(base, count) {
            crate::ensure!(
                self.pages.get(&addr) == Some(&PageState::Confidential),
                TeeError::InvalidAddress
            )?;
        }
        for addr in Self::addrs(base, count) {
            self.pages.insert(addr, PageState::Assigned(tvm));
        }
        Ok(())
    }

    pub fn release(&mut self, addr: u64, tvm: TvmId) {
        if let Some(state) = self.pages.get_mut(&addr) {
            assert_eq!(*state, PageState::Assigned(tvm), "releasing a page not owned by the tvm");
            *state = PageState::Confidential;
        }
    }

    pub fn release_all(&mut self, tvm: TvmId) -> Vec<u64> {
        let mut released = Vec::new();
        for (addr, state) in self.pages.iter_mut() {
            if *state == PageState::Assigned(tvm) {
                *state = PageState::Confidential;
                released.push(*addr);
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(harts: usize) -> PageAllocator {
        PageAllocator::new(&TsmConfig {
            hart_count: harts,
            ..TsmConfig::default()
        })
    }

    #[test]
    fn convert_checks_address_then_count() {
        let mut pages = allocator(1);
        assert_eq!(pages.convert(0x8000_0800, 1), Err(TeeError::InvalidAddress));
        assert_eq!(pages.convert(0x1000, 1), Err(TeeError::InvalidAddress));
        assert_eq!(pages.convert(0x8000_0000, 0), Err(TeeError::InvalidParam));
        assert_eq!(pages.convert(0xffff_f000, 2), Err(TeeError::InvalidParam));
        assert_eq!(pages.convert(0x8000_0000, 4), Ok(()));
        assert_eq!(pages.convert(0x8000_2000, 4), Err(TeeError::InvalidParam));
    }

    #[test]
    fn single_hart_fence_completes_immediately() {
        let mut pages = allocator(1);
        pages.convert(0x8000_0000, 2).unwrap();
        assert_eq!(
            pages.state(0x8000_0000),
            Some(PageState::Converting { epoch: 0 })
        );
        pages.global_fence(0).unwrap();
        assert!(!pages.fence_pending());
        assert_eq!(pages.state(0x8000_1000), Some(PageState::Confidential));
    }

    #[test]
    fn conversion_needs_every_other_hart() {
        let mut pages = allocator(3);
        pages.convert(0x8000_0000, 1).unwrap();
        pages.global_fence(1).unwrap();
        assert!(pages.fence_pending());
        assert_eq!(pages.global_fence(0), Err(TeeError::AlreadyStarted));

        // pages converted while the sequence runs wait for the next one
        pages.convert(0x8010_0000, 1).unwrap();

        pages.local_fence(0).unwrap();
        assert_eq!(
            pages.state(0x8000_0000),
            Some(PageState::Converting { epoch: 0 })
        );
        // the initiator's own local fence does not count
        pages.local_fence(1).unwrap();
        assert!(pages.fence_pending());
        pages.local_fence(2).unwrap();
        assert!(!pages.fence_pending());
        assert_eq!(pages.state(0x8000_0000), Some(PageState::Confidential));
        assert_eq!(
            pages.state(0x8010_0000),
            Some(PageState::Converting { epoch: 1 })
        );
    }

    #[test]
    fn reclaim_refuses_assigned_pages() {
        let mut pages = allocator(1);
        pages.convert(0x8000_0000, 2).unwrap();
        pages.global_fence(0).unwrap();
        pages.assign(0x8000_0000, 1, 7).unwrap();
        assert_eq!(pages.reclaim(0x8000_0000, 2), Err(TeeError::Failed));
        // all-or-nothing: the free page is still tracked
        assert_eq!(pages.state(0x8000_1000), Some(PageState::Confidential));

        assert_eq!(pages.release_all(7), [0x8000_0000]);
        assert_eq!(pages.reclaim(0x8000_0000, 2), Ok(()));
        assert!(pages.is_non_confidential(0x8000_0000, 0x2000));
        assert_eq!(pages.reclaim(0x8000_0000, 1), Err(TeeError::InvalidAddress));
    }

    #[test]
    fn converting_pages_cannot_be_assigned() {
        let mut pages = allocator(2);
        pages.convert(0x8000_0000, 1).unwrap();
        assert_eq!(pages.assign(0x8000_0000, 1, 1), Err(TeeError::InvalidAddress));
    }
}
