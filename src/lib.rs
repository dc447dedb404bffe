/*
 * Host and guest sides of the RISC-V CoVE interface used to run a Standalone MM
 * partition inside a TVM, together with a reference TSM that implements the monitor
 * side of the protocol over an abstract physical memory.
 *
 * Author: Giuseppe Capasso <capassog97@gmail.com>
 */
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod guest;
pub mod host;
pub mod insn;
pub mod log;
pub mod mem;
pub mod regs;
pub mod tsm;

pub use common::sbi::{SbiError, SbiRet, PAGE_SIZE};
pub use common::tee::{RegionKind, RunExit, TeeError, TsmPageType, TsmState};
