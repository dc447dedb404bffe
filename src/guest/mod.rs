//! Guest side: what runs inside the MM partition.

pub mod boot_info;
pub mod event_loop;
pub mod transport;

pub use boot_info::BootInfo;
pub use event_loop::{DispatchStatus, EventLoop, MmDispatcher, MmEntry, MmReturn};
pub use transport::{SharedMemory, Transport};
