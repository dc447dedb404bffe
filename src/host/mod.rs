//! Host side: drives the monitor to build, run and tear down the MM TVM.

pub mod bootstrap;
pub mod communicate;
pub mod guest_request;
pub mod monitor;
pub mod pages;
pub mod regions;
pub mod runner;
pub mod trap;

pub use bootstrap::{launch, max_pte_pages, teardown, MmTvm};
pub use communicate::{CommError, MmCommunicator};
pub use monitor::{Monitor, TsmHandle};
pub use pages::{HostPages, PageWindow};
pub use regions::HostRegions;
pub use runner::{MmioBus, TvmRunner};
