//! In-process NVMe controller, host driver and DMA memory used to exercise vectored I/O.
//!
//! The pieces mirror what a userspace NVMe stack talks to on real hardware:
//!
//! - [`DmaArena`]: DMA-able memory with separate virtual and physical address spaces
//! - [`NvmeController`]: the device model (I/O queue pair, READ/WRITE/FLUSH, PRP decoding)
//! - [`SimDevice`]: the host driver; turns a scatter-gather cursor into PRP entries, splits
//!   transfers larger than MDTS and reaps completions
//! - [`SimBus`]: enumerates a set of configured controllers
//!
//! Everything is single-threaded. Commands execute synchronously when the submission doorbell is
//! written; completions sit in the completion queue until the host polls for them.

#![forbid(unsafe_code)]

mod bus;
mod controller;
mod disk;
mod driver;
mod memory;
mod prp;

pub use bus::{AttachError, DeviceConfig, SimBus};
pub use controller::{FaultPlan, NvmeController, NvmeStatus};
pub use disk::{DiskBackend, DiskError, SparseMemDisk};
pub use driver::SimDevice;
pub use memory::{
    DmaArena, MemoryBus, MemoryError, SharedArena, ARENA_PHYS_BASE, ARENA_VIRT_BASE,
};
pub use prp::collect_prp_entries;

/// Controller memory page size (CC.MPS = 0).
pub const PAGE_SIZE: usize = 4096;
