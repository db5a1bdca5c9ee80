//! Capabilities the round-trip harness consumes from the storage driver and the DMA allocator.
//!
//! Nothing here knows about PCI, queue pairs or PRP layout; those stay behind the trait objects.

use thiserror::Error;

use crate::{AddressTranslator, SgCursor};

/// Identity and geometry of an addressable namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub id: u32,
    /// Bytes per logical block.
    pub sector_size: u32,
    /// Namespace size (NSZE) in logical blocks.
    pub size_blocks: u64,
}

/// Completion status handed to a [`CompletionCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    /// Status code type.
    pub sct: u8,
    /// Status code.
    pub sc: u8,
}

impl IoCompletion {
    pub const SUCCESS: IoCompletion = IoCompletion { sct: 0, sc: 0 };

    pub fn is_error(&self) -> bool {
        self.sct != 0 || self.sc != 0
    }
}

/// Invoked exactly once per accepted submission, from inside
/// [`IoDevice::process_completions`].
pub type CompletionCallback = Box<dyn FnOnce(&IoCompletion)>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("namespace {0} does not exist")]
    InvalidNamespace(u32),

    #[error("block count must be non-zero")]
    ZeroLength,

    #[error("scatter-gather list rejected at byte {offset}: {reason}")]
    InvalidSgl { offset: u64, reason: &'static str },

    #[error("scatter-gather list ended {missing} bytes short of the transfer")]
    SglTooShort { missing: u64 },

    #[error("submission queue has {free} free slots, request needs {needed}")]
    QueueFull { free: usize, needed: usize },

    #[error("out of DMA memory for descriptor lists")]
    OutOfDescriptorMemory,

    #[error("submission queue entry could not be written")]
    QueueWrite,

    #[error("controller is in a fatal state")]
    ControllerFatal,

    #[error("controller is detached")]
    Detached,
}

/// Host-side handle on one NVMe controller.
///
/// Submissions are asynchronous: `submit_*` only queues the command (pulling spans out of the
/// cursor while doing so). The completion callback runs later, from `process_completions`.
pub trait IoDevice {
    fn name(&self) -> &str;

    /// First active namespace, or `None` when the controller exposes no usable namespace.
    fn default_namespace(&self) -> Option<NamespaceInfo>;

    fn submit_writev(
        &mut self,
        nsid: u32,
        lba: u64,
        lba_count: u32,
        callback: CompletionCallback,
        cursor: &mut dyn SgCursor,
    ) -> Result<(), SubmitError>;

    fn submit_readv(
        &mut self,
        nsid: u32,
        lba: u64,
        lba_count: u32,
        callback: CompletionCallback,
        cursor: &mut dyn SgCursor,
    ) -> Result<(), SubmitError>;

    /// Reaps up to `max_completions` completion entries (0 means no limit) and runs the callbacks
    /// of every request that finished. Returns the number of entries reaped.
    fn process_completions(&mut self, max_completions: u32) -> usize;

    /// Tears the controller down. Outstanding callbacks are dropped without running.
    fn detach(&mut self);
}

/// A DMA-capable buffer. `vaddr` is the virtual handle used as a [`crate::Segment`] base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaHandle {
    pub vaddr: u64,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of DMA memory (len={len} align={align})")]
    OutOfMemory { len: u32, align: u32 },

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u32),

    #[error("zero-length allocation")]
    ZeroLength,

    #[error("no live buffer at {vaddr:#x}")]
    UnknownBuffer { vaddr: u64 },

    #[error("access out of bounds of buffer {vaddr:#x} (len={len})")]
    OutOfBounds { vaddr: u64, len: u32 },
}

/// Zeroed, alignment-constrained DMA buffers plus the byte access the harness needs to fill and
/// check them.
pub trait DmaAllocator: AddressTranslator {
    fn alloc_zeroed(&mut self, len: u32, align: u32) -> Result<DmaHandle, AllocError>;

    fn free(&mut self, handle: DmaHandle) -> Result<(), AllocError>;

    fn fill(&mut self, handle: DmaHandle, byte: u8) -> Result<(), AllocError>;

    fn read(&self, handle: DmaHandle, out: &mut [u8]) -> Result<(), AllocError>;
}
