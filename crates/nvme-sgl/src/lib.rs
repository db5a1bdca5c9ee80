//! Scatter-gather plumbing shared by the NVMe round-trip harness and the devices it drives.
//!
//! A vectored NVMe command does not carry its buffers directly. Instead the driver pulls
//! physically-contiguous spans out of a caller-supplied cursor while it builds PRP entries:
//!
//! - [`SgCursor::reset`] seeks to a byte offset inside the transfer (called once per command, so
//!   a transfer split across several commands resumes mid-segment)
//! - [`SgCursor::next_span`] yields one span at a time until the terminal [`PhysSpan::END`]
//!
//! [`SegmentCursor`] is the cursor over a [`SegmentList`]. The other traits in [`device`] describe
//! the capabilities the harness consumes from the storage driver and DMA allocator.

#![forbid(unsafe_code)]

mod cursor;
pub mod device;
mod error;
mod segment;
mod translate;

pub use cursor::{PhysSpan, SegmentCursor, SgCursor};
pub use device::{
    AllocError, CompletionCallback, DmaAllocator, DmaHandle, IoCompletion, IoDevice,
    NamespaceInfo, SubmitError,
};
pub use error::SglError;
pub use segment::{Segment, SegmentList, MAX_SEGMENTS};
pub use translate::{AddressTranslator, IdentityTranslator, OffsetTranslator};

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;
