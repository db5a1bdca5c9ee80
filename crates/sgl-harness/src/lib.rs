//! Vectored write/read round-trip checks for NVMe scatter-gather I/O.
//!
//! For every device and every [`RequestShape`], [`writev_readv`] builds a segment list, fills it
//! with a pattern, writes it through a [`nvme_sgl::SegmentCursor`], clears it, reads it back
//! through a freshly reset cursor and compares. [`run_device`] drives the whole shape matrix for
//! one device and collects a [`DeviceReport`].

#![forbid(unsafe_code)]

mod report;
mod request;
mod runner;
pub mod shapes;
mod verify;

pub use report::{
    DeviceError, DeviceReport, FailureKind, RunSummary, ShapeReport, ShapeStatus, Totals,
};
pub use request::{Mismatch, RequestBuffers, ShapeError};
pub use runner::{run_device, RunOptions};
pub use shapes::{RequestShape, SHAPES};
pub use verify::{
    writev_readv, CompletionSlot, IoDirection, ShapeOutcome, SkipReason, VerifyError,
    VerifyOptions, BASE_LBA_START, DATA_PATTERN,
};
