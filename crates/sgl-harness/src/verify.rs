use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nvme_sgl::{
    CompletionCallback, DmaAllocator, IoCompletion, IoDevice, NamespaceInfo, SubmitError,
};
use serde::Serialize;
use thiserror::Error;

use crate::request::{RequestBuffers, ShapeError};
use crate::shapes::RequestShape;

/// Byte every request buffer is filled with before the write.
pub const DATA_PATTERN: u8 = 0x5a;

/// First LBA touched by every round trip.
pub const BASE_LBA_START: u64 = 0x10_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    pub pattern: u8,
    pub base_lba: u64,
    /// How long to poll for one completion before giving up on the command.
    pub completion_timeout: Duration,
    /// `max_completions` handed to each `process_completions` call.
    pub poll_batch: u32,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            pattern: DATA_PATTERN,
            base_lba: BASE_LBA_START,
            completion_timeout: Duration::from_secs(5),
            poll_batch: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoDirection {
    Write,
    Read,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IoDirection::Write => "writev",
            IoDirection::Read => "readv",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The allocator never produced the buffer placement the shape needs.
    AllocationConstraint,
    /// The request would run past the end of the namespace.
    CapacityExceeded { lba_end: u64, namespace_blocks: u64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AllocationConstraint => f.write_str("allocation constraint not met"),
            SkipReason::CapacityExceeded {
                lba_end,
                namespace_blocks,
            } => write!(
                f,
                "needs LBAs up to {lba_end:#x}, namespace has {namespace_blocks:#x}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeOutcome {
    Passed,
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("device has no usable namespace")]
    NamespaceUnavailable,

    #[error("request setup failed: {0}")]
    Setup(#[from] ShapeError),

    #[error("{op} Failed: {source}")]
    Submit { op: IoDirection, source: SubmitError },

    #[error("{op} Failed: sct={:#x} sc={:#x}", .status.sct, .status.sc)]
    Completion { op: IoDirection, status: IoCompletion },

    #[error("{op} Failed: no completion within {waited:?}")]
    Timeout { op: IoDirection, waited: Duration },

    #[error(
        "Write/Read Success, But Memcmp Failed: segment {segment} byte {offset:#x} \
         expected {expected:#04x} found {found:#04x}"
    )]
    DataMismatch {
        segment: usize,
        offset: usize,
        expected: u8,
        found: u8,
    },
}

/// Receives the completion of one in-flight command.
///
/// The callback handed to the device holds a clone, so the slot stays valid however long the
/// device keeps the command.
#[derive(Debug, Clone, Default)]
pub struct CompletionSlot {
    state: Rc<Cell<Option<IoCompletion>>>,
}

impl CompletionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> CompletionCallback {
        let state = self.state.clone();
        Box::new(move |cpl: &IoCompletion| state.set(Some(*cpl)))
    }

    pub fn get(&self) -> Option<IoCompletion> {
        self.state.get()
    }
}

/// Runs one write-then-read round trip of `shape` against the device's default namespace.
pub fn writev_readv(
    device: &mut dyn IoDevice,
    alloc: &mut dyn DmaAllocator,
    shape: &RequestShape,
    opts: &VerifyOptions,
) -> Result<ShapeOutcome, VerifyError> {
    let ns = device
        .default_namespace()
        .filter(|ns| ns.sector_size != 0)
        .ok_or(VerifyError::NamespaceUnavailable)?;

    let mut req = RequestBuffers::new(alloc);
    let len = (shape.build)(&mut req)?;
    if len == 0 {
        return Ok(ShapeOutcome::Skipped(SkipReason::AllocationConstraint));
    }
    // Whole blocks only: a sub-block tail is never transferred and shows up in the compare, and a
    // request smaller than one block goes to the device as a zero-block command.
    let lba_count = len / ns.sector_size;
    let lba_end = opts.base_lba + u64::from(lba_count);
    if lba_end > ns.size_blocks {
        return Ok(ShapeOutcome::Skipped(SkipReason::CapacityExceeded {
            lba_end,
            namespace_blocks: ns.size_blocks,
        }));
    }

    req.fill(opts.pattern).map_err(ShapeError::from)?;
    submit_and_wait(device, &req, &ns, lba_count, IoDirection::Write, opts)?;

    req.fill(0).map_err(ShapeError::from)?;
    submit_and_wait(device, &req, &ns, lba_count, IoDirection::Read, opts)?;

    if let Some(m) = req.find_mismatch(opts.pattern).map_err(ShapeError::from)? {
        return Err(VerifyError::DataMismatch {
            segment: m.segment,
            offset: m.offset,
            expected: opts.pattern,
            found: m.found,
        });
    }
    Ok(ShapeOutcome::Passed)
}

fn submit_and_wait(
    device: &mut dyn IoDevice,
    req: &RequestBuffers<'_>,
    ns: &NamespaceInfo,
    lba_count: u32,
    op: IoDirection,
    opts: &VerifyOptions,
) -> Result<(), VerifyError> {
    let slot = CompletionSlot::new();
    // Each submission walks the segments from the start.
    let mut cursor = req.cursor();
    let submitted = match op {
        IoDirection::Write => {
            device.submit_writev(ns.id, opts.base_lba, lba_count, slot.callback(), &mut cursor)
        }
        IoDirection::Read => {
            device.submit_readv(ns.id, opts.base_lba, lba_count, slot.callback(), &mut cursor)
        }
    };
    submitted.map_err(|source| VerifyError::Submit { op, source })?;

    let cpl = wait_for_completion(device, &slot, opts)
        .ok_or(VerifyError::Timeout {
            op,
            waited: opts.completion_timeout,
        })?;
    if cpl.is_error() {
        return Err(VerifyError::Completion { op, status: cpl });
    }
    Ok(())
}

fn wait_for_completion(
    device: &mut dyn IoDevice,
    slot: &CompletionSlot,
    opts: &VerifyOptions,
) -> Option<IoCompletion> {
    let deadline = Instant::now() + opts.completion_timeout;
    loop {
        device.process_completions(opts.poll_batch);
        if let Some(cpl) = slot.get() {
            return Some(cpl);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::hint::spin_loop();
    }
}
