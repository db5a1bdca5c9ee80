use thiserror::Error;

/// Errors raised while assembling a [`crate::SegmentList`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SglError {
    #[error("segment list is full ({capacity} segments)")]
    CapacityExceeded { capacity: usize },

    #[error("segment {index} has zero length")]
    EmptySegment { index: usize },

    #[error("total transfer length overflows 32 bits")]
    LengthOverflow,
}
