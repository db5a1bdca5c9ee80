//! The six request shapes exercised against every device.
//!
//! Each builder fills a [`RequestBuffers`] with freshly allocated, zeroed segments and returns the
//! total byte count. A return of 0 means the allocator could not produce the layout the shape
//! needs; the caller treats that as a skip rather than a failure.

use crate::request::{RequestBuffers, ShapeError};

pub type BuildRequestFn = fn(&mut RequestBuffers<'_>) -> Result<u32, ShapeError>;

#[derive(Debug, Clone, Copy)]
pub struct RequestShape {
    pub id: u8,
    pub name: &'static str,
    pub build: BuildRequestFn,
}

pub const SHAPES: [RequestShape; 6] = [
    RequestShape {
        id: 1,
        name: "misaligned-first-segment",
        build: misaligned_first_segment,
    },
    RequestShape {
        id: 2,
        name: "many-segments",
        build: many_segments,
    },
    RequestShape {
        id: 3,
        name: "single-8k",
        build: single_8k,
    },
    RequestShape {
        id: 4,
        name: "two-4k",
        build: two_4k,
    },
    RequestShape {
        id: 5,
        name: "single-256k",
        build: single_256k,
    },
    RequestShape {
        id: 6,
        name: "single-512",
        build: single_512,
    },
];

pub fn by_id(id: u8) -> Option<&'static RequestShape> {
    SHAPES.iter().find(|shape| shape.id == id)
}

const MISALIGN_ATTEMPTS: usize = 8;
const HALF_PAGE: u32 = 0x800;

/// 2 KiB ending on a page boundary, then 4 KiB and 12 KiB page-aligned.
///
/// The first buffer must sit in the upper half of a page, which an allocator only produces by
/// chance; up to eight half-page-aligned candidates are tried.
pub fn misaligned_first_segment(req: &mut RequestBuffers<'_>) -> Result<u32, ShapeError> {
    let mut found = None;
    for _ in 0..MISALIGN_ATTEMPTS {
        let candidate = req.alloc_scratch(HALF_PAGE, HALF_PAGE)?;
        if candidate.vaddr & u64::from(HALF_PAGE) != 0 {
            found = Some(candidate);
            break;
        }
    }
    let Some(first) = found else {
        req.release_scratch();
        tracing::debug!("no candidate landed in the upper half of a page");
        return Ok(0);
    };
    req.promote(first)?;
    req.release_scratch();

    req.push_new(0x1000, 0x1000)?;
    req.push_new(0x3000, 0x1000)?;
    Ok(req.total_len())
}

/// 4 KiB followed by 31 x 8 KiB, all page-aligned (252 KiB).
pub fn many_segments(req: &mut RequestBuffers<'_>) -> Result<u32, ShapeError> {
    req.push_new(0x1000, 0x1000)?;
    for _ in 1..32 {
        req.push_new(0x2000, 0x1000)?;
    }
    Ok(req.total_len())
}

pub fn single_8k(req: &mut RequestBuffers<'_>) -> Result<u32, ShapeError> {
    req.push_new(0x2000, 0x1000)?;
    Ok(req.total_len())
}

pub fn two_4k(req: &mut RequestBuffers<'_>) -> Result<u32, ShapeError> {
    req.push_new(0x1000, 0x1000)?;
    req.push_new(0x1000, 0x1000)?;
    Ok(req.total_len())
}

pub fn single_256k(req: &mut RequestBuffers<'_>) -> Result<u32, ShapeError> {
    req.push_new(0x40000, 0x1000)?;
    Ok(req.total_len())
}

/// One 512-byte buffer, only 512-byte aligned, so it may start anywhere inside a page.
pub fn single_512(req: &mut RequestBuffers<'_>) -> Result<u32, ShapeError> {
    req.push_new(0x200, 0x200)?;
    Ok(req.total_len())
}
