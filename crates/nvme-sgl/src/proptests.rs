use crate::{IdentityTranslator, PhysSpan, Segment, SegmentCursor, SegmentList, SgCursor};
use proptest::prelude::*;

const MAX_SEGS: usize = 24;
const MAX_SEG_LEN: u32 = 0x3000;
const MAX_GAP: u64 = 0x1000;

/// Segments laid out in a flat "memory" with gaps between them, plus that memory's contents.
#[derive(Debug, Clone)]
struct Layout {
    list: SegmentList,
    memory: Vec<u8>,
}

impl Layout {
    fn stream(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.list.total_len() as usize);
        for seg in &self.list {
            let start = seg.base as usize;
            out.extend_from_slice(&self.memory[start..start + seg.len as usize]);
        }
        out
    }

    fn span_bytes(&self, span: PhysSpan) -> &[u8] {
        let start = span.addr as usize;
        &self.memory[start..start + span.len as usize]
    }
}

fn layout_strategy() -> impl Strategy<Value = Layout> {
    prop::collection::vec((1u32..=MAX_SEG_LEN, 0u64..=MAX_GAP), 0..=MAX_SEGS).prop_map(|shape| {
        let mut base = 0u64;
        let mut segments = Vec::with_capacity(shape.len());
        for (len, gap) in shape {
            base += gap;
            segments.push(Segment::new(base, len));
            base += u64::from(len);
        }
        let memory = (0..base).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect();
        Layout {
            list: SegmentList::from_segments(segments).unwrap(),
            memory,
        }
    })
}

fn layout_and_offset() -> impl Strategy<Value = (Layout, u32)> {
    layout_strategy().prop_flat_map(|layout| {
        let total = layout.list.total_len();
        let boundaries: Vec<u32> = layout
            .list
            .iter()
            .scan(0u32, |acc, seg| {
                let start = *acc;
                *acc += seg.len;
                Some(start)
            })
            .chain(std::iter::once(total))
            .collect();
        let offset = prop_oneof![
            3 => 0u32..=total,
            1 => prop::sample::select(boundaries),
        ];
        (Just(layout), offset)
    })
}

fn drain(cursor: &mut impl SgCursor, limit: usize) -> Vec<PhysSpan> {
    let mut spans = Vec::new();
    for _ in 0..limit {
        let span = cursor.next_span();
        if span.is_end() {
            return spans;
        }
        spans.push(span);
    }
    panic!("cursor did not terminate within {limit} spans");
}

proptest! {
    #[test]
    fn resume_yields_exact_tail((layout, offset) in layout_and_offset()) {
        let mut cursor = SegmentCursor::new(&layout.list, &IdentityTranslator);
        cursor.reset(offset);

        let spans = drain(&mut cursor, MAX_SEGS + 1);
        let total: u64 = spans.iter().map(|s| u64::from(s.len)).sum();
        prop_assert_eq!(total, u64::from(layout.list.total_len() - offset));

        let mut bytes = Vec::new();
        for span in &spans {
            bytes.extend_from_slice(layout.span_bytes(*span));
        }
        let stream = layout.stream();
        prop_assert_eq!(bytes.as_slice(), &stream[offset as usize..]);
    }

    #[test]
    fn each_span_consumes_exactly_one_segment((layout, offset) in layout_and_offset()) {
        let mut cursor = SegmentCursor::new(&layout.list, &IdentityTranslator);
        cursor.reset(offset);
        let start = cursor.current_index();

        let mut expected_index = start;
        loop {
            let span = cursor.next_span();
            if span.is_end() {
                break;
            }
            expected_index += 1;
            prop_assert_eq!(cursor.current_index(), expected_index);
            if expected_index - 1 > start {
                // Only the first span after a reset may be partial.
                let seg = layout.list.get(expected_index - 1).unwrap();
                prop_assert_eq!(span, PhysSpan { addr: seg.base, len: seg.len });
            }
        }
        prop_assert_eq!(expected_index, layout.list.len());
    }

    #[test]
    fn exhausted_cursor_stays_exhausted(layout in layout_strategy(), extra in 1usize..8) {
        let mut cursor = SegmentCursor::new(&layout.list, &IdentityTranslator);
        cursor.reset(0);
        drain(&mut cursor, MAX_SEGS + 1);
        for _ in 0..extra {
            prop_assert_eq!(cursor.next_span(), PhysSpan::END);
        }
    }

    #[test]
    fn reset_past_end_is_exhausted(layout in layout_strategy(), past in 0u32..0x10000) {
        let mut cursor = SegmentCursor::new(&layout.list, &IdentityTranslator);
        cursor.reset(layout.list.total_len().saturating_add(past));
        prop_assert!(cursor.is_exhausted());
        prop_assert_eq!(cursor.next_span(), PhysSpan::END);
    }
}
