//! Offset-ordered buffer of received segments.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::segment::Segment;

/// Heap entry ordering segments so the smallest offset sits on top.
/// Among equal offsets the empty segment comes first.
#[derive(Debug)]
struct Entry(Segment);

impl Entry {
    fn key(&self) -> (u64, u64) {
        (self.0.header.offset_count, self.0.header.byte_count)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Received segments pending delivery, ordered by offset.
///
/// The queue does no locking of its own; the reader keeps it behind the
/// mutex it shares with its workers.
#[derive(Debug, Default)]
pub struct SegmentQueue {
    heap: BinaryHeap<Entry>,
}

impl SegmentQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment.
    pub fn push(&mut self, segment: Segment) {
        self.heap.push(Entry(segment));
    }

    /// Removes the segment with the smallest offset.
    pub fn pop(&mut self) -> Option<Segment> {
        self.heap.pop().map(|e| e.0)
    }

    /// The segment with the smallest offset, left in place.
    pub fn peek(&self) -> Option<&Segment> {
        self.heap.peek().map(|e| &e.0)
    }

    /// Number of queued segments.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops every queued segment.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_offset_order() {
        let mut queue = SegmentQueue::new();
        queue.push(Segment::new(b"IJKL".to_vec(), 8, 0));
        queue.push(Segment::new(b"ABCD".to_vec(), 0, 0));
        queue.push(Segment::new(b"EFGH".to_vec(), 4, 0));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.peek().map(|s| s.offset()), Some(0));
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|s| s.offset())
            .collect();
        assert_eq!(order, vec![0, 4, 8]);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn empty_segment_wins_ties() {
        let mut queue = SegmentQueue::new();
        queue.push(Segment::new(b"MNOP".to_vec(), 12, 0));
        queue.push(Segment::end_of_data(12));
        assert!(queue.pop().unwrap().is_end_of_data());
        assert_eq!(queue.pop().unwrap().data, b"MNOP");
    }

    #[test]
    fn clear_discards_everything() {
        let mut queue = SegmentQueue::new();
        queue.push(Segment::end_of_data(0));
        queue.push(Segment::end_of_data(0));
        queue.clear();
        assert_eq!(queue.len(), 0);
        assert!(queue.peek().is_none());
    }
}
