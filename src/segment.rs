use anyhow::bail;
use bit_set::BitSet;
use bytes::{Bytes, BytesMut};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Splits a serialized (and encrypted) message into segments of at most `max_segment_len` bytes.
///  An empty payload yields a single empty segment, so every message has at least one packet.
#[derive(Debug)]
pub struct Segmenter {
    segments: Vec<Bytes>,
}
impl Segmenter {
    pub fn new(payload: Bytes, max_segment_len: usize) -> anyhow::Result<Segmenter> {
        if max_segment_len == 0 {
            bail!("segment length must be positive");
        }

        let count = payload.len().div_ceil(max_segment_len).max(1);
        if count > u32::MAX as usize {
            bail!("message of {} bytes requires too many segments", payload.len());
        }

        let segments = (0..count)
            .map(|i| payload.slice(i * max_segment_len..payload.len().min((i + 1) * max_segment_len)))
            .collect();
        Ok(Segmenter { segments })
    }

    pub fn count(&self) -> u32 {
        self.segments.len().prechecked_cast()
    }

    pub fn get(&self, index: u32) -> Option<&Bytes> {
        self.segments.get(SafeCast::<usize>::safe_cast(index))
    }
}

/// Collects the segments of one inbound message. Segments are stored by position so they can
///  arrive in any order, and a duplicate segment simply replaces the earlier copy.
#[derive(Debug)]
pub struct Reassembler {
    segments: Vec<Option<Bytes>>,
    received: BitSet,
}
impl Reassembler {
    pub fn new(count: u32, max_segments: usize) -> anyhow::Result<Reassembler> {
        let count: usize = count.safe_cast();
        if count == 0 {
            bail!("segment count must be positive");
        }
        if count > max_segments {
            bail!("segment count {} exceeds the maximum of {}", count, max_segments);
        }

        Ok(Reassembler {
            segments: vec![None; count],
            received: BitSet::with_capacity(count),
        })
    }

    pub fn count(&self) -> u32 {
        self.segments.len().prechecked_cast()
    }

    /// returns `true` if the segment was not received before
    pub fn insert(&mut self, index: u32, count: u32, body: Bytes) -> anyhow::Result<bool> {
        if count != self.count() {
            bail!("segment count {} does not match the message's count {}", count, self.count());
        }
        let index: usize = index.safe_cast();
        if index >= self.segments.len() {
            bail!("segment {} is out of range", index);
        }

        self.segments[index] = Some(body);
        Ok(self.received.insert(index))
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.segments.len()
    }

    /// indices below `end` that were not received yet, in ascending order
    pub fn missing_below(&self, end: u32) -> Vec<u32> {
        let end = self.count().min(end);
        (0..end)
            .filter(|&i| !self.received.contains(i.safe_cast()))
            .collect()
    }

    /// the concatenated segments, or `None` while segments are missing
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        let len: usize = self.segments.iter().flatten().map(|s| s.len()).sum();
        let mut result = BytesMut::with_capacity(len);
        for segment in self.segments.iter().flatten() {
            result.extend_from_slice(segment);
        }
        Some(result.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[rstest]
    #[case::empty(0, 10, 1)]
    #[case::single_byte(1, 10, 1)]
    #[case::exact_fit(10, 10, 1)]
    #[case::one_more(11, 10, 2)]
    #[case::several(95, 10, 10)]
    #[case::message(30_160, 988, 31)]
    fn test_segment_count(#[case] len: usize, #[case] max_segment_len: usize, #[case] expected: u32) {
        let segmenter = Segmenter::new(payload(len), max_segment_len).unwrap();
        assert_eq!(segmenter.count(), expected);
        for i in 0..expected {
            assert!(segmenter.get(i).unwrap().len() <= max_segment_len);
        }
        assert!(segmenter.get(expected).is_none());
    }

    #[test]
    fn test_zero_segment_len() {
        assert!(Segmenter::new(payload(10), 0).is_err());
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::reversed(vec![4, 3, 2, 1, 0])]
    #[case::shuffled(vec![3, 0, 4, 2, 1])]
    #[case::duplicates(vec![0, 0, 3, 1, 3, 2, 4, 4])]
    fn test_reassemble(#[case] order: Vec<u32>) {
        let original = payload(45);
        let segmenter = Segmenter::new(original.clone(), 10).unwrap();
        let mut reassembler = Reassembler::new(segmenter.count(), 100).unwrap();

        for &i in &order {
            reassembler.insert(i, segmenter.count(), segmenter.get(i).unwrap().clone()).unwrap();
        }
        assert!(reassembler.is_complete());
        assert_eq!(reassembler.assemble(), Some(original));
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut reassembler = Reassembler::new(3, 10).unwrap();
        assert!(reassembler.insert(1, 3, Bytes::from_static(b"bb")).unwrap());
        assert!(!reassembler.insert(1, 3, Bytes::from_static(b"bb")).unwrap());
        assert_eq!(reassembler.received_count(), 1);
        assert!(reassembler.assemble().is_none());
    }

    #[test]
    fn test_missing_below() {
        let mut reassembler = Reassembler::new(8, 10).unwrap();
        for i in [0, 3, 4, 7] {
            reassembler.insert(i, 8, Bytes::from_static(b"x")).unwrap();
        }
        assert_eq!(reassembler.missing_below(7), vec![1, 2, 5, 6]);
        assert_eq!(reassembler.missing_below(3), vec![1, 2]);
        assert_eq!(reassembler.missing_below(100), vec![1, 2, 5, 6]);
        assert!(reassembler.missing_below(1).is_empty());
    }

    #[rstest]
    #[case::zero_count(0, 10)]
    #[case::too_many(11, 10)]
    fn test_new_rejects(#[case] count: u32, #[case] max_segments: usize) {
        assert!(Reassembler::new(count, max_segments).is_err());
    }

    #[rstest]
    #[case::count_mismatch(1, 4)]
    #[case::out_of_range(3, 3)]
    fn test_insert_rejects(#[case] index: u32, #[case] count: u32) {
        let mut reassembler = Reassembler::new(3, 10).unwrap();
        assert!(reassembler.insert(index, count, Bytes::from_static(b"x")).is_err());
        assert_eq!(reassembler.received_count(), 0);
    }
}
