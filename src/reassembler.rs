//! Ordered outbox reassembler: accepts out-of-order `(index, bytes)` pairs from the
//! compressor/cipher worker pools and releases them strictly in index order.

use std::collections::BTreeMap;

/// Accepts `(index, bytes)` pairs in arbitrary order and yields them back in strictly increasing
/// index order, with no gaps and no duplicates.
#[derive(Debug, Default)]
pub struct Reassembler {
    next_index: u64,
    pending: BTreeMap<u64, Vec<u8>>,
}

impl Reassembler {
    /// Creates a reassembler starting at index 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_index: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Submits a completed work item. Returns every blob that is now releasable, in order
    /// (possibly more than one, if this item fills a gap that unblocks already-parked items;
    /// possibly zero, if this item is still ahead of `next_index`).
    ///
    /// A worker failure for a given index is represented by passing an empty `Vec` -- the index
    /// is still consumed and released in order, just with zero bytes, rather than left as a
    /// permanent gap that would stall every later index behind it.
    pub fn submit(&mut self, index: u64, bytes: Vec<u8>) -> Vec<Vec<u8>> {
        if index < self.next_index {
            // duplicate or already-released index; ignore defensively rather than panic.
            return Vec::new();
        }
        self.pending.insert(index, bytes);

        let mut released = Vec::new();
        while let Some(bytes) = self.pending.remove(&self.next_index) {
            self.next_index += 1;
            if !bytes.is_empty() {
                released.push(bytes);
            }
        }
        released
    }

    /// The next index this reassembler is waiting to release.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Number of items parked ahead of `next_index`, awaiting earlier items.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn releases_in_order_regardless_of_arrival_order() {
        let mut items: Vec<(u64, Vec<u8>)> = (0..50).map(|i| (i, vec![i as u8])).collect();
        items.shuffle(&mut rand::rng());

        let mut reassembler = Reassembler::new();
        let mut released = Vec::new();
        for (index, bytes) in items {
            released.extend(reassembler.submit(index, bytes));
        }

        let expected: Vec<Vec<u8>> = (0..50).map(|i| vec![i as u8]).collect();
        assert_eq!(released, expected);
        assert_eq!(reassembler.next_index(), 50);
        assert_eq!(reassembler.pending_len(), 0);
    }

    #[test]
    fn empty_blob_still_consumes_its_index() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.submit(0, vec![1]), vec![vec![1]]);
        assert_eq!(reassembler.submit(1, vec![]), Vec::<Vec<u8>>::new());
        assert_eq!(reassembler.submit(2, vec![2]), vec![vec![2]]);
        assert_eq!(reassembler.next_index(), 3);
    }

    #[test]
    fn holds_gaps_until_filled() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.submit(2, vec![2]).is_empty());
        assert!(reassembler.submit(1, vec![1]).is_empty());
        assert_eq!(reassembler.pending_len(), 2);
        assert_eq!(reassembler.submit(0, vec![0]), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(reassembler.pending_len(), 0);
    }
}
