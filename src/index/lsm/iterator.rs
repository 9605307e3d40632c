use crate::error::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type KvIterator<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

struct HeapEntry<'a> {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
    iterator: KvIterator<'a>,
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    // BinaryHeap is a max-heap: smallest key first, then lowest source.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sorted sources into one sorted stream. When several sources hold
/// the same key, the one listed first wins and the others are skipped.
pub struct MergeIterator<'a> {
    heap: BinaryHeap<HeapEntry<'a>>,
    latest_key: Option<Vec<u8>>,
    failed: Option<crate::Error>,
}

impl<'a> MergeIterator<'a> {
    pub fn new(iterators: Vec<KvIterator<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::new(),
            latest_key: None,
            failed: None,
        };
        for (source, iterator) in iterators.into_iter().enumerate() {
            merge.advance(source, iterator);
        }
        merge
    }

    fn advance(&mut self, source: usize, mut iterator: KvIterator<'a>) {
        match iterator.next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source,
                iterator,
            }),
            Some(Err(e)) => {
                self.failed.get_or_insert(e);
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.failed.take() {
                self.heap.clear();
                return Some(Err(e));
            }
            let entry = self.heap.pop()?;
            let HeapEntry {
                key,
                value,
                source,
                iterator,
            } = entry;
            self.advance(source, iterator);

            if self.latest_key.as_ref() == Some(&key) {
                continue;
            }
            self.latest_key = Some(key.clone());
            return Some(Ok((key, value)));
        }
    }
}
