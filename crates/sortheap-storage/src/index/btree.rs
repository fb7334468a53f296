//! Per-run B-tree over sort keys.
//!
//! A run is already sorted when it is written, so its tree is built bottom
//! up: one leaf entry per stored tuple (`locator || key`), packed into a
//! chain of leaf pages, then one level of internal entries
//! (`child || first key of child`) per level until a single root remains.
//! The tree only positions a scan; rows are still read from the run.

use std::cmp::Ordering;

use bytes::{Buf, BufMut, Bytes};
use sortheap_common::types::{BlockId, BlockType, RowLocator};

use crate::buffer::BufferPool;
use crate::error::{StorageError, StorageResult};
use crate::page::{max_record_size, PageHeader, SlottedPage};
use crate::row::encoding::{decode_values, encode_values_into, encoded_values_len};
use crate::row::{RowComparator, Value};
use crate::tape::TapeWriter;

const LEAF_PREFIX: usize = RowLocator::ENCODED_SIZE;
const CHILD_PREFIX: usize = 8;

/// Collects the sorted keys of a run and writes its tree.
#[derive(Debug)]
pub struct BTreeBuilder {
    leaves: Vec<Bytes>,
    max_entry: usize,
    oversized: bool,
}

impl BTreeBuilder {
    /// Creates a builder for pages of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Self {
            leaves: Vec::new(),
            max_entry: max_record_size(block_size) / 4,
            oversized: false,
        }
    }

    /// Records the key of the tuple at `locator`. Keys must arrive sorted.
    pub fn add(&mut self, locator: RowLocator, key: &[Value]) {
        if self.oversized {
            return;
        }
        let len = LEAF_PREFIX + encoded_values_len(key);
        if len > self.max_entry {
            // Keys this large would leave a tree too shallow to be useful.
            self.oversized = true;
            self.leaves.clear();
            return;
        }
        let mut entry = Vec::with_capacity(len);
        entry.put_slice(&locator.to_bytes());
        encode_values_into(key, &mut entry);
        self.leaves.push(Bytes::from(entry));
    }

    /// Number of leaf entries collected.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Returns true if nothing will be written.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Writes the tree into the run's tape and returns its root and height,
    /// or `None` when the run gets no tree.
    pub fn finish(
        self,
        writer: &mut TapeWriter<'_>,
        fill_percent: u8,
    ) -> StorageResult<Option<(BlockId, u16)>> {
        if self.oversized || self.leaves.is_empty() {
            return Ok(None);
        }
        let mut records = self.leaves;
        let mut prefix = LEAF_PREFIX;
        let mut pages = writer.write_chain(BlockType::BTreeLeaf, &records, fill_percent)?;
        let mut height = 1u16;
        while pages.len() > 1 {
            let level: Vec<Bytes> = pages
                .iter()
                .map(|(block, first)| {
                    let key = &records[*first][prefix..];
                    let mut entry = Vec::with_capacity(CHILD_PREFIX + key.len());
                    entry.put_u64_le(block.as_u64());
                    entry.put_slice(key);
                    Bytes::from(entry)
                })
                .collect();
            records = level;
            prefix = CHILD_PREFIX;
            pages = writer.write_chain(BlockType::BTreeInternal, &records, fill_percent)?;
            height += 1;
        }
        Ok(Some((pages[0].0, height)))
    }
}

/// Read access to one run's tree.
#[derive(Debug, Clone, Copy)]
pub struct BTree<'a> {
    pool: &'a BufferPool,
    comparator: &'a RowComparator,
    root: BlockId,
}

impl<'a> BTree<'a> {
    /// Opens the tree rooted at `root`.
    pub fn open(pool: &'a BufferPool, comparator: &'a RowComparator, root: BlockId) -> Self {
        Self {
            pool,
            comparator,
            root,
        }
    }

    /// First entry whose key is `>= prefix` (`> prefix` when not
    /// inclusive), comparing on the columns `prefix` covers.
    pub fn find_first(&self, prefix: &[Value], inclusive: bool) -> StorageResult<Option<RowLocator>> {
        // Descend into the last child whose first key lies strictly before
        // the first qualifying key.
        let before = |ord: Ordering| if inclusive { ord.is_lt() } else { ord.is_le() };
        let Some((leaf, page)) = self.descend(prefix, before)? else {
            return Ok(None);
        };
        let slotted = SlottedPage::new(&page[..]);
        let count = slotted.slot_count();
        let mut lo = 0u16;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if before(self.compare_entry(&slotted, mid, LEAF_PREFIX, prefix, leaf)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < count {
            return Ok(Some(leaf_locator(slotted.record(lo)?, leaf)?));
        }
        let next = PageHeader::new(&page[..]).next();
        if !next.is_valid() {
            return Ok(None);
        }
        let page = self.pool.read_typed(next, BlockType::BTreeLeaf)?;
        let slotted = SlottedPage::new(&page[..]);
        Ok(Some(leaf_locator(slotted.record(0)?, next)?))
    }

    /// Last entry whose key is `<= prefix` (`< prefix` when not inclusive).
    pub fn find_last(&self, prefix: &[Value], inclusive: bool) -> StorageResult<Option<RowLocator>> {
        let qualifies = |ord: Ordering| if inclusive { ord.is_le() } else { ord.is_lt() };
        let Some((leaf, page)) = self.descend(prefix, qualifies)? else {
            return Ok(None);
        };
        let slotted = SlottedPage::new(&page[..]);
        let mut lo = 0u16;
        let mut hi = slotted.slot_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if qualifies(self.compare_entry(&slotted, mid, LEAF_PREFIX, prefix, leaf)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Ok(None);
        }
        Ok(Some(leaf_locator(slotted.record(lo - 1)?, leaf)?))
    }

    /// Walks from the root to a leaf, at each level taking the last child
    /// whose first key satisfies `take` (the first child if none does).
    fn descend(
        &self,
        prefix: &[Value],
        take: impl Fn(Ordering) -> bool,
    ) -> StorageResult<Option<(BlockId, Bytes)>> {
        let mut block = self.root;
        loop {
            let guard = self.pool.read(block)?;
            let page = Bytes::copy_from_slice(&guard);
            drop(guard);
            match PageHeader::new(&page[..]).block_type() {
                Some(BlockType::BTreeLeaf) => {
                    let slotted = SlottedPage::new(&page[..]);
                    if slotted.slot_count() == 0 {
                        return Err(StorageError::corrupted(block, "empty b-tree leaf"));
                    }
                    return Ok(Some((block, page)));
                }
                Some(BlockType::BTreeInternal) => {
                    let slotted = SlottedPage::new(&page[..]);
                    let mut lo = 0u16;
                    let mut hi = slotted.slot_count();
                    while lo < hi {
                        let mid = lo + (hi - lo) / 2;
                        if take(self.compare_entry(&slotted, mid, CHILD_PREFIX, prefix, block)?) {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    let child = lo.saturating_sub(1);
                    let mut record = slotted.record(child)?;
                    if record.len() < CHILD_PREFIX {
                        return Err(StorageError::corrupted(block, "short b-tree entry"));
                    }
                    block = BlockId::new(record.get_u64_le());
                }
                _ => {
                    return Err(StorageError::corrupted(block, "expected a b-tree page"));
                }
            }
        }
    }

    /// Compares the key of entry `slot` against `prefix`.
    fn compare_entry(
        &self,
        page: &SlottedPage<&[u8]>,
        slot: u16,
        skip: usize,
        prefix: &[Value],
        block: BlockId,
    ) -> StorageResult<Ordering> {
        let record = page.record(slot)?;
        if record.len() < skip {
            return Err(StorageError::corrupted(block, "short b-tree entry"));
        }
        let key = decode_values(&record[skip..])?;
        Ok(self.comparator.compare_keys(&key, prefix))
    }
}

fn leaf_locator(record: &[u8], block: BlockId) -> StorageResult<RowLocator> {
    RowLocator::from_bytes(record)
        .ok_or_else(|| StorageError::corrupted(block, "short b-tree leaf entry"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{SortKey, SortKeyColumn};
    use crate::tape::tests::{create_tape, setup, TXN};
    use crate::tape::{RunMeta, RunOrigin, Tape};
    use sortheap_common::types::TxnId;

    fn locator(i: u64) -> RowLocator {
        RowLocator::new(BlockId::new(1000 + i / 100), (i % 100) as u16)
    }

    /// Builds a tree over key `(i / dup)` for `i` in `0..n` and commits it
    /// inside an otherwise empty run.
    fn build(pool: &BufferPool, tape: &Tape<'_>, n: u64, dup: u64, fill: u8) -> (BlockId, u16) {
        let mut builder = BTreeBuilder::new(pool.block_size());
        for i in 0..n {
            builder.add(locator(i), &[Value::Int((i / dup) as i64)]);
        }
        let mut writer = tape.begin_run(TXN).unwrap();
        let root = builder.finish(&mut writer, fill).unwrap().unwrap();
        let mut mtr = pool.begin(TXN).unwrap();
        writer
            .finish(&mut mtr, RunMeta::new(RunOrigin::Dump, 0, TxnId::MIN))
            .unwrap();
        mtr.commit().unwrap();
        root
    }

    #[test]
    fn test_multi_level_search() {
        let (pool, alloc) = setup();
        let tape = Tape::open(&pool, alloc, create_tape(&pool, &alloc, 4, 64));
        let cmp = RowComparator::new(SortKey::new(vec![SortKeyColumn::asc(0)]));
        let (root, height) = build(&pool, &tape, 3000, 3, 90);
        assert!(height >= 2);
        let tree = BTree::open(&pool, &cmp, root);

        // Key k covers entries 3k..3k+2.
        let key = |k: i64| vec![Value::Int(k)];
        assert_eq!(tree.find_first(&key(500), true).unwrap(), Some(locator(1500)));
        assert_eq!(tree.find_first(&key(500), false).unwrap(), Some(locator(1503)));
        assert_eq!(tree.find_last(&key(500), true).unwrap(), Some(locator(1502)));
        assert_eq!(tree.find_last(&key(500), false).unwrap(), Some(locator(1499)));

        assert_eq!(tree.find_first(&key(-5), true).unwrap(), Some(locator(0)));
        assert_eq!(tree.find_first(&key(999), false).unwrap(), None);
        assert_eq!(tree.find_last(&key(0), false).unwrap(), None);
        assert_eq!(tree.find_last(&key(5000), true).unwrap(), Some(locator(2999)));
    }

    #[test]
    fn test_search_matches_linear_scan() {
        let (pool, alloc) = setup();
        let tape = Tape::open(&pool, alloc, create_tape(&pool, &alloc, 4, 64));
        let cmp = RowComparator::new(SortKey::new(vec![SortKeyColumn::asc(0)]));
        let n = 1200u64;
        let dup = 7u64;
        let (root, _) = build(&pool, &tape, n, dup, 50);
        let tree = BTree::open(&pool, &cmp, root);

        for target in (-2..(n / dup) as i64 + 2).step_by(5) {
            let keys: Vec<i64> = (0..n).map(|i| (i / dup) as i64).collect();
            let first_ge = keys.iter().position(|k| *k >= target).map(|i| locator(i as u64));
            let first_gt = keys.iter().position(|k| *k > target).map(|i| locator(i as u64));
            let last_le = keys.iter().rposition(|k| *k <= target).map(|i| locator(i as u64));
            let last_lt = keys.iter().rposition(|k| *k < target).map(|i| locator(i as u64));
            let key = [Value::Int(target)];
            assert_eq!(tree.find_first(&key, true).unwrap(), first_ge, "target {target}");
            assert_eq!(tree.find_first(&key, false).unwrap(), first_gt, "target {target}");
            assert_eq!(tree.find_last(&key, true).unwrap(), last_le, "target {target}");
            assert_eq!(tree.find_last(&key, false).unwrap(), last_lt, "target {target}");
        }
    }

    #[test]
    fn test_oversized_keys_skip_tree() {
        let (pool, alloc) = setup();
        let tape = Tape::open(&pool, alloc, create_tape(&pool, &alloc, 4, 16));
        let mut builder = BTreeBuilder::new(pool.block_size());
        builder.add(locator(0), &[Value::from("small")]);
        builder.add(locator(1), &[Value::Text("k".repeat(2000))]);
        builder.add(locator(2), &[Value::from("zzz")]);
        assert!(builder.is_empty());
        let mut writer = tape.begin_run(TXN).unwrap();
        assert_eq!(builder.finish(&mut writer, 90).unwrap(), None);
    }
}
