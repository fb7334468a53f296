//! Run cursors.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sortheap_common::types::{BlockId, BlockType, RowLocator};

use super::run::RunMeta;
use super::tuple::StoredTuple;
use crate::buffer::BufferPool;
use crate::error::{StorageError, StorageResult};
use crate::page::{PageHeader, SlottedPage};

/// Direction of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanDirection {
    /// Ascending key order.
    #[default]
    Forward,
    /// Descending key order.
    Backward,
}

impl ScanDirection {
    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }
}

/// Reads the tuples of one run in one direction.
///
/// The cursor works on a private copy of the current page and holds no
/// latch between calls. Forward reads stop at the end-of-run marker,
/// backward reads after the first tuple of the run.
#[derive(Debug)]
pub struct RunCursor<'a> {
    pool: &'a BufferPool,
    direction: ScanDirection,
    first: RowLocator,
    position: RowLocator,
    page: Option<(BlockId, Bytes)>,
    done: bool,
}

impl<'a> RunCursor<'a> {
    /// Opens a cursor at the start of `run` for `direction`.
    pub fn open(pool: &'a BufferPool, run: &RunMeta, direction: ScanDirection) -> Self {
        let position = match direction {
            ScanDirection::Forward => run.first,
            ScanDirection::Backward => run.last,
        };
        Self {
            pool,
            direction,
            first: run.first,
            position,
            page: None,
            done: !position.is_valid() || (direction == ScanDirection::Backward && run.rows == 0),
        }
    }

    /// Direction of the cursor.
    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    /// Locator of the next tuple to be returned.
    pub fn position(&self) -> RowLocator {
        self.position
    }

    /// Returns true once the run is exhausted.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Moves to `locator`, which must lie inside the run.
    pub fn seek(&mut self, locator: RowLocator) {
        self.position = RowLocator::new(locator.block, locator.slot);
        self.done = !locator.is_valid();
    }

    /// Stops the cursor.
    pub fn exhaust(&mut self) {
        self.done = true;
    }

    fn load(&mut self, block: BlockId) -> StorageResult<Bytes> {
        if let Some((cached, page)) = &self.page {
            if *cached == block {
                return Ok(page.clone());
            }
        }
        let guard = self.pool.read_typed(block, BlockType::Data)?;
        let page = Bytes::copy_from_slice(&guard);
        drop(guard);
        self.page = Some((block, page.clone()));
        Ok(page)
    }

    /// Returns the next tuple, or `None` at the end of the run.
    pub fn next(&mut self) -> StorageResult<Option<StoredTuple>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let block = self.position.block;
            let page = self.load(block)?;
            let slotted = SlottedPage::new(&page[..]);
            let count = slotted.slot_count();

            match self.direction {
                ScanDirection::Forward => {
                    if self.position.slot >= count {
                        let next = PageHeader::new(&page[..]).next();
                        if !next.is_valid() {
                            return Err(StorageError::corrupted(
                                block,
                                "run ends without an end marker",
                            ));
                        }
                        self.position = RowLocator::new(next, 0);
                        continue;
                    }
                    let record = slotted.record(self.position.slot)?;
                    let tuple = StoredTuple::parse(self.position, &page, record)?;
                    self.position.slot += 1;
                    if tuple.is_end() {
                        self.done = true;
                        return Ok(None);
                    }
                    return Ok(Some(tuple));
                }
                ScanDirection::Backward => {
                    let record = slotted.record(self.position.slot)?;
                    let tuple = StoredTuple::parse(self.position, &page, record)?;
                    if self.position == self.first {
                        self.done = true;
                    } else if self.position.slot > 0 {
                        self.position.slot -= 1;
                    } else {
                        let prev = PageHeader::new(&page[..]).prev();
                        if !prev.is_valid() {
                            return Err(StorageError::corrupted(
                                block,
                                "run chain ends before its first tuple",
                            ));
                        }
                        let prev_page = self.load(prev)?;
                        let prev_count = SlottedPage::new(&prev_page[..]).slot_count();
                        if prev_count == 0 {
                            return Err(StorageError::corrupted(prev, "empty data page in run"));
                        }
                        self.position = RowLocator::new(prev, prev_count - 1);
                    }
                    return Ok(Some(tuple));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::tests::{create_tape, setup, write_run};
    use crate::tape::Tape;

    #[test]
    fn test_seek_skips_ahead() {
        let (pool, alloc) = setup();
        let tape = Tape::open(&pool, alloc, create_tape(&pool, &alloc, 4, 16));
        let rows: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_le_bytes().repeat(10)).collect();
        let refs: Vec<&[u8]> = rows.iter().map(|r| r.as_slice()).collect();
        let run = write_run(&tape, &refs);

        let mut all = Vec::new();
        let mut cursor = tape.cursor(&run, ScanDirection::Forward);
        while let Some(tuple) = cursor.next().unwrap() {
            all.push(tuple.locator);
        }
        assert_eq!(all.len(), 200);

        let mut cursor = tape.cursor(&run, ScanDirection::Forward);
        cursor.seek(all[150]);
        let tuple = cursor.next().unwrap().unwrap();
        assert_eq!(tuple.payload.to_vec(), rows[150]);
        assert_eq!(cursor.position(), all[151]);

        let mut backward = tape.cursor(&run, ScanDirection::Backward);
        backward.seek(all[3]);
        let mut seen = 0;
        while backward.next().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert!(backward.is_done());
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(ScanDirection::Forward.reverse(), ScanDirection::Backward);
        assert_eq!(ScanDirection::default(), ScanDirection::Forward);
    }
}
