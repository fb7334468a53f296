//! Redo: the single dispatcher that turns a [`PageOp`] into a page change.
//!
//! The forward path applies each op through [`apply`] as it is added to a
//! mini-transaction; recovery replays logged ops through the same function.
//! A page's LSN records the last record applied to it, so replay skips
//! records the page already reflects.

use std::collections::{BTreeMap, HashMap};

use sortheap_common::types::{BlockId, BlockType, Lsn};
use sortheap_wal::{LogSink, PageOp, WalPayload};
use tracing::{debug, info};

use crate::alloc::layout::{init_leaf, set_leaf_bit, set_root_entry};
use crate::error::{StorageError, StorageResult};
use crate::page::{
    expect_type, is_zero_page, stamp_checksum, verify_page, write_body, PageHeader, SlottedPage,
};
use crate::store::BlockStore;

/// Applies one op to a page buffer.
pub fn apply(op: &PageOp, page: &mut [u8]) -> StorageResult<()> {
    match op {
        PageOp::Init { block, block_type } => {
            PageHeader::new(&mut *page).initialize(*block, *block_type);
            if *block_type == BlockType::AllocLeaf {
                init_leaf(page);
            }
        }
        PageOp::SlotAppend { block, data } => {
            expect_slotted(page, *block)?;
            SlottedPage::new(page).append(data)?;
        }
        PageOp::SlotOverwrite { block, slot, data } => {
            expect_slotted(page, *block)?;
            SlottedPage::new(page).overwrite(*slot, data)?;
        }
        PageOp::SlotTruncate { block, keep } => {
            expect_slotted(page, *block)?;
            SlottedPage::new(page).truncate(*keep)?;
        }
        PageOp::SetNext { block, next } => {
            expect_formatted(page, *block)?;
            PageHeader::new(page).set_next(*next);
        }
        PageOp::SetPrev { block, prev } => {
            expect_formatted(page, *block)?;
            PageHeader::new(page).set_prev(*prev);
        }
        PageOp::BitmapSet {
            block,
            bit,
            allocated,
        } => {
            expect_type(page, *block, BlockType::AllocLeaf)?;
            set_leaf_bit(page, *bit, *allocated)?;
        }
        PageOp::AllocRootSet {
            block,
            index,
            leaf,
            free,
        } => {
            expect_type(page, *block, BlockType::AllocRoot)?;
            set_root_entry(page, *index, *leaf, *free)?;
        }
        PageOp::BodyWrite {
            block,
            block_type,
            body,
        } => {
            expect_type(page, *block, *block_type)?;
            write_body(page, body)?;
        }
    }
    Ok(())
}

fn expect_formatted(page: &[u8], block: BlockId) -> StorageResult<()> {
    if !PageHeader::new(page).is_valid_magic() {
        return Err(StorageError::corrupted(block, "page op on unformatted page"));
    }
    Ok(())
}

fn expect_slotted(page: &[u8], block: BlockId) -> StorageResult<()> {
    expect_formatted(page, block)?;
    let actual = PageHeader::new(page).block_type().unwrap_or(BlockType::Free);
    if !actual.is_slotted() {
        return Err(StorageError::InvalidBlockType {
            block,
            expected: BlockType::Data,
            actual,
        });
    }
    Ok(())
}

/// Summary of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// LSN replay started from.
    pub redo_lsn: Lsn,
    /// Last LSN seen in the log.
    pub last_lsn: Lsn,
    /// Page-op records read.
    pub records_scanned: u64,
    /// Page-op groups applied to at least one page.
    pub records_applied: u64,
    /// Ops skipped because the page already reflected them.
    pub ops_skipped: u64,
    /// Pages written back.
    pub pages_written: u64,
}

/// Replays the log into the store, starting at the last checkpoint.
///
/// Must run before a buffer pool is created over `store`. Blocks never
/// written read as zero pages, which is the state an `Init` op expects.
pub fn recover(store: &dyn BlockStore, wal: &dyn LogSink) -> StorageResult<RecoveryStats> {
    let records = wal.records_from(Lsn::FIRST)?;
    let redo_lsn = records
        .iter()
        .rev()
        .find_map(|r| match r.payload {
            WalPayload::Checkpoint { redo_lsn, .. } => Some(redo_lsn),
            _ => None,
        })
        .unwrap_or(Lsn::FIRST);

    let mut stats = RecoveryStats {
        redo_lsn,
        last_lsn: records.last().map_or(Lsn::INVALID, |r| r.lsn()),
        ..RecoveryStats::default()
    };
    let block_size = store.block_size();
    let mut pages: HashMap<BlockId, Vec<u8>> = HashMap::new();

    for record in records.iter().filter(|r| r.lsn() >= redo_lsn) {
        let WalPayload::PageOps(ops) = &record.payload else {
            continue;
        };
        stats.records_scanned += 1;
        let lsn = record.lsn();

        let mut by_block: BTreeMap<BlockId, Vec<&PageOp>> = BTreeMap::new();
        for op in ops {
            by_block.entry(op.block()).or_default().push(op);
        }

        let mut applied = false;
        for (block, block_ops) in by_block {
            if !pages.contains_key(&block) {
                let mut buf = vec![0u8; block_size];
                store.read_block(block, &mut buf)?;
                verify_page(&buf, block)?;
                pages.insert(block, buf);
            }
            let Some(page) = pages.get_mut(&block) else {
                continue;
            };

            let fresh = is_zero_page(page);
            if !fresh && PageHeader::new(&page[..]).lsn() >= lsn {
                stats.ops_skipped += block_ops.len() as u64;
                continue;
            }
            for op in block_ops {
                apply(op, page)?;
            }
            PageHeader::new(&mut page[..]).set_lsn(lsn);
            applied = true;
        }
        if applied {
            stats.records_applied += 1;
        }
    }

    for (block, mut page) in pages {
        if is_zero_page(&page) {
            continue;
        }
        stamp_checksum(&mut page);
        store.write_block(block, &page)?;
        stats.pages_written += 1;
    }
    store.sync()?;

    if stats.records_applied > 0 {
        info!(
            redo_lsn = %stats.redo_lsn,
            last_lsn = %stats.last_lsn,
            applied = stats.records_applied,
            pages = stats.pages_written,
            "replayed log"
        );
    } else {
        debug!(redo_lsn = %stats.redo_lsn, "nothing to replay");
    }
    Ok(stats)
}
