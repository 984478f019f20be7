//! Address-keyed store of live heap blocks.

use log::warn;
use radix_trie::{Trie, TrieCommon};

use crate::pool::{AllocRecord, RecordId, RecordPool};

/// Location of an address inside a tracked block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hit {
    /// Start address of the block.
    pub base: usize,
    pub offset: usize,
}

/// Maps block start addresses to pooled [`AllocRecord`]s.  At most one record
/// exists per address.
pub struct BlockTable {
    pool: RecordPool,
    blocks: Trie<usize, RecordId>,
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockTable {
    pub fn new() -> Self {
        BlockTable {
            pool: RecordPool::new(),
            blocks: Trie::new(),
        }
    }

    pub fn insert(&mut self, record: AllocRecord) -> RecordId {
        let id = self.pool.acquire(record);
        if let Some(stale) = self.blocks.insert(record.address, id) {
            // The allocator handed out a live address again; the old block
            // must have been released behind our back.
            warn!("replacing stale record for block {:#x}", record.address);
            self.pool.release(stale);
        }
        id
    }

    /// Unlink the record of the block starting at `address`.  The record stays
    /// acquired: pass it to [`BlockTable::release`] or [`BlockTable::reinsert`].
    pub fn forget(&mut self, address: usize) -> Option<(RecordId, AllocRecord)> {
        let id = self.blocks.remove(&address)?;
        let record = *self.pool.get(id)?;
        Some((id, record))
    }

    /// Link a forgotten record again, under its (possibly new) address.
    pub fn reinsert(&mut self, id: RecordId, record: AllocRecord) {
        match self.pool.get_mut(id) {
            Some(slot) => *slot = record,
            None => {
                warn!("reinserting released record for block {:#x}", record.address);
                self.insert(record);
                return;
            }
        }
        if let Some(stale) = self.blocks.insert(record.address, id) {
            warn!("replacing stale record for block {:#x}", record.address);
            self.pool.release(stale);
        }
    }

    pub fn release(&mut self, id: RecordId) -> Option<AllocRecord> {
        self.pool.release(id)
    }

    pub fn get(&self, address: usize) -> Option<&AllocRecord> {
        self.pool.get(*self.blocks.get(&address)?)
    }

    /// Find the block whose requested range contains `address`.
    ///
    /// This is a linear scan over all live blocks; it only runs when not every
    /// access is reported.
    pub fn resolve(&self, address: usize) -> Option<Hit> {
        self.records().find_map(|record| {
            record.offset_of(address).map(|offset| Hit {
                base: record.address,
                offset,
            })
        })
    }

    /// Live records, in trie order.
    pub fn records(&self) -> impl Iterator<Item = &AllocRecord> + '_ {
        let pool = &self.pool;
        self.blocks.values().filter_map(move |id| pool.get(*id))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pool(&self) -> &RecordPool {
        &self.pool
    }
}
