//! Fixed-block pool of allocation records.
//!
//! Records live in a slab that grows by [`RECORDS_PER_CHUNK`] slots at a
//! time; released slots are threaded onto a free list and handed out again
//! before the slab grows.  This keeps the per-`malloc` bookkeeping off the
//! general-purpose allocator we are tracing.

/// Number of slots reserved whenever the pool runs out.
pub const RECORDS_PER_CHUNK: usize = 1000;

/// Metadata of one live heap block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRecord {
    pub address: usize,
    /// Size the program asked for.
    pub requested: usize,
    /// Usable bytes beyond `requested`.
    pub slack: usize,
}

impl AllocRecord {
    pub fn new(address: usize, requested: usize, slack: usize) -> Self {
        AllocRecord {
            address,
            requested,
            slack,
        }
    }

    /// Bytes the block can hold without moving.
    pub fn capacity(&self) -> usize {
        self.requested + self.slack
    }

    /// Offset of `address` into the requested part of this block.
    pub fn offset_of(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.address)?;
        if offset < self.requested {
            Some(offset)
        } else {
            None
        }
    }
}

/// Handle to a record owned by a [`RecordPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordId(u32);

impl RecordId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
enum Slot {
    Live(AllocRecord),
    // Next free slot.
    Free(Option<RecordId>),
}

#[derive(Debug)]
pub struct RecordPool {
    slots: Vec<Slot>,
    free: Option<RecordId>,
    live: usize,
}

impl Default for RecordPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordPool {
    pub const fn new() -> Self {
        RecordPool {
            slots: Vec::new(),
            free: None,
            live: 0,
        }
    }

    /// Store `record` in a free slot, growing the pool by a chunk when none is
    /// left.
    pub fn acquire(&mut self, record: AllocRecord) -> RecordId {
        self.live += 1;
        if let Some(id) = self.free {
            self.free = match self.slots[id.index()] {
                Slot::Free(next) => next,
                Slot::Live(_) => unreachable!("free list points at a live record"),
            };
            self.slots[id.index()] = Slot::Live(record);
            return id;
        }
        if self.slots.len() == self.slots.capacity() {
            self.slots.reserve_exact(RECORDS_PER_CHUNK);
        }
        let id = RecordId(self.slots.len() as u32);
        self.slots.push(Slot::Live(record));
        id
    }

    /// Return the slot of `id` to the free list.  Returns the record it held,
    /// or `None` if `id` was not live.
    pub fn release(&mut self, id: RecordId) -> Option<AllocRecord> {
        let slot = self.slots.get_mut(id.index())?;
        let record = match slot {
            Slot::Live(record) => *record,
            Slot::Free(_) => return None,
        };
        *slot = Slot::Free(self.free);
        self.free = Some(id);
        self.live -= 1;
        Some(record)
    }

    pub fn get(&self, id: RecordId) -> Option<&AllocRecord> {
        match self.slots.get(id.index())? {
            Slot::Live(record) => Some(record),
            Slot::Free(_) => None,
        }
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut AllocRecord> {
        match self.slots.get_mut(id.index())? {
            Slot::Live(record) => Some(record),
            Slot::Free(_) => None,
        }
    }

    /// Number of records currently handed out.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of slots allocated so far, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused() {
        let mut pool = RecordPool::new();
        let a = pool.acquire(AllocRecord::new(0x1000, 16, 0));
        let b = pool.acquire(AllocRecord::new(0x2000, 32, 8));
        assert_eq!(pool.live(), 2);

        assert_eq!(pool.release(a), Some(AllocRecord::new(0x1000, 16, 0)));
        assert_eq!(pool.get(a), None);

        let c = pool.acquire(AllocRecord::new(0x3000, 4, 4));
        assert_eq!(c, a);
        assert_eq!(pool.get(c).map(|r| r.address), Some(0x3000));
        assert_eq!(pool.get(b).map(|r| r.capacity()), Some(40));
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn double_release_is_refused() {
        let mut pool = RecordPool::new();
        let a = pool.acquire(AllocRecord::new(0x1000, 16, 0));
        assert!(pool.release(a).is_some());
        assert!(pool.release(a).is_none());
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn grows_in_chunks() {
        let mut pool = RecordPool::new();
        let ids: Vec<_> = (0..RECORDS_PER_CHUNK + 1)
            .map(|i| pool.acquire(AllocRecord::new(i * 16, 16, 0)))
            .collect();
        assert!(pool.capacity() >= 2 * RECORDS_PER_CHUNK);
        assert_eq!(pool.live(), RECORDS_PER_CHUNK + 1);

        for id in ids {
            pool.release(id);
        }
        let capacity = pool.capacity();
        for i in 0..RECORDS_PER_CHUNK {
            pool.acquire(AllocRecord::new(i, 1, 0));
        }
        assert_eq!(pool.capacity(), capacity);
    }

    #[test]
    fn offsets_stop_at_requested_size() {
        let record = AllocRecord::new(0x1000, 16, 8);
        assert_eq!(record.offset_of(0x1000), Some(0));
        assert_eq!(record.offset_of(0x100f), Some(15));
        assert_eq!(record.offset_of(0x1010), None);
        assert_eq!(record.offset_of(0xfff), None);
    }
}
