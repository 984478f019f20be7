//! The allocation tracker: heap wrappers that keep a [`BlockTable`] in sync
//! with the real allocator.

use std::cmp;

use libc::{c_char, c_int, c_void, dlsym, size_t, RTLD_NEXT};
use log::{debug, warn};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::{
    pool::{AllocRecord, RecordId},
    report::Report,
    table::{BlockTable, Hit},
};

/// Alignment `malloc` guarantees without being asked.
pub const MIN_ALIGN: usize = 2 * std::mem::size_of::<usize>();

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory allocating {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },
    #[error("block {address:#x} is not tracked")]
    NotTracked { address: usize },
}

/// The heap the tracker delegates to.  Addresses are plain integers; `0` is
/// never a valid block.
pub trait RawAllocator {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    fn allocate(&self, align: usize, size: usize) -> Option<usize>;

    /// Bytes usable in the block at `address`; at least what was requested.
    fn usable_size(&self, address: usize) -> usize;

    /// # Safety
    ///
    /// `address` must have come from [`RawAllocator::allocate`] and not have
    /// been freed yet.
    unsafe fn free(&self, address: usize);

    /// # Safety
    ///
    /// Both ranges must be valid for `len` bytes and must not overlap.
    unsafe fn copy(&self, dst: usize, src: usize, len: usize);

    /// # Safety
    ///
    /// `address` must be valid for writes of `len` bytes.
    unsafe fn zero(&self, address: usize, len: usize);
}

type MallocFunc = unsafe extern "C" fn(size: size_t) -> *mut c_void;
type CallocFunc = unsafe extern "C" fn(nmemb: size_t, size: size_t) -> *mut c_void;
type ReallocFunc = unsafe extern "C" fn(ptr: *mut c_void, size: size_t) -> *mut c_void;
type PosixMemalignFunc =
    unsafe extern "C" fn(memptr: *mut *mut c_void, align: size_t, size: size_t) -> c_int;
type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);
type UsableSizeFunc = unsafe extern "C" fn(ptr: *mut c_void) -> size_t;

// Look up the next definition of `name` after ours, i.e. the C library's.
fn real_symbol(name: &'static [u8]) -> usize {
    let sym = unsafe { dlsym(RTLD_NEXT, name.as_ptr() as *const c_char) };
    if sym.is_null() {
        panic!(
            "memtrace: couldn't find original {}",
            String::from_utf8_lossy(&name[..name.len() - 1])
        );
    }
    sym as usize
}

static REAL_MALLOC: Lazy<usize> = Lazy::new(|| real_symbol(b"malloc\0"));
static REAL_CALLOC: Lazy<usize> = Lazy::new(|| real_symbol(b"calloc\0"));
static REAL_REALLOC: Lazy<usize> = Lazy::new(|| real_symbol(b"realloc\0"));
static REAL_POSIX_MEMALIGN: Lazy<usize> = Lazy::new(|| real_symbol(b"posix_memalign\0"));
static REAL_FREE: Lazy<usize> = Lazy::new(|| real_symbol(b"free\0"));
static REAL_USABLE_SIZE: Lazy<usize> = Lazy::new(|| real_symbol(b"malloc_usable_size\0"));

/// The C library heap, reached through `dlsym(RTLD_NEXT, ..)` so that it still
/// works when our own `malloc` family shadows it via `LD_PRELOAD`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcAllocator;

impl LibcAllocator {
    pub unsafe fn malloc(size: size_t) -> *mut c_void {
        let real: MallocFunc = std::mem::transmute(*REAL_MALLOC);
        real(size)
    }

    pub unsafe fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
        let real: CallocFunc = std::mem::transmute(*REAL_CALLOC);
        real(nmemb, size)
    }

    pub unsafe fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
        let real: ReallocFunc = std::mem::transmute(*REAL_REALLOC);
        real(ptr, size)
    }

    pub unsafe fn memalign(align: size_t, size: size_t) -> *mut c_void {
        let real: PosixMemalignFunc = std::mem::transmute(*REAL_POSIX_MEMALIGN);
        let align = cmp::max(align, std::mem::size_of::<*mut c_void>());
        let mut ptr = std::ptr::null_mut();
        if real(&mut ptr, align, size) != 0 {
            return std::ptr::null_mut();
        }
        ptr
    }

    pub unsafe fn free(ptr: *mut c_void) {
        let real: FreeFunc = std::mem::transmute(*REAL_FREE);
        real(ptr)
    }

    pub unsafe fn usable_size(ptr: *mut c_void) -> size_t {
        let real: UsableSizeFunc = std::mem::transmute(*REAL_USABLE_SIZE);
        real(ptr)
    }
}

impl RawAllocator for LibcAllocator {
    fn allocate(&self, align: usize, size: usize) -> Option<usize> {
        let ptr = unsafe {
            if align <= MIN_ALIGN {
                Self::malloc(size)
            } else {
                Self::memalign(align, size)
            }
        };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }

    fn usable_size(&self, address: usize) -> usize {
        unsafe { Self::usable_size(address as *mut c_void) }
    }

    unsafe fn free(&self, address: usize) {
        Self::free(address as *mut c_void)
    }

    unsafe fn copy(&self, dst: usize, src: usize, len: usize) {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len)
    }

    unsafe fn zero(&self, address: usize, len: usize) {
        std::ptr::write_bytes(address as *mut u8, 0, len)
    }
}

/// Keeps a record of every live block allocated through it and reports each
/// new allocation.
pub struct AllocationTracker<A, R> {
    table: BlockTable,
    allocator: A,
    reporter: R,
    reported: usize,
}

impl<A: RawAllocator, R: Report> AllocationTracker<A, R> {
    pub fn new(allocator: A, reporter: R) -> Self {
        AllocationTracker {
            table: BlockTable::new(),
            allocator,
            reporter,
            reported: 0,
        }
    }

    pub fn table(&self) -> &BlockTable {
        &self.table
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut R {
        &mut self.reporter
    }

    /// Number of allocations reported so far.
    pub fn reported(&self) -> usize {
        self.reported
    }

    /// Track a new block and report it.
    pub fn record_allocation(&mut self, address: usize, requested: usize, slack: usize) -> RecordId {
        let id = self
            .table
            .insert(AllocRecord::new(address, requested, slack));
        self.reporter.allocation(address, requested);
        self.reported += 1;
        id
    }

    /// Stop tracking the block at `address`.  The record is not returned to
    /// the pool; see [`BlockTable::forget`].
    pub fn forget(&mut self, address: usize) -> Option<(RecordId, AllocRecord)> {
        self.table.forget(address)
    }

    pub fn resolve(&self, address: usize) -> Option<Hit> {
        self.table.resolve(address)
    }

    fn slack(&self, address: usize, requested: usize) -> usize {
        let usable = self.allocator.usable_size(address);
        match usable.checked_sub(requested) {
            Some(slack) => slack,
            None => panic!(
                "memtrace: usable size {} of block {:#x} is smaller than the {} bytes requested",
                usable, address, requested
            ),
        }
    }

    pub fn allocate(&mut self, size: usize, align: usize, zeroed: bool) -> Result<usize, HeapError> {
        let address = self
            .allocator
            .allocate(align, size)
            .ok_or(HeapError::OutOfMemory { size, align })?;
        let slack = self.slack(address, size);
        if zeroed {
            unsafe { self.allocator.zero(address, size) };
        }
        self.record_allocation(address, size, slack);
        Ok(address)
    }

    /// Release the block at `address`.  Untracked blocks are still handed back
    /// to the real allocator.
    ///
    /// # Safety
    ///
    /// `address` must be a live block of the real allocator.
    pub unsafe fn free(&mut self, address: usize) {
        match self.table.forget(address) {
            Some((id, _)) => {
                self.table.release(id);
            }
            None => warn!("freeing untracked block {:#x}", address),
        }
        self.allocator.free(address);
    }

    /// Resize the block at `address`, in place when it has enough slack.
    ///
    /// On failure to grow, the old block stays valid but is no longer tracked.
    ///
    /// # Safety
    ///
    /// `address` must be a live block of the real allocator.
    pub unsafe fn reallocate(&mut self, address: usize, new_size: usize) -> Result<usize, HeapError> {
        let (id, old) = self
            .table
            .forget(address)
            .ok_or(HeapError::NotTracked { address })?;
        let capacity = old.capacity();

        let record = if new_size <= capacity {
            AllocRecord::new(address, new_size, capacity - new_size)
        } else {
            let new_address = match self.allocator.allocate(MIN_ALIGN, new_size) {
                Some(new_address) => new_address,
                None => {
                    self.table.release(id);
                    return Err(HeapError::OutOfMemory {
                        size: new_size,
                        align: MIN_ALIGN,
                    });
                }
            };
            self.allocator.copy(new_address, address, capacity);
            self.allocator.free(address);
            let slack = self.slack(new_address, new_size);
            AllocRecord::new(new_address, new_size, slack)
        };
        debug!(
            "realloc {:#x} ({} bytes) -> {:#x} ({} bytes)",
            address, old.requested, record.address, new_size
        );
        self.table.reinsert(id, record);
        Ok(record.address)
    }

    /// Usable size as seen by the program: the requested size of tracked
    /// blocks, so that slack stays invisible.
    pub fn usable_size(&self, address: usize) -> usize {
        match self.table.get(address) {
            Some(record) => record.requested,
            None => self.allocator.usable_size(address),
        }
    }
}
