//! The run-time half of the tracer.
//!
//! Helper calls injected by the [`Instrumenter`] end up in [`Tracer`], as do
//! the intercepted heap functions.  A process has one [`TRACER`]; it is only
//! ever reached through [`with_tracer`], which keeps allocations made by the
//! tracer itself out of the trace.

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    ffi::CStr,
    fs::File,
    io::{self, LineWriter, Write},
    ptr, thread_local,
};

use libc::{c_void, size_t};
use log::warn;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    config::TraceConfig,
    event::EventKind,
    instrument::{BacktraceSymbolizer, Instrumenter},
    ir::{Block, Expr, HelperCall},
    report::{LineReporter, Report},
    tracker::{AllocationTracker, LibcAllocator, RawAllocator, MIN_ALIGN},
};

/// Receives trace calls and heap calls of the traced program.
///
/// All heap entry points follow the C conventions: addresses are plain
/// integers and `0` stands for the null pointer.
pub struct Tracer<A, R> {
    config: TraceConfig,
    tracker: AllocationTracker<A, R>,
}

impl<A: RawAllocator, R: Report> Tracer<A, R> {
    pub fn new(config: TraceConfig, allocator: A, reporter: R) -> Self {
        Tracer {
            config,
            tracker: AllocationTracker::new(allocator, reporter),
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn tracker(&self) -> &AllocationTracker<A, R> {
        &self.tracker
    }

    pub fn on_fetch(&mut self, address: usize, size: usize) {
        if self.config.trace_instructions {
            self.tracker
                .reporter_mut()
                .access(EventKind::InstrFetch, address, size, None);
        }
    }

    pub fn on_load(&mut self, address: usize, size: usize) {
        self.on_access(EventKind::Read, address, size);
    }

    pub fn on_store(&mut self, address: usize, size: usize) {
        self.on_access(EventKind::Write, address, size);
    }

    pub fn on_modify(&mut self, address: usize, size: usize) {
        self.on_access(EventKind::Modify, address, size);
    }

    // With `trace_all` every access is printed as is and the resolver is
    // never consulted; otherwise only accesses to tracked blocks are printed.
    fn on_access(&mut self, kind: EventKind, address: usize, size: usize) {
        if self.config.trace_all {
            self.tracker.reporter_mut().access(kind, address, size, None);
        } else if let Some(hit) = self.tracker.resolve(address) {
            self.tracker
                .reporter_mut()
                .access(kind, address, size, Some(hit));
        }
    }

    pub fn on_function(&mut self, name: &str) {
        self.tracker.reporter_mut().function(name);
    }

    /// Run an injected helper call.  `eval` computes the run-time value of
    /// the call's address and guard expressions.  Guarded calls whose guard
    /// evaluates to zero do nothing.
    pub fn dispatch<F>(&mut self, call: &HelperCall, eval: F)
    where
        F: Fn(&Expr) -> u64,
    {
        match call {
            HelperCall::Access {
                kind,
                addr,
                size,
                guard,
            } => {
                if let Some(guard) = guard {
                    if eval(guard) == 0 {
                        return;
                    }
                }
                let address = eval(addr) as usize;
                match kind {
                    EventKind::InstrFetch => self.on_fetch(address, *size),
                    EventKind::Read => self.on_load(address, *size),
                    EventKind::Write => self.on_store(address, *size),
                    EventKind::Modify => self.on_modify(address, *size),
                }
            }
            HelperCall::Function { name } => self.on_function(name),
        }
    }

    fn allocate(&mut self, size: usize, align: usize, zeroed: bool) -> usize {
        match self.tracker.allocate(size, align, zeroed) {
            Ok(address) => address,
            Err(e) => {
                warn!("{}", e);
                0
            }
        }
    }

    pub fn on_alloc(&mut self, size: usize) -> usize {
        self.allocate(size, MIN_ALIGN, false)
    }

    pub fn on_calloc(&mut self, nmemb: usize, size: usize) -> usize {
        match nmemb.checked_mul(size) {
            Some(total) => self.allocate(total, MIN_ALIGN, true),
            None => {
                warn!("calloc({}, {}) overflows", nmemb, size);
                0
            }
        }
    }

    /// `align` must be a power of two.
    pub fn on_aligned_alloc(&mut self, align: usize, size: usize) -> usize {
        if !align.is_power_of_two() {
            warn!("invalid alignment {}", align);
            return 0;
        }
        self.allocate(size, align, false)
    }

    /// # Safety
    ///
    /// `address` must be `0` or a live block of the real allocator.
    pub unsafe fn on_free(&mut self, address: usize) {
        if address != 0 {
            self.tracker.free(address);
        }
    }

    /// Returns `0` when the block cannot be resized; the old block is then
    /// left in place.
    ///
    /// # Safety
    ///
    /// `address` must be `0` or a live block of the real allocator.
    pub unsafe fn on_realloc(&mut self, address: usize, size: usize) -> usize {
        if address == 0 {
            return self.on_alloc(size);
        }
        if size == 0 {
            self.on_free(address);
            return 0;
        }
        match self.tracker.reallocate(address, size) {
            Ok(address) => address,
            Err(e) => {
                warn!("realloc failed: {}", e);
                0
            }
        }
    }

    pub fn on_usable_size(&self, address: usize) -> usize {
        if address == 0 {
            0
        } else {
            self.tracker.usable_size(address)
        }
    }

    /// Is the block at `address` one we allocated?
    pub fn is_tracked(&self, address: usize) -> bool {
        self.tracker.table().get(address).is_some()
    }
}

pub type GlobalTracer = Tracer<LibcAllocator, LineReporter<Box<dyn Write + Send>>>;

/// Options of this process, from the environment.
pub static CONFIG: Lazy<TraceConfig> = Lazy::new(|| {
    TraceConfig::from_env().unwrap_or_else(|e| {
        eprintln!("memtrace: {}\n{}", e, TraceConfig::usage());
        TraceConfig::default()
    })
});

pub static TRACER: Lazy<Mutex<GlobalTracer>> = Lazy::new(|| {
    let config = TraceConfig::clone(&CONFIG);
    let out: Box<dyn Write + Send> = match &config.log_file {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(LineWriter::new(file)),
            Err(e) => {
                eprintln!("memtrace: failed to create {}: {}", path.display(), e);
                Box::new(io::stderr())
            }
        },
        None => Box::new(io::stderr()),
    };
    let reporter = LineReporter::new(out, config.num_callers);
    Mutex::new(Tracer::new(config, LibcAllocator, reporter))
});

static INSTRUMENTER: Lazy<Mutex<Instrumenter<BacktraceSymbolizer>>> =
    Lazy::new(|| Mutex::new(Instrumenter::new(&CONFIG, BacktraceSymbolizer)));

/// Instrument one code unit with this process' options.
///
/// # Panics
///
/// If the block contains a statement that cannot be instrumented; tracing
/// it anyway would silently lose accesses.
pub fn rewrite(block: &Block) -> Block {
    // Symbol lookups allocate under the `backtrace` lock, which the tracer
    // takes too; keep those allocations away from `TRACER`.
    let instrument = || INSTRUMENTER.lock().instrument(block);
    match untraced(&instrument).unwrap_or_else(instrument) {
        Ok(block) => block,
        Err(e) => panic!("memtrace: {}", e),
    }
}

thread_local! {
    // Flag used to detect nested calls into the tracer.
    static NESTED: Cell<bool> = Cell::new(false);
}

// Run `f` with this thread's allocations going to libc untracked.  Returns
// `None` without calling `f` when the thread is already inside the tracer,
// or is being torn down.
fn untraced<T, F>(f: F) -> Option<T>
where
    F: FnOnce() -> T,
{
    // Ignore errors accessing the TLS when the thread is being destroyed.
    NESTED
        .try_with(|nested| {
            if nested.get() {
                return None;
            }
            nested.set(true);
            let res = f();
            nested.set(false);
            Some(res)
        })
        .ok()
        .flatten()
}

/// Run `f` on [`TRACER`].  Returns `None` without calling `f` when this
/// thread is already inside the tracer, or is being torn down; the caller is
/// expected to fall back to the real allocator.
pub fn with_tracer<T, F>(f: F) -> Option<T>
where
    F: FnOnce(&mut GlobalTracer) -> T,
{
    untraced(|| f(&mut TRACER.lock()))
}

/// Announce on [`TRACER`] that execution entered the function `name`.
pub fn report_function(name: &CStr) {
    // Invalid UTF-8 makes the conversion allocate.
    with_tracer(|t| t.on_function(&name.to_string_lossy()));
}

/// `malloc`-family functions that go through [`TRACER`].  The companion
/// `lib_memtrace` crate exports them under their C names for `LD_PRELOAD`.
/// Rust programs can use this as the global allocator instead:
///
/// ```no_run
/// use memtrace::TraceAllocator;
///
/// #[global_allocator]
/// static GLOBAL: TraceAllocator = TraceAllocator;
///
/// fn main() {}
/// ```
pub struct TraceAllocator;

impl TraceAllocator {
    /// # Safety
    ///
    /// Same contract as C `malloc`.
    pub unsafe fn malloc(size: size_t) -> *mut c_void {
        match with_tracer(|t| t.on_alloc(size)) {
            Some(address) => address as *mut c_void,
            None => LibcAllocator::malloc(size),
        }
    }

    /// # Safety
    ///
    /// Same contract as C `calloc`.
    pub unsafe fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
        match with_tracer(|t| t.on_calloc(nmemb, size)) {
            Some(address) => address as *mut c_void,
            None => LibcAllocator::calloc(nmemb, size),
        }
    }

    /// # Safety
    ///
    /// Same contract as C `memalign`.
    pub unsafe fn memalign(align: size_t, size: size_t) -> *mut c_void {
        match with_tracer(|t| t.on_aligned_alloc(align, size)) {
            Some(address) => address as *mut c_void,
            None if align.is_power_of_two() => LibcAllocator::memalign(align, size),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// Same contract as C `realloc`.
    pub unsafe fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
        let address = ptr as usize;
        let res = with_tracer(|t| {
            // Blocks allocated behind the tracer's back keep going to libc.
            if address != 0 && !t.is_tracked(address) {
                None
            } else {
                Some(t.on_realloc(address, size))
            }
        });
        match res.flatten() {
            Some(address) => address as *mut c_void,
            None => LibcAllocator::realloc(ptr, size),
        }
    }

    /// # Safety
    ///
    /// Same contract as C `free`.
    pub unsafe fn free(ptr: *mut c_void) {
        if with_tracer(|t| t.on_free(ptr as usize)).is_none() {
            LibcAllocator::free(ptr);
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live block.
    pub unsafe fn usable_size(ptr: *mut c_void) -> size_t {
        match with_tracer(|t| t.on_usable_size(ptr as usize)) {
            Some(size) => size,
            None if ptr.is_null() => 0,
            None => LibcAllocator::usable_size(ptr),
        }
    }
}

unsafe impl GlobalAlloc for TraceAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::memalign(layout.align(), layout.size()) as *mut u8
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let (align, size) = (layout.align(), layout.size());
        match with_tracer(|t| t.allocate(size, align, true)) {
            Some(address) => address as *mut u8,
            None => {
                let ptr = LibcAllocator::memalign(align, size) as *mut u8;
                if !ptr.is_null() {
                    ptr::write_bytes(ptr, 0, size);
                }
                ptr
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        Self::free(ptr as *mut c_void);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return Self::realloc(ptr as *mut c_void, new_size) as *mut u8;
        }
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.alloc(new_layout);
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, std::cmp::min(layout.size(), new_size));
            self.dealloc(ptr, layout);
        }
        new_ptr
    }
}
