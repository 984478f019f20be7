//! `memtrace` traces the memory accesses of a program and tells which live heap block, and which
//! offset inside it, each access touches.
//!
//! It consists of two halves:
//!
//! * the [`Instrumenter`], which rewrites a code unit (a [`Block`] of decoded operations handed
//!   over by a binary-translation host) so that every load, store, atomic and memory-touching
//!   helper call reports itself.  Consecutive accesses are buffered in an [`EventBuffer`], where a
//!   load followed by a store to the same location turns into a single `Modify`;
//! * the [`Tracer`], which receives those reports at run time together with every `malloc`,
//!   `calloc`, `realloc` and `free` of the program.  Live blocks are kept in a [`BlockTable`] so
//!   that an accessed address can be resolved to a block and an offset.
//!
//! ## Tracing a program via `LD_PRELOAD`
//!
//! The companion [`lib_memtrace`] crate produces a dynamic library that intercepts the `malloc`
//! family of the program and exports the trace entry points (`memtrace_on_load` etc.) that
//! instrumented code calls:
//!
//! ```bash
//! MEMTRACE_OPTIONS="--all-refs=no" LD_PRELOAD=libmemtrace_preload.so ./my_program 2> trace.log
//! ```
//!
//! Every allocation is reported together with the stack that performed it:
//!
//! ```text
//! ==4242== Detected allocation in thread 139872
//! ==4242==    at 0x55D1C3A4B2: malloc (src/lib.rs:18)
//! ==4242==    by 0x55D1C3A011: make_buffer (demo.c:5)
//! ==4242== Address: 0x5581f0, Size: 16
//! ==4242== Store 0x5581f4 4 in 0x5581f0+4
//! ```
//!
//! See [`TraceConfig`] for the available options.
//!
//! ## Tracing a Rust program
//!
//! Rust programs can track their heap by installing [`TraceAllocator`] as the global allocator:
//!
//! ```no_run
//! use memtrace::TraceAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: TraceAllocator = TraceAllocator;
//!
//! fn main() {}
//! ```
//!
//! ## Reading traces
//!
//! The `mt_print` tool from this crate lists the allocations found in a trace and extracts the
//! accesses to one of them:
//!
//! ```bash
//! mt_print --file trace.log --whitelist ignored_functions.txt
//! mt_print --file trace.log --select 3 --output block3.log
//! ```
//!
//! [`lib_memtrace`]: https://docs.rs/lib_memtrace

pub mod config;
pub mod event;
pub mod instrument;
pub mod ir;
pub mod parse;
pub mod pool;
pub mod report;
pub mod runtime;
pub mod table;
pub mod tracker;

pub use config::{ConfigError, TraceConfig};
pub use event::{Event, EventBuffer, EventKind, N_EVENTS};
pub use instrument::{
    BacktraceSymbolizer, FunctionTracker, InstrumentError, Instrumenter, Symbolizer,
};
pub use ir::{Block, Expr, HelperCall, Stmt};
pub use pool::{AllocRecord, RecordId, RecordPool};
pub use report::{LineReporter, Report};
pub use runtime::{report_function, rewrite, with_tracer, TraceAllocator, Tracer, TRACER};
pub use table::{BlockTable, Hit};
pub use tracker::{AllocationTracker, HeapError, LibcAllocator, RawAllocator};
