//! Human-readable trace output.
//!
//! Every line starts with `==<pid>==`.  An allocation report looks like
//!
//! ```text
//! ==4242== Detected allocation in thread 139872
//! ==4242==    at 0x55D1C3A4B2: malloc (src/lib.rs:18)
//! ==4242==    by 0x55D1C3A011: my_program::main (src/main.rs:7)
//! ==4242== Address: 0x5581f0, Size: 16
//! ```
//!
//! and an access, depending on `trace_all`, either `==4242== Load 0x5581f4 4`
//! or `==4242== Load 0x5581f4 4 in 0x5581f0+4`.

use std::{
    fmt::{self, Write as _},
    io::Write,
    process,
};

use libc::{c_void, pthread_self};

use crate::{event::EventKind, table::Hit};

// Upper bound on frames captured before dropping the tracer's own frames.
const MAX_BACKTRACE: usize = 128;

/// Receiver of everything the tracer prints.
pub trait Report {
    /// A block of `size` bytes was allocated at `address`.
    fn allocation(&mut self, address: usize, size: usize);
    fn access(&mut self, kind: EventKind, address: usize, size: usize, hit: Option<Hit>);
    /// Execution entered function `name`.
    fn function(&mut self, name: &str);
}

/// [`Report`] that writes one line per event to `out`.
pub struct LineReporter<W> {
    out: W,
    prefix: String,
    num_callers: usize,
    callstack: Vec<usize>,
    line: String,
}

impl<W: Write> LineReporter<W> {
    /// Reports allocations with up to `num_callers` stack frames.
    pub fn new(out: W, num_callers: usize) -> Self {
        LineReporter {
            out,
            prefix: format!("=={}==", process::id()),
            num_callers,
            callstack: Vec::with_capacity(MAX_BACKTRACE),
            line: String::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn capture(&mut self) -> Vec<Frame> {
        if self.num_callers == 0 {
            return Vec::new();
        }
        let callstack = &mut self.callstack;
        callstack.clear();
        backtrace::trace(|frame| {
            callstack.push(frame.ip() as usize);
            callstack.len() < MAX_BACKTRACE
        });

        let frames = callstack.iter().map(|ip| Frame::resolve(*ip));
        program_frames(frames, self.num_callers)
    }

    fn emit(&mut self, args: fmt::Arguments<'_>) {
        self.line.clear();
        let _ = writeln!(self.line, "{} {}", self.prefix, args);
        // Tracing must never take the traced program down.
        let _ = self.out.write_all(self.line.as_bytes());
    }
}

impl<W: Write> Report for LineReporter<W> {
    fn allocation(&mut self, address: usize, size: usize) {
        let frames = self.capture();
        let thread = unsafe { pthread_self() };
        self.emit(format_args!("Detected allocation in thread {}", thread));
        for (i, frame) in frames.iter().enumerate() {
            let word = if i == 0 { "at" } else { "by" };
            self.emit(format_args!("   {} {}", word, frame));
        }
        self.emit(format_args!("Address: {:#x}, Size: {}", address, size));
    }

    fn access(&mut self, kind: EventKind, address: usize, size: usize, hit: Option<Hit>) {
        match hit {
            None => self.emit(format_args!("{} {:#x} {}", kind, address, size)),
            Some(hit) => self.emit(format_args!(
                "{} {:#x} {} in {:#x}+{}",
                kind, address, size, hit.base, hit.offset
            )),
        }
    }

    fn function(&mut self, name: &str) {
        self.emit(format_args!("Function {}", name));
    }
}

// The first `num_callers` frames outside the tracer.  Frames inner to a
// tracer frame are dropped, so the report starts at the intercepted heap
// function.  Symbolization is slow: `frames` is consumed no further than
// needed.
fn program_frames<I>(frames: I, num_callers: usize) -> Vec<Frame>
where
    I: Iterator<Item = Frame>,
{
    let mut kept = Vec::with_capacity(num_callers);
    if num_callers == 0 {
        return kept;
    }
    for frame in frames {
        if frame.is_internal() {
            kept.clear();
        } else if !(kept.is_empty() && frame.is_glue()) {
            kept.push(frame);
            if kept.len() == num_callers {
                break;
            }
        }
    }
    kept
}

struct Frame {
    ip: usize,
    name: Option<String>,
    location: Option<String>,
}

impl Frame {
    // Must be called while running in the context of the target program.
    fn resolve(ip: usize) -> Self {
        let mut frame = Frame {
            ip,
            name: None,
            location: None,
        };
        backtrace::resolve(ip as *mut c_void, |s| {
            if frame.name.is_some() {
                return;
            }
            frame.name = s.name().map(|name| format!("{:#}", name));
            frame.location = s
                .filename()
                .map(|file| format!("{}:{}", file.display(), s.lineno().unwrap_or(0)));
        });
        frame
    }

    fn is_internal(&self) -> bool {
        match &self.name {
            Some(name) => {
                let name = name.trim_start_matches('<');
                name.starts_with("memtrace::") || name.starts_with("backtrace::")
            }
            None => false,
        }
    }

    // Library frames that sit between two tracer frames, e.g. the
    // thread-local access around the tracer lock.
    fn is_glue(&self) -> bool {
        match &self.name {
            Some(name) => {
                name.contains("std::thread::local::") || name.contains("core::ops::function::")
            }
            None => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}: ", self.ip)?;
        match (&self.name, &self.location) {
            (Some(name), Some(location)) => write!(f, "{} ({})", name, location),
            (Some(name), None) => f.write_str(name),
            (None, _) => f.write_str("???"),
        }
    }
}
