//! The instrumentation pass: rewrites a code unit so that every memory access
//! it performs calls back into the [`Tracer`](crate::runtime::Tracer).

use libc::c_void;
use log::debug;
use thiserror::Error;

use crate::{
    config::TraceConfig,
    event::{Event, EventBuffer, EventKind},
    ir::{Block, Dirty, Effect, Expr, HelperCall, Stmt},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstrumentError {
    #[error("cannot instrument statement {index}: {op}")]
    Unsupported { index: usize, op: String },
    #[error("cannot infer the type of {expr} in statement {index}")]
    Untyped { index: usize, expr: String },
    #[error("helper `{callee}` in statement {index} declares {effect:?} but a memory range of {range:?}")]
    BadEffect {
        index: usize,
        callee: String,
        effect: Effect,
        range: Option<usize>,
    },
}

/// Function names of code addresses.
pub trait Symbolizer {
    fn function_name(&self, addr: u64) -> Option<String>;
    /// Is `addr` the first instruction of a function?
    fn is_function_entry(&self, addr: u64) -> bool;
}

/// [`Symbolizer`] backed by the debug info of the running process.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceSymbolizer;

impl Symbolizer for BacktraceSymbolizer {
    fn function_name(&self, addr: u64) -> Option<String> {
        let mut name = None;
        backtrace::resolve(addr as usize as *mut c_void, |s| {
            if name.is_none() {
                name = s.name().map(|n| format!("{:#}", n));
            }
        });
        name
    }

    fn is_function_entry(&self, addr: u64) -> bool {
        let mut entry = false;
        backtrace::resolve(addr as usize as *mut c_void, |s| {
            entry |= s.addr() == Some(addr as usize as *mut c_void);
        });
        entry
    }
}

/// Remembers the last announced function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionTracker {
    last: Option<String>,
}

impl FunctionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Should `name` be announced?  True on function entry or when the name
    /// differs from the last one announced.
    pub fn changed(&mut self, name: &str, is_entry: bool) -> bool {
        if is_entry || self.last.as_deref() != Some(name) {
            self.last = Some(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

pub struct Instrumenter<S> {
    trace_memory: bool,
    show_function_names: bool,
    symbols: S,
    events: EventBuffer,
    functions: FunctionTracker,
}

impl<S: Symbolizer> Instrumenter<S> {
    pub fn new(config: &TraceConfig, symbols: S) -> Self {
        Instrumenter {
            trace_memory: config.trace_memory,
            show_function_names: config.show_function_names,
            symbols,
            events: EventBuffer::new(),
            functions: FunctionTracker::new(),
        }
    }

    pub fn functions(&self) -> &FunctionTracker {
        &self.functions
    }

    /// Rewrite `block`, returning a copy with helper calls injected.
    ///
    /// Statements before the first instruction mark are copied unchanged.
    /// Buffered events are flushed before every side exit and at the end of
    /// the block, so no access is lost whichever way control leaves it.
    pub fn instrument(&mut self, block: &Block) -> Result<Block, InstrumentError> {
        self.events.reset();
        let mut out = block.empty_copy();

        let preamble = block
            .stmts
            .iter()
            .position(|stmt| matches!(stmt, Stmt::IMark { .. }))
            .unwrap_or(block.stmts.len());
        out.stmts.extend_from_slice(&block.stmts[..preamble]);

        for (index, stmt) in block.stmts.iter().enumerate().skip(preamble) {
            self.instrument_stmt(block, index, stmt, &mut out.stmts)?;
        }
        self.events.flush(&mut out.stmts);

        debug!(
            "instrumented {} statements into {}",
            block.stmts.len(),
            out.stmts.len()
        );
        Ok(out)
    }

    fn instrument_stmt(
        &mut self,
        block: &Block,
        index: usize,
        stmt: &Stmt,
        out: &mut Vec<Stmt>,
    ) -> Result<(), InstrumentError> {
        let size_of = |expr: &Expr| {
            block
                .type_of(expr)
                .map(|ty| ty.size())
                .ok_or_else(|| InstrumentError::Untyped {
                    index,
                    expr: format!("{:?}", expr),
                })
        };

        match stmt {
            Stmt::NoOp
            | Stmt::AbiHint { .. }
            | Stmt::Put { .. }
            | Stmt::PutI { .. }
            | Stmt::MemBarrier => {}

            Stmt::IMark { addr, len } => {
                if self.show_function_names {
                    self.announce_function(*addr, out);
                }
                if self.trace_memory {
                    self.add(Event::new(EventKind::InstrFetch, Expr::addr(*addr), *len), out);
                }
            }

            Stmt::WrTmp { data, .. } => {
                if let Expr::Load { ty, addr } = data {
                    self.add(Event::new(EventKind::Read, (**addr).clone(), ty.size()), out);
                }
            }

            Stmt::Store { addr, data } => {
                let size = size_of(data)?;
                self.add(Event::new(EventKind::Write, addr.clone(), size), out);
            }

            Stmt::StoreG { guard, addr, data } => {
                let size = size_of(data)?;
                let event = Event::guarded(EventKind::Write, addr.clone(), size, guard.clone());
                self.add(event, out);
            }

            Stmt::LoadG {
                guard,
                addr,
                loaded,
                ..
            } => {
                let event = Event::guarded(EventKind::Read, addr.clone(), loaded.size(), guard.clone());
                self.add(event, out);
            }

            Stmt::Dirty(dirty) => self.instrument_dirty(index, dirty, out)?,

            Stmt::Cas {
                addr,
                data_lo,
                data_hi,
                ..
            } => {
                let mut size = size_of(data_lo)?;
                if data_hi.is_some() {
                    size *= 2;
                }
                // Two plain accesses, never folded into a modify.
                self.push(Event::new(EventKind::Read, addr.clone(), size), out);
                self.push(Event::new(EventKind::Write, addr.clone(), size), out);
            }

            Stmt::Llsc {
                result,
                addr,
                store_data: None,
            } => {
                let size = block
                    .type_of_tmp(*result)
                    .map(|ty| ty.size())
                    .ok_or_else(|| InstrumentError::Untyped {
                        index,
                        expr: format!("{:?}", result),
                    })?;
                self.add(Event::new(EventKind::Read, addr.clone(), size), out);
                self.events.flush(out);
            }

            Stmt::Llsc {
                addr,
                store_data: Some(data),
                ..
            } => {
                let size = size_of(data)?;
                self.add(Event::new(EventKind::Write, addr.clone(), size), out);
            }

            Stmt::Exit { .. } => self.events.flush(out),

            Stmt::Helper(_) | Stmt::Opaque(_) => {
                return Err(InstrumentError::Unsupported {
                    index,
                    op: format!("{:?}", stmt),
                })
            }
        }

        out.push(stmt.clone());
        Ok(())
    }

    fn instrument_dirty(
        &mut self,
        index: usize,
        dirty: &Dirty,
        out: &mut Vec<Stmt>,
    ) -> Result<(), InstrumentError> {
        let range = match (dirty.effect, &dirty.mem) {
            (Effect::None, None) => return Ok(()),
            (effect, Some(range)) if effect != Effect::None && range.size != 0 => range,
            (effect, range) => {
                return Err(InstrumentError::BadEffect {
                    index,
                    callee: dirty.callee.clone(),
                    effect,
                    range: range.as_ref().map(|r| r.size),
                })
            }
        };

        let event = |kind| Event {
            kind,
            addr: range.addr.clone(),
            size: range.size,
            guard: dirty.guard.clone(),
        };
        match dirty.effect {
            Effect::Read => self.add(event(EventKind::Read), out),
            Effect::Write => self.add(event(EventKind::Write), out),
            // Reported as a separate read and write, not as a modify.
            Effect::Modify => {
                self.push(event(EventKind::Read), out);
                self.push(event(EventKind::Write), out);
            }
            Effect::None => {}
        }
        Ok(())
    }

    fn announce_function(&mut self, addr: u64, out: &mut Vec<Stmt>) {
        let name = match self.symbols.function_name(addr) {
            Some(name) => name,
            None => return,
        };
        let is_entry = self.symbols.is_function_entry(addr);
        if self.functions.changed(&name, is_entry) {
            // Keep the announcement behind the previous instruction's accesses.
            self.events.flush(out);
            out.push(Stmt::Helper(HelperCall::Function { name }));
        }
    }

    fn add(&mut self, event: Event, out: &mut Vec<Stmt>) {
        if self.trace_memory {
            self.events.add(event, out);
        }
    }

    fn push(&mut self, event: Event, out: &mut Vec<Stmt>) {
        if self.trace_memory {
            self.events.push(event, out);
        }
    }
}
