//! Pending memory events of the code unit being instrumented.
//!
//! Events are buffered instead of being turned into helper calls right away,
//! so that a load followed by a store to the same location (`x += 1`) is
//! reported once as a [`Modify`](EventKind::Modify).

use std::fmt;

use log::trace;

use crate::ir::{Expr, HelperCall, Stmt};

/// Maximum number of buffered events.
pub const N_EVENTS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    InstrFetch,
    Read,
    Write,
    Modify,
}

impl EventKind {
    /// Label used in trace lines.
    pub fn label(self) -> &'static str {
        match self {
            EventKind::InstrFetch => "Instr",
            EventKind::Read => "Load",
            EventKind::Write => "Store",
            EventKind::Modify => "Modify",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Instr" => Some(EventKind::InstrFetch),
            "Load" => Some(EventKind::Read),
            "Store" => Some(EventKind::Write),
            "Modify" => Some(EventKind::Modify),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub addr: Expr,
    pub size: usize,
    pub guard: Option<Expr>,
}

impl Event {
    pub fn new(kind: EventKind, addr: Expr, size: usize) -> Self {
        Event {
            kind,
            addr,
            size,
            guard: None,
        }
    }

    pub fn guarded(kind: EventKind, addr: Expr, size: usize, guard: Expr) -> Self {
        Event {
            kind,
            addr,
            size,
            guard: Some(guard),
        }
    }

    fn into_call(self) -> Stmt {
        Stmt::Helper(HelperCall::Access {
            kind: self.kind,
            addr: self.addr,
            size: self.size,
            guard: self.guard,
        })
    }
}

/// FIFO of at most [`N_EVENTS`] events.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Event>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    pub fn new() -> Self {
        EventBuffer {
            events: Vec::with_capacity(N_EVENTS),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Drop buffered events without emitting them.  Called at the start of
    /// every code unit.
    pub fn reset(&mut self) {
        self.events.clear();
    }

    /// Buffer `event`, turning a preceding matching read into a modify when
    /// `event` is an unguarded write.  Flushes into `out` first if the buffer
    /// is full.
    pub fn add(&mut self, event: Event, out: &mut Vec<Stmt>) {
        if event.kind == EventKind::Write && event.guard.is_none() {
            if let Some(last) = self.events.last_mut() {
                if last.kind == EventKind::Read
                    && last.size == event.size
                    && last.guard.is_none()
                    && last.addr == event.addr
                {
                    last.kind = EventKind::Modify;
                    return;
                }
            }
        }
        self.push(event, out);
    }

    /// Buffer `event` as is, never merging it.
    pub fn push(&mut self, event: Event, out: &mut Vec<Stmt>) {
        if self.events.len() == N_EVENTS {
            self.flush(out);
        }
        self.events.push(event);
    }

    /// Emit one helper call per buffered event, in insertion order, and
    /// empty the buffer.
    pub fn flush(&mut self, out: &mut Vec<Stmt>) {
        if !self.events.is_empty() {
            trace!("flushing {} events", self.events.len());
        }
        out.extend(self.events.drain(..).map(Event::into_call));
    }
}
