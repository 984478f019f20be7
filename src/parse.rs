//! Analysis of trace logs written by [`LineReporter`](crate::report::LineReporter).
//!
//! [`collect_allocations`] finds the allocation reports in a log,
//! [`filter_whitelisted`] and [`select_targets`] narrow them down by the
//! functions on their stacks, and [`trace_allocation`] extracts the accesses
//! to one of them.

use std::{
    collections::HashMap,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::EventKind;

/// Functions whose allocations are skipped unless a whitelist file is given.
pub const DEFAULT_WHITELIST: &[&str] = &["printf", "vprintf"];

const DETECTED: &str = "Detected allocation";
const FUNCTION: &str = "Function ";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One allocation report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub address: usize,
    pub size: usize,
    /// Stack frames, innermost first, as printed: `0x...: function (file:line)`.
    pub stack: Vec<String>,
    /// Line of the `Address:` summary, counting from 1.
    pub line: usize,
}

impl AllocationInfo {
    /// Function names on the stack, innermost first.
    pub fn functions(&self) -> impl Iterator<Item = &str> + '_ {
        self.stack.iter().map(|frame| frame_function(frame))
    }

    /// Outermost function on the stack.
    pub fn origin(&self) -> Option<&str> {
        self.functions().last()
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.address && address - self.address < self.size
    }
}

// "0x55D1C3A4B2: my::func (src/lib.rs:18)" -> "my::func"
fn frame_function(frame: &str) -> &str {
    let name = match frame.split_once(": ") {
        Some((_, name)) => name,
        None => frame,
    };
    match name.rfind(" (") {
        Some(pos) if name.ends_with(')') => &name[..pos],
        _ => name,
    }
}

// "==77==    by ..." -> ("77", "by ...")
fn split_line(line: &str) -> Option<(&str, &str)> {
    let (pid, body) = line.trim_end().strip_prefix("==")?.split_once("== ")?;
    Some((pid, body.trim_start()))
}

// Text after the `==pid==` prefix.
fn message(line: &str) -> Option<&str> {
    split_line(line).map(|(_, body)| body)
}

fn parse_hex(text: &str) -> Option<usize> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    usize::from_str_radix(digits, 16).ok()
}

// "Address: 0x1000, Size: 16"
fn parse_summary(body: &str) -> Option<(usize, usize)> {
    let (address, size) = body.strip_prefix("Address: ")?.split_once(", Size: ")?;
    Some((parse_hex(address)?, size.trim().parse().ok()?))
}

/// Parse an access line body such as `Load 0x1004 4 in 0x1000+4`.
pub fn parse_access(body: &str) -> Option<(EventKind, usize, usize)> {
    let mut words = body.split_whitespace();
    let kind = EventKind::from_label(words.next()?)?;
    let address = parse_hex(words.next()?)?;
    let size = words.next()?.parse().ok()?;
    Some((kind, address, size))
}

/// Scan a trace log for allocation reports.
///
/// Processes sharing the log (e.g. children that inherited it) may
/// interleave their lines, so a report is only continued by lines with the
/// same `==pid==` prefix.  A report cut short by anything other than a frame
/// or its summary is dropped.
pub fn collect_allocations<R: BufRead>(reader: R) -> Result<Vec<AllocationInfo>, ParseError> {
    let mut allocations = Vec::new();
    // Frames of the report being read, by process.
    let mut pending: HashMap<String, Vec<String>> = HashMap::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let (pid, body) = match split_line(&line) {
            Some(parts) => parts,
            None => continue,
        };
        if let Some(mut stack) = pending.remove(pid) {
            if let Some(frame) = body.strip_prefix("at ").or_else(|| body.strip_prefix("by ")) {
                stack.push(frame.to_string());
                pending.insert(pid.to_string(), stack);
                continue;
            }
            match parse_summary(body) {
                Some((address, size)) => {
                    allocations.push(AllocationInfo {
                        address,
                        size,
                        stack,
                        line: index + 1,
                    });
                    continue;
                }
                None => warn!(
                    "line {}: dropping unterminated allocation report of process {}",
                    index + 1,
                    pid
                ),
            }
        }
        if body.starts_with(DETECTED) {
            pending.insert(pid.to_string(), Vec::new());
        }
    }
    Ok(allocations)
}

/// Whitespace-separated list of function names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionList {
    names: Vec<String>,
}

impl FunctionList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FunctionList {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn default_whitelist() -> Self {
        Self::new(DEFAULT_WHITELIST.iter().copied())
    }

    pub fn parse(text: &str) -> Self {
        Self::new(text.split_whitespace())
    }

    pub fn load(path: &Path) -> Result<Self, ParseError> {
        let text = fs::read_to_string(path).map_err(|source| ParseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn contains(&self, function: &str) -> bool {
        self.names.iter().any(|name| name == function)
    }

    /// Does any function on the stack of `info` appear in the list?
    pub fn mentioned_by(&self, info: &AllocationInfo) -> bool {
        info.functions().any(|function| self.contains(function))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Drop allocations made under a whitelisted function.
pub fn filter_whitelisted(
    allocations: Vec<AllocationInfo>,
    whitelist: &FunctionList,
) -> Vec<AllocationInfo> {
    allocations
        .into_iter()
        .filter(|info| !whitelist.mentioned_by(info))
        .collect()
}

/// Keep only allocations made under one of `targets`.
pub fn select_targets(
    allocations: Vec<AllocationInfo>,
    targets: &FunctionList,
) -> Vec<AllocationInfo> {
    allocations
        .into_iter()
        .filter(|info| targets.mentioned_by(info))
        .collect()
}

/// Copy the function announcements and the data accesses that fall inside
/// the block of `info` from `reader` to `writer`.  Returns the number of
/// accesses copied.
pub fn trace_allocation<R, W>(reader: R, mut writer: W, info: &AllocationInfo) -> Result<usize, ParseError>
where
    R: BufRead,
    W: Write,
{
    let mut accesses = 0;
    for line in reader.lines() {
        let line = line?;
        let body = match message(&line) {
            Some(body) => body,
            None => continue,
        };
        let keep = if body.starts_with(FUNCTION) {
            true
        } else {
            match parse_access(body) {
                Some((EventKind::InstrFetch, ..)) | None => false,
                Some((_, address, _)) if info.contains(address) => {
                    accesses += 1;
                    true
                }
                Some(_) => false,
            }
        };
        if keep {
            writeln!(writer, "{}", line)?;
        }
    }
    writer.flush()?;
    Ok(accesses)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
==77== Function main
==77== Detected allocation in thread 1
==77==    at 0x4C2DB8F: malloc (preload.rs:20)
==77==    by 0x40057D: make_buffer (demo.c:5)
==77==    by 0x4005A0: main (demo.c:12)
==77== Address: 0x1000, Size: 16
==77== Store 0x1000 4 in 0x1000+0
==77== Instr 0x400600 3
==77== Detected allocation in thread 1
==77==    at 0x4C2DB8F: malloc (preload.rs:20)
==77==    by 0x4E80A11: vprintf
==77==    by 0x4005B0: ???
==77== Address: 0x2000, Size: 1,024
==77== Function printf
==77== Load 0x100c 4 in 0x1000+12
==77== Modify 0x1010 1
==77== Load 0x0ff0 8
not a trace line
";

    #[test]
    fn allocations_are_collected() {
        // The second report's size has a thousands separator.
        let allocations = collect_allocations(LOG.as_bytes()).unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].address, 0x1000);

        let log = LOG.replace("1,024", "1024");
        let allocations = collect_allocations(log.as_bytes()).unwrap();
        assert_eq!(allocations.len(), 2);

        let first = &allocations[0];
        assert_eq!((first.address, first.size, first.line), (0x1000, 16, 6));
        assert_eq!(
            first.functions().collect::<Vec<_>>(),
            vec!["malloc", "make_buffer", "main"]
        );
        assert_eq!(first.origin(), Some("main"));

        let second = &allocations[1];
        assert_eq!((second.address, second.size), (0x2000, 1024));
        assert_eq!(
            second.functions().collect::<Vec<_>>(),
            vec!["malloc", "vprintf", "???"]
        );
    }

    #[test]
    fn reports_of_other_processes_interleave() {
        let log = "\
==100== Detected allocation in thread 1
==100==    at 0x4C2DB8F: malloc (preload.rs:20)
==101== Load 0x5000 4
==101== Detected allocation in thread 7
==100==    by 0x40057D: make_buffer (demo.c:5)
==101==    at 0x4C2DB8F: malloc (preload.rs:20)
==100== Address: 0x1000, Size: 16
==101== Address: 0x5000, Size: 8
==100== Detected allocation in thread 1
==100== Store 0x1000 4 in 0x1000+0
==100== Detected allocation in thread 1
==100==    at 0x4C2DB8F: malloc (preload.rs:20)
==100== Address: 0x3000, Size: 32
";
        let allocations = collect_allocations(log.as_bytes()).unwrap();
        let found: Vec<_> = allocations
            .iter()
            .map(|info| (info.address, info.size, info.stack.len(), info.line))
            .collect();
        // The report cut short by an access on line 10 is dropped.
        assert_eq!(
            found,
            vec![(0x1000, 16, 2, 7), (0x5000, 8, 1, 8), (0x3000, 32, 1, 13)]
        );
        assert_eq!(allocations[0].origin(), Some("make_buffer"));
    }

    #[test]
    fn whitelist_and_targets() {
        let log = LOG.replace("1,024", "1024");
        let allocations = collect_allocations(log.as_bytes()).unwrap();

        let kept = filter_whitelisted(allocations.clone(), &FunctionList::default_whitelist());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].address, 0x1000);

        let kept = filter_whitelisted(allocations.clone(), &FunctionList::parse("nothing\n"));
        assert_eq!(kept.len(), 2);

        let targets = FunctionList::parse("  make_buffer\n other ");
        assert_eq!(targets.names().len(), 2);
        let kept = select_targets(allocations, &targets);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].size, 16);
    }

    #[test]
    fn trace_keeps_functions_and_accesses_inside_block() {
        let info = AllocationInfo {
            address: 0x1000,
            size: 16,
            stack: vec![],
            line: 6,
        };
        let mut out = Vec::new();
        let accesses = trace_allocation(LOG.as_bytes(), &mut out, &info).unwrap();

        assert_eq!(accesses, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "==77== Function main\n\
             ==77== Store 0x1000 4 in 0x1000+0\n\
             ==77== Function printf\n\
             ==77== Load 0x100c 4 in 0x1000+12\n"
        );
    }

    #[test]
    fn frame_functions() {
        assert_eq!(frame_function("0x1: main (demo.c:1)"), "main");
        assert_eq!(
            frame_function("0x1: <alloc::vec::Vec<T> as core::ops::drop::Drop>::drop (vec.rs:3)"),
            "<alloc::vec::Vec<T> as core::ops::drop::Drop>::drop"
        );
        assert_eq!(frame_function("0x1: ???"), "???");
    }

    #[test]
    fn access_lines() {
        assert_eq!(
            parse_access("Modify 0x1004 4 in 0x1000+4"),
            Some((EventKind::Modify, 0x1004, 4))
        );
        assert_eq!(parse_access("Function main"), None);
        assert_eq!(parse_access("Load zzz 4"), None);
    }
}
