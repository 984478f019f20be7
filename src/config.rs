//! Tracer options.
//!
//! Options come from a YAML file named by `MEMTRACE_CONFIG` and/or a
//! command-line style string in `MEMTRACE_OPTIONS`, e.g.
//!
//! ```bash
//! MEMTRACE_OPTIONS="--all-refs=no --num-callers=4" LD_PRELOAD=libmemtrace_preload.so ./my_program
//! ```

use std::{env, ffi::OsStr, fs, io, path::PathBuf};

use getopts::{Matches, Options};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const OPTIONS_VAR: &str = "MEMTRACE_OPTIONS";
pub const CONFIG_VAR: &str = "MEMTRACE_CONFIG";

/// Default number of stack frames in an allocation report.
pub const DEFAULT_NUM_CALLERS: usize = 12;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Options(#[from] getopts::Fail),
    #[error("invalid value `{value}` for --{option}: expected yes or no")]
    Bool { option: String, value: String },
    #[error("invalid value `{value}` for --{option}: expected a number")]
    Number { option: String, value: String },
    #[error("unexpected argument `{0}`")]
    Unexpected(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Register memory events while instrumenting.
    pub trace_memory: bool,
    /// Report every access; otherwise only accesses that hit a tracked
    /// allocation, annotated with the offset into it.
    pub trace_all: bool,
    /// Announce the enclosing function when it changes.
    pub show_function_names: bool,
    /// Print instruction fetches.
    pub trace_instructions: bool,
    /// Stack frames per allocation report.
    pub num_callers: usize,
    /// Trace output file; stderr when unset.
    pub log_file: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            trace_memory: true,
            trace_all: true,
            show_function_names: true,
            trace_instructions: false,
            num_callers: DEFAULT_NUM_CALLERS,
            log_file: None,
        }
    }
}

// (option, alias, help)
type Flag = (&'static str, &'static str, &'static str);

const MEM_TRACE: Flag = ("mem-trace", "trace-memory", "trace all memory accesses [yes]");
const ALL_REFS: Flag = ("all-refs", "trace-all", "trace all memory references [yes]");
const FN_NAMES: Flag = ("fn-names", "show-function-names", "announce the enclosing function [yes]");
const TRACE_INSTR: &str = "trace-instr";
const NUM_CALLERS: &str = "num-callers";
const LOG_FILE: &str = "log-file";

fn options() -> Options {
    let mut opts = Options::new();
    for &(name, alias, desc) in &[MEM_TRACE, ALL_REFS, FN_NAMES] {
        opts.optopt("", name, desc, "yes|no");
        opts.optopt("", alias, "", "yes|no");
    }
    opts.optopt("", TRACE_INSTR, "print instruction fetches [no]", "yes|no");
    opts.optopt(
        "",
        NUM_CALLERS,
        "stack frames in allocation reports [12]",
        "<n>",
    );
    opts.optopt("", LOG_FILE, "write the trace to <file> [stderr]", "<file>");
    opts
}

fn parse_bool(option: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(ConfigError::Bool {
            option: option.to_string(),
            value: value.to_string(),
        }),
    }
}

// The alias wins when both spellings are given.
fn flag(matches: &Matches, (name, alias, _): Flag, current: bool) -> Result<bool, ConfigError> {
    let mut value = current;
    for option in &[name, alias] {
        if let Some(text) = matches.opt_str(option) {
            value = parse_bool(option, &text)?;
        }
    }
    Ok(value)
}

impl TraceConfig {
    /// Help text for the options understood by [`TraceConfig::apply_args`].
    pub fn usage() -> String {
        options().usage("memtrace options:")
    }

    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        let mut config = Self::default();
        config.apply_args(args)?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads `MEMTRACE_CONFIG`, then overrides it with `MEMTRACE_OPTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var_os(CONFIG_VAR) {
            Some(path) => {
                let path = PathBuf::from(path);
                let text = fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };
        if let Ok(opts) = env::var(OPTIONS_VAR) {
            config.apply_args(opts.split_whitespace())?;
        }
        Ok(config)
    }

    /// Override fields with the options present in `args`.
    pub fn apply_args<I>(&mut self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        let matches = options().parse(args)?;
        if let Some(arg) = matches.free.first() {
            return Err(ConfigError::Unexpected(arg.clone()));
        }

        self.trace_memory = flag(&matches, MEM_TRACE, self.trace_memory)?;
        self.trace_all = flag(&matches, ALL_REFS, self.trace_all)?;
        self.show_function_names = flag(&matches, FN_NAMES, self.show_function_names)?;
        if let Some(value) = matches.opt_str(TRACE_INSTR) {
            self.trace_instructions = parse_bool(TRACE_INSTR, &value)?;
        }
        if let Some(value) = matches.opt_str(NUM_CALLERS) {
            self.num_callers = value.parse().map_err(|_| ConfigError::Number {
                option: NUM_CALLERS.to_string(),
                value,
            })?;
        }
        if let Some(value) = matches.opt_str(LOG_FILE) {
            self.log_file = Some(PathBuf::from(value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_trace_everything() {
        let config = TraceConfig::default();
        assert!(config.trace_memory);
        assert!(config.trace_all);
        assert!(config.show_function_names);
        assert!(!config.trace_instructions);
        assert_eq!(config.num_callers, DEFAULT_NUM_CALLERS);
    }

    #[test]
    fn mem_trace_and_all_refs() {
        let config = TraceConfig::from_args(&["--mem-trace=no", "--all-refs=no"]).unwrap();
        assert!(!config.trace_memory);
        assert!(!config.trace_all);
        assert!(config.show_function_names);
    }

    #[test]
    fn aliases_and_numbers() {
        let config = TraceConfig::from_args(&[
            "--trace-all=no",
            "--show-function-names=no",
            "--trace-instr=yes",
            "--num-callers=3",
            "--log-file=trace.out",
        ])
        .unwrap();
        assert!(!config.trace_all);
        assert!(!config.show_function_names);
        assert!(config.trace_instructions);
        assert_eq!(config.num_callers, 3);
        assert_eq!(config.log_file, Some(PathBuf::from("trace.out")));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            TraceConfig::from_args(&["--all-refs=maybe"]),
            Err(ConfigError::Bool { .. })
        ));
        assert!(matches!(
            TraceConfig::from_args(&["--num-callers=lots"]),
            Err(ConfigError::Number { .. })
        ));
        assert!(matches!(
            TraceConfig::from_args(&["--no-such-option=yes"]),
            Err(ConfigError::Options(_))
        ));
        assert!(matches!(
            TraceConfig::from_args(&["stray"]),
            Err(ConfigError::Unexpected(_))
        ));
    }

    #[test]
    fn yaml_fills_in_defaults() {
        let config = TraceConfig::from_yaml("trace_all: false\nnum_callers: 2\n").unwrap();
        assert!(!config.trace_all);
        assert!(config.trace_memory);
        assert_eq!(config.num_callers, 2);
    }
}
