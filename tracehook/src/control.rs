//! Control command surface
//!
//! Text commands in, text replies out. A command is parsed completely before
//! anything changes, so a rejected command leaves the engine as it was.
//!
//! | Command | Effect |
//! |---|---|
//! | `get_status` | flags, counters, filters, breakpoint summary |
//! | `enable` / `disable` | global switch |
//! | `enable_<hook>` / `disable_<hook>` | per-hook switch (`access`, `openat`, `kill`) |
//! | `reset_counters` | zero the event counters |
//! | `set_whitelist` / `set_blacklist` | filter mode |
//! | `add_filter:name:<s>` / `add_filter:pid:<n>` | append a filter |
//! | `clear_filters` | drop every filter |
//! | `bp_set:<addr>:<kind>:<width>[:<pid>][:<desc>]` | install a hardware breakpoint |
//! | `bp_clear:<index>` / `bp_clear_all` | remove breakpoints |
//! | `bp_list` | describe populated slots |
//! | `bp_verbose_on` / `bp_verbose_off` | record the verbose flag |
//! | `mem_read:<pid>:<addr>:<size>` | hex dump of another process's memory |
//! | `help` | command summary |
//!
//! Addresses are hexadecimal with an optional `0x` prefix; every other number
//! is decimal.

use std::fmt;
use std::str::FromStr;

use log::info;
use serde::Serialize;
use tracehook_common::{BreakpointKind, BreakpointWidth};

use crate::domain::{EngineError, FilterMode, HookKind, Pid};
use crate::engine::breakpoints::BreakpointRequest;
use crate::engine::filter::FilterEntry;
use crate::engine::memory_reader::{hex_capacity, MAX_HEX_READ};
use crate::engine::Engine;

pub const HELP_TEXT: &str = "\
Available commands:
  get_status                         - Get engine status
  enable                             - Enable all hooks
  disable                            - Disable all hooks
  enable_access                      - Enable access hook
  disable_access                     - Disable access hook
  enable_openat                      - Enable openat hook
  disable_openat                     - Disable openat hook
  enable_kill                        - Enable kill hook
  disable_kill                       - Disable kill hook
  reset_counters                     - Reset hook counters
  set_whitelist                      - Set filter mode to whitelist
  set_blacklist                      - Set filter mode to blacklist
  add_filter:name:X                  - Add name filter
  add_filter:pid:X                   - Add PID filter
  clear_filters                      - Clear all filters
  bp_set:ADDR:KIND:WIDTH[:PID][:DESC] - Set hardware breakpoint
                                       KIND: exec|write|read|rw (or 0-3), WIDTH: 1|2|4|8
  bp_clear:INDEX                     - Clear hardware breakpoint
  bp_clear_all                       - Clear all hardware breakpoints
  bp_list                            - List hardware breakpoints
  bp_verbose_on                      - Request verbose breakpoint logging
  bp_verbose_off                     - Minimal breakpoint logging
  mem_read:PID:ADDR:SIZE             - Read process memory as hex (SIZE 1-256)
  help                               - Show this help";

/// A parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    SetEnabled(bool),
    SetHook(HookKind, bool),
    ResetCounters,
    SetMode(FilterMode),
    AddFilter(FilterEntry),
    ClearFilters,
    BpSet(BreakpointRequest),
    BpClear(usize),
    BpClearAll,
    BpList,
    BpVerbose(bool),
    MemRead { pid: Pid, address: u64, size: usize },
    Help,
}

impl FromStr for Command {
    type Err = EngineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let command = match line {
            "get_status" => Command::Status,
            "enable" => Command::SetEnabled(true),
            "disable" => Command::SetEnabled(false),
            "reset_counters" => Command::ResetCounters,
            "set_whitelist" => Command::SetMode(FilterMode::Whitelist),
            "set_blacklist" => Command::SetMode(FilterMode::Blacklist),
            "clear_filters" => Command::ClearFilters,
            "bp_clear_all" => Command::BpClearAll,
            "bp_list" => Command::BpList,
            "bp_verbose_on" => Command::BpVerbose(true),
            "bp_verbose_off" => Command::BpVerbose(false),
            "help" => Command::Help,
            _ => {
                if let Some(hook) = line.strip_prefix("enable_") {
                    Command::SetHook(hook.parse().map_err(|_| unknown(line))?, true)
                } else if let Some(hook) = line.strip_prefix("disable_") {
                    Command::SetHook(hook.parse().map_err(|_| unknown(line))?, false)
                } else if let Some(spec) = line.strip_prefix("add_filter:") {
                    Command::AddFilter(parse_filter(spec)?)
                } else if let Some(spec) = line.strip_prefix("bp_set:") {
                    Command::BpSet(parse_breakpoint(spec)?)
                } else if let Some(index) = line.strip_prefix("bp_clear:") {
                    Command::BpClear(index.trim().parse().map_err(|_| {
                        EngineError::InvalidArgument(format!("Invalid breakpoint index: {index}"))
                    })?)
                } else if let Some(spec) = line.strip_prefix("mem_read:") {
                    parse_mem_read(spec)?
                } else {
                    return Err(unknown(line));
                }
            }
        };
        Ok(command)
    }
}

fn unknown(line: &str) -> EngineError {
    EngineError::InvalidArgument(format!("Unknown command: {line} (try 'help')"))
}

fn parse_filter(spec: &str) -> Result<FilterEntry, EngineError> {
    if let Some(name) = spec.strip_prefix("name:") {
        if name.is_empty() {
            return Err(EngineError::InvalidArgument("Filter name is empty".to_string()));
        }
        Ok(FilterEntry::name(name))
    } else if let Some(pid) = spec.strip_prefix("pid:") {
        match pid.parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(FilterEntry::pid(Pid(pid))),
            _ => Err(EngineError::InvalidArgument("Invalid PID".to_string())),
        }
    } else {
        Err(EngineError::InvalidArgument("Invalid filter format".to_string()))
    }
}

/// Hexadecimal, with or without `0x`
pub fn parse_address(text: &str) -> Result<u64, EngineError> {
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|_| EngineError::InvalidArgument(format!("Invalid address: {text}")))
}

fn parse_kind(text: &str) -> Result<BreakpointKind, EngineError> {
    match text {
        "exec" | "x" | "0" => Ok(BreakpointKind::Exec),
        "write" | "w" | "1" => Ok(BreakpointKind::Write),
        "read" | "r" | "2" => Ok(BreakpointKind::Read),
        "rw" | "read-write" | "3" => Ok(BreakpointKind::ReadWrite),
        other => Err(EngineError::InvalidArgument(format!("Invalid breakpoint type: {other}"))),
    }
}

fn parse_width(text: &str) -> Result<BreakpointWidth, EngineError> {
    text.parse::<u64>()
        .ok()
        .and_then(BreakpointWidth::from_bytes)
        .ok_or_else(|| EngineError::InvalidArgument(format!("Invalid breakpoint size: {text}")))
}

/// `<addr>:<kind>:<width>[:<pid>][:<desc>]`; a numeric fourth field is the pid
fn parse_breakpoint(spec: &str) -> Result<BreakpointRequest, EngineError> {
    let mut fields = spec.splitn(4, ':');
    let (Some(address), Some(kind), Some(width)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(EngineError::InvalidArgument(
            "Usage: bp_set:ADDR:KIND:WIDTH[:PID][:DESC]".to_string(),
        ));
    };

    let mut request =
        BreakpointRequest::new(parse_address(address)?, parse_kind(kind)?, parse_width(width)?);

    if let Some(rest) = fields.next() {
        let (first, tail) = match rest.split_once(':') {
            Some((first, tail)) => (first, Some(tail)),
            None => (rest, None),
        };
        if !first.is_empty() && first.bytes().all(|b| b.is_ascii_digit()) {
            let pid = first
                .parse::<i32>()
                .map_err(|_| EngineError::InvalidArgument(format!("Invalid PID: {first}")))?;
            request = request.for_process(Pid(pid));
            request = request.describe(tail.unwrap_or(""));
        } else {
            request = request.describe(rest);
        }
    }

    Ok(request)
}

fn parse_mem_read(spec: &str) -> Result<Command, EngineError> {
    let usage = || EngineError::InvalidArgument("Usage: mem_read:PID:ADDR:SIZE".to_string());
    let mut fields = spec.split(':');
    let (Some(pid), Some(address), Some(size), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(usage());
    };

    let pid = match pid.parse::<i32>() {
        Ok(pid) if pid > 0 => Pid(pid),
        _ => return Err(EngineError::InvalidArgument(format!("Invalid PID: {pid}"))),
    };
    let size = size
        .parse::<usize>()
        .map_err(|_| EngineError::InvalidArgument(format!("Invalid size: {size}")))?;

    Ok(Command::MemRead { pid, address: parse_address(address)?, size })
}

/// Reply to one control command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlReply {
    /// `0` on success, a negative errno on failure
    pub status: i32,
    pub message: String,
}

impl ControlReply {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

impl From<Result<String, EngineError>> for ControlReply {
    fn from(result: Result<String, EngineError>) -> Self {
        match result {
            Ok(message) => ControlReply { status: 0, message },
            Err(err) => ControlReply { status: err.errno(), message: format!("Error: {err}") },
        }
    }
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Parse and run one command line
pub fn dispatch(engine: &Engine, line: &str) -> ControlReply {
    let line = line.trim();
    info!("[control] received command: {line}");
    line.parse::<Command>().and_then(|command| execute(engine, &command)).into()
}

/// Run a parsed command
///
/// # Errors
/// Whatever the targeted component reports; state is unchanged on error
pub fn execute(engine: &Engine, command: &Command) -> Result<String, EngineError> {
    let config = engine.config();
    let reply = match command {
        Command::Status => engine.status().to_string(),
        Command::SetEnabled(true) => {
            config.set_enabled(true);
            "Hooks enabled".to_string()
        }
        Command::SetEnabled(false) => {
            config.set_enabled(false);
            "Hooks disabled".to_string()
        }
        Command::SetHook(hook, enabled) => {
            config.set_hook_enabled(*hook, *enabled);
            let name = capitalize(hook.as_str());
            format!("{name} hook {}", if *enabled { "enabled" } else { "disabled" })
        }
        Command::ResetCounters => {
            config.reset_counters();
            "Counters reset".to_string()
        }
        Command::SetMode(mode) => {
            config.set_filter_mode(*mode);
            format!("Filter mode: {mode}")
        }
        Command::AddFilter(entry) => {
            config.add_filter(entry.clone())?;
            if entry.pid > 0 {
                format!("Added filter: pid={}", entry.pid)
            } else {
                format!("Added filter: name={}", entry.name)
            }
        }
        Command::ClearFilters => {
            config.clear_filters();
            "All filters cleared".to_string()
        }
        Command::BpSet(request) => {
            let index = engine.breakpoints().set(request)?;
            format!("Breakpoint {index} set at 0x{:x}", request.address)
        }
        Command::BpClear(index) => {
            engine.breakpoints().clear(*index)?;
            format!("Breakpoint {index} cleared")
        }
        Command::BpClearAll => {
            let cleared = engine.breakpoints().clear_all();
            format!("All breakpoints cleared ({cleared})")
        }
        Command::BpList => {
            let list = engine.breakpoints().list();
            if list.is_empty() {
                "No hardware breakpoints set".to_string()
            } else {
                list.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
            }
        }
        Command::BpVerbose(verbose) => {
            engine.breakpoints().set_verbose(*verbose);
            if *verbose {
                "Breakpoint verbose mode: on (minimal logging only)".to_string()
            } else {
                "Breakpoint verbose mode: off".to_string()
            }
        }
        Command::MemRead { pid, address, size } => {
            let (n, hex) =
                engine.memory().read_hex(*pid, *address, hex_capacity(MAX_HEX_READ), *size)?;
            format!("Read {n} bytes from {pid} at 0x{address:x}:\n{hex}")
        }
        Command::Help => HELP_TEXT.to_string(),
    };
    Ok(reply)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("get_status".parse::<Command>().unwrap(), Command::Status);
        assert_eq!("disable_kill".parse::<Command>().unwrap(), Command::SetHook(HookKind::Kill, false));
        assert_eq!("bp_verbose_on".parse::<Command>().unwrap(), Command::BpVerbose(true));
        assert_eq!("bp_clear:3".parse::<Command>().unwrap(), Command::BpClear(3));
    }

    #[test]
    fn test_unknown_command() {
        let err = "enable_everything".parse::<Command>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: enable_everything (try 'help')");
        assert!("frobnicate".parse::<Command>().is_err());
    }

    #[test]
    fn test_parse_filters() {
        assert_eq!(
            "add_filter:name:com.app".parse::<Command>().unwrap(),
            Command::AddFilter(FilterEntry::name("com.app"))
        );
        assert_eq!(
            "add_filter:pid:42".parse::<Command>().unwrap(),
            Command::AddFilter(FilterEntry::pid(Pid(42)))
        );
        for bad in ["add_filter:pid:0", "add_filter:pid:-3", "add_filter:pid:12abc", "add_filter:uid:1"] {
            assert!(matches!(bad.parse::<Command>(), Err(EngineError::InvalidArgument(_))), "{bad}");
        }
    }

    #[test]
    fn test_parse_bp_set_variants() {
        let Command::BpSet(plain) = "bp_set:0x7000:exec:4".parse::<Command>().unwrap() else {
            panic!("expected bp_set");
        };
        assert_eq!(plain, BreakpointRequest::new(0x7000, BreakpointKind::Exec, BreakpointWidth::Four));

        let Command::BpSet(scoped) = "bp_set:7000:1:8:1234:watch:counter".parse::<Command>().unwrap()
        else {
            panic!("expected bp_set");
        };
        assert_eq!(scoped.kind, BreakpointKind::Write);
        assert_eq!(scoped.width, BreakpointWidth::Eight);
        assert_eq!(scoped.pid, Some(Pid(1234)));
        assert_eq!(scoped.description, "watch:counter");

        let Command::BpSet(described) = "bp_set:7000:rw:2:hot path".parse::<Command>().unwrap() else {
            panic!("expected bp_set");
        };
        assert_eq!(described.pid, None);
        assert_eq!(described.description, "hot path");
    }

    #[test]
    fn test_parse_bp_set_rejects_bad_fields() {
        for bad in ["bp_set:zz:exec:4", "bp_set:1000:jump:4", "bp_set:1000:exec:3", "bp_set:1000:exec"] {
            assert!(matches!(bad.parse::<Command>(), Err(EngineError::InvalidArgument(_))), "{bad}");
        }
    }

    #[test]
    fn test_parse_mem_read() {
        assert_eq!(
            "mem_read:100:0x4000:16".parse::<Command>().unwrap(),
            Command::MemRead { pid: Pid(100), address: 0x4000, size: 16 }
        );
        assert!("mem_read:100:0x4000".parse::<Command>().is_err());
        assert!("mem_read:x:0x4000:16".parse::<Command>().is_err());
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("openat"), "Openat");
        assert_eq!(capitalize(""), "");
    }
}
