//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep process ids, trap handles and mapping ids from
//! being mixed up at the host boundary.

use std::fmt;
use std::str::FromStr;

use super::errors::EngineError;

/// Process ID
///
/// Signed, because the signal path carries the host's `pid_t` verbatim
/// (`-1` addresses every process the caller may signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Pid(pid)
    }
}

impl From<Pid> for i32 {
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

/// Instrumented entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// File access check (`faccessat`)
    Access,
    /// File open (`openat`)
    Openat,
    /// Signal delivery (`kill`)
    Kill,
}

impl HookKind {
    pub const ALL: [HookKind; 3] = [HookKind::Access, HookKind::Openat, HookKind::Kill];

    /// Name used by control commands and status keys
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            HookKind::Access => "access",
            HookKind::Openat => "openat",
            HookKind::Kill => "kill",
        }
    }

    /// Position in per-hook tables
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            HookKind::Access => 0,
            HookKind::Openat => 1,
            HookKind::Kill => 2,
        }
    }

    /// Log target for observation records
    #[must_use]
    pub const fn log_target(self) -> &'static str {
        match self {
            HookKind::Access => "tracehook::access",
            HookKind::Openat => "tracehook::openat",
            HookKind::Kill => "tracehook::kill",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(HookKind::Access),
            "openat" => Ok(HookKind::Openat),
            "kill" => Ok(HookKind::Kill),
            other => Err(EngineError::InvalidArgument(format!("Unknown hook: {other}"))),
        }
    }
}

/// How the filter list is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Only matching processes are observed
    #[default]
    Whitelist,
    /// Matching processes are skipped
    Blacklist,
}

impl FilterMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FilterMode::Whitelist => "whitelist",
            FilterMode::Blacklist => "blacklist",
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a filter decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Observe,
    Skip,
}

/// Handle identifying one registered hardware trap
///
/// Assigned by the trap facility; the engine only compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrapHandle(pub u64);

impl TrapHandle {
    /// Reserved value meaning "no trap registered"
    pub const NONE: TrapHandle = TrapHandle(0);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TrapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trap#{}", self.0)
    }
}

/// Identifier of one mapping inside an address-space view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(pub u64);

/// Identity of the file backing a mapping
///
/// Two mappings map the same file exactly when their `FileId`s are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);
