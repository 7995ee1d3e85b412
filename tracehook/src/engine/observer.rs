//! Syscall observers
//!
//! Three handlers, one per instrumented entry point, called synchronously by
//! the interception layer before the observed operation runs. Each handler:
//!
//! 1. returns at once unless the global and per-hook switches are on
//! 2. asks the [`filter`](super::filter) whether this process is observed
//! 3. counts the event
//! 4. copies its arguments (user strings defensively)
//! 5. logs one record and the caller's user stack
//!
//! Handlers never fail, never panic and never wait: a filter snapshot that
//! cannot be taken promptly causes the event to be skipped.

use std::fmt;
use std::sync::Arc;

use log::info;
use tracehook_common::RegisterSnapshot;

use super::filter;
use super::unwinder::StackUnwinder;
use crate::config::EngineConfig;
use crate::domain::{HookKind, Pid, Verdict};
use crate::host::{ProcessIdentity, ProcessRef, ProcessTable, UserCopy};

/// Payload logged when a user path cannot be copied
pub const READ_ERROR: &str = "<read_error>";

/// Payload logged when the host has no user-string copy
pub const SYMBOL_MISSING: &str = "<symbol_missing>";

/// Longest user path copied, in bytes
pub const MAX_PATH_COPY: usize = 255;

/// Register slot holding the target pid of a signal call
const SIGNAL_PID_ARG: usize = 0;

/// Register slot holding the signal number of a signal call
const SIGNAL_NUM_ARG: usize = 1;

/// The task that made an observed call
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    pub process: ProcessRef,
    /// User registers at the point the task entered the kernel
    pub user_regs: RegisterSnapshot,
}

/// Arguments of an observed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDetail {
    Access { path: String, mode: i32 },
    Open { path: String, dfd: i32 },
    Signal { target: Pid, signal: i32 },
}

impl fmt::Display for EventDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDetail::Access { path, mode } => write!(f, "{path} [Mode:{mode}]"),
            EventDetail::Open { path, dfd } => write!(f, "{path} [DFD:{dfd}]"),
            EventDetail::Signal { target, signal } => {
                write!(f, "kill({target}, SIG:{signal})")
            }
        }
    }
}

/// What a handler logged
#[derive(Debug, Clone)]
pub struct Observation {
    pub hook: HookKind,
    pub pid: Pid,
    pub process_name: String,
    pub detail: EventDetail,
    /// Rendered stack lines, empty when no trace could be captured
    pub stack: Vec<String>,
}

impl Observation {
    /// The single-line record logged for this event
    #[must_use]
    pub fn record(&self) -> String {
        format!("[{}] ({}) -> {}", self.process_name, self.pid, self.detail)
    }
}

pub struct SyscallObserver {
    config: Arc<EngineConfig>,
    processes: Option<Arc<dyn ProcessTable>>,
    user_copy: Option<Arc<dyn UserCopy>>,
    unwinder: StackUnwinder,
}

impl SyscallObserver {
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        processes: Option<Arc<dyn ProcessTable>>,
        user_copy: Option<Arc<dyn UserCopy>>,
        unwinder: StackUnwinder,
    ) -> Self {
        Self { config, processes, user_copy, unwinder }
    }

    /// File access check: `filename` is the user pointer argument, `mode` the access mode
    pub fn on_access(&self, site: &CallSite, filename: u64, mode: i32) -> Option<Observation> {
        let identity = self.admit(HookKind::Access, site)?;
        self.config.record_event(HookKind::Access);

        let path = self.copy_path(site.process, filename);
        Some(self.emit(HookKind::Access, site, identity, EventDetail::Access { path, mode }))
    }

    /// File open: `dfd` is the directory descriptor, `filename` the user pointer argument
    pub fn on_open(&self, site: &CallSite, dfd: i32, filename: u64) -> Option<Observation> {
        let identity = self.admit(HookKind::Openat, site)?;
        self.config.record_event(HookKind::Openat);

        let path = self.copy_path(site.process, filename);
        Some(self.emit(HookKind::Openat, site, identity, EventDetail::Open { path, dfd }))
    }

    /// Signal delivery: target pid and signal are read from `args` (`x0`, `x1`)
    ///
    /// Out-of-bounds arguments are dropped without counting or logging.
    #[allow(clippy::cast_possible_truncation)]
    pub fn on_signal(&self, site: &CallSite, args: &RegisterSnapshot) -> Option<Observation> {
        let identity = self.admit(HookKind::Kill, site)?;

        let target = args.syscall_arg(SIGNAL_PID_ARG) as i32;
        let signal = args.syscall_arg(SIGNAL_NUM_ARG) as i32;
        if !self.config.signal_policy().accepts(target, signal) {
            return None;
        }

        self.config.record_event(HookKind::Kill);
        let detail = EventDetail::Signal { target: Pid(target), signal };
        Some(self.emit(HookKind::Kill, site, identity, detail))
    }

    /// Switch and filter checks; returns the caller's identity when observed
    fn admit(&self, hook: HookKind, site: &CallSite) -> Option<ProcessIdentity> {
        if !self.config.observing(hook) {
            return None;
        }

        let identity = self.identity(site.process);
        let filters = self.config.try_filters()?;
        match filter::decide(self.config.filter_mode(), filters.entries(), &identity) {
            Verdict::Observe => Some(identity),
            Verdict::Skip => None,
        }
    }

    fn identity(&self, process: ProcessRef) -> ProcessIdentity {
        match &self.processes {
            Some(table) => table.identity(process),
            None => ProcessIdentity { pid: process.pid, cmdline: None, comm: None },
        }
    }

    fn copy_path(&self, process: ProcessRef, addr: u64) -> String {
        let Some(copy) = &self.user_copy else {
            return SYMBOL_MISSING.to_string();
        };
        copy.copy_string(process, addr, MAX_PATH_COPY).unwrap_or_else(|_| READ_ERROR.to_string())
    }

    fn emit(
        &self,
        hook: HookKind,
        site: &CallSite,
        identity: ProcessIdentity,
        detail: EventDetail,
    ) -> Observation {
        let mut observation = Observation {
            hook,
            pid: identity.pid,
            process_name: identity.display_name().to_string(),
            detail,
            stack: Vec::new(),
        };
        info!(target: hook.log_target(), "{}", observation.record());
        observation.stack = self.unwinder.unwind_and_log(site.process, &site.user_regs);
        observation
    }
}
