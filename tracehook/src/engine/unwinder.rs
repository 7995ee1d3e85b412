//! User stack unwinding and trace rendering
//!
//! Native-width tasks are unwound by the host's stack capture service. Tasks
//! interrupted in the reduced-width (AArch32) state are walked here, by
//! following the two-word frame records their frame pointer chain leaves on the
//! stack. Every read is a single bounded copy; a failed read ends the walk.
//!
//! Each rendered trace is one line per entry followed by [`TRACE_SEPARATOR`]:
//!
//! ```text
//! #00 PC: 0000000000012a40 libfoo.so + 0x2a40
//! #01 PC: 0000000000013b08 libfoo.so + 0x3b08
//! #02 PC: ffffffffffffffff
//! ------------------------------------------
//! ```

use std::sync::Arc;

use log::info;
use tracehook_common::{
    CompatFrameRecord, RegisterSnapshot, COMPAT_FP_CEILING, COMPAT_REG_FP_ARM,
    COMPAT_REG_FP_THUMB, COMPAT_REG_LR, COMPAT_REG_SP, LOW_ADDRESS_GUARD, MAX_STACK_DEPTH,
    STACK_SENTINEL,
};

use super::module_resolver::ModuleResolver;
use crate::host::{ProcessRef, UserCopy, UserStackService};

/// Line logged after every trace
pub const TRACE_SEPARATOR: &str = "------------------------------------------";

/// Bounded list of return addresses, innermost first
///
/// Holds at most [`MAX_STACK_DEPTH`] addresses plus the trailing sentinel.
#[derive(Clone, PartialEq, Eq)]
pub struct StackTrace {
    entries: [u64; MAX_STACK_DEPTH + 1],
    len: usize,
}

impl Default for StackTrace {
    fn default() -> Self {
        Self { entries: [0; MAX_STACK_DEPTH + 1], len: 0 }
    }
}

impl std::fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice().iter().map(|a| format!("{a:#x}"))).finish()
    }
}

impl StackTrace {
    /// Append an address; returns `false` once [`MAX_STACK_DEPTH`] addresses are held
    pub fn push(&mut self, address: u64) -> bool {
        if self.len >= MAX_STACK_DEPTH {
            return false;
        }
        self.entries[self.len] = address;
        self.len += 1;
        true
    }

    /// Terminate the trace
    pub fn push_sentinel(&mut self) {
        if self.len <= MAX_STACK_DEPTH {
            self.entries[self.len] = STACK_SENTINEL;
            self.len += 1;
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len >= MAX_STACK_DEPTH
    }

    #[must_use]
    pub fn last(&self) -> Option<u64> {
        self.as_slice().last().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.entries[..self.len]
    }
}

/// Walk the frame-pointer chain of a task interrupted in AArch32 state
///
/// Records PC, then LR (when plausible), then one return address per frame
/// record, then the sentinel. With no copy facility the walk stops after LR.
#[must_use]
pub fn walk_compat(
    copy: Option<&dyn UserCopy>,
    process: ProcessRef,
    regs: &RegisterSnapshot,
) -> StackTrace {
    let mut trace = StackTrace::default();

    let mut sp = u64::from(regs.compat_reg(COMPAT_REG_SP));
    if sp == 0 {
        sp = regs.sp & u64::from(u32::MAX);
    }
    let lr = u64::from(regs.compat_reg(COMPAT_REG_LR));
    let pc = regs.pc & u64::from(u32::MAX);

    trace.push(pc);
    if lr > LOW_ADDRESS_GUARD {
        trace.push(lr);
    }

    let fp_reg = if regs.is_thumb() { COMPAT_REG_FP_THUMB } else { COMPAT_REG_FP_ARM };
    let mut fp = u64::from(regs.compat_reg(fp_reg));

    if let Some(copy) = copy {
        for _ in 0..MAX_STACK_DEPTH {
            if trace.is_full() {
                break;
            }
            if fp <= LOW_ADDRESS_GUARD || fp > COMPAT_FP_CEILING || fp & 3 != 0 || fp < sp {
                break;
            }

            let mut raw = [0u8; CompatFrameRecord::SIZE];
            if copy.copy_from_user(process, fp, &mut raw).is_err() {
                break;
            }
            let record = CompatFrameRecord::from_le_bytes(raw);

            let ret = u64::from(record.ret_addr);
            if ret > LOW_ADDRESS_GUARD && trace.last() != Some(ret) {
                trace.push(ret);
            }

            let next_fp = u64::from(record.next_fp);
            if next_fp <= fp {
                break;
            }
            fp = next_fp;
        }
    }

    trace.push_sentinel();
    trace
}

/// Captures and logs user stacks
#[derive(Clone, Default)]
pub struct StackUnwinder {
    user_copy: Option<Arc<dyn UserCopy>>,
    stack_service: Option<Arc<dyn UserStackService>>,
    resolver: ModuleResolver,
}

impl StackUnwinder {
    #[must_use]
    pub fn new(
        user_copy: Option<Arc<dyn UserCopy>>,
        stack_service: Option<Arc<dyn UserStackService>>,
        resolver: ModuleResolver,
    ) -> Self {
        Self { user_copy, stack_service, resolver }
    }

    /// Capture the user stack of `process`
    ///
    /// Returns `None` for a native-width task when the host has no stack service.
    #[must_use]
    pub fn capture(&self, process: ProcessRef, regs: &RegisterSnapshot) -> Option<StackTrace> {
        if regs.is_compat() {
            return Some(walk_compat(self.user_copy.as_deref(), process, regs));
        }

        let service = self.stack_service.as_deref()?;
        let mut trace = StackTrace::default();
        let mut buf = [0u64; MAX_STACK_DEPTH + 1];
        let n = service.save_user_stack(process, regs, &mut buf).min(buf.len());
        trace.entries[..n].copy_from_slice(&buf[..n]);
        trace.len = n;
        Some(trace)
    }

    /// One line per entry plus the separator
    #[must_use]
    pub fn render(&self, process: ProcessRef, trace: &StackTrace) -> Vec<String> {
        let entries = trace.as_slice();
        let labels = self.resolver.resolve_all(process, entries);
        let mut lines = Vec::with_capacity(entries.len() + 1);
        for (i, (&ip, label)) in entries.iter().zip(&labels).enumerate() {
            if label.is_empty() {
                lines.push(format!("#{i:02} PC: {ip:016x}"));
            } else {
                lines.push(format!("#{i:02} PC: {ip:016x} {label}"));
            }
        }
        lines.push(TRACE_SEPARATOR.to_string());
        lines
    }

    /// Capture, render and log the stack of `process`; returns the logged lines
    pub fn unwind_and_log(&self, process: ProcessRef, regs: &RegisterSnapshot) -> Vec<String> {
        let Some(trace) = self.capture(process, regs) else {
            return Vec::new();
        };
        let lines = self.render(process, &trace);
        for line in &lines {
            info!(target: "tracehook::stack", "{line}");
        }
        lines
    }
}
