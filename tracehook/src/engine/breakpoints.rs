//! Hardware breakpoint manager
//!
//! A fixed pool of [`HW_BREAKPOINT_SLOTS`] trap slots. The control path sets,
//! clears and lists slots; the trap-delivery path calls [`on_hit`] and walks
//! the [`relocation`](super::relocation) state machine.
//!
//! The hit path takes no locks and allocates nothing beyond its log record.
//! Every field it reads is an atomic, and a slot only becomes visible to it
//! once fully populated: slots are claimed by a `FREE -> RESERVED` exchange,
//! filled while reserved, then published with a release store of `ARMED`.
//! Clearing runs the same protocol in reverse.
//!
//! [`on_hit`]: HardwareBreakpointManager::on_hit

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use log::{error, info, warn};
use serde::Serialize;
use tracehook_common::{BreakpointKind, BreakpointWidth, HW_BREAKPOINT_SLOTS};

use super::relocation::{self, RelocateResult, RelocationState, SlotFate};
use crate::domain::{EngineError, Pid, TrapHandle};
use crate::host::{HostCapabilities, TrapRequest};

/// Longest description kept per breakpoint, in bytes
pub const MAX_DESCRIPTION_LEN: usize = 127;

const FREE: u8 = 0;
const RESERVED: u8 = 1;
const ARMED: u8 = 2;
const MOVED: u8 = 3;

/// Parameters of a new breakpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub address: u64,
    pub kind: BreakpointKind,
    pub width: BreakpointWidth,
    /// Scope the trap to this process; `None` or a non-positive pid means system-wide
    pub pid: Option<Pid>,
    pub description: String,
}

impl BreakpointRequest {
    #[must_use]
    pub fn new(address: u64, kind: BreakpointKind, width: BreakpointWidth) -> Self {
        Self { address, kind, width, pid: None, description: String::new() }
    }

    #[must_use]
    pub fn for_process(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }

    #[must_use]
    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    fn scoped_pid(&self) -> Option<Pid> {
        self.pid.filter(|pid| pid.0 > 0)
    }
}

/// Snapshot of one populated slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakpointInfo {
    pub index: usize,
    pub address: u64,
    /// Where the trap currently sits
    pub current_address: u64,
    pub kind: &'static str,
    pub width: u64,
    pub hit_count: u64,
    pub state: &'static str,
    pub pid: Option<i32>,
    /// Debug register the host assigned
    pub hw_slot: Option<u32>,
    pub description: String,
}

impl fmt::Display for BreakpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bp[{}]: addr=0x{:x} type={} size={} hits={} state={}",
            self.index, self.address, self.kind, self.width, self.hit_count, self.state
        )?;
        if self.current_address != self.address {
            write!(f, " at=0x{:x}", self.current_address)?;
        }
        match self.pid {
            Some(pid) => write!(f, " pid={pid}")?,
            None => write!(f, " scope=system")?,
        }
        if let Some(hw_slot) = self.hw_slot {
            write!(f, " hw_slot={hw_slot}")?;
        }
        if !self.description.is_empty() {
            write!(f, " desc={}", self.description)?;
        }
        Ok(())
    }
}

/// What a trap callback did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// No populated slot owns the handle
    Ignored,
    /// Counted hit; trap moved to the next instruction
    SteppedPast { index: usize, hits: u64 },
    /// Trap moved back to the original address
    Restored { index: usize },
    /// Relocation away from the original failed; the slot was freed
    Retired { index: usize },
    /// Moving back failed; the trap stays on the next instruction
    Stuck { index: usize },
}

#[derive(Debug, Default)]
struct Slot {
    state: AtomicU8,
    handle: AtomicU64,
    original: AtomicU64,
    current: AtomicU64,
    kind: AtomicU8,
    width: AtomicU8,
    hits: AtomicU64,
    /// `0` for system-wide traps
    scope_pid: AtomicI32,
    /// `-1` when the host reported no slot
    hw_slot: AtomicI64,
    /// Control path only
    description: Mutex<String>,
}

impl Slot {
    fn populated(&self) -> Option<RelocationState> {
        match self.state.load(Ordering::Acquire) {
            ARMED => Some(RelocationState::Armed),
            MOVED => Some(RelocationState::MovedToNext),
            _ => None,
        }
    }

    fn handle(&self) -> TrapHandle {
        TrapHandle(self.handle.load(Ordering::Relaxed))
    }

    fn original_request(&self) -> TrapRequest {
        TrapRequest {
            address: self.original.load(Ordering::Relaxed),
            kind: BreakpointKind::from_code(self.kind.load(Ordering::Relaxed))
                .unwrap_or(BreakpointKind::Exec),
            width: BreakpointWidth::from_bytes(u64::from(self.width.load(Ordering::Relaxed)))
                .unwrap_or(BreakpointWidth::Four),
        }
    }

    fn reset(&self) {
        self.handle.store(0, Ordering::Relaxed);
        self.original.store(0, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.scope_pid.store(0, Ordering::Relaxed);
        self.hw_slot.store(-1, Ordering::Relaxed);
    }

    /// Record a completed relocation of `handle` from `from` to `to`
    ///
    /// Returns `false`, leaving the slot untouched, when it no longer holds
    /// `handle` in state `from` (a concurrent clear won).
    fn publish_move(
        &self,
        handle: TrapHandle,
        from: RelocationState,
        to: RelocationState,
        current: u64,
    ) -> bool {
        if self.handle() != handle {
            return false;
        }
        if self
            .state
            .compare_exchange(state_code(from), state_code(to), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.current.store(current, Ordering::Relaxed);
        true
    }

    /// Claim a populated slot for teardown
    fn claim(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current != ARMED && current != MOVED {
                return false;
            }
            if self
                .state
                .compare_exchange(current, RESERVED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

const fn state_code(state: RelocationState) -> u8 {
    match state {
        RelocationState::Armed => ARMED,
        RelocationState::MovedToNext => MOVED,
    }
}

pub struct HardwareBreakpointManager {
    slots: [Slot; HW_BREAKPOINT_SLOTS],
    host: HostCapabilities,
    verbose: AtomicBool,
}

impl HardwareBreakpointManager {
    #[must_use]
    pub fn new(host: HostCapabilities) -> Self {
        let manager = Self { slots: Default::default(), host, verbose: AtomicBool::new(false) };
        for slot in &manager.slots {
            slot.hw_slot.store(-1, Ordering::Relaxed);
        }
        manager
    }

    /// Whether hits relocate the trap (otherwise breakpoints are one-shot)
    #[must_use]
    pub fn relocation_available(&self) -> bool {
        self.host.relocator().is_ok()
    }

    /// Install a breakpoint, returning its slot index
    ///
    /// # Errors
    /// - `InvalidArgument` for a zero address
    /// - `Unsupported` when the needed registration facility is missing
    /// - `ProcessNotFound` when the target process does not exist
    /// - `ResourceExhausted` when every slot is populated
    /// - `Host` with the facility's code when registration fails
    pub fn set(&self, request: &BreakpointRequest) -> Result<usize, EngineError> {
        if request.address == 0 {
            return Err(EngineError::InvalidArgument(
                "Invalid breakpoint address: 0x0".to_string(),
            ));
        }

        let target = match request.scoped_pid() {
            Some(pid) => {
                let traps = self.host.process_traps()?;
                let process = self
                    .host
                    .processes()?
                    .find(pid)
                    .ok_or(EngineError::ProcessNotFound(pid))?;
                Some((traps, process))
            }
            None => {
                self.host.wide_traps()?;
                None
            }
        };

        let index = self.reserve().ok_or_else(|| {
            EngineError::ResourceExhausted("No free hardware breakpoint slots".to_string())
        })?;
        let slot = &self.slots[index];

        let trap = TrapRequest { address: request.address, kind: request.kind, width: request.width };
        let registered = match &target {
            Some((traps, process)) => traps.register_for_process(&trap, *process),
            None => self.host.wide_traps()?.register_wide(&trap),
        };
        let registration = match registered {
            Ok(registration) => registration,
            Err(err) => {
                slot.state.store(FREE, Ordering::Release);
                error!("Failed to register hardware breakpoint: {}", err.code());
                return Err(err.into());
            }
        };

        slot.handle.store(registration.handle.0, Ordering::Relaxed);
        slot.original.store(request.address, Ordering::Relaxed);
        slot.current.store(request.address, Ordering::Relaxed);
        slot.kind.store(request.kind as u8, Ordering::Relaxed);
        slot.width.store(request.width as u8, Ordering::Relaxed);
        slot.hits.store(0, Ordering::Relaxed);
        slot.scope_pid.store(request.scoped_pid().map_or(0, |pid| pid.0), Ordering::Relaxed);
        slot.hw_slot.store(registration.hw_slot.map_or(-1, i64::from), Ordering::Relaxed);
        *slot.description.lock().unwrap_or_else(PoisonError::into_inner) =
            truncate(&request.description, MAX_DESCRIPTION_LEN).to_string();
        slot.state.store(ARMED, Ordering::Release);

        match &target {
            Some((_, process)) => {
                let name = self
                    .host
                    .processes()
                    .map(|table| table.identity(*process).display_name().to_string())
                    .unwrap_or_default();
                info!(
                    "Hardware breakpoint[{index}] set at 0x{:x} for {} [{name}] (type={}, size={})",
                    request.address,
                    process.pid,
                    request.kind.as_str(),
                    request.width.bytes()
                );
            }
            None => info!(
                "Hardware breakpoint[{index}] set at 0x{:x} (system-wide, type={}, size={})",
                request.address,
                request.kind.as_str(),
                request.width.bytes()
            ),
        }
        if self.relocation_available() {
            info!("Hardware breakpoint[{index}]: Using move-to-next-instruction mechanism");
        } else {
            info!("Hardware breakpoint[{index}]: Using one-shot mode (will disable after first hit)");
        }

        Ok(index)
    }

    fn reserve(&self) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.state
                .compare_exchange(FREE, RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Trap callback: `handle` fired with the task at `pc`
    ///
    /// Runs in the trap-delivery context. Unknown handles are ignored.
    pub fn on_hit(&self, handle: TrapHandle, pc: u64) -> HitOutcome {
        if handle.is_none() {
            return HitOutcome::Ignored;
        }
        let Some((index, slot, state)) = self.slots.iter().enumerate().find_map(|(i, slot)| {
            let state = slot.populated()?;
            (slot.handle() == handle).then_some((i, slot, state))
        }) else {
            return HitOutcome::Ignored;
        };

        let original = slot.original_request();
        let plan = relocation::plan_hit(state, &original, pc);

        let mut hits = slot.hits.load(Ordering::Relaxed);
        if plan.counts_hit {
            hits = slot.hits.fetch_add(1, Ordering::Relaxed) + 1;
            info!("HW_BP[{index}]: Hit at 0x{:x} (original), count:{hits}", original.address);
        } else {
            info!("HW_BP[{index}]: Hit at 0x{pc:x} (next instruction)");
        }

        let result = match self.host.relocator() {
            Ok(relocator) => match relocator.relocate(handle, &plan.target) {
                Ok(()) => RelocateResult::Done,
                Err(err) => RelocateResult::Failed(err),
            },
            Err(_) => RelocateResult::Unavailable,
        };

        match relocation::settle(state, result) {
            SlotFate::Moved(next) => {
                if !slot.publish_move(handle, state, next, plan.target.address) {
                    warn!("HW_BP[{index}]: slot was cleared during the hit, state left unchanged");
                }
                match next {
                    RelocationState::MovedToNext => {
                        info!("HW_BP[{index}]: Moved to next instruction 0x{:x}", plan.target.address);
                        HitOutcome::SteppedPast { index, hits }
                    }
                    RelocationState::Armed => {
                        info!("HW_BP[{index}]: Moved back to original 0x{:x}", original.address);
                        HitOutcome::Restored { index }
                    }
                }
            }
            SlotFate::Retire => {
                match result {
                    RelocateResult::Failed(err) => error!(
                        "HW_BP[{index}]: Failed to move to next instruction: {}",
                        err.code()
                    ),
                    _ => warn!("HW_BP[{index}]: trap relocation not available, disabling"),
                }
                if slot
                    .state
                    .compare_exchange(ARMED, RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.unregister(slot);
                    slot.reset();
                    slot.state.store(FREE, Ordering::Release);
                }
                HitOutcome::Retired { index }
            }
            SlotFate::Stay(_) => {
                if let RelocateResult::Failed(err) = result {
                    error!("HW_BP[{index}]: Failed to move back to original: {}", err.code());
                }
                HitOutcome::Stuck { index }
            }
        }
    }

    fn unregister(&self, slot: &Slot) {
        let handle = slot.handle();
        if slot.scope_pid.load(Ordering::Relaxed) > 0 {
            if let Ok(traps) = self.host.process_traps() {
                traps.unregister(handle);
                return;
            }
        }
        if let Ok(traps) = self.host.wide_traps() {
            traps.unregister_wide(handle);
        }
    }

    /// Remove the breakpoint in slot `index`
    ///
    /// # Errors
    /// `InvalidArgument` for an out-of-range index, `NotFound` for a free slot
    pub fn clear(&self, index: usize) -> Result<(), EngineError> {
        let slot = self.slots.get(index).ok_or_else(|| {
            EngineError::InvalidArgument(format!("Invalid breakpoint index: {index}"))
        })?;
        if !slot.claim() {
            return Err(EngineError::NotFound(format!("Breakpoint {index} is not set")));
        }

        self.unregister(slot);
        info!(
            "Hardware breakpoint[{index}] cleared (was at 0x{:x}, hit {} times)",
            slot.original.load(Ordering::Relaxed),
            slot.hits.load(Ordering::Relaxed)
        );
        slot.reset();
        slot.description.lock().unwrap_or_else(PoisonError::into_inner).clear();
        slot.state.store(FREE, Ordering::Release);
        Ok(())
    }

    /// Remove every breakpoint, returning how many were removed
    pub fn clear_all(&self) -> usize {
        let cleared = (0..HW_BREAKPOINT_SLOTS).filter(|&i| self.clear(i).is_ok()).count();
        info!("All hardware breakpoints cleared");
        cleared
    }

    /// Snapshot of slot `index`, if populated
    #[must_use]
    pub fn get(&self, index: usize) -> Option<BreakpointInfo> {
        let slot = self.slots.get(index)?;
        let state = slot.populated()?;
        let original = slot.original_request();
        let scope_pid = slot.scope_pid.load(Ordering::Relaxed);
        Some(BreakpointInfo {
            index,
            address: original.address,
            current_address: slot.current.load(Ordering::Relaxed),
            kind: original.kind.as_str(),
            width: original.width.bytes(),
            hit_count: slot.hits.load(Ordering::Relaxed),
            state: state.as_str(),
            pid: (scope_pid > 0).then_some(scope_pid),
            hw_slot: u32::try_from(slot.hw_slot.load(Ordering::Relaxed)).ok(),
            description: slot.description.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        })
    }

    #[must_use]
    pub fn list(&self) -> Vec<BreakpointInfo> {
        (0..HW_BREAKPOINT_SLOTS).filter_map(|i| self.get(i)).collect()
    }

    /// Populated slots
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.populated().is_some()).count()
    }

    /// Record the verbose flag; the trap context only supports minimal logging
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
        if verbose {
            warn!("Verbose mode requested but detailed hit logging is not available in the trap context");
            warn!("Only minimal logging is available: HW_BP[N]: Hit at 0xADDR, count:N");
        } else {
            info!("Hardware breakpoint verbose mode: disabled (minimal logging)");
        }
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
