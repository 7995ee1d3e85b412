//! Relocate-on-hit transition functions
//!
//! An execution trap that stays on its instruction would fire again as soon as
//! the task resumes. Instead, the first hit moves the trap one instruction
//! forward; the hit at that next instruction moves it back. Only the hit at
//! the original address is counted.
//!
//! ```text
//!            hit @ original            hit @ next
//!   Armed ───────────────▶ MovedToNext ─────────▶ Armed
//!     │  relocate failed / unavailable
//!     ▼
//!   retired (slot freed)
//! ```
//!
//! Everything here is pure; the breakpoint manager applies the side effects.

use tracehook_common::{BreakpointKind, BreakpointWidth, INSN_SIZE};

use crate::domain::HostError;
use crate::host::TrapRequest;

/// Position of a populated slot's trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationState {
    /// Trap sits on the original address
    Armed,
    /// Trap sits on the instruction after the one that hit
    MovedToNext,
}

impl RelocationState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RelocationState::Armed => "armed",
            RelocationState::MovedToNext => "moved",
        }
    }
}

/// What a hit asks the trap facility to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitPlan {
    /// Whether the hit increments the slot's hit count
    pub counts_hit: bool,
    /// Where the trap is moved
    pub target: TrapRequest,
}

/// Outcome of the relocation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocateResult {
    Done,
    Failed(HostError),
    /// The host cannot move traps in place
    Unavailable,
}

/// Slot state after a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFate {
    /// The trap moved; the slot continues in this state
    Moved(RelocationState),
    /// Leaving the original address failed: unregister and free the slot
    Retire,
    /// Moving back failed: the trap stays where it is
    Stay(RelocationState),
}

/// Decide where a hit at `pc` sends the trap
///
/// Stepping past the instruction uses an execute trap on the next
/// instruction; moving back restores the slot's own kind and width.
#[must_use]
pub fn plan_hit(state: RelocationState, original: &TrapRequest, pc: u64) -> HitPlan {
    match state {
        RelocationState::Armed => HitPlan {
            counts_hit: true,
            target: TrapRequest {
                address: pc.wrapping_add(INSN_SIZE),
                kind: BreakpointKind::Exec,
                width: BreakpointWidth::Four,
            },
        },
        RelocationState::MovedToNext => HitPlan { counts_hit: false, target: *original },
    }
}

/// Apply the relocation outcome to the slot state
#[must_use]
pub fn settle(state: RelocationState, result: RelocateResult) -> SlotFate {
    match (state, result) {
        (RelocationState::Armed, RelocateResult::Done) => {
            SlotFate::Moved(RelocationState::MovedToNext)
        }
        (RelocationState::Armed, RelocateResult::Failed(_) | RelocateResult::Unavailable) => {
            SlotFate::Retire
        }
        (RelocationState::MovedToNext, RelocateResult::Done) => {
            SlotFate::Moved(RelocationState::Armed)
        }
        (RelocationState::MovedToNext, _) => SlotFate::Stay(RelocationState::MovedToNext),
    }
}
