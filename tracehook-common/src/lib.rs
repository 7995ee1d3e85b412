//! # Shared Data Structures (Host ↔ Engine)
//!
//! Defines the constants and `#[repr(C)]` layouts exchanged between the host
//! environment (the code that intercepts calls and delivers traps) and the
//! `tracehook` engine. Every type here mirrors a layout the host produces, so
//! nothing in this crate allocates or depends on `std`.
//!
//! ## Key Types
//!
//! - [`RegisterSnapshot`] - User register file of an interrupted task (AArch64 `pt_regs`)
//! - [`CompatFrameRecord`] - Two-word frame record pushed by 32-bit (AArch32) code
//! - [`BreakpointKind`] / [`BreakpointWidth`] - Hardware trap encodings

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Stack Trace Constants
// ============================================================================

/// Maximum number of addresses recorded in one stack trace
///
/// The trace terminator ([`STACK_SENTINEL`]) is stored in addition to these.
pub const MAX_STACK_DEPTH: usize = 32;

/// Trace terminator appended after the last recorded address
pub const STACK_SENTINEL: u64 = u64::MAX;

/// Addresses at or below this value are never treated as code or frame addresses
pub const LOW_ADDRESS_GUARD: u64 = 0x1000;

/// Highest frame pointer value accepted by the compat frame walker
pub const COMPAT_FP_CEILING: u64 = 0xffff_fff0;

// ============================================================================
// Processor State Bits
// ============================================================================

/// `PSTATE.nRW`: set when the interrupted task executes in AArch32 state
pub const PSR_MODE32_BIT: u64 = 0x0000_0010;

/// `CPSR.T`: set when an AArch32 task executes Thumb instructions
pub const PSR_T_BIT: u64 = 0x0000_0020;

/// AArch32 frame pointer in Thumb state
pub const COMPAT_REG_FP_THUMB: usize = 7;

/// AArch32 frame pointer in ARM state
pub const COMPAT_REG_FP_ARM: usize = 11;

/// AArch32 stack pointer
pub const COMPAT_REG_SP: usize = 13;

/// AArch32 link register
pub const COMPAT_REG_LR: usize = 14;

/// Fixed AArch64 instruction width, used to step past a trapped instruction
pub const INSN_SIZE: u64 = 4;

// ============================================================================
// Register Snapshot
// ============================================================================

/// User register file of an interrupted task
///
/// **Memory Layout**: matches the leading fields of the AArch64 `struct pt_regs`
/// (`regs[31]`, `sp`, `pc`, `pstate`). For AArch32 tasks the 32-bit registers
/// live in the low halves of `regs[0..15]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterSnapshot {
    /// General purpose registers `x0..x30`
    pub regs: [u64; 31],

    /// Stack pointer
    pub sp: u64,

    /// Program counter
    pub pc: u64,

    /// Processor state (`PSTATE` / `CPSR`)
    pub pstate: u64,
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self { regs: [0; 31], sp: 0, pc: 0, pstate: 0 }
    }
}

impl RegisterSnapshot {
    /// True when the task was interrupted in the reduced-width (AArch32) mode
    #[must_use]
    pub const fn is_compat(&self) -> bool {
        self.pstate & PSR_MODE32_BIT != 0
    }

    /// True when an AArch32 task was executing Thumb instructions
    #[must_use]
    pub const fn is_thumb(&self) -> bool {
        self.pstate & PSR_T_BIT != 0
    }

    /// Read an AArch32 register (`r0..r14`), truncated to 32 bits
    ///
    /// Out-of-range indices read as zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn compat_reg(&self, n: usize) -> u32 {
        if n < 15 {
            self.regs[n] as u32
        } else {
            0
        }
    }

    /// Read syscall argument `n` (`x0..x5`) as passed to a `pt_regs`-style entry point
    #[must_use]
    pub const fn syscall_arg(&self, n: usize) -> u64 {
        if n < 6 {
            self.regs[n]
        } else {
            0
        }
    }
}

// ============================================================================
// Compat Frame Record
// ============================================================================

/// Frame record pushed by AArch32 code compiled with frame pointers
///
/// Read from the task's stack at the current frame pointer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompatFrameRecord {
    /// Frame pointer of the caller's frame
    pub next_fp: u32,

    /// Return address into the caller
    pub ret_addr: u32,
}

impl CompatFrameRecord {
    /// Size of the record in the task's memory
    pub const SIZE: usize = 8;

    /// Decode a record from the little-endian bytes read at the frame pointer
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            next_fp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            ret_addr: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

// ============================================================================
// Hardware Breakpoint Encodings
// ============================================================================

/// Number of hardware trap slots managed by the engine
pub const HW_BREAKPOINT_SLOTS: usize = 4;

/// `perf_event_attr.type` for hardware breakpoints
pub const PERF_TYPE_BREAKPOINT: u32 = 5;

/// `HW_BREAKPOINT_R`
pub const HW_BREAKPOINT_R: u32 = 1;

/// `HW_BREAKPOINT_W`
pub const HW_BREAKPOINT_W: u32 = 2;

/// `HW_BREAKPOINT_RW`
pub const HW_BREAKPOINT_RW: u32 = HW_BREAKPOINT_R | HW_BREAKPOINT_W;

/// `HW_BREAKPOINT_X`
pub const HW_BREAKPOINT_X: u32 = 4;

/// What access triggers a hardware breakpoint
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    Exec = 0,
    Write = 1,
    Read = 2,
    ReadWrite = 3,
}

impl BreakpointKind {
    /// Decode the numeric kind used by the control channel (`0..=3`)
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Exec),
            1 => Some(Self::Write),
            2 => Some(Self::Read),
            3 => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// `perf_event_attr.bp_type` value
    #[must_use]
    pub const fn bp_type(self) -> u32 {
        match self {
            Self::Exec => HW_BREAKPOINT_X,
            Self::Write => HW_BREAKPOINT_W,
            Self::Read => HW_BREAKPOINT_R,
            Self::ReadWrite => HW_BREAKPOINT_RW,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Write => "write",
            Self::Read => "read",
            Self::ReadWrite => "rw",
        }
    }
}

/// Number of bytes watched by a hardware breakpoint
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BreakpointWidth {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl BreakpointWidth {
    /// Decode a width in bytes
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    /// `perf_event_attr.bp_len` value
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self as u64
    }
}
