//! # Host Boundary
//!
//! Everything the engine needs from its environment, expressed as traits. The
//! engine never assumes a facility exists: each one is an optional entry in
//! [`HostCapabilities`], resolved once at startup, and every use goes through a
//! presence-checked accessor that yields [`EngineError::Unsupported`] when the
//! facility is missing.
//!
//! ## Facilities
//!
//! | Trait | Used by | Contract |
//! |---|---|---|
//! | [`ProcessTable`] | observer, breakpoints, memory reader | pid lookup and identity |
//! | [`UserCopy`] | observer, compat unwinder | single bounded copy from the current task |
//! | [`UserStackService`] | native unwinder | trusted user stack capture |
//! | [`AddressSpaces`] | module resolver | try-locked mapping table walk |
//! | [`ProcessMemory`] | memory reader | cross-process reads with a pinned address space |
//! | [`WideTraps`] / [`ProcessTraps`] | breakpoints | hardware trap registration |
//! | [`TrapRelocator`] | breakpoint hit path | in-place trap move, callable from the trap context |
//!
//! [`SymbolLookup`] and [`Interceptor`] are only needed by
//! [`Engine::attach`](crate::engine::Engine::attach) and are passed there directly.
//!
//! ## Backends
//!
//! - [`linux`]: userspace backend over `/proc`, `process_vm_readv` and `perf_event_open`
//! - [`layout`]: raw kernel-structure walker driven by a [`layout::LayoutDescriptor`]
//! - [`sim`]: scriptable in-memory host with fault injection

pub mod layout;
pub mod linux;
pub mod sim;

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use tracehook_common::{BreakpointKind, BreakpointWidth, RegisterSnapshot};

use crate::domain::{EngineError, FileId, HookKind, MappingId, Pid, TrapHandle};

pub use crate::domain::{HostError, HostResult};

// ============================================================================
// Processes
// ============================================================================

/// Reference to a live process
///
/// `token` distinguishes incarnations of a reused pid; backends choose its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessRef {
    pub pid: Pid,
    pub token: u64,
}

/// Who a process is, as far as filtering and logging care
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: Pid,
    /// First command line argument, if the command line could be read
    pub cmdline: Option<String>,
    /// Short task name
    pub comm: Option<String>,
}

impl ProcessIdentity {
    /// Command line if non-empty, else the short name
    #[must_use]
    pub fn display_name(&self) -> &str {
        match (&self.cmdline, &self.comm) {
            (Some(cmdline), _) if !cmdline.is_empty() => cmdline,
            (_, Some(comm)) if !comm.is_empty() => comm,
            _ => "[Unknown]",
        }
    }
}

pub trait ProcessTable: Send + Sync {
    fn find(&self, pid: Pid) -> Option<ProcessRef>;

    fn identity(&self, process: ProcessRef) -> ProcessIdentity;
}

// ============================================================================
// Memory
// ============================================================================

/// Copies from the user memory of the task that made the observed call
///
/// Each call is a single bounded attempt that never waits.
pub trait UserCopy: Send + Sync {
    /// Fill `buf` entirely, or fail
    fn copy_from_user(&self, process: ProcessRef, addr: u64, buf: &mut [u8]) -> HostResult<()>;

    /// Copy a NUL-terminated string of at most `max_len` bytes
    fn copy_string(&self, process: ProcessRef, addr: u64, max_len: usize) -> HostResult<String>;
}

/// Host-provided user stack capture for native-width tasks
pub trait UserStackService: Send + Sync {
    /// Write return addresses into `out`, returning how many were written
    fn save_user_stack(&self, process: ProcessRef, regs: &RegisterSnapshot, out: &mut [u64])
        -> usize;
}

/// Pinned reference to a process's address space
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpaceRef(pub u64);

/// Cross-process memory access
pub trait ProcessMemory: Send + Sync {
    /// Take a reference on the address space; `None` if the process has none
    fn pin(&self, process: ProcessRef) -> Option<AddressSpaceRef>;

    fn unpin(&self, space: AddressSpaceRef);

    /// Read into `buf`; the count may be short, and zero means nothing was readable
    fn access(&self, process: ProcessRef, space: &AddressSpaceRef, addr: u64, buf: &mut [u8])
        -> HostResult<usize>;
}

// ============================================================================
// Address-space mappings
// ============================================================================

/// One memory mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    /// Backing file, `None` for anonymous memory
    pub file: Option<FileId>,
}

impl Mapping {
    /// Check if an address falls within this mapping
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Read access to a mapping table while its lock is held
pub trait MappingView {
    /// First mapping ending above `addr`
    fn find(&self, addr: u64) -> Option<MappingId>;

    fn mapping(&self, id: MappingId) -> Option<Mapping>;

    /// Mapping immediately below `id`
    fn prev(&self, id: MappingId) -> Option<MappingId>;

    fn file_path(&self, file: FileId) -> Option<String>;
}

pub trait AddressSpaces: Send + Sync {
    /// Try to read-lock the mapping table and run `visit` while it is held
    ///
    /// Returns `false` without calling `visit` when the lock is contended or
    /// the process has no address space. The lock is released before returning.
    fn try_with_mappings(&self, process: ProcessRef, visit: &mut dyn FnMut(&dyn MappingView))
        -> bool;
}

// ============================================================================
// Hardware traps
// ============================================================================

/// Where and how a hardware trap fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRequest {
    pub address: u64,
    pub kind: BreakpointKind,
    pub width: BreakpointWidth,
}

/// Result of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRegistration {
    pub handle: TrapHandle,
    /// Hardware debug register the host assigned, when it reports one
    pub hw_slot: Option<u32>,
}

/// System-wide trap registration
pub trait WideTraps: Send + Sync {
    fn register_wide(&self, request: &TrapRequest) -> HostResult<TrapRegistration>;

    fn unregister_wide(&self, handle: TrapHandle);
}

/// Traps scoped to a single process
pub trait ProcessTraps: Send + Sync {
    fn register_for_process(&self, request: &TrapRequest, process: ProcessRef)
        -> HostResult<TrapRegistration>;

    fn unregister(&self, handle: TrapHandle);
}

/// Moves a registered trap in place
///
/// Called from the trap-delivery context: implementations must not sleep.
pub trait TrapRelocator: Send + Sync {
    fn relocate(&self, handle: TrapHandle, request: &TrapRequest) -> HostResult<()>;
}

// ============================================================================
// Attach collaborators
// ============================================================================

/// Entry-point lookup by symbol name
pub trait SymbolLookup {
    fn lookup(&self, name: &str) -> Option<u64>;
}

/// Installs and removes interception at an entry point
pub trait Interceptor {
    fn install(&self, hook: HookKind, target: u64) -> HostResult<()>;

    fn uninstall(&self, hook: HookKind, target: u64);
}

// ============================================================================
// Capabilities
// ============================================================================

/// Set of host facilities, resolved once at startup
#[derive(Clone, Default)]
pub struct HostCapabilities {
    processes: Option<Arc<dyn ProcessTable>>,
    user_copy: Option<Arc<dyn UserCopy>>,
    stack_service: Option<Arc<dyn UserStackService>>,
    address_spaces: Option<Arc<dyn AddressSpaces>>,
    process_memory: Option<Arc<dyn ProcessMemory>>,
    wide_traps: Option<Arc<dyn WideTraps>>,
    process_traps: Option<Arc<dyn ProcessTraps>>,
    relocator: Option<Arc<dyn TrapRelocator>>,
}

impl HostCapabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_processes(mut self, facility: Arc<dyn ProcessTable>) -> Self {
        self.processes = Some(facility);
        self
    }

    #[must_use]
    pub fn with_user_copy(mut self, facility: Arc<dyn UserCopy>) -> Self {
        self.user_copy = Some(facility);
        self
    }

    #[must_use]
    pub fn with_stack_service(mut self, facility: Arc<dyn UserStackService>) -> Self {
        self.stack_service = Some(facility);
        self
    }

    #[must_use]
    pub fn with_address_spaces(mut self, facility: Arc<dyn AddressSpaces>) -> Self {
        self.address_spaces = Some(facility);
        self
    }

    #[must_use]
    pub fn with_process_memory(mut self, facility: Arc<dyn ProcessMemory>) -> Self {
        self.process_memory = Some(facility);
        self
    }

    #[must_use]
    pub fn with_wide_traps(mut self, facility: Arc<dyn WideTraps>) -> Self {
        self.wide_traps = Some(facility);
        self
    }

    #[must_use]
    pub fn with_process_traps(mut self, facility: Arc<dyn ProcessTraps>) -> Self {
        self.process_traps = Some(facility);
        self
    }

    #[must_use]
    pub fn with_relocator(mut self, facility: Arc<dyn TrapRelocator>) -> Self {
        self.relocator = Some(facility);
        self
    }

    /// # Errors
    /// `Unsupported` when the host offers no process lookup
    pub fn processes(&self) -> Result<&dyn ProcessTable, EngineError> {
        self.processes.as_deref().ok_or(EngineError::Unsupported("process lookup"))
    }

    /// # Errors
    /// `Unsupported` when the host offers no user-memory copy
    pub fn user_copy(&self) -> Result<&dyn UserCopy, EngineError> {
        self.user_copy.as_deref().ok_or(EngineError::Unsupported("user memory copy"))
    }

    /// # Errors
    /// `Unsupported` when the host offers no stack capture
    pub fn stack_service(&self) -> Result<&dyn UserStackService, EngineError> {
        self.stack_service.as_deref().ok_or(EngineError::Unsupported("user stack capture"))
    }

    /// # Errors
    /// `Unsupported` when the host exposes no mapping tables
    pub fn address_spaces(&self) -> Result<&dyn AddressSpaces, EngineError> {
        self.address_spaces.as_deref().ok_or(EngineError::Unsupported("address space mappings"))
    }

    /// # Errors
    /// `Unsupported` when the host offers no cross-process reads
    pub fn process_memory(&self) -> Result<&dyn ProcessMemory, EngineError> {
        self.process_memory.as_deref().ok_or(EngineError::Unsupported("cross-process memory access"))
    }

    /// # Errors
    /// `Unsupported` when system-wide traps cannot be registered
    pub fn wide_traps(&self) -> Result<&dyn WideTraps, EngineError> {
        self.wide_traps.as_deref().ok_or(EngineError::Unsupported("system-wide trap registration"))
    }

    /// # Errors
    /// `Unsupported` when process-scoped traps cannot be registered
    pub fn process_traps(&self) -> Result<&dyn ProcessTraps, EngineError> {
        self.process_traps
            .as_deref()
            .ok_or(EngineError::Unsupported("process-scoped trap registration"))
    }

    /// # Errors
    /// `Unsupported` when traps cannot be moved in place
    pub fn relocator(&self) -> Result<&dyn TrapRelocator, EngineError> {
        self.relocator.as_deref().ok_or(EngineError::Unsupported("trap relocation"))
    }

    /// Owned handles for components that keep a facility for their lifetime
    #[must_use]
    pub fn shared_processes(&self) -> Option<Arc<dyn ProcessTable>> {
        self.processes.clone()
    }

    #[must_use]
    pub fn shared_user_copy(&self) -> Option<Arc<dyn UserCopy>> {
        self.user_copy.clone()
    }

    #[must_use]
    pub fn shared_stack_service(&self) -> Option<Arc<dyn UserStackService>> {
        self.stack_service.clone()
    }

    #[must_use]
    pub fn shared_address_spaces(&self) -> Option<Arc<dyn AddressSpaces>> {
        self.address_spaces.clone()
    }

    #[must_use]
    pub fn summary(&self) -> CapabilitySummary {
        CapabilitySummary {
            process_lookup: self.processes.is_some(),
            user_copy: self.user_copy.is_some(),
            stack_service: self.stack_service.is_some(),
            address_spaces: self.address_spaces.is_some(),
            process_memory: self.process_memory.is_some(),
            wide_traps: self.wide_traps.is_some(),
            process_traps: self.process_traps.is_some(),
            relocation: self.relocator.is_some(),
        }
    }

    /// Log which features are degraded by missing facilities
    pub fn log_startup_checks(&self) {
        let summary = self.summary();
        if !summary.stack_service {
            warn!("User stack capture unavailable: native stack traces disabled");
        }
        if !summary.user_copy {
            warn!("User memory copy unavailable: paths logged as <symbol_missing>, compat walks stop at LR");
        }
        if !summary.address_spaces {
            warn!("Mapping tables unavailable: stack frames will have no module labels");
        }
        if !summary.process_lookup {
            warn!("Process lookup unavailable: filters see no process names");
        }
        if !summary.wide_traps && !summary.process_traps {
            warn!("Hardware trap registration unavailable: breakpoint commands will fail");
        }
        if summary.relocation {
            info!("Hardware breakpoints: move-to-next-instruction enabled");
        } else {
            warn!("Trap relocation unavailable: hardware breakpoints are one-shot");
        }
        if !summary.process_memory {
            warn!("Cross-process memory access unavailable: mem_read will fail");
        }
    }
}

impl fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.summary(), f)
    }
}

/// Which facilities are present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct CapabilitySummary {
    pub process_lookup: bool,
    pub user_copy: bool,
    pub stack_service: bool,
    pub address_spaces: bool,
    pub process_memory: bool,
    pub wide_traps: bool,
    pub process_traps: bool,
    pub relocation: bool,
}
