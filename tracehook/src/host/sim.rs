//! Simulated host
//!
//! In-memory implementation of every host facility, with knobs for the
//! failures a real host produces: unreadable memory, contended mapping locks,
//! rejected trap registrations, failing relocations and missing entry points.
//! Used by the test-suite and by `tracehook --simulate`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracehook_common::RegisterSnapshot;

use super::{
    AddressSpaceRef, AddressSpaces, HostCapabilities, HostError, HostResult, Interceptor, Mapping,
    MappingView, ProcessIdentity, ProcessMemory, ProcessRef, ProcessTable, ProcessTraps,
    SymbolLookup, TrapRegistration, TrapRelocator, TrapRequest, UserCopy, UserStackService,
    WideTraps,
};
use crate::domain::{FileId, HookKind, MappingId, Pid, TrapHandle};

/// A mapping as scripted by a test
#[derive(Debug, Clone)]
struct SimMapping {
    start: u64,
    end: u64,
    path: Option<String>,
}

#[derive(Debug, Default)]
struct SimProcess {
    token: u64,
    cmdline: Option<String>,
    comm: Option<String>,
    has_address_space: bool,
    /// Readable memory, keyed by region start
    memory: BTreeMap<u64, Vec<u8>>,
    /// Sorted by start
    mappings: Vec<SimMapping>,
    user_stack: Vec<u64>,
}

impl SimProcess {
    fn read_byte(&self, addr: u64) -> Option<u8> {
        let (start, bytes) = self.memory.range(..=addr).next_back()?;
        let offset = usize::try_from(addr - start).ok()?;
        bytes.get(offset).copied()
    }

    /// Bytes readable from `addr` onward, stopping at the first hole
    fn read_contiguous(&self, addr: u64, buf: &mut [u8]) -> usize {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.read_byte(addr.wrapping_add(i as u64)) {
                Some(byte) => *slot = byte,
                None => return i,
            }
        }
        buf.len()
    }
}

/// Where a simulated trap came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapScope {
    Wide,
    Process(Pid),
}

/// State of one registered trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTrap {
    pub request: TrapRequest,
    pub scope: TrapScope,
}

/// Side effects recorded by the simulated trap facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapEvent {
    Registered { handle: TrapHandle, address: u64 },
    Relocated { handle: TrapHandle, address: u64 },
    RelocateFailed { handle: TrapHandle, address: u64 },
    Unregistered { handle: TrapHandle, scope: TrapScope },
}

#[derive(Debug, Default)]
struct SimState {
    processes: HashMap<i32, SimProcess>,
    traps: HashMap<TrapHandle, SimTrap>,
    trap_events: Vec<TrapEvent>,
    symbols: HashMap<String, u64>,
    installed: Vec<(HookKind, u64)>,
    failing_installs: HashSet<u64>,
    next_registration_error: Option<HostError>,
    relocation_error: Option<HostError>,
    forced_access: Option<HostResult<usize>>,
}

/// Scriptable host with fault injection
#[derive(Debug, Default)]
pub struct SimulatedHost {
    state: Mutex<SimState>,
    next_handle: AtomicU64,
    next_token: AtomicU64,
    mappings_contended: AtomicBool,
    file_paths_unavailable: AtomicBool,
    pinned: AtomicUsize,
    mapping_locks_held: AtomicUsize,
    hw_slots: AtomicU64,
}

impl SimulatedHost {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every facility, backed by this host
    #[must_use]
    pub fn capabilities(self: &Arc<Self>) -> HostCapabilities {
        self.capabilities_without_relocation().with_relocator(self.clone())
    }

    /// Every facility except in-place trap relocation
    #[must_use]
    pub fn capabilities_without_relocation(self: &Arc<Self>) -> HostCapabilities {
        HostCapabilities::new()
            .with_processes(self.clone())
            .with_user_copy(self.clone())
            .with_stack_service(self.clone())
            .with_address_spaces(self.clone())
            .with_process_memory(self.clone())
            .with_wide_traps(self.clone())
            .with_process_traps(self.clone())
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Add a user process with an address space
    pub fn add_process(&self, pid: i32, cmdline: &str, comm: &str) -> ProcessRef {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let process = SimProcess {
            token,
            cmdline: Some(cmdline.to_string()),
            comm: Some(comm.to_string()),
            has_address_space: true,
            ..SimProcess::default()
        };
        self.state().processes.insert(pid, process);
        ProcessRef { pid: Pid(pid), token }
    }

    /// Add a task without an address space or command line
    pub fn add_kernel_thread(&self, pid: i32, comm: &str) -> ProcessRef {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let process = SimProcess {
            token,
            comm: Some(comm.to_string()),
            ..SimProcess::default()
        };
        self.state().processes.insert(pid, process);
        ProcessRef { pid: Pid(pid), token }
    }

    pub fn remove_process(&self, pid: i32) {
        self.state().processes.remove(&pid);
    }

    #[must_use]
    pub fn process_ref(&self, pid: i32) -> Option<ProcessRef> {
        self.state().processes.get(&pid).map(|p| ProcessRef { pid: Pid(pid), token: p.token })
    }

    /// Make `bytes` readable at `addr` in process `pid`
    pub fn write_memory(&self, pid: i32, addr: u64, bytes: &[u8]) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.memory.insert(addr, bytes.to_vec());
        }
    }

    /// Add a mapping; `path` is `None` for anonymous memory
    pub fn map(&self, pid: i32, start: u64, end: u64, path: Option<&str>) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.mappings.push(SimMapping { start, end, path: path.map(str::to_string) });
            process.mappings.sort_by_key(|m| m.start);
        }
    }

    /// Frames returned by the stack capture service for `pid`
    pub fn set_user_stack(&self, pid: i32, frames: &[u64]) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.user_stack = frames.to_vec();
        }
    }

    pub fn set_mapping_contention(&self, contended: bool) {
        self.mappings_contended.store(contended, Ordering::Relaxed);
    }

    pub fn set_file_paths_unavailable(&self, unavailable: bool) {
        self.file_paths_unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Reject the next trap registration with `error`
    pub fn fail_next_registration(&self, error: HostError) {
        self.state().next_registration_error = Some(error);
    }

    /// Make every relocation fail with `error` (`None` restores success)
    pub fn set_relocation_error(&self, error: Option<HostError>) {
        self.state().relocation_error = error;
    }

    /// Override the result of cross-process reads
    pub fn force_access_result(&self, result: Option<HostResult<usize>>) {
        self.state().forced_access = result;
    }

    pub fn add_symbol(&self, name: &str, address: u64) {
        self.state().symbols.insert(name.to_string(), address);
    }

    /// Make interception at `target` fail to install
    pub fn fail_install_at(&self, target: u64) {
        self.state().failing_installs.insert(target);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn trap(&self, handle: TrapHandle) -> Option<SimTrap> {
        self.state().traps.get(&handle).copied()
    }

    #[must_use]
    pub fn active_traps(&self) -> usize {
        self.state().traps.len()
    }

    #[must_use]
    pub fn trap_events(&self) -> Vec<TrapEvent> {
        self.state().trap_events.clone()
    }

    /// Handles of every trap armed at `address`, as the hardware would fire them
    #[must_use]
    pub fn execute(&self, address: u64) -> Vec<TrapHandle> {
        let mut handles: Vec<TrapHandle> = self
            .state()
            .traps
            .iter()
            .filter(|(_, trap)| trap.request.address == address)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    /// Address-space references currently pinned
    #[must_use]
    pub fn pinned_spaces(&self) -> usize {
        self.pinned.load(Ordering::Relaxed)
    }

    /// Mapping-table locks currently held
    #[must_use]
    pub fn mapping_locks_held(&self) -> usize {
        self.mapping_locks_held.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn installed_hooks(&self) -> Vec<(HookKind, u64)> {
        self.state().installed.clone()
    }

    fn register(&self, request: &TrapRequest, scope: TrapScope) -> HostResult<TrapRegistration> {
        let mut state = self.state();
        if let Some(error) = state.next_registration_error.take() {
            return Err(error);
        }
        let handle = TrapHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let hw_slot = u32::try_from(self.hw_slots.fetch_add(1, Ordering::Relaxed) % 16).ok();
        state.traps.insert(handle, SimTrap { request: *request, scope });
        state.trap_events.push(TrapEvent::Registered { handle, address: request.address });
        Ok(TrapRegistration { handle, hw_slot })
    }

    fn remove_trap(&self, handle: TrapHandle, scope: TrapScope) {
        let mut state = self.state();
        if state.traps.remove(&handle).is_some() {
            state.trap_events.push(TrapEvent::Unregistered { handle, scope });
        }
    }
}

impl ProcessTable for SimulatedHost {
    fn find(&self, pid: Pid) -> Option<ProcessRef> {
        self.process_ref(pid.0)
    }

    fn identity(&self, process: ProcessRef) -> ProcessIdentity {
        let state = self.state();
        let found = state.processes.get(&process.pid.0);
        ProcessIdentity {
            pid: process.pid,
            cmdline: found.and_then(|p| p.cmdline.clone()),
            comm: found.and_then(|p| p.comm.clone()),
        }
    }
}

impl UserCopy for SimulatedHost {
    fn copy_from_user(&self, process: ProcessRef, addr: u64, buf: &mut [u8]) -> HostResult<()> {
        let state = self.state();
        let found = state.processes.get(&process.pid.0).ok_or(HostError::FAULT)?;
        if found.read_contiguous(addr, buf) == buf.len() {
            Ok(())
        } else {
            Err(HostError::FAULT)
        }
    }

    fn copy_string(&self, process: ProcessRef, addr: u64, max_len: usize) -> HostResult<String> {
        let state = self.state();
        let found = state.processes.get(&process.pid.0).ok_or(HostError::FAULT)?;
        let mut bytes = Vec::new();
        for i in 0..max_len {
            match found.read_byte(addr.wrapping_add(i as u64)) {
                Some(0) => break,
                Some(byte) => bytes.push(byte),
                None if i == 0 => return Err(HostError::FAULT),
                None => break,
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl UserStackService for SimulatedHost {
    fn save_user_stack(
        &self,
        process: ProcessRef,
        _regs: &RegisterSnapshot,
        out: &mut [u64],
    ) -> usize {
        let state = self.state();
        let Some(found) = state.processes.get(&process.pid.0) else {
            return 0;
        };
        let n = found.user_stack.len().min(out.len());
        out[..n].copy_from_slice(&found.user_stack[..n]);
        n
    }
}

/// Mapping table of one simulated process
struct SimMappingView<'a> {
    mappings: &'a [SimMapping],
    paths: Vec<&'a str>,
    paths_unavailable: bool,
}

impl<'a> SimMappingView<'a> {
    fn new(mappings: &'a [SimMapping], paths_unavailable: bool) -> Self {
        let mut paths: Vec<&str> = Vec::new();
        for path in mappings.iter().filter_map(|m| m.path.as_deref()) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Self { mappings, paths, paths_unavailable }
    }

    fn file_id(&self, path: &str) -> Option<FileId> {
        self.paths.iter().position(|p| *p == path).map(|i| FileId(i as u64))
    }
}

impl MappingView for SimMappingView<'_> {
    fn find(&self, addr: u64) -> Option<MappingId> {
        self.mappings.iter().position(|m| m.end > addr).map(|i| MappingId(i as u64))
    }

    fn mapping(&self, id: MappingId) -> Option<Mapping> {
        let m = self.mappings.get(usize::try_from(id.0).ok()?)?;
        Some(Mapping {
            start: m.start,
            end: m.end,
            file: m.path.as_deref().and_then(|p| self.file_id(p)),
        })
    }

    fn prev(&self, id: MappingId) -> Option<MappingId> {
        id.0.checked_sub(1).map(MappingId)
    }

    fn file_path(&self, file: FileId) -> Option<String> {
        if self.paths_unavailable {
            return None;
        }
        self.paths.get(usize::try_from(file.0).ok()?).map(|p| (*p).to_string())
    }
}

impl AddressSpaces for SimulatedHost {
    fn try_with_mappings(
        &self,
        process: ProcessRef,
        visit: &mut dyn FnMut(&dyn MappingView),
    ) -> bool {
        if self.mappings_contended.load(Ordering::Relaxed) {
            return false;
        }
        let state = self.state();
        let Some(found) = state.processes.get(&process.pid.0) else {
            return false;
        };
        if !found.has_address_space {
            return false;
        }
        self.mapping_locks_held.fetch_add(1, Ordering::Relaxed);
        let view =
            SimMappingView::new(&found.mappings, self.file_paths_unavailable.load(Ordering::Relaxed));
        visit(&view);
        self.mapping_locks_held.fetch_sub(1, Ordering::Relaxed);
        true
    }
}

impl ProcessMemory for SimulatedHost {
    fn pin(&self, process: ProcessRef) -> Option<AddressSpaceRef> {
        let state = self.state();
        let found = state.processes.get(&process.pid.0)?;
        if !found.has_address_space {
            return None;
        }
        self.pinned.fetch_add(1, Ordering::Relaxed);
        Some(AddressSpaceRef(found.token))
    }

    fn unpin(&self, _space: AddressSpaceRef) {
        self.pinned.fetch_sub(1, Ordering::Relaxed);
    }

    fn access(
        &self,
        process: ProcessRef,
        _space: &AddressSpaceRef,
        addr: u64,
        buf: &mut [u8],
    ) -> HostResult<usize> {
        let state = self.state();
        if let Some(forced) = state.forced_access {
            return forced;
        }
        let found = state.processes.get(&process.pid.0).ok_or(HostError::FAULT)?;
        Ok(found.read_contiguous(addr, buf))
    }
}

impl WideTraps for SimulatedHost {
    fn register_wide(&self, request: &TrapRequest) -> HostResult<TrapRegistration> {
        self.register(request, TrapScope::Wide)
    }

    fn unregister_wide(&self, handle: TrapHandle) {
        self.remove_trap(handle, TrapScope::Wide);
    }
}

impl ProcessTraps for SimulatedHost {
    fn register_for_process(
        &self,
        request: &TrapRequest,
        process: ProcessRef,
    ) -> HostResult<TrapRegistration> {
        self.register(request, TrapScope::Process(process.pid))
    }

    fn unregister(&self, handle: TrapHandle) {
        let scope = self.trap(handle).map_or(TrapScope::Wide, |t| t.scope);
        self.remove_trap(handle, scope);
    }
}

impl TrapRelocator for SimulatedHost {
    fn relocate(&self, handle: TrapHandle, request: &TrapRequest) -> HostResult<()> {
        let mut state = self.state();
        if let Some(error) = state.relocation_error {
            state.trap_events.push(TrapEvent::RelocateFailed { handle, address: request.address });
            return Err(error);
        }
        let trap = state.traps.get_mut(&handle).ok_or(HostError::from_errno(libc::ENOENT))?;
        trap.request = *request;
        state.trap_events.push(TrapEvent::Relocated { handle, address: request.address });
        Ok(())
    }
}

impl SymbolLookup for SimulatedHost {
    fn lookup(&self, name: &str) -> Option<u64> {
        self.state().symbols.get(name).copied()
    }
}

impl Interceptor for SimulatedHost {
    fn install(&self, hook: HookKind, target: u64) -> HostResult<()> {
        let mut state = self.state();
        if state.failing_installs.contains(&target) {
            return Err(HostError::BUSY);
        }
        state.installed.push((hook, target));
        Ok(())
    }

    fn uninstall(&self, hook: HookKind, target: u64) {
        self.state().installed.retain(|entry| *entry != (hook, target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracehook_common::{BreakpointKind, BreakpointWidth};

    #[test]
    fn test_short_read_stops_at_hole() {
        let host = SimulatedHost::new();
        let process = host.add_process(100, "app", "app");
        host.write_memory(100, 0x4000, &[1, 2, 3]);

        let mut buf = [0u8; 8];
        assert!(host.copy_from_user(process, 0x4000, &mut buf).is_err());
        assert!(host.copy_from_user(process, 0x4000, &mut buf[..3]).is_ok());

        let space = host.pin(process).unwrap();
        assert_eq!(host.access(process, &space, 0x4000, &mut buf).unwrap(), 3);
        host.unpin(space);
        assert_eq!(host.pinned_spaces(), 0);
    }

    #[test]
    fn test_copy_string_stops_at_nul() {
        let host = SimulatedHost::new();
        let process = host.add_process(100, "app", "app");
        host.write_memory(100, 0x5000, b"/data/local\0junk");
        assert_eq!(host.copy_string(process, 0x5000, 256).unwrap(), "/data/local");
        assert!(host.copy_string(process, 0x9000, 256).is_err());
    }

    #[test]
    fn test_trap_lifecycle_is_recorded() {
        let host = SimulatedHost::new();
        let request = TrapRequest {
            address: 0x1000,
            kind: BreakpointKind::Exec,
            width: BreakpointWidth::Four,
        };
        let reg = host.register_wide(&request).unwrap();
        assert_eq!(host.execute(0x1000), vec![reg.handle]);

        let moved = TrapRequest { address: 0x1004, ..request };
        host.relocate(reg.handle, &moved).unwrap();
        assert!(host.execute(0x1000).is_empty());

        host.unregister_wide(reg.handle);
        assert_eq!(host.active_traps(), 0);
        assert_eq!(host.trap_events().len(), 3);
    }
}
