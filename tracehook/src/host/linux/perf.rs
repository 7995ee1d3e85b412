//! Hardware traps over `perf_event_open(PERF_TYPE_BREAKPOINT)`
//!
//! A system-wide trap is one counting event per online CPU; a process-scoped
//! trap is a single event following the process across CPUs. Traps are moved
//! in place with `PERF_EVENT_IOC_MODIFY_ATTRIBUTES`.
//!
//! Counting events carry no program counter, so hits are discovered by polling
//! the counters ([`PerfTraps::poll_hits`]) and reported at the trap's current
//! address. [`spawn_hit_pump`] runs that poll on a thread and hands hits over
//! a bounded channel.

#![allow(unsafe_code)] // perf_event_open, ioctl and read require unsafe

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, TrySendError};
use log::{debug, info, warn};
use tracehook_common::PERF_TYPE_BREAKPOINT;

use crate::domain::{HostError, HostResult, TrapHandle};
use crate::host::{
    ProcessRef, ProcessTraps, TrapRegistration, TrapRelocator, TrapRequest, WideTraps,
};

/// `PERF_EVENT_IOC_MODIFY_ATTRIBUTES` (`_IOW('$', 11, struct perf_event_attr *)`)
const PERF_EVENT_IOC_MODIFY_ATTRIBUTES: u64 = 0x4008_240b;

/// `PERF_FLAG_FD_CLOEXEC`
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 8;

/// `perf_event_attr.exclude_kernel`
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;

/// `perf_event_attr.exclude_hv`
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

/// Channel depth between the pump thread and the consumer
pub const HIT_CHANNEL_CAPACITY: usize = 1000;

/// `struct perf_event_attr`, `PERF_ATTR_SIZE_VER5`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    bp_addr: u64,
    bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

impl PerfEventAttr {
    #[allow(clippy::cast_possible_truncation)]
    fn breakpoint(request: &TrapRequest) -> Self {
        Self {
            kind: PERF_TYPE_BREAKPOINT,
            size: std::mem::size_of::<Self>() as u32,
            sample_period: 1,
            flags: ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
            bp_type: request.kind.bp_type(),
            bp_addr: request.address,
            bp_len: request.width.bytes(),
            ..Self::default()
        }
    }
}

fn perf_event_open(attr: &PerfEventAttr, pid: i32, cpu: i32) -> HostResult<File> {
    // SAFETY: `attr` points to a fully initialised attribute struct whose `size`
    // field matches its layout; the kernel only reads it.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            std::ptr::from_ref(attr),
            pid,
            cpu,
            -1,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(HostError::last_os_error());
    }
    let fd = i32::try_from(fd).map_err(|_| HostError::from_errno(libc::EBADF))?;
    // SAFETY: `fd` was just returned by the kernel and is owned by nobody else.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

fn modify_attributes(file: &File, attr: &PerfEventAttr) -> HostResult<()> {
    // SAFETY: the request takes a pointer to a perf_event_attr, which `attr` is.
    let rc = unsafe {
        libc::ioctl(file.as_raw_fd(), PERF_EVENT_IOC_MODIFY_ATTRIBUTES as _, std::ptr::from_ref(attr))
    };
    if rc < 0 {
        return Err(HostError::last_os_error());
    }
    Ok(())
}

/// Apply `next` to every event of a trap
///
/// When one event refuses, the events already changed get `previous` back so
/// the trap never watches two addresses at once.
fn modify_all<E>(
    events: &[E],
    next: &PerfEventAttr,
    previous: &PerfEventAttr,
    mut modify: impl FnMut(&E, &PerfEventAttr) -> HostResult<()>,
) -> HostResult<()> {
    for (i, event) in events.iter().enumerate() {
        if let Err(err) = modify(event, next) {
            for done in &events[..i] {
                if let Err(restore) = modify(done, previous) {
                    warn!("Failed to restore breakpoint event at 0x{:x}: {restore}", previous.bp_addr);
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Collapse a counter advance into at most one hit
///
/// A trap relocates on every hit, so any further counts since the last poll
/// were taken at addresses this poll cannot reconstruct.
fn take_hit(handle: TrapHandle, address: u64, reported: &mut u64, total: u64) -> Option<TrapHit> {
    if total <= *reported {
        return None;
    }
    let burst = total - *reported;
    *reported = total;
    if burst > 1 {
        debug!("Trap {handle}: {burst} counts since last poll, reporting one hit");
    }
    Some(TrapHit { handle, address })
}

fn read_count(file: &File) -> Option<u64> {
    let mut raw = [0u8; 8];
    let mut reader = file;
    reader.read_exact(&mut raw).ok()?;
    Some(u64::from_ne_bytes(raw))
}

/// A trap fired at `address`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapHit {
    pub handle: TrapHandle,
    pub address: u64,
}

struct PerfTrap {
    /// One per CPU for system-wide traps
    events: Vec<File>,
    request: TrapRequest,
    /// Sum of event counts already reported
    reported: u64,
}

/// `perf_event_open` trap facility
pub struct PerfTraps {
    cpus: Vec<u32>,
    traps: Mutex<HashMap<TrapHandle, PerfTrap>>,
    next_handle: AtomicU64,
}

impl PerfTraps {
    /// Facility registering system-wide traps on `cpus`
    #[must_use]
    pub fn new(cpus: Vec<u32>) -> Self {
        Self { cpus, traps: Mutex::new(HashMap::new()), next_handle: AtomicU64::new(0) }
    }

    fn traps(&self) -> MutexGuard<'_, HashMap<TrapHandle, PerfTrap>> {
        self.traps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, events: Vec<File>, request: &TrapRequest) -> TrapRegistration {
        let handle = TrapHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.traps().insert(handle, PerfTrap { events, request: *request, reported: 0 });
        // perf does not expose which debug register it picked
        TrapRegistration { handle, hw_slot: None }
    }

    /// Traps whose counters advanced since the last poll, one hit per trap
    /// at the address it currently watches
    #[must_use]
    pub fn poll_hits(&self) -> Vec<TrapHit> {
        let mut hits = Vec::new();
        for (handle, trap) in self.traps().iter_mut() {
            let total: u64 = trap.events.iter().filter_map(read_count).sum();
            hits.extend(take_hit(*handle, trap.request.address, &mut trap.reported, total));
        }
        hits
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.traps().len()
    }
}

impl WideTraps for PerfTraps {
    fn register_wide(&self, request: &TrapRequest) -> HostResult<TrapRegistration> {
        let attr = PerfEventAttr::breakpoint(request);
        let mut events = Vec::with_capacity(self.cpus.len());
        for &cpu in &self.cpus {
            let cpu = i32::try_from(cpu).map_err(|_| HostError::from_errno(libc::EINVAL))?;
            // A failure drops the events opened so far
            events.push(perf_event_open(&attr, -1, cpu)?);
        }
        if events.is_empty() {
            return Err(HostError::NOT_SUPPORTED);
        }
        debug!("Opened {} breakpoint events at 0x{:x}", events.len(), request.address);
        Ok(self.insert(events, request))
    }

    fn unregister_wide(&self, handle: TrapHandle) {
        self.traps().remove(&handle);
    }
}

impl ProcessTraps for PerfTraps {
    fn register_for_process(
        &self,
        request: &TrapRequest,
        process: ProcessRef,
    ) -> HostResult<TrapRegistration> {
        let event = perf_event_open(&PerfEventAttr::breakpoint(request), process.pid.0, -1)?;
        Ok(self.insert(vec![event], request))
    }

    fn unregister(&self, handle: TrapHandle) {
        self.traps().remove(&handle);
    }
}

impl TrapRelocator for PerfTraps {
    fn relocate(&self, handle: TrapHandle, request: &TrapRequest) -> HostResult<()> {
        let mut traps = self.traps();
        let trap = traps.get_mut(&handle).ok_or(HostError::from_errno(libc::ENOENT))?;
        let next = PerfEventAttr::breakpoint(request);
        let previous = PerfEventAttr::breakpoint(&trap.request);
        modify_all(&trap.events, &next, &previous, modify_attributes)?;
        trap.request = *request;
        Ok(())
    }
}

/// Poll `traps` every `interval` until `stop` is set, sending hits to the returned channel
///
/// Hits that do not fit in the channel are dropped with a warning.
///
/// # Errors
/// Returns an error if the thread cannot be spawned
pub fn spawn_hit_pump(
    traps: Arc<PerfTraps>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, Receiver<TrapHit>)> {
    let (tx, rx) = bounded(HIT_CHANNEL_CAPACITY);
    let handle = std::thread::Builder::new()
        .name("tracehook-hits".to_string())
        .spawn(move || {
            info!("Breakpoint hit pump started");
            while !stop.load(Ordering::Relaxed) {
                for hit in traps.poll_hits() {
                    match tx.try_send(hit) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => warn!("Hit channel full, dropping hit"),
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                std::thread::sleep(interval);
            }
            info!("Breakpoint hit pump stopped");
        })
        .context("Failed to spawn hit pump thread")?;
    Ok((handle, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_size_matches_ver5() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
    }

    #[test]
    fn test_breakpoint_attr() {
        use tracehook_common::{BreakpointKind, BreakpointWidth, HW_BREAKPOINT_W};
        let request =
            TrapRequest { address: 0x4000, kind: BreakpointKind::Write, width: BreakpointWidth::Eight };
        let attr = PerfEventAttr::breakpoint(&request);
        assert_eq!(attr.kind, PERF_TYPE_BREAKPOINT);
        assert_eq!(attr.bp_type, HW_BREAKPOINT_W);
        assert_eq!(attr.bp_addr, 0x4000);
        assert_eq!(attr.bp_len, 8);
        assert_eq!(attr.size, 112);
    }

    #[test]
    fn test_failed_relocation_rolls_back_every_event() {
        use std::cell::RefCell;
        use tracehook_common::{BreakpointKind, BreakpointWidth};

        let original =
            TrapRequest { address: 0x4000, kind: BreakpointKind::Exec, width: BreakpointWidth::Four };
        let moved = TrapRequest { address: 0x4004, ..original };
        let previous = PerfEventAttr::breakpoint(&original);
        let next = PerfEventAttr::breakpoint(&moved);

        // Four per-CPU events; the third refuses the new address
        let watching = RefCell::new(vec![0x4000u64; 4]);
        let events: Vec<usize> = (0..4).collect();
        let result = modify_all(&events, &next, &previous, |&cpu, attr| {
            if cpu == 2 && attr.bp_addr == 0x4004 {
                return Err(HostError::BUSY);
            }
            watching.borrow_mut()[cpu] = attr.bp_addr;
            Ok(())
        });

        assert_eq!(result, Err(HostError::BUSY));
        assert_eq!(*watching.borrow(), vec![0x4000; 4]);

        let result = modify_all(&events, &next, &previous, |&cpu, attr| {
            watching.borrow_mut()[cpu] = attr.bp_addr;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(*watching.borrow(), vec![0x4004; 4]);
    }

    #[test]
    fn test_counter_burst_is_one_hit() {
        use crate::engine::{BreakpointRequest, HardwareBreakpointManager, HitOutcome};
        use crate::host::sim::SimulatedHost;
        use tracehook_common::{BreakpointKind, BreakpointWidth};

        let mut reported = 0;
        let hit = take_hit(TrapHandle(1), 0x4000, &mut reported, 3);
        assert_eq!(hit, Some(TrapHit { handle: TrapHandle(1), address: 0x4000 }));
        assert_eq!(reported, 3);
        assert_eq!(take_hit(TrapHandle(1), 0x4000, &mut reported, 3), None);

        // A burst of three counts delivered to the manager
        let host = SimulatedHost::new();
        let manager = HardwareBreakpointManager::new(host.capabilities());
        let index = manager
            .set(&BreakpointRequest::new(0x4000, BreakpointKind::Exec, BreakpointWidth::Four))
            .unwrap();
        let handle = host.execute(0x4000)[0];
        let mut reported = 0;
        let hit = take_hit(handle, 0x4000, &mut reported, 3).unwrap();
        assert_eq!(manager.on_hit(hit.handle, hit.address), HitOutcome::SteppedPast { index, hits: 1 });

        let info = manager.get(index).unwrap();
        assert_eq!(info.state, "moved");
        assert_eq!(info.current_address, 0x4004);
        assert_eq!(info.hit_count, 1);
    }

    #[test]
    fn test_unknown_handle_relocation() {
        use tracehook_common::{BreakpointKind, BreakpointWidth};
        let traps = PerfTraps::new(vec![0]);
        let request =
            TrapRequest { address: 0x4000, kind: BreakpointKind::Exec, width: BreakpointWidth::Four };
        assert_eq!(
            traps.relocate(TrapHandle(9), &request).unwrap_err(),
            HostError::from_errno(libc::ENOENT)
        );
        assert!(traps.poll_hits().is_empty());
    }
}
