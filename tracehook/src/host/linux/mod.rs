//! Linux userspace host backend
//!
//! | Facility | Source |
//! |---|---|
//! | process lookup | `/proc/<pid>/stat`, `cmdline` |
//! | user copy, cross-process reads | `process_vm_readv` |
//! | mapping tables | `/proc/<pid>/maps` |
//! | hardware traps, relocation | `perf_event_open(PERF_TYPE_BREAKPOINT)` |
//!
//! There is no user stack capture service from userspace, so native-width
//! traces are unavailable here.

#![allow(unsafe_code)] // geteuid() requires unsafe

pub mod maps;
pub mod perf;
pub mod procfs;
pub mod vm;

use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use self::maps::ProcMaps;
use self::perf::PerfTraps;
use self::procfs::ProcFs;
use self::vm::ProcessVm;
use super::layout::HostVersion;
use super::HostCapabilities;

/// Facilities of the running Linux host
pub struct LinuxHost {
    procfs: Arc<ProcFs>,
    vm: Arc<ProcessVm>,
    maps: Arc<ProcMaps>,
    traps: Option<Arc<PerfTraps>>,
}

impl LinuxHost {
    /// Probe `/proc` and the online CPUs
    ///
    /// A host whose CPU list cannot be read has no trap facility.
    ///
    /// # Errors
    /// Returns an error if `/proc` is not mounted
    pub fn open() -> Result<Self> {
        let procfs = ProcFs::default();
        fs::metadata(procfs.root().join("self"))
            .with_context(|| format!("{} is not mounted", procfs.root().display()))?;

        let traps = match online_cpus() {
            Ok(cpus) => {
                info!("Hardware traps available on {} CPUs", cpus.len());
                Some(Arc::new(PerfTraps::new(cpus)))
            }
            Err(e) => {
                warn!("Failed to read online CPUs: {e}. Hardware traps disabled.");
                None
            }
        };

        Ok(Self {
            vm: Arc::new(ProcessVm::new(procfs.clone())),
            maps: Arc::new(ProcMaps::new(procfs.clone())),
            procfs: Arc::new(procfs),
            traps,
        })
    }

    #[must_use]
    pub fn capabilities(&self) -> HostCapabilities {
        let mut caps = HostCapabilities::new()
            .with_processes(self.procfs.clone())
            .with_user_copy(self.vm.clone())
            .with_process_memory(self.vm.clone())
            .with_address_spaces(self.maps.clone());
        if let Some(traps) = &self.traps {
            caps = caps
                .with_wide_traps(traps.clone())
                .with_process_traps(traps.clone())
                .with_relocator(traps.clone());
        }
        caps
    }

    /// Trap facility, for the hit pump
    #[must_use]
    pub fn traps(&self) -> Option<&Arc<PerfTraps>> {
        self.traps.as_ref()
    }

    /// Running kernel version, if the release string can be parsed
    #[must_use]
    pub fn version(&self) -> Option<HostVersion> {
        self.procfs.os_release().ok().as_deref().and_then(HostVersion::parse)
    }
}

/// Get list of online CPU IDs from /sys/devices/system/cpu/online
///
/// The format in /sys is like "0-3" or "0-3,8-11" for NUMA systems.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed
pub fn online_cpus() -> Result<Vec<u32>> {
    let content = fs::read_to_string("/sys/devices/system/cpu/online")
        .context("Failed to read /sys/devices/system/cpu/online")?;
    parse_cpu_list(&content)
}

fn parse_cpu_list(content: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for range in content.trim().split(',') {
        if let Some((start, end)) = range.split_once('-') {
            let start: u32 = start.parse()?;
            let end: u32 = end.parse()?;
            cpus.extend(start..=end);
        } else {
            cpus.push(range.parse()?);
        }
    }
    Ok(cpus)
}

/// Check that the tool runs with the privileges trap registration and
/// cross-process reads need
///
/// # Errors
/// Returns a "Permission denied" error when not running as root
pub fn check_privileges() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    bail!(
        "Permission denied: tracehook requires root privileges to read other processes \
         and register hardware breakpoints.\n\n\
         Run with: sudo tracehook ...\n\
         Or try the simulated host: tracehook --simulate ..."
    );
}
