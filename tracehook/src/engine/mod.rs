//! Instrumentation engine
//!
//! [`Engine`] owns the live configuration and every component, wired to one
//! set of [`HostCapabilities`]:
//!
//! ```text
//!  interception ──▶ SyscallObserver ──▶ filter::decide
//!                         │
//!                         └──▶ StackUnwinder ──▶ ModuleResolver
//!
//!  trap delivery ──▶ HardwareBreakpointManager ──▶ relocation
//!
//!  control ──▶ EngineConfig / HardwareBreakpointManager / RemoteMemoryReader
//! ```

pub mod breakpoints;
pub mod filter;
pub mod memory_reader;
pub mod module_resolver;
pub mod observer;
pub mod relocation;
pub mod unwinder;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, warn};
use serde::Serialize;
use tracehook_common::HW_BREAKPOINT_SLOTS;

pub use breakpoints::{BreakpointInfo, BreakpointRequest, HardwareBreakpointManager, HitOutcome};
pub use filter::{FilterEntry, FilterList};
pub use memory_reader::RemoteMemoryReader;
pub use module_resolver::ModuleResolver;
pub use observer::{CallSite, EventDetail, Observation, SyscallObserver};
pub use unwinder::{StackTrace, StackUnwinder};

use crate::config::{EngineConfig, EngineSettings};
use crate::control::{self, ControlReply};
use crate::domain::{EngineError, HookKind};
use crate::host::{CapabilitySummary, HostCapabilities, Interceptor, SymbolLookup};

/// Entry points tried for each hook, in order
#[must_use]
pub const fn hook_candidates(hook: HookKind) -> &'static [&'static str] {
    match hook {
        HookKind::Access => &["do_faccessat"],
        HookKind::Openat => &["do_sys_openat2", "do_sys_open"],
        HookKind::Kill => &["__arm64_sys_kill", "__sys_kill", "sys_kill"],
    }
}

/// Where a hook was installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledHook {
    pub hook: &'static str,
    pub symbol: &'static str,
    pub address: u64,
}

/// Result of [`Engine::attach`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttachReport {
    pub installed: Vec<InstalledHook>,
    /// Optional hooks that could not be installed and were switched off
    pub missing: Vec<&'static str>,
}

impl fmt::Display for AttachReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hook in &self.installed {
            writeln!(f, "{}: {} @ 0x{:x}", hook.hook, hook.symbol, hook.address)?;
        }
        for hook in &self.missing {
            writeln!(f, "{hook}: not installed")?;
        }
        Ok(())
    }
}

/// Point-in-time view of the engine, rendered by `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub access_hook: bool,
    pub openat_hook: bool,
    pub kill_hook: bool,
    pub access_count: u64,
    pub openat_count: u64,
    pub kill_count: u64,
    pub total_hooks: u64,
    pub filter_mode: &'static str,
    /// Active filters as `pid:N` / `name:S`
    pub filters: Vec<String>,
    pub breakpoints: usize,
    pub breakpoint_slots: usize,
    pub relocation: bool,
    pub capabilities: CapabilitySummary,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "enabled={}", u8::from(self.enabled))?;
        writeln!(f, "access_hook={}", u8::from(self.access_hook))?;
        writeln!(f, "openat_hook={}", u8::from(self.openat_hook))?;
        writeln!(f, "kill_hook={}", u8::from(self.kill_hook))?;
        writeln!(f, "access_count={}", self.access_count)?;
        writeln!(f, "openat_count={}", self.openat_count)?;
        writeln!(f, "kill_count={}", self.kill_count)?;
        writeln!(f, "total_hooks={}", self.total_hooks)?;
        writeln!(f, "filter_mode={}", self.filter_mode)?;
        writeln!(f, "filter_count={}", self.filters.len())?;
        for (i, filter) in self.filters.iter().enumerate() {
            writeln!(f, "filter[{i}]={filter}")?;
        }
        writeln!(f, "breakpoints={}/{}", self.breakpoints, self.breakpoint_slots)?;
        write!(f, "bp_relocate={}", if self.relocation { "available" } else { "one-shot" })
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    host: HostCapabilities,
    observer: SyscallObserver,
    breakpoints: HardwareBreakpointManager,
    memory: RemoteMemoryReader,
    installed: Mutex<Vec<(HookKind, u64)>>,
}

impl Engine {
    /// Build an engine over `host`
    ///
    /// # Errors
    /// Returns the settings validation error
    pub fn new(settings: &EngineSettings, host: HostCapabilities) -> Result<Self, EngineError> {
        let config = Arc::new(EngineConfig::new(settings)?);
        host.log_startup_checks();

        let unwinder = StackUnwinder::new(
            host.shared_user_copy(),
            host.shared_stack_service(),
            ModuleResolver::new(host.shared_address_spaces()),
        );
        let observer = SyscallObserver::new(
            Arc::clone(&config),
            host.shared_processes(),
            host.shared_user_copy(),
            unwinder,
        );

        Ok(Self {
            observer,
            breakpoints: HardwareBreakpointManager::new(host.clone()),
            memory: RemoteMemoryReader::new(host.clone()),
            config,
            host,
            installed: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    #[must_use]
    pub fn observer(&self) -> &SyscallObserver {
        &self.observer
    }

    #[must_use]
    pub fn breakpoints(&self) -> &HardwareBreakpointManager {
        &self.breakpoints
    }

    #[must_use]
    pub fn memory(&self) -> &RemoteMemoryReader {
        &self.memory
    }

    #[must_use]
    pub fn host(&self) -> &HostCapabilities {
        &self.host
    }

    /// Resolve and install the three hooks
    ///
    /// The access hook is required; the open and signal hooks fall back through
    /// [`hook_candidates`] and are switched off when none can be installed.
    ///
    /// # Errors
    /// - `InvalidArgument` when already attached
    /// - `NotFound` when no access-check entry point exists
    /// - `Host` when installing the access hook fails
    pub fn attach(
        &self,
        symbols: &dyn SymbolLookup,
        interceptor: &dyn Interceptor,
    ) -> Result<AttachReport, EngineError> {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if !installed.is_empty() {
            return Err(EngineError::InvalidArgument("Engine is already attached".to_string()));
        }

        let mut report = AttachReport::default();
        for hook in HookKind::ALL {
            match install_hook(hook, symbols, interceptor) {
                Ok((symbol, address)) => {
                    installed.push((hook, address));
                    report.installed.push(InstalledHook { hook: hook.as_str(), symbol, address });
                }
                Err(err) if hook == HookKind::Access => {
                    error!("Failed to install {hook} hook: {err}");
                    return Err(err);
                }
                Err(_) => {
                    self.config.set_hook_enabled(hook, false);
                    report.missing.push(hook.as_str());
                }
            }
        }

        info!("Engine attached ({} hooks installed)", report.installed.len());
        Ok(report)
    }

    /// Remove installed hooks and log final statistics; returns how many were removed
    pub fn detach(&self, interceptor: &dyn Interceptor) -> usize {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        for (hook, address) in installed.iter() {
            interceptor.uninstall(*hook, *address);
            info!("{hook} hook removed");
        }
        let removed = installed.len();
        installed.clear();

        info!(
            "Final statistics: access={}, openat={}, kill={}",
            self.config.count(HookKind::Access),
            self.config.count(HookKind::Openat),
            self.config.count(HookKind::Kill)
        );
        removed
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.installed.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let config = &self.config;
        EngineStatus {
            enabled: config.is_enabled(),
            access_hook: config.hook_enabled(HookKind::Access),
            openat_hook: config.hook_enabled(HookKind::Openat),
            kill_hook: config.hook_enabled(HookKind::Kill),
            access_count: config.count(HookKind::Access),
            openat_count: config.count(HookKind::Openat),
            kill_count: config.count(HookKind::Kill),
            total_hooks: config.total_count(),
            filter_mode: config.filter_mode().as_str(),
            filters: config
                .filters()
                .entries()
                .iter()
                .filter(|entry| entry.active)
                .map(ToString::to_string)
                .collect(),
            breakpoints: self.breakpoints.active_count(),
            breakpoint_slots: HW_BREAKPOINT_SLOTS,
            relocation: self.breakpoints.relocation_available(),
            capabilities: self.host.summary(),
        }
    }

    /// Run one control command line
    pub fn execute(&self, line: &str) -> ControlReply {
        control::dispatch(self, line)
    }
}

/// First candidate that resolves and installs
fn install_hook(
    hook: HookKind,
    symbols: &dyn SymbolLookup,
    interceptor: &dyn Interceptor,
) -> Result<(&'static str, u64), EngineError> {
    let mut last_error = None;
    for (i, &symbol) in hook_candidates(hook).iter().enumerate() {
        let Some(address) = symbols.lookup(symbol) else {
            continue;
        };
        match interceptor.install(hook, address) {
            Ok(()) => {
                info!("{symbol} hook installed");
                return Ok((symbol, address));
            }
            Err(err) => {
                match hook_candidates(hook).get(i + 1) {
                    Some(next) => warn!("{symbol} hook installation failed, trying {next}"),
                    None => warn!("{symbol} hook installation failed: {}", err.code()),
                }
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) => Err(err.into()),
        None => {
            warn!("{} symbol not found, {hook} hook disabled", hook_candidates(hook).join("/"));
            Err(EngineError::NotFound(format!("No entry point found for the {hook} hook")))
        }
    }
}
