//! Engine configuration
//!
//! [`EngineSettings`] is the plain, cloneable description of how the engine
//! starts. [`EngineConfig`] is the live context built from it: one control
//! caller mutates it while any number of observers read it.
//!
//! Flags and counters are relaxed atomics. The filter list is published as an
//! immutable [`FilterList`] snapshot behind a short-lived lock; observers only
//! ever `try_read` it, so an observer never waits on the control path.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::info;

use crate::domain::{EngineError, FilterMode, HookKind};
use crate::engine::filter::{FilterEntry, FilterList};
use crate::host::layout::{HostVersion, LayoutDescriptor};

/// Attempts an observer makes to read the filter snapshot before giving up
pub const FILTER_SNAPSHOT_SPINS: usize = 64;

/// Bounds applied to the raw target-pid and signal arguments of the signal hook
///
/// Invocations outside these bounds are dropped without logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalArgPolicy {
    pub min_pid: i32,
    pub max_pid: i32,
    pub min_signal: i32,
    pub max_signal: i32,
}

impl Default for SignalArgPolicy {
    fn default() -> Self {
        Self { min_pid: -1, max_pid: 99_999, min_signal: 0, max_signal: 64 }
    }
}

impl SignalArgPolicy {
    #[must_use]
    pub fn accepts(&self, pid: i32, signal: i32) -> bool {
        (self.min_pid..=self.max_pid).contains(&pid)
            && (self.min_signal..=self.max_signal).contains(&signal)
    }
}

/// Startup configuration
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct EngineSettings {
    /// Global switch for all observers
    pub enabled: bool,
    pub access_enabled: bool,
    pub openat_enabled: bool,
    pub kill_enabled: bool,
    pub filter_mode: FilterMode,
    /// Filters installed before the first observation
    pub filters: Vec<FilterEntry>,
    pub signal_policy: SignalArgPolicy,
    /// Structure layout to use instead of the built-in table
    pub layout_override: Option<LayoutDescriptor>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            access_enabled: true,
            openat_enabled: true,
            kill_enabled: true,
            filter_mode: FilterMode::Whitelist,
            filters: Vec::new(),
            signal_policy: SignalArgPolicy::default(),
            layout_override: None,
        }
    }
}

impl EngineSettings {
    /// Validate configuration
    ///
    /// # Errors
    /// Returns `InvalidArgument` for inverted signal bounds or too many filters
    pub fn validate(&self) -> Result<(), EngineError> {
        let policy = &self.signal_policy;
        if policy.min_pid > policy.max_pid || policy.min_signal > policy.max_signal {
            return Err(EngineError::InvalidArgument(
                "Signal argument bounds are inverted".to_string(),
            ));
        }
        if self.filters.len() > FilterList::CAPACITY {
            return Err(EngineError::InvalidArgument(format!(
                "At most {} filters can be configured",
                FilterList::CAPACITY
            )));
        }
        if let Some(layout) = &self.layout_override {
            layout.validate()?;
        }
        Ok(())
    }

    /// Layout for `version`: the override if one is set, else the built-in table
    ///
    /// # Errors
    /// `Unsupported` when no built-in layout covers `version`
    pub fn layout_for(&self, version: HostVersion) -> Result<LayoutDescriptor, EngineError> {
        match &self.layout_override {
            Some(layout) => Ok(*layout),
            None => LayoutDescriptor::for_version(version),
        }
    }

    #[must_use]
    pub fn hook_enabled(&self, hook: HookKind) -> bool {
        match hook {
            HookKind::Access => self.access_enabled,
            HookKind::Openat => self.openat_enabled,
            HookKind::Kill => self.kill_enabled,
        }
    }
}

#[derive(Debug, Default)]
struct HookState {
    enabled: AtomicBool,
    count: AtomicU64,
}

/// Live engine configuration shared between the control path and observers
#[derive(Debug)]
pub struct EngineConfig {
    enabled: AtomicBool,
    hooks: [HookState; 3],
    filter_mode: AtomicU8,
    filters: RwLock<Arc<FilterList>>,
    generation: AtomicU64,
    signal_policy: SignalArgPolicy,
}

impl EngineConfig {
    /// Build the live configuration from validated settings
    ///
    /// # Errors
    /// Returns the validation error from [`EngineSettings::validate`]
    pub fn new(settings: &EngineSettings) -> Result<Self, EngineError> {
        settings.validate()?;

        let mut list = FilterList::default();
        for entry in &settings.filters {
            list.push(entry.clone())?;
        }

        let config = Self {
            enabled: AtomicBool::new(settings.enabled),
            hooks: Default::default(),
            filter_mode: AtomicU8::new(mode_code(settings.filter_mode)),
            filters: RwLock::new(Arc::new(list)),
            generation: AtomicU64::new(0),
            signal_policy: settings.signal_policy,
        };
        for hook in HookKind::ALL {
            config.set_hook_enabled(hook, settings.hook_enabled(hook));
        }
        Ok(config)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn hook_enabled(&self, hook: HookKind) -> bool {
        self.hooks[hook.index()].enabled.load(Ordering::Relaxed)
    }

    pub fn set_hook_enabled(&self, hook: HookKind, enabled: bool) {
        self.hooks[hook.index()].enabled.store(enabled, Ordering::Relaxed);
    }

    /// Global and per-hook switches are both on
    #[must_use]
    pub fn observing(&self, hook: HookKind) -> bool {
        self.is_enabled() && self.hook_enabled(hook)
    }

    pub fn record_event(&self, hook: HookKind) {
        self.hooks[hook.index()].count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self, hook: HookKind) -> u64 {
        self.hooks[hook.index()].count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_count(&self) -> u64 {
        HookKind::ALL.iter().map(|hook| self.count(*hook)).sum()
    }

    pub fn reset_counters(&self) {
        for hook in &self.hooks {
            hook.count.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn signal_policy(&self) -> &SignalArgPolicy {
        &self.signal_policy
    }

    #[must_use]
    pub fn filter_mode(&self) -> FilterMode {
        if self.filter_mode.load(Ordering::Relaxed) == mode_code(FilterMode::Blacklist) {
            FilterMode::Blacklist
        } else {
            FilterMode::Whitelist
        }
    }

    pub fn set_filter_mode(&self, mode: FilterMode) {
        self.filter_mode.store(mode_code(mode), Ordering::Relaxed);
    }

    /// Current filter snapshot, for observers
    ///
    /// Never blocks: returns `None` if the control path holds the lock for
    /// longer than [`FILTER_SNAPSHOT_SPINS`] attempts.
    #[must_use]
    pub fn try_filters(&self) -> Option<Arc<FilterList>> {
        for _ in 0..FILTER_SNAPSHOT_SPINS {
            if let Ok(guard) = self.filters.try_read() {
                return Some(Arc::clone(&guard));
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Current filter snapshot, for the control path
    #[must_use]
    pub fn filters(&self) -> Arc<FilterList> {
        Arc::clone(&self.filters.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Bumped each time a new filter list is published
    #[must_use]
    pub fn filter_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Append a filter, returning its index
    ///
    /// # Errors
    /// `ResourceExhausted` when the list is full; the published list is unchanged
    pub fn add_filter(&self, entry: FilterEntry) -> Result<usize, EngineError> {
        let mut published = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = FilterList::clone(&published);
        let index = next.push(entry)?;
        *published = Arc::new(next);
        self.generation.fetch_add(1, Ordering::Release);
        Ok(index)
    }

    pub fn clear_filters(&self) {
        let mut published = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        *published = Arc::new(FilterList::default());
        self.generation.fetch_add(1, Ordering::Release);
        info!("All filters cleared");
    }
}

const fn mode_code(mode: FilterMode) -> u8 {
    match mode {
        FilterMode::Whitelist => 0,
        FilterMode::Blacklist => 1,
    }
}
