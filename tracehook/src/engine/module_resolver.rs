//! Module attribution for code addresses
//!
//! Turns a user code address into `"<module> + 0x<offset>"`, where the offset
//! is relative to the lowest mapping of the same file found just below the
//! address. Anonymous memory is labelled `"[anon] + 0x<offset>"`.
//!
//! The mapping table is only ever try-locked. On contention, or when no
//! mapping contains the address, the label is empty.

use std::sync::Arc;

use tracehook_common::STACK_SENTINEL;

use crate::domain::MappingId;
use crate::host::{AddressSpaces, Mapping, MappingView, ProcessRef};

/// How many preceding mappings are inspected when looking for a module's base
///
/// Modules split into more mappings than this get an offset relative to a
/// higher mapping than their real base.
pub const MODULE_BASE_MAX_HOPS: usize = 10;

/// Shown in place of a module name whose path cannot be produced
const UNKNOWN_MODULE: &str = "?";

#[derive(Clone, Default)]
pub struct ModuleResolver {
    spaces: Option<Arc<dyn AddressSpaces>>,
}

impl ModuleResolver {
    #[must_use]
    pub fn new(spaces: Option<Arc<dyn AddressSpaces>>) -> Self {
        Self { spaces }
    }

    /// Label `address` in `process`, or return an empty string
    #[must_use]
    pub fn resolve(&self, process: ProcessRef, address: u64) -> String {
        let Some(spaces) = &self.spaces else {
            return String::new();
        };

        let mut label = None;
        let acquired = spaces.try_with_mappings(process, &mut |view| {
            label = describe(view, address);
        });

        if acquired {
            label.unwrap_or_default()
        } else {
            String::new()
        }
    }

    /// Label every address of a trace under a single hold of the mapping table
    ///
    /// The sentinel and unresolvable addresses get empty labels. On contention
    /// every label is empty.
    #[must_use]
    pub fn resolve_all(&self, process: ProcessRef, addresses: &[u64]) -> Vec<String> {
        let mut labels = vec![String::new(); addresses.len()];
        let Some(spaces) = &self.spaces else {
            return labels;
        };

        spaces.try_with_mappings(process, &mut |view| {
            for (label, &address) in labels.iter_mut().zip(addresses) {
                if address != STACK_SENTINEL {
                    *label = describe(view, address).unwrap_or_default();
                }
            }
        });
        labels
    }
}

/// Label `address` using a locked mapping table
#[must_use]
pub fn describe(view: &dyn MappingView, address: u64) -> Option<String> {
    let id = view.find(address)?;
    let mapping = view.mapping(id)?;
    if !mapping.contains(address) {
        return None;
    }

    let Some(file) = mapping.file else {
        return Some(format!("[anon] + 0x{:x}", address - mapping.start));
    };

    let base = module_base(view, id, &mapping);
    let path = view.file_path(file);
    let name = path.as_deref().map_or(UNKNOWN_MODULE, basename);
    Some(format!("{name} + 0x{:x}", address - base))
}

/// Lowest start among the run of same-file mappings ending at `id`
fn module_base(view: &dyn MappingView, id: MappingId, mapping: &Mapping) -> u64 {
    let mut base = mapping.start;
    let mut current = id;

    for _ in 0..MODULE_BASE_MAX_HOPS {
        let Some(prev) = view.prev(current) else {
            break;
        };
        let Some(prev_mapping) = view.mapping(prev) else {
            break;
        };
        if prev_mapping.file != mapping.file {
            break;
        }
        base = base.min(prev_mapping.start);
        current = prev;
    }

    base
}

/// Final path component
#[must_use]
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimulatedHost;

    fn resolver(host: &Arc<SimulatedHost>) -> ModuleResolver {
        ModuleResolver::new(Some(host.clone()))
    }

    #[test]
    fn test_anonymous_mapping_label() {
        let host = SimulatedHost::new();
        let process = host.add_process(10, "app", "app");
        host.map(10, 0x7000_0000, 0x7001_0000, None);

        assert_eq!(resolver(&host).resolve(process, 0x7000_0abc), "[anon] + 0xabc");
    }

    #[test]
    fn test_file_label_uses_lowest_same_file_start() {
        let host = SimulatedHost::new();
        let process = host.add_process(10, "app", "app");
        host.map(10, 0x1000, 0x2000, Some("/system/lib64/libc.so"));
        host.map(10, 0x2000, 0x5000, Some("/system/lib64/libc.so"));
        host.map(10, 0x5000, 0x6000, Some("/system/lib64/libc.so"));

        assert_eq!(resolver(&host).resolve(process, 0x5010), "libc.so + 0x4010");
    }

    #[test]
    fn test_walk_stops_at_other_file() {
        let host = SimulatedHost::new();
        let process = host.add_process(10, "app", "app");
        host.map(10, 0x1000, 0x2000, Some("/apex/libm.so"));
        host.map(10, 0x2000, 0x3000, Some("/apex/libdl.so"));
        host.map(10, 0x3000, 0x4000, Some("/apex/libdl.so"));

        assert_eq!(resolver(&host).resolve(process, 0x3004), "libdl.so + 0x1004");
    }

    #[test]
    fn test_walk_is_bounded() {
        let host = SimulatedHost::new();
        let process = host.add_process(10, "app", "app");
        let pages = MODULE_BASE_MAX_HOPS as u64 + 3;
        for i in 0..pages {
            host.map(10, 0x10_000 + i * 0x1000, 0x11_000 + i * 0x1000, Some("/data/app/big.so"));
        }
        let last = 0x10_000 + (pages - 1) * 0x1000;
        let reachable_base = last - MODULE_BASE_MAX_HOPS as u64 * 0x1000;

        let label = resolver(&host).resolve(process, last + 8);
        assert_eq!(label, format!("big.so + 0x{:x}", last + 8 - reachable_base));
    }

    #[test]
    fn test_unmapped_address_and_contention_are_empty() {
        let host = SimulatedHost::new();
        let process = host.add_process(10, "app", "app");
        host.map(10, 0x4000, 0x5000, None);

        // below the only mapping: found, but not containing
        assert_eq!(resolver(&host).resolve(process, 0x1000), "");
        assert_eq!(resolver(&host).resolve(process, 0x9000), "");

        host.set_mapping_contention(true);
        assert_eq!(resolver(&host).resolve(process, 0x4000), "");
        assert_eq!(host.mapping_locks_held(), 0);
    }

    #[test]
    fn test_path_failure_uses_placeholder() {
        let host = SimulatedHost::new();
        let process = host.add_process(10, "app", "app");
        host.map(10, 0x4000, 0x5000, Some("/system/bin/app"));
        host.set_file_paths_unavailable(true);

        assert_eq!(resolver(&host).resolve(process, 0x4100), "? + 0x100");
    }

    /// Counts how often the mapping table is taken
    struct CountingSpaces {
        inner: Arc<SimulatedHost>,
        acquired: std::sync::atomic::AtomicUsize,
    }

    impl AddressSpaces for CountingSpaces {
        fn try_with_mappings(
            &self,
            process: ProcessRef,
            visit: &mut dyn FnMut(&dyn MappingView),
        ) -> bool {
            self.acquired.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.inner.try_with_mappings(process, visit)
        }
    }

    #[test]
    fn test_resolve_all_takes_mappings_once() {
        let host = SimulatedHost::new();
        let process = host.add_process(10, "app", "app");
        host.map(10, 0x1000, 0x2000, Some("/system/lib64/libc.so"));
        host.map(10, 0x2000, 0x3000, Some("/system/lib64/libc.so"));
        host.map(10, 0x8000, 0x9000, None);
        let spaces = Arc::new(CountingSpaces { inner: host.clone(), acquired: Default::default() });
        let resolver = ModuleResolver::new(Some(spaces.clone()));

        let labels = resolver.resolve_all(process, &[0x2010, 0x8004, 0x5000, STACK_SENTINEL]);
        assert_eq!(labels, ["libc.so + 0x1010", "[anon] + 0x4", "", ""]);
        assert_eq!(spaces.acquired.load(std::sync::atomic::Ordering::Relaxed), 1);

        host.set_mapping_contention(true);
        assert_eq!(resolver.resolve_all(process, &[0x2010]), [""]);
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/system/lib64/libc.so"), "libc.so");
        assert_eq!(basename("libc.so"), "libc.so");
        assert_eq!(basename("/"), "");
    }
}
