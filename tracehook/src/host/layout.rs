//! Kernel structure layouts
//!
//! The raw mapping walker reads task, address-space and mapping records at
//! fixed byte offsets. Offsets differ between host versions, so they live in a
//! [`LayoutDescriptor`] chosen by [`HostVersion`] (or supplied explicitly) and
//! validated once before use. Nothing outside this module touches an offset.

use std::fmt;

use crate::domain::{EngineError, FileId, HostResult, MappingId};

use super::{AddressSpaces, Mapping, MappingView, ProcessRef};

// ============================================================================
// Host version
// ============================================================================

/// Kernel release as `major.minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostVersion {
    pub major: u32,
    pub minor: u32,
}

impl HostVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a release string such as `5.10.168-android12-9-g1a2b` or `6.1.0`
    #[must_use]
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor: String =
            parts.next()?.chars().take_while(char::is_ascii_digit).collect();
        Some(Self { major, minor: minor.parse().ok()? })
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ============================================================================
// Layout descriptor
// ============================================================================

/// Byte offsets of the fields the raw walker reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDescriptor {
    /// `task_struct.mm`
    pub task_mm: u64,
    /// `mm_struct.mmap_lock`
    pub mm_lock: u64,
    /// `vm_area_struct.vm_start`
    pub vma_start: u64,
    /// `vm_area_struct.vm_end`
    pub vma_end: u64,
    /// `vm_area_struct.vm_prev`
    pub vma_prev: u64,
    /// `vm_area_struct.vm_file`
    pub vma_file: u64,
}

/// Versions covered by the built-in table, `[first, last)`
const LAYOUTS: &[(HostVersion, HostVersion, LayoutDescriptor)] = &[(
    HostVersion::new(5, 4),
    HostVersion::new(6, 1),
    LayoutDescriptor {
        task_mm: 0x588,
        mm_lock: 0x68,
        vma_start: 0x00,
        vma_end: 0x08,
        vma_prev: 0x18,
        vma_file: 0xa0,
    },
)];

impl LayoutDescriptor {
    /// Built-in layout for `version`
    ///
    /// # Errors
    /// `Unsupported` when no table entry covers `version`
    pub fn for_version(version: HostVersion) -> Result<Self, EngineError> {
        LAYOUTS
            .iter()
            .find(|(first, last, _)| (*first..*last).contains(&version))
            .map(|(_, _, layout)| *layout)
            .ok_or(EngineError::Unsupported("structure layout for this host version"))
    }

    /// Check that every offset is word aligned and the mapping fields are distinct
    ///
    /// # Errors
    /// `InvalidArgument` naming the first bad field
    pub fn validate(&self) -> Result<(), EngineError> {
        let fields = [
            ("task_mm", self.task_mm),
            ("mm_lock", self.mm_lock),
            ("vma_start", self.vma_start),
            ("vma_end", self.vma_end),
            ("vma_prev", self.vma_prev),
            ("vma_file", self.vma_file),
        ];
        for (name, offset) in fields {
            if offset % 8 != 0 {
                return Err(EngineError::InvalidArgument(format!(
                    "Layout offset {name}=0x{offset:x} is not 8-byte aligned"
                )));
            }
        }
        let vma = [self.vma_start, self.vma_end, self.vma_prev, self.vma_file];
        for (i, a) in vma.iter().enumerate() {
            if vma[i + 1..].contains(a) {
                return Err(EngineError::InvalidArgument(
                    "Layout mapping offsets overlap".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Raw walker
// ============================================================================

/// Host primitives over raw kernel memory
pub trait KernelMemory: Send + Sync {
    /// Task record address of `process`
    fn task_of(&self, process: ProcessRef) -> Option<u64>;

    fn read_word(&self, addr: u64) -> HostResult<u64>;

    /// Non-blocking read-lock of the lock at `lock`
    fn try_read_lock(&self, lock: u64) -> bool;

    fn read_unlock(&self, lock: u64);

    /// First mapping record ending above `addr` in the address space at `mm`
    fn find_mapping(&self, mm: u64, addr: u64) -> Option<u64>;

    /// Path of the file record at `file`
    fn file_path(&self, file: u64) -> Option<String>;
}

/// Address-space facility reading kernel records through a [`LayoutDescriptor`]
pub struct RawAddressSpace<M> {
    memory: M,
    layout: LayoutDescriptor,
}

impl<M: KernelMemory> RawAddressSpace<M> {
    /// # Errors
    /// `InvalidArgument` when `layout` fails validation
    pub fn new(memory: M, layout: LayoutDescriptor) -> Result<Self, EngineError> {
        layout.validate()?;
        Ok(Self { memory, layout })
    }

    fn address_space(&self, process: ProcessRef) -> Option<u64> {
        let task = self.memory.task_of(process)?;
        let mm = read_field(&self.memory, task, self.layout.task_mm)?;
        (mm != 0).then_some(mm)
    }
}

/// Read the word at `record + offset`; a record address that overflows is a fault
fn read_field<M: KernelMemory>(memory: &M, record: u64, offset: u64) -> Option<u64> {
    let addr = record.checked_add(offset)?;
    memory.read_word(addr).ok()
}

/// Releases the mapping lock when dropped
struct ReadLock<'a, M: KernelMemory> {
    memory: &'a M,
    lock: u64,
}

impl<M: KernelMemory> Drop for ReadLock<'_, M> {
    fn drop(&mut self) {
        self.memory.read_unlock(self.lock);
    }
}

struct RawView<'a, M> {
    memory: &'a M,
    layout: &'a LayoutDescriptor,
    mm: u64,
}

impl<M: KernelMemory> MappingView for RawView<'_, M> {
    fn find(&self, addr: u64) -> Option<MappingId> {
        self.memory.find_mapping(self.mm, addr).map(MappingId)
    }

    fn mapping(&self, id: MappingId) -> Option<Mapping> {
        let start = read_field(self.memory, id.0, self.layout.vma_start)?;
        let end = read_field(self.memory, id.0, self.layout.vma_end)?;
        let file = read_field(self.memory, id.0, self.layout.vma_file)?;
        Some(Mapping { start, end, file: (file != 0).then_some(FileId(file)) })
    }

    fn prev(&self, id: MappingId) -> Option<MappingId> {
        let prev = read_field(self.memory, id.0, self.layout.vma_prev)?;
        (prev != 0).then_some(MappingId(prev))
    }

    fn file_path(&self, file: FileId) -> Option<String> {
        self.memory.file_path(file.0)
    }
}

impl<M: KernelMemory> AddressSpaces for RawAddressSpace<M> {
    fn try_with_mappings(
        &self,
        process: ProcessRef,
        visit: &mut dyn FnMut(&dyn MappingView),
    ) -> bool {
        let Some(mm) = self.address_space(process) else {
            return false;
        };
        let Some(lock) = mm.checked_add(self.layout.mm_lock) else {
            return false;
        };
        if !self.memory.try_read_lock(lock) {
            return false;
        }
        let _guard = ReadLock { memory: &self.memory, lock };
        visit(&RawView { memory: &self.memory, layout: &self.layout, mm });
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::domain::{HostError, Pid};
    use crate::engine::module_resolver::ModuleResolver;
    use std::sync::Arc;

    const TASK: u64 = 0x10_0000;
    const MM: u64 = 0x20_0000;
    const LIB: u64 = 0x30_0000;
    const HOSTILE_TASK: u64 = u64::MAX - 0x10;

    #[derive(Default)]
    struct FakeKernel {
        words: HashMap<u64, u64>,
        /// (record, start, end), sorted by start
        mappings: Vec<(u64, u64, u64)>,
        files: HashMap<u64, String>,
        contended: AtomicBool,
        held: AtomicUsize,
    }

    impl FakeKernel {
        fn add_mapping(&mut self, layout: &LayoutDescriptor, record: u64, start: u64, end: u64, file: u64) {
            let prev = self.mappings.last().map_or(0, |m| m.0);
            self.words.insert(record + layout.vma_start, start);
            self.words.insert(record + layout.vma_end, end);
            self.words.insert(record + layout.vma_prev, prev);
            self.words.insert(record + layout.vma_file, file);
            self.mappings.push((record, start, end));
        }
    }

    impl KernelMemory for Arc<FakeKernel> {
        fn task_of(&self, process: ProcessRef) -> Option<u64> {
            match process.pid {
                Pid(42) => Some(TASK),
                Pid(44) => Some(HOSTILE_TASK),
                _ => None,
            }
        }

        fn read_word(&self, addr: u64) -> HostResult<u64> {
            self.words.get(&addr).copied().ok_or(HostError::FAULT)
        }

        fn try_read_lock(&self, lock: u64) -> bool {
            assert_eq!(lock, MM + 0x68);
            if self.contended.load(Ordering::Relaxed) {
                return false;
            }
            self.held.fetch_add(1, Ordering::Relaxed);
            true
        }

        fn read_unlock(&self, _lock: u64) {
            self.held.fetch_sub(1, Ordering::Relaxed);
        }

        fn find_mapping(&self, _mm: u64, addr: u64) -> Option<u64> {
            self.mappings.iter().find(|m| m.2 > addr).map(|m| m.0)
        }

        fn file_path(&self, file: u64) -> Option<String> {
            self.files.get(&file).cloned()
        }
    }

    fn kernel() -> Arc<FakeKernel> {
        let layout = LayoutDescriptor::for_version(HostVersion::new(5, 10)).unwrap();
        let mut kernel = FakeKernel::default();
        kernel.words.insert(TASK + layout.task_mm, MM);
        kernel.files.insert(LIB, "/system/lib64/libc.so".to_string());
        kernel.add_mapping(&layout, 0xa000, 0x7000_0000, 0x7000_1000, LIB);
        kernel.add_mapping(&layout, 0xa100, 0x7000_1000, 0x7000_4000, LIB);
        kernel.add_mapping(&layout, 0xa200, 0x7100_0000, 0x7100_2000, 0);
        Arc::new(kernel)
    }

    fn process(pid: i32) -> ProcessRef {
        ProcessRef { pid: Pid(pid), token: 0 }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(HostVersion::parse("5.10.168-android12-9-g1a2b"), Some(HostVersion::new(5, 10)));
        assert_eq!(HostVersion::parse("6.1"), Some(HostVersion::new(6, 1)));
        assert_eq!(HostVersion::parse("6"), None);
        assert_eq!(HostVersion::parse("x.y"), None);
    }

    #[test]
    fn test_layout_table() {
        assert!(LayoutDescriptor::for_version(HostVersion::new(5, 4)).is_ok());
        assert!(LayoutDescriptor::for_version(HostVersion::new(6, 0)).is_ok());
        assert!(matches!(
            LayoutDescriptor::for_version(HostVersion::new(6, 1)),
            Err(EngineError::Unsupported(_))
        ));
        assert!(LayoutDescriptor::for_version(HostVersion::new(4, 19)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_offsets() {
        let good = LayoutDescriptor::for_version(HostVersion::new(5, 15)).unwrap();
        assert!(good.validate().is_ok());
        assert!(LayoutDescriptor { vma_file: 0xa4, ..good }.validate().is_err());
        assert!(LayoutDescriptor { vma_prev: good.vma_end, ..good }.validate().is_err());
    }

    #[test]
    fn test_raw_walk_labels_modules() {
        let kernel = kernel();
        let layout = LayoutDescriptor::for_version(HostVersion::new(5, 10)).unwrap();
        let spaces = Arc::new(RawAddressSpace::new(Arc::clone(&kernel), layout).unwrap());
        let resolver = ModuleResolver::new(Some(spaces));

        assert_eq!(resolver.resolve(process(42), 0x7000_2010), "libc.so + 0x2010");
        assert_eq!(resolver.resolve(process(42), 0x7100_0040), "[anon] + 0x40");
        assert_eq!(resolver.resolve(process(43), 0x7000_2010), "");
        assert_eq!(kernel.held.load(Ordering::Relaxed), 0);

        kernel.contended.store(true, Ordering::Relaxed);
        assert_eq!(resolver.resolve(process(42), 0x7000_2010), "");
    }

    #[test]
    fn test_overflowing_record_addresses_fault() {
        let kernel = kernel();
        let layout = LayoutDescriptor::for_version(HostVersion::new(5, 10)).unwrap();
        let spaces = Arc::new(RawAddressSpace::new(Arc::clone(&kernel), layout).unwrap());
        let resolver = ModuleResolver::new(Some(spaces));

        // task + task_mm overflows
        assert_eq!(resolver.resolve(process(44), 0x7000_2010), "");
        assert_eq!(read_field(&kernel, u64::MAX, layout.vma_end), None);
        assert_eq!(kernel.held.load(Ordering::Relaxed), 0);
    }
}
