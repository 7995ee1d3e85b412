//! Mapping tables from `/proc/<pid>/maps`
//!
//! Each walk reads one snapshot of the file; there is no lock to contend on,
//! so a walk only fails when the file cannot be read.

use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result};

use super::procfs::ProcFs;
use crate::domain::{FileId, MappingId};
use crate::host::{AddressSpaces, Mapping, MappingView, ProcessRef};

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    pub start: u64,
    pub end: u64,
    /// Backing file; `None` for anonymous and pseudo mappings (`[stack]`, `[anon:..]`)
    pub path: Option<String>,
}

/// Parse the contents of a maps file
///
/// Format: "start-end perms offset dev inode [pathname]"
///
/// # Errors
/// Returns an error naming the first malformed line
pub fn parse_maps(content: &str) -> Result<Vec<MapsEntry>> {
    let mut entries = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let range =
            line.split_whitespace().next().with_context(|| format!("Empty maps line {}", n + 1))?;
        let (start, end) =
            range.split_once('-').with_context(|| format!("Bad range on maps line {}", n + 1))?;
        let start = u64::from_str_radix(start, 16).context("Failed to parse range start")?;
        let end = u64::from_str_radix(end, 16).context("Failed to parse range end")?;

        let path = line_path(line).filter(|p| !p.starts_with('['));
        entries.push(MapsEntry { start, end, path });
    }
    entries.sort_by_key(|e| e.start);
    Ok(entries)
}

/// Pathname column, which may itself contain spaces
fn line_path(line: &str) -> Option<String> {
    let mut rest = line;
    for _ in 0..5 {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        rest = &rest[end..];
    }
    let path = rest.trim();
    (!path.is_empty()).then(|| path.to_string())
}

/// Locked view over a parsed maps snapshot
///
/// Distinct paths are numbered in order of first appearance.
pub struct MapsView<'a> {
    entries: &'a [MapsEntry],
    paths: Vec<&'a str>,
    file_ids: HashMap<&'a str, FileId>,
}

impl<'a> MapsView<'a> {
    #[must_use]
    pub fn new(entries: &'a [MapsEntry]) -> Self {
        let mut paths = Vec::new();
        let mut file_ids = HashMap::new();
        for path in entries.iter().filter_map(|e| e.path.as_deref()) {
            file_ids.entry(path).or_insert_with(|| {
                paths.push(path);
                FileId(paths.len() as u64 - 1)
            });
        }
        Self { entries, paths, file_ids }
    }
}

impl MappingView for MapsView<'_> {
    fn find(&self, addr: u64) -> Option<MappingId> {
        // Entries are sorted and disjoint, so ends ascend too
        let i = self.entries.partition_point(|e| e.end <= addr);
        (i < self.entries.len()).then(|| MappingId(i as u64))
    }

    fn mapping(&self, id: MappingId) -> Option<Mapping> {
        let entry = self.entries.get(usize::try_from(id.0).ok()?)?;
        let file = entry.path.as_deref().and_then(|p| self.file_ids.get(p).copied());
        Some(Mapping { start: entry.start, end: entry.end, file })
    }

    fn prev(&self, id: MappingId) -> Option<MappingId> {
        id.0.checked_sub(1).map(MappingId)
    }

    fn file_path(&self, file: FileId) -> Option<String> {
        self.paths.get(usize::try_from(file.0).ok()?).map(|p| (*p).to_string())
    }
}

/// [`AddressSpaces`] backed by `/proc/<pid>/maps`
#[derive(Debug, Clone, Default)]
pub struct ProcMaps {
    procfs: ProcFs,
}

impl ProcMaps {
    #[must_use]
    pub fn new(procfs: ProcFs) -> Self {
        Self { procfs }
    }

    /// Parsed mappings of `process`
    ///
    /// # Errors
    /// Returns an error if the maps file cannot be read or parsed
    pub fn read(&self, process: ProcessRef) -> Result<Vec<MapsEntry>> {
        let path = self.procfs.pid_path(process.pid, "maps");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_maps(&content)
    }
}

impl AddressSpaces for ProcMaps {
    fn try_with_mappings(
        &self,
        process: ProcessRef,
        visit: &mut dyn FnMut(&dyn MappingView),
    ) -> bool {
        let Ok(entries) = self.read(process) else {
            return false;
        };
        if entries.is_empty() {
            return false;
        }
        visit(&MapsView::new(&entries));
        true
    }
}
