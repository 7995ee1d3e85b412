//! Process lookup from `/proc`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::domain::Pid;
use crate::host::{ProcessIdentity, ProcessRef, ProcessTable};

/// Index of `starttime` among the fields following `(comm)` in `/proc/<pid>/stat`
const STAT_STARTTIME_FIELD: usize = 19;

/// Reader for a `/proc` tree
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::at("/proc")
    }
}

impl ProcFs {
    /// Use `root` instead of `/proc`
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn pid_path(&self, pid: Pid, file: &str) -> PathBuf {
        self.root.join(pid.0.to_string()).join(file)
    }

    /// Start time of `pid`, used to tell incarnations of a reused pid apart
    #[must_use]
    pub fn start_time(&self, pid: Pid) -> Option<u64> {
        let stat = fs::read_to_string(self.pid_path(pid, "stat")).ok()?;
        parse_start_time(&stat)
    }

    /// First command line argument; empty for kernel threads
    #[must_use]
    pub fn cmdline(&self, pid: Pid) -> Option<String> {
        let raw = fs::read(self.pid_path(pid, "cmdline")).ok()?;
        let first = raw.split(|b| *b == 0).next().unwrap_or_default();
        Some(String::from_utf8_lossy(first).into_owned())
    }

    #[must_use]
    pub fn comm(&self, pid: Pid) -> Option<String> {
        let stat = fs::read_to_string(self.pid_path(pid, "stat")).ok()?;
        extract_comm(&stat).ok()
    }

    /// Whether `pid` has a user address space
    #[must_use]
    pub fn has_address_space(&self, pid: Pid) -> bool {
        fs::read_link(self.pid_path(pid, "exe")).is_ok()
    }

    /// Kernel release, from `sys/kernel/osrelease`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn os_release(&self) -> Result<String> {
        let path = self.root.join("sys/kernel/osrelease");
        let release =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(release.trim().to_string())
    }
}

impl ProcessTable for ProcFs {
    fn find(&self, pid: Pid) -> Option<ProcessRef> {
        if pid.0 <= 0 {
            return None;
        }
        let token = self.start_time(pid)?;
        Some(ProcessRef { pid, token })
    }

    fn identity(&self, process: ProcessRef) -> ProcessIdentity {
        ProcessIdentity {
            pid: process.pid,
            cmdline: self.cmdline(process.pid),
            comm: self.comm(process.pid),
        }
    }
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

fn parse_start_time(stat_line: &str) -> Option<u64> {
    let close = stat_line.rfind(')')?;
    stat_line[close + 1..].split_whitespace().nth(STAT_STARTTIME_FIELD)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my app) S 1 1234 1234 0 -1 4194304 100 0 0 0 5 3 0 0 20 0 4 0 98765 1000 50";

    #[test]
    fn test_extract_comm() {
        assert_eq!(extract_comm(STAT).unwrap(), "my app");
        // Command names can contain parentheses
        assert_eq!(extract_comm("1 (app (v2)) S 0").unwrap(), "app (v2)");
        assert!(extract_comm("garbage").is_err());
    }

    #[test]
    fn test_parse_start_time() {
        assert_eq!(parse_start_time(STAT), Some(98765));
        assert_eq!(parse_start_time("1 (short) S 0"), None);
    }

    #[test]
    fn test_proc_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("77");
        fs::create_dir(&pid_dir).unwrap();
        fs::write(pid_dir.join("stat"), STAT).unwrap();
        fs::write(pid_dir.join("cmdline"), b"com.example.app\0--flag\0").unwrap();

        let procfs = ProcFs::at(dir.path());
        let process = procfs.find(Pid(77)).unwrap();
        assert_eq!(process.token, 98765);

        let identity = procfs.identity(process);
        assert_eq!(identity.display_name(), "com.example.app");
        assert_eq!(identity.comm.as_deref(), Some("my app"));

        assert!(procfs.find(Pid(78)).is_none());
        assert!(procfs.find(Pid(0)).is_none());
        assert!(!procfs.has_address_space(Pid(77)));
    }

    #[test]
    fn test_kernel_thread_falls_back_to_comm() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("2");
        fs::create_dir(&pid_dir).unwrap();
        fs::write(pid_dir.join("stat"), "2 (kthreadd) S 0 0 0 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 3 0 0").unwrap();
        fs::write(pid_dir.join("cmdline"), b"").unwrap();

        let procfs = ProcFs::at(dir.path());
        let identity = procfs.identity(procfs.find(Pid(2)).unwrap());
        assert_eq!(identity.display_name(), "kthreadd");
    }
}
