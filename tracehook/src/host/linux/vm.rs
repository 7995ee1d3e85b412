//! Cross-process reads with `process_vm_readv`

#![allow(unsafe_code)] // process_vm_readv requires unsafe

use log::debug;

use super::procfs::ProcFs;
use crate::domain::{HostError, HostResult, Pid};
use crate::host::{AddressSpaceRef, ProcessMemory, ProcessRef, UserCopy};

/// Read into `buf` from `addr` in `pid`; the count may be short
///
/// # Errors
/// The negated `errno` of a failed call
pub fn read_remote(pid: Pid, addr: u64, buf: &mut [u8]) -> HostResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let local = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };
    let remote = libc::iovec { iov_base: addr as *mut libc::c_void, iov_len: buf.len() };

    // SAFETY: `local` describes `buf`, which is valid for writes of its length for the
    // duration of the call. The remote iovec is only interpreted by the kernel.
    let n = unsafe { libc::process_vm_readv(pid.0, &local, 1, &remote, 1, 0) };
    if n < 0 {
        return Err(HostError::last_os_error());
    }
    Ok(usize::try_from(n).unwrap_or(0))
}

/// `process_vm_readv`-backed memory access
#[derive(Debug, Clone, Default)]
pub struct ProcessVm {
    procfs: ProcFs,
}

impl ProcessVm {
    #[must_use]
    pub fn new(procfs: ProcFs) -> Self {
        Self { procfs }
    }

    /// The pid still names the incarnation `process` was resolved to
    fn is_current(&self, process: ProcessRef) -> bool {
        self.procfs.start_time(process.pid) == Some(process.token)
    }
}

impl ProcessMemory for ProcessVm {
    fn pin(&self, process: ProcessRef) -> Option<AddressSpaceRef> {
        if !self.is_current(process) || !self.procfs.has_address_space(process.pid) {
            return None;
        }
        Some(AddressSpaceRef(process.token))
    }

    fn unpin(&self, space: AddressSpaceRef) {
        debug!("Released address space reference {}", space.0);
    }

    fn access(
        &self,
        process: ProcessRef,
        space: &AddressSpaceRef,
        addr: u64,
        buf: &mut [u8],
    ) -> HostResult<usize> {
        if space.0 != process.token {
            return Err(HostError::from_errno(libc::ESRCH));
        }
        read_remote(process.pid, addr, buf)
    }
}

impl UserCopy for ProcessVm {
    fn copy_from_user(&self, process: ProcessRef, addr: u64, buf: &mut [u8]) -> HostResult<()> {
        match read_remote(process.pid, addr, buf)? {
            n if n == buf.len() => Ok(()),
            _ => Err(HostError::FAULT),
        }
    }

    fn copy_string(&self, process: ProcessRef, addr: u64, max_len: usize) -> HostResult<String> {
        let mut buf = vec![0u8; max_len];
        let n = read_remote(process.pid, addr, &mut buf)?;
        if n == 0 {
            return Err(HostError::FAULT);
        }
        let bytes = &buf[..n];
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(n);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}
