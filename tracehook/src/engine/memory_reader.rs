//! Remote memory reader
//!
//! Reads bytes from another process's address space on behalf of the control
//! channel. The address space is pinned for the duration of the read and
//! released on every path.

use std::fmt::Write as _;

use log::{info, warn};

use crate::domain::{EngineError, Pid};
use crate::host::{AddressSpaceRef, HostCapabilities, ProcessMemory};

/// Largest raw read
pub const MAX_RAW_READ: usize = 4096;

/// Largest read formatted as hex
pub const MAX_HEX_READ: usize = 256;

/// Text capacity needed to format `bytes` hex pairs, terminator included
#[must_use]
pub const fn hex_capacity(bytes: usize) -> usize {
    bytes * 3 + 1
}

/// Releases a pinned address space when dropped
struct PinnedSpace<'a> {
    memory: &'a dyn ProcessMemory,
    space: Option<AddressSpaceRef>,
}

impl PinnedSpace<'_> {
    fn get(&self) -> Option<&AddressSpaceRef> {
        self.space.as_ref()
    }
}

impl Drop for PinnedSpace<'_> {
    fn drop(&mut self) {
        if let Some(space) = self.space.take() {
            self.memory.unpin(space);
        }
    }
}

pub struct RemoteMemoryReader {
    host: HostCapabilities,
}

impl RemoteMemoryReader {
    #[must_use]
    pub fn new(host: HostCapabilities) -> Self {
        Self { host }
    }

    /// Read up to `buf.len()` bytes at `addr` in process `pid`
    ///
    /// Returns the number of bytes read, which may be short.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty or oversized buffer, or a process without an address space
    /// - `Unsupported` when cross-process access is missing
    /// - `ProcessNotFound` when `pid` does not exist
    /// - `Fault` when nothing was readable
    /// - `Host` with the host's code when the read itself failed
    pub fn read(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize, EngineError> {
        if buf.is_empty() || buf.len() > MAX_RAW_READ {
            return Err(EngineError::InvalidArgument(format!(
                "Invalid read size: {} (1-{MAX_RAW_READ})",
                buf.len()
            )));
        }

        let memory = self.host.process_memory()?;
        let process =
            self.host.processes()?.find(pid).ok_or(EngineError::ProcessNotFound(pid))?;

        let pinned = PinnedSpace { memory, space: memory.pin(process) };
        let Some(space) = pinned.get() else {
            return Err(EngineError::InvalidArgument(format!("{pid} has no address space")));
        };

        match memory.access(process, space, addr, buf) {
            Err(err) => {
                warn!("Failed to read memory from {pid} at 0x{addr:x}: {}", err.code());
                Err(err.into())
            }
            Ok(0) => {
                warn!("Read 0 bytes from {pid} at 0x{addr:x} (invalid address?)");
                Err(EngineError::Fault(format!("No readable memory at 0x{addr:x}")))
            }
            Ok(n) => {
                info!("Read {n} bytes from {pid} at 0x{addr:x}");
                Ok(n.min(buf.len()))
            }
        }
    }

    /// Read `read_size` bytes and format them as space-separated lowercase hex
    ///
    /// The text is limited to `out_capacity - 1` characters; pairs that do not
    /// fit are dropped. Returns the byte count read and the text.
    ///
    /// # Errors
    /// As [`read`](Self::read), plus `InvalidArgument` when `out_capacity` is
    /// zero or `read_size` is outside `1..=MAX_HEX_READ`
    pub fn read_hex(
        &self,
        pid: Pid,
        addr: u64,
        out_capacity: usize,
        read_size: usize,
    ) -> Result<(usize, String), EngineError> {
        if out_capacity == 0 {
            return Err(EngineError::InvalidArgument("Output buffer is empty".to_string()));
        }
        if read_size == 0 || read_size > MAX_HEX_READ {
            return Err(EngineError::InvalidArgument(format!(
                "Invalid size: {read_size} (1-{MAX_HEX_READ})"
            )));
        }

        let mut buf = [0u8; MAX_HEX_READ];
        let n = self.read(pid, addr, &mut buf[..read_size])?;
        Ok((n, format_hex(&buf[..n], out_capacity)))
    }
}

/// `"de ad be ef"`, bounded by `out_capacity` including a terminator
#[must_use]
pub fn format_hex(bytes: &[u8], out_capacity: usize) -> String {
    let mut out = String::with_capacity(out_capacity.min(hex_capacity(bytes.len())));
    for byte in bytes {
        if out.len() + 3 >= out_capacity {
            break;
        }
        let _ = write!(out, "{byte:02x} ");
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimulatedHost;
    use crate::host::HostError;

    fn reader(host: &std::sync::Arc<SimulatedHost>) -> RemoteMemoryReader {
        RemoteMemoryReader::new(host.capabilities())
    }

    #[test]
    fn test_read_bytes() {
        let host = SimulatedHost::new();
        host.add_process(50, "app", "app");
        host.write_memory(50, 0x1000, &[0xde, 0xad, 0xbe, 0xef]);

        let mut buf = [0u8; 4];
        assert_eq!(reader(&host).read(Pid(50), 0x1000, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(host.pinned_spaces(), 0);
    }

    #[test]
    fn test_short_read() {
        let host = SimulatedHost::new();
        host.add_process(50, "app", "app");
        host.write_memory(50, 0x1000, &[1, 2]);

        let mut buf = [0u8; 16];
        assert_eq!(reader(&host).read(Pid(50), 0x1000, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_size_bounds() {
        let host = SimulatedHost::new();
        host.add_process(50, "app", "app");
        let reader = reader(&host);

        let mut empty = [0u8; 0];
        assert!(matches!(reader.read(Pid(50), 0x1000, &mut empty), Err(EngineError::InvalidArgument(_))));
        let mut huge = vec![0u8; MAX_RAW_READ + 1];
        assert!(matches!(reader.read(Pid(50), 0x1000, &mut huge), Err(EngineError::InvalidArgument(_))));

        assert!(matches!(reader.read_hex(Pid(50), 0x1000, 64, 0), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(
            reader.read_hex(Pid(50), 0x1000, 2048, MAX_HEX_READ + 1),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(reader.read_hex(Pid(50), 0x1000, 0, 4), Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_errors_release_pin() {
        let host = SimulatedHost::new();
        host.add_process(50, "app", "app");
        host.add_kernel_thread(2, "kthreadd");
        let reader = reader(&host);
        let mut buf = [0u8; 8];

        assert_eq!(reader.read(Pid(51), 0x1000, &mut buf).unwrap_err(), EngineError::ProcessNotFound(Pid(51)));
        assert!(matches!(reader.read(Pid(2), 0x1000, &mut buf), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(reader.read(Pid(50), 0x1000, &mut buf), Err(EngineError::Fault(_))));

        host.force_access_result(Some(Err(HostError::from_errno(libc::EIO))));
        assert_eq!(reader.read(Pid(50), 0x1000, &mut buf).unwrap_err().errno(), -libc::EIO);

        assert_eq!(host.pinned_spaces(), 0);
    }

    #[test]
    fn test_read_hex_full_capacity() {
        let host = SimulatedHost::new();
        host.add_process(50, "app", "app");
        let bytes: Vec<u8> = (0..=255u8).collect();
        host.write_memory(50, 0x8000, &bytes);

        let (n, text) = reader(&host)
            .read_hex(Pid(50), 0x8000, hex_capacity(MAX_HEX_READ), MAX_HEX_READ)
            .unwrap();
        assert_eq!(n, MAX_HEX_READ);
        assert_eq!(text.split(' ').count(), MAX_HEX_READ);
        assert!(text.starts_with("00 01 02"));
        assert!(text.ends_with("fe ff"));
    }

    #[test]
    fn test_format_hex_truncates_to_capacity() {
        assert_eq!(format_hex(&[0xab, 0xcd, 0xef], 64), "ab cd ef");
        // room for two pairs and the terminator
        assert_eq!(format_hex(&[0xab, 0xcd, 0xef], 7), "ab cd");
        assert_eq!(format_hex(&[0xab], 3), "");
        assert_eq!(format_hex(&[], 16), "");
    }
}
