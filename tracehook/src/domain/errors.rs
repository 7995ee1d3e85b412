//! Structured error types for tracehook
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Control-path failures carry a message for the operator and map onto the
//! negative errno the control channel reports.

use super::types::Pid;
use std::fmt;
use thiserror::Error;

/// Raw negative error code returned by a host facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostError(pub i32);

impl HostError {
    pub const FAULT: HostError = HostError(-libc::EFAULT);
    pub const BUSY: HostError = HostError(-libc::EBUSY);
    pub const NO_SPACE: HostError = HostError(-libc::ENOSPC);
    pub const NOT_SUPPORTED: HostError = HostError(-libc::EOPNOTSUPP);

    /// Wrap an errno of either sign as the negative form
    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        if errno > 0 {
            HostError(-errno)
        } else {
            HostError(errno)
        }
    }

    /// Capture `errno` after a failed libc call
    #[must_use]
    pub fn last_os_error() -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self::from_errno(errno)
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = std::io::Error::from_raw_os_error(self.0.wrapping_neg());
        write!(f, "host error {} ({os})", self.0)
    }
}

impl std::error::Error for HostError {}

/// Result of a host facility call
pub type HostResult<T> = Result<T, HostError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0} is not available on this host")]
    Unsupported(&'static str),

    #[error("{0}")]
    Fault(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

impl EngineError {
    /// Negative errno reported to the control channel
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            EngineError::InvalidArgument(_) => -libc::EINVAL,
            EngineError::NotFound(_) => -libc::ENOENT,
            EngineError::ProcessNotFound(_) => -libc::ESRCH,
            EngineError::ResourceExhausted(_) => -libc::ENOMEM,
            EngineError::Unsupported(_) => -libc::ENOSYS,
            EngineError::Fault(_) => -libc::EFAULT,
            EngineError::Host(host) => host.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(EngineError::InvalidArgument("x".into()).errno(), -libc::EINVAL);
        assert_eq!(EngineError::NotFound("x".into()).errno(), -libc::ENOENT);
        assert_eq!(EngineError::ProcessNotFound(Pid(9)).errno(), -libc::ESRCH);
        assert_eq!(EngineError::ResourceExhausted("x".into()).errno(), -libc::ENOMEM);
        assert_eq!(EngineError::Unsupported("trap registration").errno(), -libc::ENOSYS);
        assert_eq!(EngineError::Fault("x".into()).errno(), -libc::EFAULT);
        assert_eq!(EngineError::Host(HostError(-16)).errno(), -16);
    }

    #[test]
    fn test_host_error_sign() {
        assert_eq!(HostError::from_errno(libc::EPERM), HostError(-libc::EPERM));
        assert_eq!(HostError::from_errno(-libc::EPERM), HostError(-libc::EPERM));
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::Unsupported("process-scoped trap registration");
        assert_eq!(err.to_string(), "process-scoped trap registration is not available on this host");
        let err = EngineError::ResourceExhausted("Maximum filters reached".into());
        assert_eq!(err.to_string(), "Maximum filters reached");
        assert_eq!(EngineError::ProcessNotFound(Pid(42)).to_string(), "Process PID:42 not found");
    }
}
