//! The error taxonomy of spec.md §7, shared so every component reports
//! failures the same `CommandProcessor`/supervisor can reason about.

use std::fmt;

/// Kind of error, independent of which component raised it.
///
/// Recoverable kinds are logged and do not advance their cursor (queue head
/// or replay marker). Unrecoverable kinds cause the resource process to
/// exit with the matching code (spec.md §6) so a supervisor can restart it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    AuthFailure,
    ProtocolError,
    InvalidCommand,
    PreprocessorReject,
    StorageCorruption,
    StorageFull,
    Conflict,
}

impl ErrorKind {
    /// Whether this error kind is recoverable (retry/log) vs fatal (process exit).
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::StorageCorruption | ErrorKind::StorageFull)
    }

    /// Process exit code for fatal kinds, per spec.md §6. Non-fatal kinds
    /// never cause a process exit, so they have no code of their own.
    #[must_use]
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ErrorKind::StorageCorruption => Some(3),
            ErrorKind::StorageFull => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::AuthFailure => "auth-failure",
            ErrorKind::ProtocolError => "protocol-error",
            ErrorKind::InvalidCommand => "invalid-command",
            ErrorKind::PreprocessorReject => "preprocessor-reject",
            ErrorKind::StorageCorruption => "storage-corruption",
            ErrorKind::StorageFull => "storage-full",
            ErrorKind::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// Process exit codes defined in spec.md §6.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const UNRECOVERABLE_INTERNAL: i32 = 1;
    pub const CONFIGURATION: i32 = 2;
    pub const STORAGE_CORRUPTION: i32 = 3;
    pub const DISK_FULL: i32 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_kinds_are_fatal() {
        assert!(ErrorKind::StorageCorruption.is_fatal());
        assert!(ErrorKind::StorageFull.is_fatal());
        assert!(!ErrorKind::TransientNetwork.is_fatal());
        assert!(!ErrorKind::Conflict.is_fatal());
    }

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(
            ErrorKind::StorageCorruption.exit_code(),
            Some(exit_code::STORAGE_CORRUPTION)
        );
        assert_eq!(ErrorKind::StorageFull.exit_code(), Some(exit_code::DISK_FULL));
        assert_eq!(ErrorKind::AuthFailure.exit_code(), None);
    }
}
