//! Error types for the pardom runtime

use core::fmt;

/// Result type for runtime operations
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors that can occur in domain operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Every domain slot is occupied
    NoFreeSlot,

    /// The OS refused to create the domain thread
    ThreadSpawnFailed,

    /// The OS refused to create the backup thread
    BackupThreadSpawnFailed,

    /// Per-domain allocation failed during domain creation
    CreationAllocFailed,

    /// The calling thread is not a domain
    NotADomain,

    /// Runtime not initialised
    NotInitialized,

    /// Runtime already initialised
    AlreadyInitialized,

    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// Memory mapping error
    Memory(MemoryError),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::NoFreeSlot => write!(f, "no free domain slot"),
            DomainError::ThreadSpawnFailed => write!(f, "failed to create domain thread"),
            DomainError::BackupThreadSpawnFailed => {
                write!(f, "failed to create domain backup thread")
            }
            DomainError::CreationAllocFailed => {
                write!(f, "allocation failed during domain creation")
            }
            DomainError::NotADomain => write!(f, "calling thread is not a domain"),
            DomainError::NotInitialized => write!(f, "runtime not initialised"),
            DomainError::AlreadyInitialized => write!(f, "runtime already initialised"),
            DomainError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            DomainError::Memory(e) => write!(f, "memory error: {}", e),
        }
    }
}

impl std::error::Error for DomainError {}

/// Memory-mapping errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    ReserveFailed,

    /// mprotect to read/write failed
    CommitFailed,

    /// madvise or mprotect back to no-access failed
    DecommitFailed,

    /// munmap failed
    UnmapFailed,

    /// Requested reservation overflows the address space
    ReservationTooLarge,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::ReserveFailed => write!(f, "virtual memory reservation failed"),
            MemoryError::CommitFailed => write!(f, "memory commit failed"),
            MemoryError::DecommitFailed => write!(f, "memory decommit failed"),
            MemoryError::UnmapFailed => write!(f, "memory unmap failed"),
            MemoryError::ReservationTooLarge => write!(f, "reservation size overflows"),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for DomainError {
    fn from(e: MemoryError) -> Self {
        DomainError::Memory(e)
    }
}

/// Print a message and abort the process.
///
/// For conditions the runtime cannot continue from: losing the initial
/// heap reservation, allocation failure inside an STW callback, loss of
/// the bootstrap domain.
pub fn fatal_error(msg: &str) -> ! {
    eprintln!("pardom fatal error: {}", msg);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = DomainError::NoFreeSlot;
        assert_eq!(format!("{}", e), "no free domain slot");

        let e = DomainError::Memory(MemoryError::ReserveFailed);
        assert_eq!(
            format!("{}", e),
            "memory error: virtual memory reservation failed"
        );
    }

    #[test]
    fn test_error_conversion() {
        let mem_err = MemoryError::CommitFailed;
        let dom_err: DomainError = mem_err.into();
        assert!(matches!(
            dom_err,
            DomainError::Memory(MemoryError::CommitFailed)
        ));
    }
}
