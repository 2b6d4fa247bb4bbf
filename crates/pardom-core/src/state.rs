//! Backup-thread and spawn-handshake state types

use core::fmt;

/// Message word steering a domain's backup thread
///
/// Every transition has a single writer:
///
/// ```text
///  Init ──install──► EnteringManaged ──mutator-leaves-managed──► InBlockingSection
///                      ▲                                              │
///                      └──────────mutator-re-enters-managed───────────┘
///  (any) ──domain_terminate──► Terminate ──backup-exits──► Init
/// ```
///
/// The mutator writes `EnteringManaged` when about to re-enter managed code
/// and `InBlockingSection` when about to leave it; `Terminate` is written at
/// domain teardown; the backup thread itself writes `Init` on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackupMsg {
    /// Mutator is in a blocking section; backup services STW interrupts
    InBlockingSection = 0,

    /// Mutator runs (or is about to run) managed code; backup sleeps
    EnteringManaged = 1,

    /// Domain is terminating; backup must exit
    Terminate = 2,

    /// No backup thread active on this slot
    Init = 3,
}

impl BackupMsg {
    /// Check whether the backup thread owns interrupt servicing
    #[inline]
    pub const fn backup_services_interrupts(&self) -> bool {
        matches!(self, BackupMsg::InBlockingSection)
    }
}

impl From<u8> for BackupMsg {
    fn from(v: u8) -> Self {
        match v {
            0 => BackupMsg::InBlockingSection,
            1 => BackupMsg::EnteringManaged,
            2 => BackupMsg::Terminate,
            _ => BackupMsg::Init,
        }
    }
}

impl From<BackupMsg> for u8 {
    fn from(msg: BackupMsg) -> u8 {
        msg as u8
    }
}

impl fmt::Display for BackupMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMsg::InBlockingSection => write!(f, "in-blocking-section"),
            BackupMsg::EnteringManaged => write!(f, "entering-managed"),
            BackupMsg::Terminate => write!(f, "terminate"),
            BackupMsg::Init => write!(f, "init"),
        }
    }
}

/// Spawn handshake status, shared between parent and child threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DomainStatus {
    /// Child thread has not finished domain creation yet
    Starting = 0,

    /// Child claimed a slot and is running
    Started = 1,

    /// Domain creation failed; the slot was released
    Failed = 2,
}

impl From<u8> for DomainStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => DomainStatus::Started,
            2 => DomainStatus::Failed,
            _ => DomainStatus::Starting,
        }
    }
}

impl From<DomainStatus> for u8 {
    fn from(s: DomainStatus) -> u8 {
        s as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_msg_roundtrip() {
        for msg in [
            BackupMsg::InBlockingSection,
            BackupMsg::EnteringManaged,
            BackupMsg::Terminate,
            BackupMsg::Init,
        ] {
            assert_eq!(BackupMsg::from(u8::from(msg)), msg);
        }
    }

    #[test]
    fn test_backup_servicing() {
        assert!(BackupMsg::InBlockingSection.backup_services_interrupts());
        assert!(!BackupMsg::EnteringManaged.backup_services_interrupts());
        assert!(!BackupMsg::Init.backup_services_interrupts());
    }

    #[test]
    fn test_domain_status_roundtrip() {
        for s in [
            DomainStatus::Starting,
            DomainStatus::Started,
            DomainStatus::Failed,
        ] {
            assert_eq!(DomainStatus::from(u8::from(s)), s);
        }
    }
}
