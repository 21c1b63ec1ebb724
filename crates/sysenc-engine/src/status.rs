//! Status mailbox shared between the orchestrator and its worker thread.

use std::sync::{Arc, Mutex, MutexGuard};

use sysenc_core::SysencError;

use crate::state::{HiddenOsCreationPhase, SetupStatus, TransformDirection};

/// Progress callback: (bytes done, bytes total, phase label). Runs on the
/// worker thread.
pub type ProgressFn = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Terminal worker error plus the last offset known to be on disk.
#[derive(Debug, thiserror::Error)]
#[error("{error} (last confirmed offset {confirmed_offset})")]
pub struct TransformFailure {
    #[source]
    pub error: SysencError,
    pub confirmed_offset: u64,
}

impl TransformFailure {
    pub fn is_interruption(&self) -> bool {
        self.error.is_interruption()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupResult {
    /// Worker still running (or never started)
    InProgress,
    Completed,
    Aborted,
}

/// Snapshot of an operation, cheap to copy out of the mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionStatus {
    pub status: SetupStatus,
    pub direction: Option<TransformDirection>,
    pub setup_in_progress: bool,
    pub encrypted_area_start: u64,
    pub encrypted_area_end: u64,
    /// End of the encrypted prefix
    pub current_offset: u64,
    pub hidden_os_phase: HiddenOsCreationPhase,
    pub last_error: Option<String>,
}

impl EncryptionStatus {
    pub fn encrypted_bytes(&self) -> u64 {
        self.current_offset.saturating_sub(self.encrypted_area_start)
    }

    pub fn total_bytes(&self) -> u64 {
        self.encrypted_area_end
            .saturating_sub(self.encrypted_area_start)
    }

    /// Percentage of the area encrypted, 0.0..=100.0.
    pub fn percent(&self) -> f64 {
        match self.total_bytes() {
            0 => 0.0,
            total => self.encrypted_bytes() as f64 * 100.0 / total as f64,
        }
    }
}

/// Mutex-protected status written by the worker, read by `query_status`.
#[derive(Debug, Clone, Default)]
pub struct StatusMailbox {
    inner: Arc<Mutex<EncryptionStatus>>,
}

impl StatusMailbox {
    pub fn new(initial: EncryptionStatus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EncryptionStatus> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> EncryptionStatus {
        self.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut EncryptionStatus)) {
        f(&mut self.lock());
    }

    pub fn set_offset(&self, offset: u64) {
        self.lock().current_offset = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_of_empty_area_is_zero() {
        let status = EncryptionStatus::default();
        assert_eq!(status.percent(), 0.0);
    }

    #[test]
    fn mailbox_clones_share_state() {
        let mailbox = StatusMailbox::new(EncryptionStatus {
            encrypted_area_start: 1000,
            encrypted_area_end: 2000,
            current_offset: 1000,
            ..Default::default()
        });
        let worker_side = mailbox.clone();
        worker_side.set_offset(1500);
        let snap = mailbox.snapshot();
        assert_eq!(snap.encrypted_bytes(), 500);
        assert!((snap.percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failure_display_carries_offset() {
        let failure = TransformFailure {
            error: SysencError::Aborted,
            confirmed_offset: 4096,
        };
        assert!(failure.is_interruption());
        assert!(failure.to_string().contains("4096"));
    }
}
