//! One long-running operation per physical drive, process wide.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, OnceLock};

use sysenc_core::{SysencError, SysencResult};

static CLAIMED: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();

fn claimed() -> MutexGuard<'static, HashSet<u32>> {
    CLAIMED
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Exclusive claim on a drive, released on drop.
#[derive(Debug)]
pub struct DriveClaim {
    drive: u32,
}

impl DriveClaim {
    /// `Busy` if another operation already holds the drive.
    pub fn acquire(drive: u32) -> SysencResult<Self> {
        if !claimed().insert(drive) {
            return Err(SysencError::Busy(drive));
        }
        tracing::debug!(drive, "drive claimed");
        Ok(Self { drive })
    }

    pub fn drive(&self) -> u32 {
        self.drive
    }

    pub fn is_claimed(drive: u32) -> bool {
        claimed().contains(&drive)
    }
}

impl Drop for DriveClaim {
    fn drop(&mut self) {
        claimed().remove(&self.drive);
        tracing::debug!(drive = self.drive, "drive released");
    }
}
