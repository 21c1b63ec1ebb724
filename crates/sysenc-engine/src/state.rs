//! Persisted operation state.
//!
//! One JSON document per machine, rewritten atomically (temp file + rename)
//! after every confirmed step, so a restart can resume an interrupted
//! transform or report where a hidden-OS creation stopped.
//!
//! An open [`StateFile`] holds an exclusive advisory lock on `<state>.lock`
//! until it is dropped. A second process opening the same state gets
//! `Busy` instead of reading a live `Encrypting` status as interrupted.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sysenc_core::{EncryptionAlgorithm, Prf, SysencError, SysencResult, WipeAlgorithm};

/// Where the system drive is in its encryption life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupStatus {
    #[default]
    Uninstalled,
    Installing,
    Installed,
    Encrypting,
    /// A transform was stopped part way and can be resumed
    Paused,
    Encrypted,
    Decrypting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformDirection {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Firmware {
    Bios,
    Efi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HiddenOsCreationPhase {
    #[default]
    None,
    Preparing,
    CloningInProgress,
    CloningFinished,
    WipingDecoy,
    DecoyWiped,
    Completed,
}

impl HiddenOsCreationPhase {
    /// Phase bits mirrored into the BIOS boot sector configuration byte.
    pub fn boot_config_bits(self) -> u8 {
        match self {
            HiddenOsCreationPhase::None | HiddenOsCreationPhase::Completed => 0,
            HiddenOsCreationPhase::Preparing
            | HiddenOsCreationPhase::CloningInProgress
            | HiddenOsCreationPhase::CloningFinished => 0x02,
            HiddenOsCreationPhase::WipingDecoy | HiddenOsCreationPhase::DecoyWiped => 0x04,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HiddenOsCreationPhase::None => "none",
            HiddenOsCreationPhase::Preparing => "preparing",
            HiddenOsCreationPhase::CloningInProgress => "cloning-in-progress",
            HiddenOsCreationPhase::CloningFinished => "cloning-finished",
            HiddenOsCreationPhase::WipingDecoy => "wiping-decoy",
            HiddenOsCreationPhase::DecoyWiped => "decoy-wiped",
            HiddenOsCreationPhase::Completed => "completed",
        }
    }
}

impl std::fmt::Display for HiddenOsCreationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for HiddenOsCreationPhase {
    type Err = sysenc_core::SysencError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use HiddenOsCreationPhase::*;
        [
            None,
            Preparing,
            CloningInProgress,
            CloningFinished,
            WipingDecoy,
            DecoyWiped,
            Completed,
        ]
        .into_iter()
        .find(|p| p.name() == s.trim())
        .ok_or_else(|| sysenc_core::SysencError::Config(format!("unknown hidden OS phase: {s}")))
    }
}

/// Progress of overwriting the decoy system partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoySystemWipeStatus {
    pub in_progress: bool,
    pub algorithm: WipeAlgorithm,
    /// Bytes of the decoy partition already wiped
    pub offset: u64,
    pub total: u64,
    pub last_error: Option<String>,
}

/// Placement of the hidden system inside the partition after the decoy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenOsLayout {
    pub partition_number: u32,
    /// Byte offset of the hidden volume header on the drive
    pub header_offset: u64,
    /// Byte offset where the cloned system starts
    pub data_start: u64,
    pub data_length: u64,
    /// Bytes cloned so far
    pub cloned: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationState {
    pub drive_number: u32,
    pub status: SetupStatus,
    pub firmware: Option<Firmware>,
    pub system_partition_only: bool,
    pub algorithm: Option<EncryptionAlgorithm>,
    pub prf: Option<Prf>,
    /// Byte range covered by the volume header
    pub encrypted_area_start: u64,
    pub encrypted_area_end: u64,
    /// End of the encrypted prefix of the area (last confirmed offset)
    pub current_offset: u64,
    pub direction: Option<TransformDirection>,
    pub hidden_os_phase: HiddenOsCreationPhase,
    pub hidden_os: Option<HiddenOsLayout>,
    pub decoy_wipe: DecoySystemWipeStatus,
    /// Copy of the loader that was on the drive before install
    pub original_loader_backup: Option<PathBuf>,
    /// Verified copy of the boot volume header
    pub header_backup: Option<PathBuf>,
    pub last_error: Option<String>,
    /// Unix timestamp of the last write
    pub updated_at: u64,
}

impl OperationState {
    /// Bytes of the area that are currently encrypted.
    pub fn encrypted_bytes(&self) -> u64 {
        self.current_offset.saturating_sub(self.encrypted_area_start)
    }

    pub fn area_len(&self) -> u64 {
        self.encrypted_area_end
            .saturating_sub(self.encrypted_area_start)
    }
}

/// Exclusive lock on the companion `.lock` file; released when the handle closes.
#[derive(Debug)]
struct StateLock {
    _file: File,
}

impl StateLock {
    fn acquire(state_path: &Path, drive: u32) -> SysencResult<Self> {
        let path = state_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening state lock: {}", path.display()))?;
        match file.try_lock() {
            Ok(()) => {
                tracing::debug!(drive, lock = %path.display(), "state lock held");
                Ok(Self { _file: file })
            }
            Err(TryLockError::WouldBlock) => {
                tracing::warn!(drive, lock = %path.display(), "state is held by another process");
                Err(SysencError::Busy(drive))
            }
            Err(TryLockError::Error(e)) => Err(SysencError::device(
                format_args!("locking {}", path.display()),
                e,
            )),
        }
    }
}

/// The state document plus where it lives.
pub struct StateFile {
    path: PathBuf,
    state: OperationState,
    dirty: bool,
    _lock: StateLock,
}

impl StateFile {
    /// Lock the state at `path` for `drive` and load it, or start fresh when
    /// there is none. `Busy` while another `StateFile` holds it.
    pub fn open(path: &Path, drive: u32) -> SysencResult<Self> {
        let lock = StateLock::acquire(path, drive)?;
        let state = if path.exists() {
            Self::load(path)?
        } else {
            OperationState::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
            dirty: false,
            _lock: lock,
        })
    }

    /// Read the state without locking it.
    pub fn load(path: &Path) -> SysencResult<OperationState> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading state file: {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("parsing state file: {}", path.display()))?;
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    /// Directory holding the state file and its companion backups.
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn abort_marker(path: &Path) -> PathBuf {
        path.with_extension("abort")
    }

    /// Ask the process running a worker against `path` to stop at its next
    /// checkpoint.
    pub fn request_abort(path: &Path) -> SysencResult<()> {
        let marker = Self::abort_marker(path);
        std::fs::write(&marker, b"")
            .with_context(|| format!("writing abort marker: {}", marker.display()))?;
        Ok(())
    }

    /// True (once) if another process asked for an abort.
    pub fn take_abort_request(&self) -> bool {
        let marker = Self::abort_marker(&self.path);
        if !marker.exists() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(&marker) {
            tracing::warn!("removing abort marker {}: {e}", marker.display());
        }
        true
    }

    pub fn update(&mut self, f: impl FnOnce(&mut OperationState)) {
        f(&mut self.state);
        self.dirty = true;
    }

    /// Update and write through.
    pub fn commit(&mut self, f: impl FnOnce(&mut OperationState)) -> SysencResult<()> {
        self.update(f);
        self.flush()
    }

    /// Flush dirty changes to disk using an atomic write (write then rename).
    pub fn flush(&mut self) -> SysencResult<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir: {}", parent.display()))?;
        }

        self.state.updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let json = serde_json::to_string_pretty(&self.state).context("serializing state")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing state temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming state file: {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for StateFile {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush operation state on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_uninstalled() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::open(&dir.path().join("state.json"), 0).unwrap();
        assert_eq!(file.state().status, SetupStatus::Uninstalled);
        assert_eq!(file.state().hidden_os_phase, HiddenOsCreationPhase::None);
    }

    #[test]
    fn commit_persists_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let mut file = StateFile::open(&path, 0).unwrap();
        file.commit(|s| {
            s.drive_number = 1;
            s.status = SetupStatus::Encrypting;
            s.encrypted_area_start = 1 << 20;
            s.encrypted_area_end = 1 << 30;
            s.current_offset = (1 << 20) + 4096;
            s.direction = Some(TransformDirection::Encrypt);
            s.decoy_wipe.algorithm = WipeAlgorithm::Dod7;
        })
        .unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = StateFile::load(&path).unwrap();
        assert_eq!(loaded.status, SetupStatus::Encrypting);
        assert_eq!(loaded.encrypted_bytes(), 4096);
        assert_eq!(loaded.decoy_wipe.algorithm, WipeAlgorithm::Dod7);
        assert!(loaded.updated_at > 0);
    }

    #[test]
    fn dirty_state_flushed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let mut file = StateFile::open(&path, 0).unwrap();
            file.update(|s| s.hidden_os_phase = HiddenOsCreationPhase::CloningFinished);
        }
        let loaded = StateFile::load(&path).unwrap();
        assert_eq!(loaded.hidden_os_phase, HiddenOsCreationPhase::CloningFinished);
    }

    #[test]
    fn unknown_fields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"drive_number": 2, "status": "paused"}"#).unwrap();
        let loaded = StateFile::load(&path).unwrap();
        assert_eq!(loaded.drive_number, 2);
        assert_eq!(loaded.status, SetupStatus::Paused);
        assert_eq!(loaded.direction, None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(StateFile::open(&path, 0).is_err());
    }

    #[test]
    fn abort_request_is_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let file = StateFile::open(&path, 0).unwrap();
        assert!(!file.take_abort_request());
        StateFile::request_abort(&path).unwrap();
        assert!(file.take_abort_request());
        assert!(!file.take_abort_request());
    }

    #[test]
    fn second_open_is_busy_until_the_first_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut first = StateFile::open(&path, 3).unwrap();
        first.commit(|s| s.status = SetupStatus::Encrypting).unwrap();

        assert!(matches!(StateFile::open(&path, 3), Err(SysencError::Busy(3))));
        // lock-free readers still see the live status
        assert_eq!(StateFile::load(&path).unwrap().status, SetupStatus::Encrypting);

        drop(first);
        let second = StateFile::open(&path, 3).unwrap();
        assert_eq!(second.state().status, SetupStatus::Encrypting);
    }

    #[test]
    fn phase_names_roundtrip() {
        for phase in [
            HiddenOsCreationPhase::Preparing,
            HiddenOsCreationPhase::WipingDecoy,
            HiddenOsCreationPhase::Completed,
        ] {
            assert_eq!(phase.name().parse::<HiddenOsCreationPhase>().unwrap(), phase);
        }
        assert!("cloning".parse::<HiddenOsCreationPhase>().is_err());
    }
}
