//! Boot encryption orchestrator.
//!
//! Drives one system drive through
//! `Uninstalled → Installing → Installed → Encrypting ⇄ Paused → Encrypted
//! → Decrypting → Uninstalled`, plus the hidden-OS track
//! ([`HiddenOsCreationPhase`]) and the decoy wipe.
//!
//! Long operations run on a [`Worker`] that owns its own device handle and
//! the unlocked header. The worker writes the boot volume header (sector
//! 62) and then the state file after every batch, so the header is the
//! authority on how much of the drive is encrypted.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use sysenc_boot::area::RESERVED_SECTORS;
use sysenc_boot::image::CFG_HIDDEN_OS_PHASE_MASK;
use sysenc_boot::{
    bios, check_reserved_area_free, erase_boot_volume_header, parse_rescue_image,
    read_boot_volume_header, verify_rescue_image, version_string, write_boot_volume_header,
    BiosBackup, BootLoaderImage, BootSettings, DirectoryLoaderSource, EfiInstaller, EfiLayout,
    LoaderSource,
};
use sysenc_core::config::SysencConfig;
use sysenc_core::privileged::{LocalExecutor, PrivilegedExecutor};
use sysenc_core::{
    ChainingMode, EncryptionAlgorithm, Prf, SysencError, SysencResult, WipeAlgorithm,
};
use sysenc_crypto::{
    HeaderKind, HeaderOptions, KdfParams, ParseOptions, UnlockedHeader, VolumeGeometry,
    VolumeHeader, HEADER_SIZE,
};
use sysenc_disk::inspect::{check_supported_layout, probe, ProbeOptions};
use sysenc_disk::{BlockDevice, Partition, PartitionKind, SystemDriveConfiguration};

use crate::claims::DriveClaim;
use crate::environment::{
    backing_device, DeviceProvider, FileDeviceProvider, HostEnvironment, SystemEnvironment,
};
use crate::state::{
    DecoySystemWipeStatus, Firmware, HiddenOsCreationPhase, HiddenOsLayout, OperationState,
    SetupStatus, StateFile, TransformDirection,
};
use crate::status::{EncryptionStatus, ProgressFn, SetupResult, StatusMailbox, TransformFailure};
use crate::transform::{clone_encrypted, run_transform, wipe_range, TransformParams};
use crate::worker::Worker;

const SECTOR_SIZE: u64 = 512;
/// Hidden volume header position inside the partition after the system partition
pub const HIDDEN_HEADER_OFFSET: u64 = 64 * 1024;
/// Space at the front of that partition kept clear of cloned data
pub const HIDDEN_HEADER_AREA: u64 = 128 * 1024;

const ORIGINAL_LOADER_FILE: &str = "original_loader.bin";
const HEADER_BACKUP_FILE: &str = "header_backup.bin";

/// Everything outside the orchestrator that it talks to.
#[derive(Clone)]
pub struct Host {
    pub devices: Arc<dyn DeviceProvider>,
    pub environment: Arc<dyn SystemEnvironment>,
    pub executor: Arc<dyn PrivilegedExecutor>,
    pub loaders: Arc<dyn LoaderSource>,
}

impl Host {
    /// Raw devices, `/sys` + `/proc`, in-process privileged calls and the
    /// configured loader directory.
    pub fn local(config: &SysencConfig) -> Self {
        Self {
            devices: Arc::new(FileDeviceProvider::new(config.drive.clone())),
            environment: Arc::new(HostEnvironment),
            executor: Arc::new(LocalExecutor),
            loaders: Arc::new(DirectoryLoaderSource::new(&config.boot.loader_dir)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Transform(TransformDirection),
    HiddenOsClone,
    DecoyWipe,
}

struct WorkerOutcome {
    result: Result<u64, TransformFailure>,
    header: Option<UnlockedHeader>,
}

struct Running {
    kind: OperationKind,
    worker: Worker<WorkerOutcome>,
}

/// Headers built by `prepare_installation`, waiting for `install`.
struct PreparedInstall {
    header: VolumeHeader,
    rescue_header: VolumeHeader,
    algorithm: EncryptionAlgorithm,
    prf: Prf,
    pim: u32,
}

fn lock_state(state: &Mutex<StateFile>) -> MutexGuard<'_, StateFile> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn fail(error: SysencError, confirmed_offset: u64) -> TransformFailure {
    TransformFailure {
        error,
        confirmed_offset,
    }
}

/// Write `bytes` to `path` and read them back.
fn write_verified(path: &Path, bytes: &[u8]) -> SysencResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    let back = std::fs::read(path).with_context(|| format!("reading back {}", path.display()))?;
    if back != bytes {
        return Err(SysencError::IntegrityMismatch(format!(
            "{} does not read back as written",
            path.display()
        )));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> SysencResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("removing {}", path.display()))
            .into()),
    }
}

fn status_from(state: &OperationState) -> EncryptionStatus {
    EncryptionStatus {
        status: state.status,
        direction: state.direction,
        setup_in_progress: false,
        encrypted_area_start: state.encrypted_area_start,
        encrypted_area_end: state.encrypted_area_end,
        current_offset: state.current_offset,
        hidden_os_phase: state.hidden_os_phase,
        last_error: state.last_error.clone(),
    }
}

fn write_header_at(dev: &mut dyn BlockDevice, offset: u64, header: &VolumeHeader) -> SysencResult<()> {
    dev.write_at(offset, header.as_bytes())?;
    dev.flush()
}

fn read_header_at(dev: &mut dyn BlockDevice, offset: u64) -> SysencResult<VolumeHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    dev.read_at(offset, &mut buf)?;
    VolumeHeader::from_bytes(&buf)
}

/// Shared pieces a worker job needs besides its own arguments.
struct JobContext {
    state: Arc<Mutex<StateFile>>,
    mailbox: StatusMailbox,
    progress: Option<ProgressFn>,
}

impl JobContext {
    /// Stop at the next batch if another process asked for it.
    fn poll_abort(&self, file: &StateFile, cancel: &CancellationToken) {
        if file.take_abort_request() {
            tracing::info!("abort requested through the state file");
            cancel.cancel();
        }
    }

    fn report(&self, done: u64, total: u64, label: &str) {
        if let Some(cb) = &self.progress {
            cb(done, total, label);
        }
    }
}

fn transform_job(
    mut dev: Box<dyn BlockDevice>,
    mut header: UnlockedHeader,
    params: TransformParams,
    from: u64,
    cancel: CancellationToken,
    job: JobContext,
) -> WorkerOutcome {
    let start = params.area_start;
    let total = params.area_end - start;
    let direction = params.direction;
    let label = match direction {
        TransformDirection::Encrypt => "encrypting",
        TransformDirection::Decrypt => "decrypting",
    };

    let result = {
        let sealer = &header;
        run_transform(
            dev.as_mut(),
            sealer.context(),
            &params,
            from,
            &cancel,
            &mut |dev, boundary| {
                write_boot_volume_header(dev, &sealer.seal_with_area(start, boundary - start)?)?;
                let mut file = lock_state(&job.state);
                file.commit(|s| s.current_offset = boundary)?;
                job.poll_abort(&file, &cancel);
                drop(file);
                job.mailbox.set_offset(boundary);
                let done = match direction {
                    TransformDirection::Encrypt => boundary - start,
                    TransformDirection::Decrypt => params.area_end - boundary,
                };
                job.report(done, total, label);
                Ok(())
            },
        )
    };

    let boundary = match &result {
        Ok(b) => *b,
        Err(f) => f.confirmed_offset,
    };
    if let Err(e) = header.with_encrypted_area(start, boundary - start) {
        tracing::warn!("updating in-memory header: {e}");
    }
    let status = match (&result, direction) {
        (Ok(_), TransformDirection::Encrypt) => SetupStatus::Encrypted,
        (Ok(_), TransformDirection::Decrypt) => SetupStatus::Installed,
        (Err(_), _) => SetupStatus::Paused,
    };
    let last_error = match &result {
        Err(f) if !f.is_interruption() => Some(f.to_string()),
        _ => None,
    };
    match &result {
        Ok(_) => tracing::info!(?direction, "transform completed"),
        Err(f) => tracing::warn!(?direction, "transform stopped: {f}"),
    }

    let committed = lock_state(&job.state).commit(|s| {
        s.status = status;
        s.current_offset = boundary;
        s.last_error = last_error.clone();
    });
    if let Err(e) = committed {
        tracing::warn!("persisting transform outcome: {e}");
    }
    job.mailbox.update(|m| {
        m.status = status;
        m.current_offset = boundary;
        m.setup_in_progress = false;
        m.last_error = last_error;
    });
    WorkerOutcome {
        result,
        header: Some(header),
    }
}

/// Orchestrates boot encryption of one system drive.
pub struct BootEncryption {
    config: SysencConfig,
    drive_number: u32,
    host: Host,
    drive_config: Option<SystemDriveConfiguration>,
    state: Arc<Mutex<StateFile>>,
    mailbox: StatusMailbox,
    progress: Option<ProgressFn>,
    /// Open boot volume header (after prepare/unlock)
    active: Option<UnlockedHeader>,
    /// Open hidden volume header during hidden-OS creation
    hidden: Option<UnlockedHeader>,
    prepared: Option<PreparedInstall>,
    running: Option<Running>,
}

impl BootEncryption {
    /// Takes the state lock for the lifetime of the orchestrator; `Busy` while
    /// another instance (in this process or another) has it.
    pub fn new(config: SysencConfig, drive_number: u32, host: Host) -> SysencResult<Self> {
        let mut file = StateFile::open(&config.drive.state_file, drive_number)?;
        let persisted = file.state().clone();
        if persisted.status != SetupStatus::Uninstalled && persisted.drive_number != drive_number
        {
            return Err(SysencError::InvalidState(format!(
                "state file {} belongs to drive {}, not {drive_number}",
                file.path().display(),
                persisted.drive_number
            )));
        }
        match persisted.status {
            SetupStatus::Encrypting | SetupStatus::Decrypting => {
                tracing::warn!(
                    offset = persisted.current_offset,
                    "previous transform was interrupted; marking paused"
                );
                file.commit(|s| s.status = SetupStatus::Paused)?;
            }
            SetupStatus::Installing => {
                tracing::warn!("discarding an unfinished installation");
                file.commit(|s| s.status = SetupStatus::Uninstalled)?;
            }
            _ => {}
        }
        let mailbox = StatusMailbox::new(status_from(file.state()));
        Ok(Self {
            config,
            drive_number,
            host,
            drive_config: None,
            state: Arc::new(Mutex::new(file)),
            mailbox,
            progress: None,
            active: None,
            hidden: None,
            prepared: None,
            running: None,
        })
    }

    pub fn drive_number(&self) -> u32 {
        self.drive_number
    }

    pub fn config(&self) -> &SysencConfig {
        &self.config
    }

    /// Receive (bytes done, bytes total, label) from worker threads.
    pub fn set_progress(&mut self, progress: impl Fn(u64, u64, &str) + Send + Sync + 'static) {
        self.progress = Some(Arc::new(progress));
    }

    /// Copy of the persisted operation state.
    pub fn state(&self) -> OperationState {
        lock_state(&self.state).state().clone()
    }

    fn commit(&self, f: impl FnOnce(&mut OperationState)) -> SysencResult<()> {
        let mut file = lock_state(&self.state);
        file.commit(f)?;
        let snapshot = status_from(file.state());
        drop(file);
        self.mailbox.update(|m| {
            let in_progress = m.setup_in_progress;
            *m = snapshot;
            m.setup_in_progress = in_progress;
        });
        Ok(())
    }

    fn state_dir(&self) -> PathBuf {
        lock_state(&self.state).dir()
    }

    fn kdf(&self) -> KdfParams {
        KdfParams::from(&self.config.encryption)
    }

    fn parse_options(&self, prf: Option<Prf>, kind: HeaderKind) -> ParseOptions {
        ParseOptions {
            prf,
            kind,
            kdf: self.kdf(),
        }
    }

    fn firmware(&self) -> Firmware {
        self.state()
            .firmware
            .unwrap_or_else(|| self.host.environment.firmware())
    }

    fn open_drive(&self) -> SysencResult<Box<dyn BlockDevice>> {
        self.host.devices.open(self.drive_number)
    }

    // ── Drive configuration ──────────────────────────────────────────────

    /// Probe the drive once and cache the result.
    pub fn system_drive_configuration(&mut self) -> SysencResult<&SystemDriveConfiguration> {
        if self.drive_config.is_none() {
            let opts = ProbeOptions {
                device_path: self.host.devices.device_path(self.drive_number),
                system_partition: self.config.drive.system_partition,
                mounts: self.host.environment.mounts(),
            };
            let mut dev = self.open_drive()?;
            let probed = probe(dev.as_mut(), self.drive_number, &opts)?;
            tracing::debug!(
                drive = self.drive_number,
                partitions = probed.partitions.len(),
                system = probed.system_partition.number,
                "drive configuration cached"
            );
            self.drive_config = Some(probed);
        }
        self.drive_config
            .as_ref()
            .ok_or_else(|| SysencError::InvalidState("drive configuration unavailable".into()))
    }

    /// Forget the cached configuration, e.g. after partitions changed.
    pub fn invalidate_drive_configuration(&mut self) {
        self.drive_config = None;
    }

    fn drive_configuration(&mut self) -> SysencResult<SystemDriveConfiguration> {
        self.system_drive_configuration().cloned()
    }

    // ── Requirements ─────────────────────────────────────────────────────

    pub fn check_requirements(
        &mut self,
        system_partition_only: bool,
        burn_rescue: bool,
    ) -> SysencResult<()> {
        let cfg = self.drive_configuration()?;
        check_supported_layout(&cfg)?;
        if u64::from(cfg.sector_size) != SECTOR_SIZE {
            return Err(SysencError::UnsupportedLayout(format!(
                "system encryption needs 512-byte sectors, drive has {}",
                cfg.sector_size
            )));
        }
        check_reserved_area_free(&cfg)?;

        let firmware = self.host.environment.firmware();
        if firmware == Firmware::Bios && cfg.is_gpt() {
            return Err(SysencError::UnsupportedLayout(
                "BIOS boot from a GPT drive would overwrite the partition entries".into(),
            ));
        }
        if !system_partition_only {
            if firmware == Firmware::Efi {
                return Err(SysencError::UnsupportedLayout(
                    "whole-drive encryption is not available with EFI boot".into(),
                ));
            }
            if cfg.contains_extended_partition() {
                return Err(SysencError::UnsupportedLayout(
                    "whole-drive encryption of a drive with extended partitions".into(),
                ));
            }
        }

        self.check_paging_files(&cfg, system_partition_only)?;

        if burn_rescue && !self.host.environment.has_cd_recorder() {
            return Err(SysencError::InvalidState(
                "no CD/DVD recorder found for burning the rescue disk".into(),
            ));
        }
        tracing::info!(system_partition_only, ?firmware, "requirements met");
        Ok(())
    }

    fn check_paging_files(
        &self,
        cfg: &SystemDriveConfiguration,
        system_partition_only: bool,
    ) -> SysencResult<()> {
        let mounts = self.host.environment.mounts();
        let encrypted: Vec<&Path> = if system_partition_only {
            vec![cfg.system_partition.device_path.as_path()]
        } else {
            cfg.partitions.iter().map(|p| p.device_path.as_path()).collect()
        };
        for file in self.host.environment.paging_files() {
            let device = backing_device(&file, &mounts);
            let in_ram = device
                .as_ref()
                .and_then(|d| d.file_name())
                .is_some_and(|n| n.to_string_lossy().starts_with("zram"));
            let covered = device
                .as_ref()
                .is_some_and(|d| encrypted.iter().any(|p| *p == d.as_path()));
            if !covered && !in_ram {
                return Err(SysencError::UnsupportedLayout(format!(
                    "paging file {} lies outside the area to be encrypted",
                    file.display()
                )));
            }
        }
        Ok(())
    }

    /// Hidden-OS creation needs BIOS boot, an MBR drive and a large enough
    /// partition behind the system partition.
    pub fn check_requirements_hidden_os(&mut self) -> SysencResult<()> {
        if self.host.environment.firmware() != Firmware::Bios {
            return Err(SysencError::UnsupportedLayout(
                "hidden operating systems need BIOS boot".into(),
            ));
        }
        let cfg = self.drive_configuration()?;
        check_supported_layout(&cfg)?;
        if cfg.is_gpt() {
            return Err(SysencError::UnsupportedLayout(
                "hidden operating systems need an MBR drive".into(),
            ));
        }
        let status = self.state().status;
        if !matches!(status, SetupStatus::Uninstalled | SetupStatus::Installed) {
            return Err(SysencError::InvalidState(format!(
                "cannot create a hidden OS while the drive is {status:?}"
            )));
        }
        self.partition_for_hidden_os().map(|_| ())
    }

    // ── Installation ─────────────────────────────────────────────────────

    /// Create the boot volume header and its rescue copy, and write the
    /// rescue disk image to `rescue_iso_path`.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_installation(
        &mut self,
        system_partition_only: bool,
        password: &SecretString,
        algorithm: EncryptionAlgorithm,
        mode: ChainingMode,
        prf: Prf,
        pim: u32,
        rescue_iso_path: &Path,
    ) -> SysencResult<()> {
        self.ensure_idle()?;
        let status = self.state().status;
        if !matches!(status, SetupStatus::Uninstalled | SetupStatus::Installing) {
            return Err(SysencError::InvalidState(format!(
                "drive is already {status:?}"
            )));
        }

        let cfg = self.drive_configuration()?;
        let (start, end) = if system_partition_only {
            (
                cfg.system_partition.start_offset,
                cfg.system_partition.end_offset(),
            )
        } else {
            (RESERVED_SECTORS * SECTOR_SIZE, cfg.drive_size / SECTOR_SIZE * SECTOR_SIZE)
        };
        let geometry = VolumeGeometry {
            sector_size: SECTOR_SIZE as u32,
            volume_size: end - start,
            encrypted_area_start: start,
            encrypted_area_length: 0,
        };
        let opts = HeaderOptions {
            prf,
            pim,
            kind: HeaderKind::System,
            kdf: self.kdf(),
        };

        let (header, unlocked) =
            VolumeHeader::create_unlocked(password, algorithm, mode, &opts, geometry)?;
        let rescue_header = VolumeHeader::seal(password, &opts, geometry, unlocked.context())?;

        let mut dev = self.open_drive()?;
        let mut original_mbr = vec![0u8; SECTOR_SIZE as usize];
        dev.read_sectors(0, &mut original_mbr)?;
        let rescue_image = BootLoaderImage::assemble(&*self.host.loaders, algorithm, prf, true, false)?;
        let iso = sysenc_boot::build_rescue_image(&rescue_image, &rescue_header, &original_mbr)?;
        write_verified(rescue_iso_path, &iso)?;

        let firmware = self.host.environment.firmware();
        let drive_number = self.drive_number;
        self.commit(|s| {
            s.drive_number = drive_number;
            s.status = SetupStatus::Installing;
            s.firmware = Some(firmware);
            s.system_partition_only = system_partition_only;
            s.algorithm = Some(algorithm);
            s.prf = Some(prf);
            s.encrypted_area_start = start;
            s.encrypted_area_end = end;
            s.current_offset = start;
            s.direction = None;
            s.last_error = None;
        })?;

        self.prepared = Some(PreparedInstall {
            header,
            rescue_header,
            algorithm,
            prf,
            pim,
        });
        self.active = Some(unlocked);
        tracing::info!(
            start,
            end,
            rescue = %rescue_iso_path.display(),
            "installation prepared"
        );
        Ok(())
    }

    /// Check a rescue image against the headers prepared in this session.
    pub fn verify_rescue_disk_image(&self, path: &Path) -> SysencResult<()> {
        let prepared = self.prepared.as_ref().ok_or_else(|| {
            SysencError::InvalidState(
                "no rescue disk was prepared in this session; verify with the password".into(),
            )
        })?;
        let iso = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let expected = BootLoaderImage::assemble(
            &*self.host.loaders,
            prepared.algorithm,
            prepared.prf,
            true,
            false,
        )?;
        verify_rescue_image(&iso, &expected, Some(&prepared.rescue_header))?;
        Ok(())
    }

    /// Check a rescue image by unlocking its header and comparing the keys
    /// with the open boot volume header.
    pub fn verify_rescue_disk_image_with_password(
        &self,
        path: &Path,
        password: &SecretString,
        pim: u32,
    ) -> SysencResult<()> {
        let active = self.active_header()?;
        let fields = active.fields();
        let iso = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let expected =
            BootLoaderImage::assemble(&*self.host.loaders, fields.algorithm, fields.prf, true, false)?;
        let contents = verify_rescue_image(&iso, &expected, None)?;
        let rescue = contents.header.unlock(
            password,
            pim,
            &self.parse_options(Some(fields.prf), HeaderKind::System),
        )?;
        if !rescue.context().same_keys(active.context()) {
            return Err(SysencError::IntegrityMismatch(
                "rescue disk holds the keys of another volume".into(),
            ));
        }
        tracing::info!(path = %path.display(), "rescue disk matches the boot volume");
        Ok(())
    }

    /// Write a fresh rescue image for an installed drive.
    pub fn create_rescue_disk_image(
        &mut self,
        path: &Path,
        password: &SecretString,
        pim: u32,
    ) -> SysencResult<()> {
        let backup_path = self.state().original_loader_backup;
        let active = self.active_header()?;
        let fields = active.fields().clone();
        let rescue_header = active.backup_copy(password, pim, &self.kdf())?;

        let original_mbr = match backup_path.filter(|_| self.firmware() == Firmware::Bios) {
            Some(p) => {
                let raw = std::fs::read(&p).with_context(|| format!("reading {}", p.display()))?;
                BiosBackup::from_bytes(raw)?.mbr_sector().to_vec()
            }
            None => {
                let mut dev = self.open_drive()?;
                let mut sector = vec![0u8; SECTOR_SIZE as usize];
                dev.read_sectors(0, &mut sector)?;
                sector
            }
        };
        let image =
            BootLoaderImage::assemble(&*self.host.loaders, fields.algorithm, fields.prf, true, false)?;
        let iso = sysenc_boot::build_rescue_image(&image, &rescue_header, &original_mbr)?;
        write_verified(path, &iso)
    }

    /// Place the boot loader and the prepared volume header on the drive.
    pub fn install(&mut self, hidden_system: bool, prf: Prf) -> SysencResult<()> {
        self.ensure_idle()?;
        if self.state().status != SetupStatus::Installing {
            return Err(SysencError::InvalidState(
                "call prepare_installation before install".into(),
            ));
        }
        let (header, rescue_header, algorithm, pim) = match &self.prepared {
            Some(p) => (p.header.clone(), p.rescue_header.clone(), p.algorithm, p.pim),
            None => {
                return Err(SysencError::InvalidState(
                    "the prepared installation was lost; prepare again".into(),
                ))
            }
        };

        let firmware = self.host.environment.firmware();
        let state_dir = self.state_dir();
        let mut dev = self.open_drive()?;
        let mut loader_backup = self.state().original_loader_backup;

        match firmware {
            Firmware::Bios => {
                let image = BootLoaderImage::assemble(
                    &*self.host.loaders,
                    algorithm,
                    prf,
                    false,
                    hidden_system,
                )?;
                if let Some(backup) = bios::install(dev.as_mut(), &image, true)? {
                    let path = state_dir.join(ORIGINAL_LOADER_FILE);
                    write_verified(&path, backup.as_bytes())?;
                    loader_backup = Some(path);
                }
            }
            Firmware::Efi => {
                if hidden_system {
                    return Err(SysencError::UnsupportedLayout(
                        "hidden operating systems need BIOS boot".into(),
                    ));
                }
                let cfg = self.drive_configuration()?;
                let layout = EfiLayout::locate(&cfg, &self.config.boot)?;
                let settings = BootSettings {
                    password_prompt: self.config.boot.password_prompt.clone(),
                    prf: Some(prf),
                    pim,
                    chain_loader: None,
                };
                let installer = EfiInstaller::new(&*self.host.executor, layout);
                installer.install(&*self.host.loaders, &settings, true)?;
                loader_backup = Some(installer.layout().backup_path.clone());
            }
        }

        write_boot_volume_header(dev.as_mut(), &header)?;
        if read_boot_volume_header(dev.as_mut())? != header {
            return Err(SysencError::IntegrityMismatch(
                "boot volume header does not read back as written".into(),
            ));
        }
        let header_backup = state_dir.join(HEADER_BACKUP_FILE);
        write_verified(&header_backup, rescue_header.as_bytes())?;

        self.commit(|s| {
            s.status = SetupStatus::Installed;
            s.firmware = Some(firmware);
            s.prf = Some(prf);
            s.original_loader_backup = loader_backup;
            s.header_backup = Some(header_backup);
        })?;
        self.prepared = None;
        tracing::info!(?firmware, hidden_system, "boot loader and volume header installed");
        Ok(())
    }

    /// Open the boot volume header on the drive.
    pub fn unlock(&mut self, password: &SecretString, pim: u32) -> SysencResult<()> {
        let mut dev = self.open_drive()?;
        let header = read_boot_volume_header(dev.as_mut())?;
        let prf = self.state().prf;
        let unlocked = header.unlock(password, pim, &self.parse_options(prf, HeaderKind::System))?;

        let g = unlocked.fields().geometry;
        let boundary = g.encrypted_area_start + g.encrypted_area_length;
        let state = self.state();
        if state.current_offset != boundary || state.encrypted_area_start != g.encrypted_area_start
        {
            tracing::warn!(
                state = state.current_offset,
                header = boundary,
                "state file disagrees with the volume header; trusting the header"
            );
        }
        let fields = unlocked.fields().clone();
        self.commit(|s| {
            s.encrypted_area_start = g.encrypted_area_start;
            s.encrypted_area_end = g.encrypted_area_start + g.volume_size;
            s.current_offset = boundary;
            s.algorithm = Some(fields.algorithm);
            s.prf = Some(fields.prf);
        })?;
        self.active = Some(unlocked);
        Ok(())
    }

    fn active_header(&self) -> SysencResult<&UnlockedHeader> {
        self.active.as_ref().ok_or_else(|| {
            SysencError::InvalidState("the boot volume header is not unlocked".into())
        })
    }

    // ── Workers ──────────────────────────────────────────────────────────

    fn job_context(&self) -> JobContext {
        JobContext {
            state: Arc::clone(&self.state),
            mailbox: self.mailbox.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Join the worker and put its header back where it came from.
    fn collect(&mut self) -> Option<(OperationKind, Result<u64, TransformFailure>)> {
        let running = self.running.take()?;
        let kind = running.kind;
        let outcome = running.worker.join().unwrap_or_else(|e| {
            let offset = self.state().current_offset;
            WorkerOutcome {
                result: Err(fail(e, offset)),
                header: None,
            }
        });
        match kind {
            OperationKind::Transform(_) => self.active = outcome.header,
            OperationKind::HiddenOsClone => self.hidden = outcome.header,
            OperationKind::DecoyWipe => {}
        }
        self.mailbox.update(|m| m.setup_in_progress = false);
        Some((kind, outcome.result))
    }

    /// `Busy` while a worker runs; a finished one is collected.
    fn ensure_idle(&mut self) -> SysencResult<()> {
        if let Some(running) = &self.running {
            if !running.worker.is_finished() {
                return Err(SysencError::Busy(self.drive_number));
            }
        }
        if let Some((kind, Err(failure))) = self.collect() {
            tracing::warn!(?kind, "collected failed operation: {failure}");
        }
        Ok(())
    }

    fn start_transform(
        &mut self,
        direction: TransformDirection,
        wipe: WipeAlgorithm,
        tolerate_unreadable: bool,
    ) -> SysencResult<()> {
        self.ensure_idle()?;
        let state = self.state();
        let allowed = match direction {
            TransformDirection::Encrypt => {
                matches!(state.status, SetupStatus::Installed | SetupStatus::Paused)
            }
            TransformDirection::Decrypt => {
                matches!(state.status, SetupStatus::Encrypted | SetupStatus::Paused)
            }
        };
        if !allowed {
            return Err(SysencError::InvalidState(format!(
                "cannot start {direction:?} while the drive is {:?}",
                state.status
            )));
        }
        self.active_header()?;

        let claim = DriveClaim::acquire(self.drive_number)?;
        let dev = self.open_drive()?;
        let header = self.active.take().ok_or_else(|| {
            SysencError::InvalidState("the boot volume header is not unlocked".into())
        })?;

        let params = TransformParams {
            direction,
            area_start: state.encrypted_area_start,
            area_end: state.encrypted_area_end,
            batch_sectors: self.config.drive.batch_sectors,
            wipe,
            tolerate_unreadable,
        };
        let from = state.current_offset;
        self.commit(|s| {
            s.status = match direction {
                TransformDirection::Encrypt => SetupStatus::Encrypting,
                TransformDirection::Decrypt => SetupStatus::Decrypting,
            };
            s.direction = Some(direction);
            s.last_error = None;
        })?;
        self.mailbox.update(|m| m.setup_in_progress = true);

        let job = self.job_context();
        let worker = Worker::spawn("sysenc-transform", move |cancel| {
            let _claim = claim;
            transform_job(dev, header, params, from, cancel, job)
        });
        match worker {
            Ok(worker) => {
                self.running = Some(Running {
                    kind: OperationKind::Transform(direction),
                    worker,
                });
                Ok(())
            }
            Err(e) => {
                self.commit(|s| s.status = SetupStatus::Paused)?;
                self.mailbox.update(|m| m.setup_in_progress = false);
                Err(e)
            }
        }
    }

    /// Start (or resume) encrypting the area on a worker thread.
    pub fn start_encryption(
        &mut self,
        wipe_algorithm: WipeAlgorithm,
        zero_unreadable_sectors: bool,
    ) -> SysencResult<()> {
        self.start_transform(
            TransformDirection::Encrypt,
            wipe_algorithm,
            zero_unreadable_sectors,
        )
    }

    /// Start (or resume) decrypting the area on a worker thread.
    pub fn start_decryption(&mut self, discard_unreadable_sectors: bool) -> SysencResult<()> {
        self.start_transform(
            TransformDirection::Decrypt,
            WipeAlgorithm::None,
            discard_unreadable_sectors,
        )
    }

    /// Ask the running worker to stop at its next batch boundary.
    pub fn abort(&self) {
        if let Some(running) = &self.running {
            tracing::info!(worker = running.worker.name(), "abort requested");
            running.worker.cancel();
        }
    }

    /// Abort and wait for the worker to stop.
    pub fn abort_and_wait(&mut self) -> SysencResult<SetupResult> {
        self.abort();
        match self.collect() {
            None => Ok(SetupResult::Completed),
            Some((_, Ok(_))) => Ok(SetupResult::Completed),
            Some((_, Err(f))) if f.is_interruption() => Ok(SetupResult::Aborted),
            Some((_, Err(f))) => Err(f.error),
        }
    }

    pub fn query_status(&self) -> EncryptionStatus {
        let mut status = self.mailbox.snapshot();
        status.setup_in_progress = self
            .running
            .as_ref()
            .is_some_and(|r| !r.worker.is_finished());
        status
    }

    /// Outcome of the last encryption, decryption or hidden-OS clone.
    /// A completed decryption also removes the boot loader.
    pub fn check_encryption_setup_result(&mut self) -> Result<SetupResult, TransformFailure> {
        let offset = self.state().current_offset;
        match &self.running {
            Some(r) if !r.worker.is_finished() => return Ok(SetupResult::InProgress),
            Some(r) if r.kind == OperationKind::DecoyWipe => return Ok(SetupResult::InProgress),
            _ => {}
        }

        match self.collect() {
            Some((_, Err(f))) if f.is_interruption() => Ok(SetupResult::Aborted),
            Some((_, Err(f))) => Err(f),
            Some((OperationKind::Transform(TransformDirection::Decrypt), Ok(_))) => {
                self.deinstall().map_err(|e| fail(e, offset))?;
                Ok(SetupResult::Completed)
            }
            Some(_) => Ok(SetupResult::Completed),
            None => {
                let state = self.state();
                match state.status {
                    SetupStatus::Paused => Ok(SetupResult::Aborted),
                    SetupStatus::Installed
                        if state.direction == Some(TransformDirection::Decrypt)
                            && state.encrypted_bytes() == 0 =>
                    {
                        self.deinstall().map_err(|e| fail(e, offset))?;
                        Ok(SetupResult::Completed)
                    }
                    _ => Ok(SetupResult::Completed),
                }
            }
        }
    }

    // ── Password change ──────────────────────────────────────────────────

    /// Re-wrap the master keys under a new password.
    ///
    /// The old header is saved to the backup file and verified before the
    /// primary copy is overwritten `wipe_pass_count` times; the new header
    /// is verified before the backup is refreshed.
    pub fn change_password(
        &mut self,
        old_password: &SecretString,
        old_pim: u32,
        new_password: &SecretString,
        prf: Prf,
        pim: u32,
        wipe_pass_count: u32,
    ) -> SysencResult<()> {
        self.ensure_idle()?;
        let state = self.state();
        if matches!(
            state.status,
            SetupStatus::Uninstalled | SetupStatus::Installing
        ) {
            return Err(SysencError::InvalidState(
                "no boot volume header installed".into(),
            ));
        }

        let mut dev = self.open_drive()?;
        let current = read_boot_volume_header(dev.as_mut())?;
        let new_opts = HeaderOptions {
            prf,
            pim,
            kind: HeaderKind::System,
            kdf: self.kdf(),
        };
        // Fails with WrongPassword before anything is written.
        let (new_header, new_unlocked) = current.rewrap_unlocked(
            old_password,
            old_pim,
            &self.parse_options(None, HeaderKind::System),
            new_password,
            &new_opts,
        )?;

        let backup_path = state
            .header_backup
            .clone()
            .unwrap_or_else(|| self.state_dir().join(HEADER_BACKUP_FILE));
        write_verified(&backup_path, current.as_bytes())?;
        tracing::debug!(path = %backup_path.display(), "old header backed up");

        let write_new = |dev: &mut dyn BlockDevice| -> SysencResult<()> {
            erase_boot_volume_header(dev, wipe_pass_count, &VolumeHeader::random_fill())?;
            write_boot_volume_header(dev, &new_header)?;
            if read_boot_volume_header(dev)? != new_header {
                return Err(SysencError::IntegrityMismatch(
                    "new volume header does not read back as written".into(),
                ));
            }
            Ok(())
        };
        if let Err(e) = write_new(dev.as_mut()) {
            tracing::error!("writing the new header failed, restoring the old one: {e}");
            if let Err(restore) = write_boot_volume_header(dev.as_mut(), &current) {
                tracing::error!(
                    backup = %backup_path.display(),
                    "restoring the old header failed: {restore}"
                );
            }
            return Err(e);
        }

        let fresh_backup = new_unlocked.backup_copy(new_password, pim, &self.kdf())?;
        write_verified(&backup_path, fresh_backup.as_bytes())?;

        if self.firmware() == Firmware::Efi {
            let cfg = self.drive_configuration()?;
            let layout = EfiLayout::locate(&cfg, &self.config.boot)?;
            EfiInstaller::new(&*self.host.executor, layout).update_credentials(Some(prf), pim)?;
        }

        self.commit(|s| {
            s.prf = Some(prf);
            s.header_backup = Some(backup_path);
        })?;
        self.active = Some(new_unlocked);
        tracing::info!(passes = wipe_pass_count, "password changed");
        Ok(())
    }

    // ── Hidden operating system ──────────────────────────────────────────

    /// The partition behind the system partition, if it is large enough to
    /// hold a clone of the system partition plus the required slack.
    pub fn partition_for_hidden_os(&mut self) -> SysencResult<Partition> {
        let cfg = self.drive_configuration()?;
        let system = &cfg.system_partition;
        let candidate = cfg.partition_after_system().cloned().ok_or_else(|| {
            SysencError::UnsupportedLayout(
                "no partition follows the system partition".into(),
            )
        })?;
        let min_ratio = if system.kind == PartitionKind::Fat {
            self.config.hidden_os.min_ratio_fat
        } else {
            self.config.hidden_os.min_ratio_ntfs
        };
        let ratio = candidate.length as f64 / system.length.max(1) as f64;
        if ratio < min_ratio {
            return Err(SysencError::ResourceExhausted(format!(
                "partition {} is {ratio:.2}x the system partition, needs {min_ratio:.2}x",
                candidate.number
            )));
        }
        Ok(candidate)
    }

    /// Create the hidden volume header in the partition behind the system
    /// partition and enter the `Preparing` phase.
    pub fn prepare_hidden_os_creation(
        &mut self,
        password: &SecretString,
        algorithm: EncryptionAlgorithm,
        mode: ChainingMode,
        prf: Prf,
        pim: u32,
    ) -> SysencResult<HiddenOsLayout> {
        self.ensure_idle()?;
        self.check_requirements_hidden_os()?;
        let phase = self.state().hidden_os_phase;
        if phase != HiddenOsCreationPhase::None {
            return Err(SysencError::InvalidState(format!(
                "hidden OS creation already in phase {phase}"
            )));
        }
        let cfg = self.drive_configuration()?;
        let partition = self.partition_for_hidden_os()?;

        let data_length = cfg.system_partition.length / SECTOR_SIZE * SECTOR_SIZE;
        let data_start = (partition.end_offset() - data_length) / SECTOR_SIZE * SECTOR_SIZE;
        if data_start < partition.start_offset + HIDDEN_HEADER_AREA {
            return Err(SysencError::ResourceExhausted(format!(
                "partition {} cannot hold the hidden system",
                partition.number
            )));
        }
        let layout = HiddenOsLayout {
            partition_number: partition.number,
            header_offset: partition.start_offset + HIDDEN_HEADER_OFFSET,
            data_start,
            data_length,
            cloned: 0,
        };

        let geometry = VolumeGeometry {
            sector_size: SECTOR_SIZE as u32,
            volume_size: data_length,
            encrypted_area_start: data_start,
            encrypted_area_length: 0,
        };
        let opts = HeaderOptions {
            prf,
            pim,
            kind: HeaderKind::Standard,
            kdf: self.kdf(),
        };
        let (header, unlocked) =
            VolumeHeader::create_unlocked(password, algorithm, mode, &opts, geometry)?;

        let mut dev = self.open_drive()?;
        write_header_at(dev.as_mut(), layout.header_offset, &header)?;
        if read_header_at(dev.as_mut(), layout.header_offset)? != header {
            return Err(SysencError::IntegrityMismatch(
                "hidden volume header does not read back as written".into(),
            ));
        }
        drop(dev);

        self.commit(|s| s.hidden_os = Some(layout))?;
        self.set_hidden_os_creation_phase(HiddenOsCreationPhase::Preparing)?;
        self.hidden = Some(unlocked);
        tracing::info!(
            partition = layout.partition_number,
            data_start,
            data_length,
            "hidden OS creation prepared"
        );
        Ok(layout)
    }

    /// Open the hidden volume header again, e.g. after a restart.
    pub fn unlock_hidden_os(&mut self, password: &SecretString, pim: u32) -> SysencResult<()> {
        let layout = self.state().hidden_os.ok_or_else(|| {
            SysencError::InvalidState("no hidden OS creation in progress".into())
        })?;
        let mut dev = self.open_drive()?;
        let header = read_header_at(dev.as_mut(), layout.header_offset)?;
        let unlocked =
            header.unlock(password, pim, &self.parse_options(None, HeaderKind::Standard))?;
        self.hidden = Some(unlocked);
        Ok(())
    }

    /// Copy the system partition into the hidden volume on a worker thread.
    pub fn start_hidden_os_clone(&mut self) -> SysencResult<()> {
        self.ensure_idle()?;
        let state = self.state();
        if !matches!(
            state.hidden_os_phase,
            HiddenOsCreationPhase::Preparing | HiddenOsCreationPhase::CloningInProgress
        ) {
            return Err(SysencError::InvalidState(format!(
                "cannot clone in phase {}",
                state.hidden_os_phase
            )));
        }
        let layout = state.hidden_os.ok_or_else(|| {
            SysencError::InvalidState("no hidden OS layout recorded".into())
        })?;
        if self.hidden.is_none() {
            return Err(SysencError::InvalidState(
                "the hidden volume header is not unlocked".into(),
            ));
        }
        let source = self.drive_configuration()?.system_partition.start_offset;

        let claim = DriveClaim::acquire(self.drive_number)?;
        let dev = self.open_drive()?;
        self.set_hidden_os_creation_phase(HiddenOsCreationPhase::CloningInProgress)?;
        let header = self.hidden.take().ok_or_else(|| {
            SysencError::InvalidState("the hidden volume header is not unlocked".into())
        })?;
        self.mailbox.update(|m| m.setup_in_progress = true);

        let batch = self.config.drive.batch_sectors;
        let job = self.job_context();
        let worker = Worker::spawn("sysenc-clone", move |cancel| {
            let _claim = claim;
            clone_job(dev, header, layout, source, batch, cancel, job)
        })?;
        self.running = Some(Running {
            kind: OperationKind::HiddenOsClone,
            worker,
        });
        Ok(())
    }

    pub fn hidden_os_creation_phase(&self) -> HiddenOsCreationPhase {
        self.state().hidden_os_phase
    }

    /// Persist `phase` and mirror it into the installed BIOS boot sector.
    pub fn set_hidden_os_creation_phase(&mut self, phase: HiddenOsCreationPhase) -> SysencResult<()> {
        if self
            .running
            .as_ref()
            .is_some_and(|r| !r.worker.is_finished())
        {
            return Err(SysencError::Busy(self.drive_number));
        }
        self.commit(|s| s.hidden_os_phase = phase)?;
        if self.firmware() == Firmware::Bios {
            let mut dev = self.open_drive()?;
            if bios::installed_loader(dev.as_mut())?.is_some() {
                bios::update_boot_config(
                    dev.as_mut(),
                    CFG_HIDDEN_OS_PHASE_MASK,
                    phase.boot_config_bits(),
                )?;
            }
        }
        tracing::info!(%phase, "hidden OS creation phase");
        Ok(())
    }

    /// Drop every trace of an unfinished hidden-OS creation.
    pub fn wipe_hidden_os_creation_config(&mut self) -> SysencResult<()> {
        self.ensure_idle()?;
        self.set_hidden_os_creation_phase(HiddenOsCreationPhase::None)?;
        self.commit(|s| {
            s.hidden_os = None;
            s.decoy_wipe = DecoySystemWipeStatus::default();
        })?;
        self.hidden = None;
        Ok(())
    }

    // ── Decoy wipe ───────────────────────────────────────────────────────

    /// Overwrite the decoy system partition on a worker thread. Resumes an
    /// earlier wipe with the same algorithm.
    pub fn start_decoy_os_wipe(&mut self, algorithm: WipeAlgorithm) -> SysencResult<()> {
        if algorithm == WipeAlgorithm::None {
            return Err(SysencError::Config(
                "choose a wipe algorithm for the decoy system".into(),
            ));
        }
        self.ensure_idle()?;
        let state = self.state();
        if !matches!(
            state.hidden_os_phase,
            HiddenOsCreationPhase::CloningFinished | HiddenOsCreationPhase::WipingDecoy
        ) {
            return Err(SysencError::InvalidState(format!(
                "the decoy system cannot be wiped in phase {}",
                state.hidden_os_phase
            )));
        }
        let system = self.drive_configuration()?.system_partition;
        let resume = if state.decoy_wipe.algorithm == algorithm
            && state.decoy_wipe.total == system.length
        {
            state.decoy_wipe.offset.min(system.length)
        } else {
            0
        };

        let claim = DriveClaim::acquire(self.drive_number)?;
        let dev = self.open_drive()?;
        self.set_hidden_os_creation_phase(HiddenOsCreationPhase::WipingDecoy)?;
        self.commit(|s| {
            s.decoy_wipe = DecoySystemWipeStatus {
                in_progress: true,
                algorithm,
                offset: resume,
                total: system.length,
                last_error: None,
            };
        })?;

        let batch = self.config.drive.batch_sectors;
        let job = self.job_context();
        let (start, length) = (system.start_offset, system.length);
        let worker = Worker::spawn("sysenc-decoy-wipe", move |cancel| {
            let _claim = claim;
            decoy_wipe_job(dev, algorithm, start, length, resume, batch, cancel, job)
        })?;
        self.running = Some(Running {
            kind: OperationKind::DecoyWipe,
            worker,
        });
        Ok(())
    }

    pub fn abort_decoy_os_wipe(&mut self) -> SysencResult<()> {
        if self
            .running
            .as_ref()
            .is_some_and(|r| r.kind == OperationKind::DecoyWipe)
        {
            self.abort();
            if let Some((_, Err(f))) = self.collect() {
                if !f.is_interruption() {
                    return Err(f.error);
                }
            }
        }
        Ok(())
    }

    pub fn decoy_os_wipe_status(&self) -> DecoySystemWipeStatus {
        self.state().decoy_wipe
    }

    pub fn check_decoy_os_wipe_result(&mut self) -> Result<SetupResult, TransformFailure> {
        let state = self.state();
        let wipe_finished = self
            .running
            .as_ref()
            .filter(|r| r.kind == OperationKind::DecoyWipe)
            .map(|r| r.worker.is_finished());
        match wipe_finished {
            Some(false) => Ok(SetupResult::InProgress),
            Some(true) => match self.collect() {
                Some((_, Err(f))) if f.is_interruption() => Ok(SetupResult::Aborted),
                Some((_, Err(f))) => Err(f),
                _ => Ok(SetupResult::Completed),
            },
            None => match (state.hidden_os_phase, &state.decoy_wipe.last_error) {
                (HiddenOsCreationPhase::DecoyWiped, _) => Ok(SetupResult::Completed),
                (_, Some(error)) => Err(fail(
                    SysencError::Other(anyhow!("{error}")),
                    state.decoy_wipe.offset,
                )),
                (HiddenOsCreationPhase::WipingDecoy, None) => Ok(SetupResult::Aborted),
                _ => Ok(SetupResult::InProgress),
            },
        }
    }

    // ── Removal and checks ───────────────────────────────────────────────

    /// Remove the boot loader and the volume header. Only allowed when
    /// nothing on the drive is encrypted.
    pub fn deinstall(&mut self) -> SysencResult<()> {
        self.ensure_idle()?;
        let state = self.state();
        if state.status == SetupStatus::Uninstalled {
            return Ok(());
        }
        let still_encrypted = state.encrypted_bytes() > 0
            || matches!(
                state.status,
                SetupStatus::Encrypted | SetupStatus::Encrypting | SetupStatus::Decrypting
            )
            || self
                .active
                .as_ref()
                .is_some_and(|h| h.fields().geometry.encrypted_area_length > 0);
        if still_encrypted {
            return Err(SysencError::InvalidState(
                "decrypt the drive before removing the boot loader".into(),
            ));
        }

        let passes = self.config.encryption.header_wipe_passes;
        let mut dev = self.open_drive()?;
        match self.firmware() {
            Firmware::Bios => {
                let backup = match &state.original_loader_backup {
                    Some(path) if path.exists() => {
                        let raw = std::fs::read(path)
                            .with_context(|| format!("reading {}", path.display()))?;
                        Some(BiosBackup::from_bytes(raw)?)
                    }
                    _ => None,
                };
                bios::uninstall(dev.as_mut(), backup.as_ref(), passes)?;
                if let Some(path) = &state.original_loader_backup {
                    remove_if_exists(path)?;
                }
            }
            Firmware::Efi => {
                let cfg = self.drive_configuration()?;
                let layout = EfiLayout::locate(&cfg, &self.config.boot)?;
                EfiInstaller::new(&*self.host.executor, layout).uninstall()?;
                erase_boot_volume_header(dev.as_mut(), passes, &[0u8; SECTOR_SIZE as usize])?;
            }
        }
        if let Some(path) = &state.header_backup {
            remove_if_exists(path)?;
        }

        let drive_number = self.drive_number;
        self.commit(|s| {
            *s = OperationState {
                drive_number,
                ..OperationState::default()
            }
        })?;
        self.active = None;
        self.hidden = None;
        self.prepared = None;
        tracing::info!(drive = drive_number, "boot encryption removed");
        Ok(())
    }

    /// `IntegrityMismatch` unless the installed loader is the one the
    /// loader source would install now.
    pub fn check_bootloader_fingerprint(&mut self) -> SysencResult<()> {
        let state = self.state();
        match self.firmware() {
            Firmware::Bios => {
                let mut dev = self.open_drive()?;
                let found = bios::installed_fingerprint(dev.as_mut())?.ok_or_else(|| {
                    SysencError::IntegrityMismatch("no sysenc boot loader on the drive".into())
                })?;
                let algorithm = state.algorithm.unwrap_or(EncryptionAlgorithm::Aes);
                let prf = state.prf.unwrap_or(self.config.encryption.prf);
                let expected =
                    BootLoaderImage::assemble(&*self.host.loaders, algorithm, prf, false, false)?;
                found.verify(&expected.fingerprint())
            }
            Firmware::Efi => {
                let cfg = self.drive_configuration()?;
                let layout = EfiLayout::locate(&cfg, &self.config.boot)?;
                EfiInstaller::new(&*self.host.executor, layout)
                    .check_fingerprint(&*self.host.loaders)
            }
        }
    }

    pub fn installed_boot_loader_version(&mut self) -> SysencResult<Option<String>> {
        match self.firmware() {
            Firmware::Bios => {
                let mut dev = self.open_drive()?;
                Ok(bios::installed_loader(dev.as_mut())?.map(|l| version_string(l.version())))
            }
            Firmware::Efi => {
                let cfg = self.drive_configuration()?;
                let layout = EfiLayout::locate(&cfg, &self.config.boot)?;
                EfiInstaller::new(&*self.host.executor, layout).installed_version()
            }
        }
    }

    /// Read the rescue image at `path` and report what it holds.
    pub fn inspect_rescue_disk_image(path: &Path) -> SysencResult<String> {
        let iso = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let contents = parse_rescue_image(&iso)?;
        let loader = sysenc_boot::InstalledLoader::parse(
            &[contents.boot_sector, contents.loader_area].concat(),
        );
        Ok(match loader {
            Some(l) => format!("rescue disk, loader {}", version_string(l.version())),
            None => "rescue disk, loader unrecognised".to_string(),
        })
    }
}

impl Drop for BootEncryption {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            if !running.worker.is_finished() {
                tracing::info!("stopping {} before shutdown", running.worker.name());
                running.worker.cancel();
            }
        }
        let _ = self.collect();
    }
}

fn clone_job(
    mut dev: Box<dyn BlockDevice>,
    header: UnlockedHeader,
    layout: HiddenOsLayout,
    source: u64,
    batch: u32,
    cancel: CancellationToken,
    job: JobContext,
) -> WorkerOutcome {
    let result = clone_encrypted(
        dev.as_mut(),
        header.context(),
        source,
        layout.data_start,
        layout.data_length,
        layout.cloned,
        batch,
        &cancel,
        &mut |dev, done| {
            let sealed = header.seal_with_area(layout.data_start, done)?;
            write_header_at(dev, layout.header_offset, &sealed)?;
            let mut file = lock_state(&job.state);
            file.commit(|s| {
                if let Some(h) = s.hidden_os.as_mut() {
                    h.cloned = done;
                }
            })?;
            job.poll_abort(&file, &cancel);
            drop(file);
            job.report(done, layout.data_length, "cloning");
            Ok(())
        },
    );

    let committed = lock_state(&job.state).commit(|s| match &result {
        Ok(_) => {
            s.hidden_os_phase = HiddenOsCreationPhase::CloningFinished;
            s.last_error = None;
        }
        Err(f) if !f.is_interruption() => s.last_error = Some(f.to_string()),
        Err(_) => {}
    });
    if let Err(e) = committed {
        tracing::warn!("persisting clone outcome: {e}");
    }
    match &result {
        Ok(_) => tracing::info!("hidden system cloned"),
        Err(f) => tracing::warn!("hidden system clone stopped: {f}"),
    }
    job.mailbox.update(|m| {
        m.setup_in_progress = false;
        if result.is_ok() {
            m.hidden_os_phase = HiddenOsCreationPhase::CloningFinished;
        }
    });
    WorkerOutcome {
        result,
        header: Some(header),
    }
}

#[allow(clippy::too_many_arguments)]
fn decoy_wipe_job(
    mut dev: Box<dyn BlockDevice>,
    algorithm: WipeAlgorithm,
    start: u64,
    length: u64,
    resume: u64,
    batch: u32,
    cancel: CancellationToken,
    job: JobContext,
) -> WorkerOutcome {
    let result = wipe_range(
        dev.as_mut(),
        algorithm,
        start,
        length,
        resume,
        batch,
        &cancel,
        &mut |_, done| {
            let mut file = lock_state(&job.state);
            file.commit(|s| s.decoy_wipe.offset = done)?;
            job.poll_abort(&file, &cancel);
            drop(file);
            job.report(done, length, "wiping");
            Ok(())
        },
    );

    let offset = match &result {
        Ok(done) => *done,
        Err(f) => f.confirmed_offset,
    };
    let committed = lock_state(&job.state).commit(|s| {
        s.decoy_wipe.in_progress = false;
        s.decoy_wipe.offset = offset;
        s.decoy_wipe.last_error = match &result {
            Err(f) if !f.is_interruption() => Some(f.error.to_string()),
            _ => None,
        };
        if result.is_ok() {
            s.hidden_os_phase = HiddenOsCreationPhase::DecoyWiped;
        }
    });
    if let Err(e) = committed {
        tracing::warn!("persisting decoy wipe outcome: {e}");
    }
    match &result {
        Ok(_) => tracing::info!(%algorithm, "decoy system wiped"),
        Err(f) => tracing::warn!("decoy wipe stopped: {f}"),
    }
    job.mailbox.update(|m| {
        m.setup_in_progress = false;
        if result.is_ok() {
            m.hidden_os_phase = HiddenOsCreationPhase::DecoyWiped;
        }
    });
    WorkerOutcome {
        result,
        header: None,
    }
}
