//! EFI target: loader files on the EFI system partition.
//!
//! Every file operation goes through a [`PrivilegedExecutor`].

use std::path::{Path, PathBuf};

use sysenc_core::config::BootLoaderConfig;
use sysenc_core::privileged::{
    copy_file, delete_file, file_exists, make_dir, read_file, write_file, PrivilegedExecutor,
};
use sysenc_core::{SysencError, SysencResult};
use sysenc_crypto::LoaderFingerprint;
use sysenc_disk::SystemDriveConfiguration;

use crate::conf::{BootConfig, BootSettings};
use crate::image::{version_string, BOOT_LOADER_VERSION};
use crate::source::{EfiFile, LoaderComponent, LoaderSource};

const VERSION_FILE: &str = "version";

/// Absolute paths of everything the installer touches on the ESP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiLayout {
    pub esp_root: PathBuf,
    pub vendor_dir: PathBuf,
    pub boot_path: PathBuf,
    pub backup_path: PathBuf,
    pub config_path: PathBuf,
    /// Backup path as the firmware sees it (`\EFI\...`)
    pub backup_firmware_path: String,
}

impl EfiLayout {
    pub fn new(esp_root: &Path, cfg: &BootLoaderConfig) -> Self {
        let vendor_dir = esp_root.join(&cfg.vendor_dir);
        let backup_rel = Path::new(&cfg.vendor_dir).join(&cfg.backup_name);
        let backup_firmware_path = format!(
            "\\{}",
            backup_rel.to_string_lossy().replace('/', "\\")
        );
        Self {
            esp_root: esp_root.to_path_buf(),
            boot_path: esp_root.join(&cfg.boot_path),
            backup_path: vendor_dir.join(&cfg.backup_name),
            config_path: vendor_dir.join(&cfg.config_file),
            vendor_dir,
            backup_firmware_path,
        }
    }

    /// Find the ESP of `drive` and where it is mounted. The configured mount
    /// path wins over the mount table.
    pub fn locate(drive: &SystemDriveConfiguration, cfg: &BootLoaderConfig) -> SysencResult<Self> {
        let esp = drive.esp_partition().ok_or_else(|| {
            SysencError::UnsupportedLayout(format!(
                "no EFI system partition on {}",
                drive.device_path.display()
            ))
        })?;
        let root = cfg
            .esp_mount
            .clone()
            .or_else(|| esp.mount_point.clone())
            .ok_or_else(|| {
                SysencError::Config(format!(
                    "EFI system partition {} is not mounted; set boot.esp_mount",
                    esp.device_path.display()
                ))
            })?;
        tracing::debug!(esp = %esp.device_path.display(), root = %root.display(), "located ESP");
        Ok(Self::new(&root, cfg))
    }

    fn vendor_file(&self, file: EfiFile) -> PathBuf {
        self.vendor_dir.join(file.file_name())
    }

    fn version_path(&self) -> PathBuf {
        self.vendor_dir.join(VERSION_FILE)
    }
}

pub struct EfiInstaller<'a> {
    exec: &'a dyn PrivilegedExecutor,
    layout: EfiLayout,
}

impl<'a> EfiInstaller<'a> {
    pub fn new(exec: &'a dyn PrivilegedExecutor, layout: EfiLayout) -> Self {
        Self { exec, layout }
    }

    pub fn layout(&self) -> &EfiLayout {
        &self.layout
    }

    /// Create the vendor directory and the parent of the boot path.
    pub fn prepare_esp(&self) -> SysencResult<()> {
        make_dir(self.exec, &self.layout.vendor_dir)?;
        if let Some(parent) = self.layout.boot_path.parent() {
            make_dir(self.exec, parent)?;
        }
        Ok(())
    }

    fn is_ours(&self, bytes: &[u8]) -> SysencResult<bool> {
        let ours = self.layout.vendor_file(EfiFile::Boot);
        if !file_exists(self.exec, &ours)? {
            return Ok(false);
        }
        Ok(read_file(self.exec, &ours)? == bytes)
    }

    /// Copy the loader set onto the ESP and take over the boot path.
    ///
    /// A foreign loader at the boot path is saved to the backup path first.
    pub fn install(
        &self,
        source: &dyn LoaderSource,
        settings: &BootSettings,
        preserve_user_config: bool,
    ) -> SysencResult<()> {
        self.prepare_esp()?;

        let boot = source.load(LoaderComponent::Efi(EfiFile::Boot))?;
        let mut has_backup = file_exists(self.exec, &self.layout.backup_path)?;
        if file_exists(self.exec, &self.layout.boot_path)? {
            let current = read_file(self.exec, &self.layout.boot_path)?;
            if current != boot && !self.is_ours(&current)? {
                write_file(self.exec, &self.layout.backup_path, &current)?;
                has_backup = true;
                tracing::info!(
                    from = %self.layout.boot_path.display(),
                    to = %self.layout.backup_path.display(),
                    "backed up system loader"
                );
            }
        }

        for file in EfiFile::INSTALLED {
            let bytes = source.load(LoaderComponent::Efi(file))?;
            write_file(self.exec, &self.layout.vendor_file(file), &bytes)?;
        }
        write_file(
            self.exec,
            &self.layout.version_path(),
            version_string(BOOT_LOADER_VERSION).as_bytes(),
        )?;

        let mut settings = settings.clone();
        settings.chain_loader = has_backup.then(|| self.layout.backup_firmware_path.clone());
        self.update_config(&settings, preserve_user_config)?;

        write_file(self.exec, &self.layout.boot_path, &boot)?;
        tracing::info!(esp = %self.layout.esp_root.display(), "EFI boot loader installed");
        Ok(())
    }

    pub fn read_config(&self) -> SysencResult<Option<BootConfig>> {
        if !file_exists(self.exec, &self.layout.config_path)? {
            return Ok(None);
        }
        BootConfig::parse(&read_file(self.exec, &self.layout.config_path)?).map(Some)
    }

    /// Rewrite the configuration block, keeping unknown keys.
    pub fn update_config(
        &self,
        settings: &BootSettings,
        preserve_user_config: bool,
    ) -> SysencResult<()> {
        let config = match self.read_config()? {
            Some(mut existing) => {
                existing.apply(settings, preserve_user_config);
                existing
            }
            None => BootConfig::from_settings(settings),
        };
        write_file(self.exec, &self.layout.config_path, &config.to_bytes())
    }

    /// Change only the PRF and PIM entries, e.g. after a password change.
    pub fn update_credentials(&self, prf: Option<sysenc_core::Prf>, pim: u32) -> SysencResult<()> {
        let Some(mut config) = self.read_config()? else {
            return Err(SysencError::InvalidState(
                "no boot configuration on the ESP".into(),
            ));
        };
        let settings = BootSettings {
            password_prompt: config
                .get(crate::conf::KEY_PASSWORD_MSG)
                .unwrap_or_default()
                .to_string(),
            prf,
            pim,
            chain_loader: config
                .get(crate::conf::KEY_ACTION_SUCCESS)
                .and_then(|v| v.strip_prefix("postexec file("))
                .and_then(|v| v.strip_suffix(')'))
                .map(str::to_string),
        };
        config.apply(&settings, true);
        write_file(self.exec, &self.layout.config_path, &config.to_bytes())
    }

    pub fn installed_fingerprint(&self) -> SysencResult<Option<LoaderFingerprint>> {
        if !file_exists(self.exec, &self.layout.boot_path)? {
            return Ok(None);
        }
        let bytes = read_file(self.exec, &self.layout.boot_path)?;
        Ok(Some(LoaderFingerprint::compute(&bytes)))
    }

    /// `IntegrityMismatch` unless the boot path holds `source`'s loader.
    pub fn check_fingerprint(&self, source: &dyn LoaderSource) -> SysencResult<()> {
        let expected =
            LoaderFingerprint::compute(&source.load(LoaderComponent::Efi(EfiFile::Boot))?);
        match self.installed_fingerprint()? {
            Some(found) => found.verify(&expected),
            None => Err(SysencError::IntegrityMismatch(format!(
                "no boot loader at {}",
                self.layout.boot_path.display()
            ))),
        }
    }

    pub fn installed_version(&self) -> SysencResult<Option<String>> {
        let path = self.layout.version_path();
        if !file_exists(self.exec, &path)? {
            return Ok(None);
        }
        let raw = read_file(self.exec, &path)?;
        Ok(Some(String::from_utf8_lossy(&raw).trim().to_string()))
    }

    /// Put the backed-up system loader back at the boot path. Returns
    /// false when there was no backup.
    pub fn restore_system_loader(&self) -> SysencResult<bool> {
        if !file_exists(self.exec, &self.layout.backup_path)? {
            tracing::warn!("no system loader backup to restore");
            return Ok(false);
        }
        copy_file(self.exec, &self.layout.backup_path, &self.layout.boot_path)?;
        delete_file(self.exec, &self.layout.backup_path)?;
        tracing::info!(path = %self.layout.boot_path.display(), "system loader restored");
        Ok(true)
    }

    /// Restore the system loader and remove every file we placed.
    pub fn uninstall(&self) -> SysencResult<()> {
        let restored = self.restore_system_loader()?;
        if !restored && file_exists(self.exec, &self.layout.boot_path)? {
            let current = read_file(self.exec, &self.layout.boot_path)?;
            if self.is_ours(&current)? {
                delete_file(self.exec, &self.layout.boot_path)?;
            }
        }
        let mut ours: Vec<PathBuf> = EfiFile::INSTALLED
            .iter()
            .map(|f| self.layout.vendor_file(*f))
            .collect();
        ours.push(self.layout.config_path.clone());
        ours.push(self.layout.version_path());
        for path in ours {
            if file_exists(self.exec, &path)? {
                delete_file(self.exec, &path)?;
            }
        }
        tracing::info!(esp = %self.layout.esp_root.display(), "EFI boot loader removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::KEY_ACTION_SUCCESS;
    use crate::test_source;
    use sysenc_core::privileged::LocalExecutor;
    use sysenc_core::Prf;

    fn settings() -> BootSettings {
        BootSettings {
            password_prompt: "Password: ".into(),
            prf: Some(Prf::Sha512),
            pim: 0,
            chain_loader: None,
        }
    }

    fn layout(root: &Path) -> EfiLayout {
        EfiLayout::new(root, &BootLoaderConfig::default())
    }

    #[test]
    fn layout_paths() {
        let l = layout(Path::new("/boot/efi"));
        assert_eq!(l.boot_path, PathBuf::from("/boot/efi/EFI/Boot/bootx64.efi"));
        assert_eq!(
            l.backup_path,
            PathBuf::from("/boot/efi/EFI/sysenc/original_loader.efi")
        );
        assert_eq!(l.backup_firmware_path, "\\EFI\\sysenc\\original_loader.efi");
    }

    #[test]
    fn install_backs_up_foreign_loader_and_restores_it() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor;
        let installer = EfiInstaller::new(&exec, layout(dir.path()));
        let source = test_source(1000);

        let boot_path = dir.path().join("EFI/Boot/bootx64.efi");
        std::fs::create_dir_all(boot_path.parent().unwrap()).unwrap();
        std::fs::write(&boot_path, b"vendor os loader").unwrap();

        installer.install(&source, &settings(), false).unwrap();
        installer.check_fingerprint(&source).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("EFI/sysenc/original_loader.efi")).unwrap(),
            b"vendor os loader"
        );
        let config = installer.read_config().unwrap().unwrap();
        assert!(config.get(KEY_ACTION_SUCCESS).unwrap().contains("original_loader.efi"));
        assert_eq!(installer.installed_version().unwrap().as_deref(), Some("0.5.0"));

        // Reinstalling must not back up our own loader over the original.
        installer.install(&source, &settings(), true).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("EFI/sysenc/original_loader.efi")).unwrap(),
            b"vendor os loader"
        );

        installer.uninstall().unwrap();
        assert_eq!(std::fs::read(&boot_path).unwrap(), b"vendor os loader");
        assert!(!dir.path().join("EFI/sysenc/sysenc_boot.efi").exists());
        assert!(!dir.path().join("EFI/sysenc/DcsProp").exists());
    }

    #[test]
    fn fingerprint_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor;
        let installer = EfiInstaller::new(&exec, layout(dir.path()));
        let source = test_source(1000);
        installer.install(&source, &settings(), false).unwrap();

        std::fs::write(dir.path().join("EFI/Boot/bootx64.efi"), b"tampered").unwrap();
        assert!(matches!(
            installer.check_fingerprint(&source),
            Err(SysencError::IntegrityMismatch(_))
        ));
    }

    #[test]
    fn credentials_update_keeps_user_keys() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor;
        let installer = EfiInstaller::new(&exec, layout(dir.path()));
        installer.install(&test_source(1000), &settings(), false).unwrap();

        let mut config = installer.read_config().unwrap().unwrap();
        config.set("PasswordMsg", "Speak, friend: ");
        std::fs::write(&installer.layout().config_path, config.to_bytes()).unwrap();

        installer.update_credentials(Some(Prf::Argon2id), 700).unwrap();
        let config = installer.read_config().unwrap().unwrap();
        assert_eq!(config.get("PasswordMsg"), Some("Speak, friend: "));
        assert_eq!(config.prf(), Some(Prf::Argon2id));
        assert!(config.pim_requested());
    }

    #[test]
    fn locate_requires_esp() {
        use sysenc_disk::inspect::{RawEntry, VolumeIdentity};
        use sysenc_disk::{Partition, PartitionKind, PartitionStyle};

        let data = Partition {
            device_path: "/dev/sda1".into(),
            entry: RawEntry::Mbr(Default::default()),
            mount_point: None,
            number: 1,
            is_gpt: false,
            identity: VolumeIdentity::Mbr {
                disk_signature: 1,
                start_lba: 2048,
            },
            start_offset: 2048 * 512,
            length: 1 << 30,
            kind: PartitionKind::BasicData,
            bootable: true,
            logical: false,
        };
        let drive = SystemDriveConfiguration {
            drive_number: 0,
            device_path: "/dev/sda".into(),
            partitions: vec![data.clone()],
            system_partition: data,
            extra_boot_partition_present: false,
            initial_unallocated_space: 0,
            total_unallocated_space: 0,
            style: PartitionStyle::Mbr,
            drive_size: 2 << 30,
            sector_size: 512,
            system_loader_present: true,
            disk_signature: 1,
            disk_guid: None,
        };
        assert!(matches!(
            EfiLayout::locate(&drive, &BootLoaderConfig::default()),
            Err(SysencError::UnsupportedLayout(_))
        ));
    }
}
