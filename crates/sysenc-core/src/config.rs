use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SysencError, SysencResult};
use crate::types::{ChainingMode, EncryptionAlgorithm, Prf};

/// Top-level configuration (loaded from sysenc.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SysencConfig {
    pub log: LogConfig,
    pub encryption: EncryptionConfig,
    pub format: FormatConfig,
    pub boot: BootLoaderConfig,
    pub drive: DriveConfig,
    pub hidden_os: HiddenOsConfig,
}

impl SysencConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> SysencResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| SysencError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| SysencError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Defaults for new volume headers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub algorithm: EncryptionAlgorithm,
    pub mode: ChainingMode,
    pub prf: Prf,
    /// Personal iteration multiplier (0 = algorithm default)
    pub pim: u32,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost used when pim is 0 (default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Random overwrite passes for the old header on password change
    pub header_wipe_passes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    /// Cluster size in sectors (0 = pick from the volume size)
    pub cluster_size: u32,
    /// Skip the encrypted free-space fill
    pub quick_format: bool,
    /// Size of the buffered write window in KiB
    pub write_buffer_kib: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootLoaderConfig {
    /// Directory holding the boot loader component images
    pub loader_dir: PathBuf,
    /// Mount path of the EFI system partition (required for UEFI installs)
    pub esp_mount: Option<PathBuf>,
    /// Vendor directory on the ESP
    pub vendor_dir: String,
    /// Default boot path on the ESP that the loader takes over
    pub boot_path: String,
    /// File name (inside vendor_dir) for the backup of the original loader
    pub backup_name: String,
    /// File name (inside vendor_dir) of the boot configuration block
    pub config_file: String,
    /// Password prompt shown by the boot loader
    pub password_prompt: String,
    /// Where the rescue ISO image is written
    pub rescue_iso: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Device path template; `{n}` is the drive number, `{letter}` maps 0 → a
    pub device_template: String,
    /// System partition number override (default: detected)
    pub system_partition: Option<u32>,
    /// Persisted operation state (JSON)
    pub state_file: PathBuf,
    /// Sectors transformed per batch by the encryption worker
    pub batch_sectors: u32,
}

impl DriveConfig {
    /// Resolve the device path for a drive number.
    pub fn device_path(&self, drive_number: u32) -> PathBuf {
        let letter = char::from(b'a' + (drive_number % 26) as u8).to_string();
        PathBuf::from(
            self.device_template
                .replace("{n}", &drive_number.to_string())
                .replace("{letter}", &letter),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiddenOsConfig {
    /// Minimum hidden/decoy size ratio when the decoy filesystem is NTFS
    pub min_ratio_ntfs: f64,
    /// Minimum hidden/decoy size ratio when the decoy filesystem is FAT
    pub min_ratio_fat: f64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: EncryptionAlgorithm::Aes,
            mode: ChainingMode::Xts,
            prf: Prf::Sha512,
            pim: 0,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            header_wipe_passes: 3,
        }
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            cluster_size: 0,
            quick_format: false,
            write_buffer_kib: 1024,
        }
    }
}

impl Default for BootLoaderConfig {
    fn default() -> Self {
        Self {
            loader_dir: PathBuf::from("/usr/share/sysenc/boot"),
            esp_mount: None,
            vendor_dir: "EFI/sysenc".into(),
            boot_path: "EFI/Boot/bootx64.efi".into(),
            backup_name: "original_loader.efi".into(),
            config_file: "DcsProp".into(),
            password_prompt: "Enter password: ".into(),
            rescue_iso: PathBuf::from("~/.local/share/sysenc/rescue.iso"),
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device_template: "/dev/sd{letter}".into(),
            system_partition: None,
            state_file: PathBuf::from("/var/lib/sysenc/state.json"),
            batch_sectors: 256,
        }
    }
}

impl Default for HiddenOsConfig {
    fn default() -> Self {
        Self {
            min_ratio_ntfs: 2.1,
            min_ratio_fat: 1.05,
        }
    }
}
