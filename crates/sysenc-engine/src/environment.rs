//! The host as the orchestrator sees it: firmware type, swap, optical
//! recorders, mounts, and a way to open a drive.

use std::path::{Path, PathBuf};

use sysenc_core::config::DriveConfig;
use sysenc_core::SysencResult;
use sysenc_disk::{BlockDevice, FileDevice};

use crate::state::Firmware;

pub trait SystemEnvironment: Send + Sync {
    fn firmware(&self) -> Firmware;
    /// Active swap devices and files.
    fn paging_files(&self) -> Vec<PathBuf>;
    fn has_cd_recorder(&self) -> bool;
    /// (device, mount point) pairs.
    fn mounts(&self) -> Vec<(PathBuf, PathBuf)>;
}

/// Reads `/sys` and `/proc`.
#[derive(Debug, Default, Clone)]
pub struct HostEnvironment;

impl SystemEnvironment for HostEnvironment {
    fn firmware(&self) -> Firmware {
        if Path::new("/sys/firmware/efi").exists() {
            Firmware::Efi
        } else {
            Firmware::Bios
        }
    }

    fn paging_files(&self) -> Vec<PathBuf> {
        match std::fs::read_to_string("/proc/swaps") {
            Ok(text) => parse_swaps(&text),
            Err(e) => {
                tracing::debug!("swap table unavailable: {e}");
                Vec::new()
            }
        }
    }

    fn has_cd_recorder(&self) -> bool {
        std::fs::read_to_string("/proc/sys/dev/cdrom/info")
            .map(|text| cdrom_can_write(&text))
            .unwrap_or(false)
    }

    fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        sysenc_disk::inspect::read_mount_table()
    }
}

/// Paths from a `/proc/swaps` table (first column, header skipped).
pub fn parse_swaps(text: &str) -> Vec<PathBuf> {
    text.lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|p| PathBuf::from(p.replace("\\040", " ")))
        .collect()
}

/// True when any drive in `/proc/sys/dev/cdrom/info` can write CD-R.
pub fn cdrom_can_write(text: &str) -> bool {
    text.lines()
        .find_map(|line| line.strip_prefix("Can write CD-R:"))
        .is_some_and(|flags| flags.split_whitespace().any(|f| f == "1"))
}

/// Block device backing `path`: the path itself for a /dev node, otherwise
/// the device of the longest mount point containing it.
pub fn backing_device(path: &Path, mounts: &[(PathBuf, PathBuf)]) -> Option<PathBuf> {
    if path.starts_with("/dev") {
        return Some(path.to_path_buf());
    }
    mounts
        .iter()
        .filter(|(_, mount)| path.starts_with(mount))
        .max_by_key(|(_, mount)| mount.as_os_str().len())
        .map(|(dev, _)| dev.clone())
}

/// Opens drives by number.
pub trait DeviceProvider: Send + Sync {
    fn device_path(&self, drive_number: u32) -> PathBuf;
    fn open(&self, drive_number: u32) -> SysencResult<Box<dyn BlockDevice>>;
}

/// Raw device nodes resolved through the drive path template.
#[derive(Debug, Clone)]
pub struct FileDeviceProvider {
    drive: DriveConfig,
}

impl FileDeviceProvider {
    pub fn new(drive: DriveConfig) -> Self {
        Self { drive }
    }
}

/// Logical sector size from sysfs, 512 when unknown.
pub fn logical_sector_size(device: &Path) -> usize {
    let Some(name) = device.file_name() else {
        return 512;
    };
    let path = Path::new("/sys/class/block")
        .join(name)
        .join("queue/logical_block_size");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(512)
}

impl DeviceProvider for FileDeviceProvider {
    fn device_path(&self, drive_number: u32) -> PathBuf {
        self.drive.device_path(drive_number)
    }

    fn open(&self, drive_number: u32) -> SysencResult<Box<dyn BlockDevice>> {
        let path = self.device_path(drive_number);
        let dev = FileDevice::open(&path, logical_sector_size(&path))?;
        Ok(Box::new(dev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swaps_table() {
        let text = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
                    /dev/sda3                               partition\t8388604\t\t0\t\t-2\n\
                    /swap\\040file                          file\t\t1048572\t\t0\t\t-3\n";
        assert_eq!(
            parse_swaps(text),
            vec![PathBuf::from("/dev/sda3"), PathBuf::from("/swap file")]
        );
        assert!(parse_swaps("Filename Type Size Used Priority\n").is_empty());
    }

    #[test]
    fn cdrom_info() {
        let text = "CD-ROM information, Id: cdrom.c 3.20 2003/12/17\n\n\
                    drive name:\t\tsr0\n\
                    Can write CD-R:\t\t1\n";
        assert!(cdrom_can_write(text));
        assert!(!cdrom_can_write("drive name:\t\tsr0\nCan write CD-R:\t\t0\n"));
        assert!(!cdrom_can_write(""));
    }

    #[test]
    fn backing_device_prefers_longest_mount() {
        let mounts = vec![
            (PathBuf::from("/dev/sda2"), PathBuf::from("/")),
            (PathBuf::from("/dev/sdb1"), PathBuf::from("/data")),
        ];
        assert_eq!(
            backing_device(Path::new("/data/swapfile"), &mounts),
            Some(PathBuf::from("/dev/sdb1"))
        );
        assert_eq!(
            backing_device(Path::new("/swapfile"), &mounts),
            Some(PathBuf::from("/dev/sda2"))
        );
        assert_eq!(
            backing_device(Path::new("/dev/sda3"), &mounts),
            Some(PathBuf::from("/dev/sda3"))
        );
    }
}
