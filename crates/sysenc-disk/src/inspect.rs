//! Drive and partition inspection.
//!
//! `probe` reads the partition table of one drive and builds an immutable
//! [`SystemDriveConfiguration`] snapshot. Nothing here writes to the drive.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sysenc_core::{SysencError, SysencResult};
use uuid::Uuid;

use crate::device::BlockDevice;
use crate::gpt::{self, GptEntry};
use crate::mbr::{self, Mbr, MbrEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStyle {
    Mbr,
    Gpt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    EfiSystem,
    /// NTFS/exFAT (MBR 0x07) or GPT basic data
    BasicData,
    Fat,
    Extended,
    /// LDM dynamic disk member
    Dynamic,
    Recovery,
    MsReserved,
    Linux,
    /// Known type with no special handling (swap, LVM)
    Other,
    /// Type outside the standard set
    Unknown,
}

impl PartitionKind {
    pub fn from_mbr_type(t: u8) -> Self {
        match t {
            mbr::TYPE_EFI_SYSTEM => PartitionKind::EfiSystem,
            mbr::TYPE_NTFS => PartitionKind::BasicData,
            mbr::TYPE_FAT12
            | mbr::TYPE_FAT16_SMALL
            | mbr::TYPE_FAT16
            | mbr::TYPE_FAT32
            | mbr::TYPE_FAT32_LBA
            | mbr::TYPE_FAT16_LBA => PartitionKind::Fat,
            t if mbr::is_extended_type(t) => PartitionKind::Extended,
            mbr::TYPE_DYNAMIC => PartitionKind::Dynamic,
            mbr::TYPE_RECOVERY => PartitionKind::Recovery,
            mbr::TYPE_LINUX => PartitionKind::Linux,
            t if mbr::STANDARD_TYPES.contains(&t) => PartitionKind::Other,
            _ => PartitionKind::Unknown,
        }
    }

    pub fn from_gpt_type(guid: &Uuid) -> Self {
        match *guid {
            gpt::EFI_SYSTEM => PartitionKind::EfiSystem,
            gpt::BASIC_DATA => PartitionKind::BasicData,
            gpt::MS_RESERVED => PartitionKind::MsReserved,
            gpt::MS_RECOVERY => PartitionKind::Recovery,
            gpt::LDM_METADATA | gpt::LDM_DATA => PartitionKind::Dynamic,
            gpt::LINUX_FILESYSTEM => PartitionKind::Linux,
            g if gpt::STANDARD_TYPES.contains(&g) => PartitionKind::Other,
            _ => PartitionKind::Unknown,
        }
    }

    /// Could hold an operating system volume.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            PartitionKind::BasicData | PartitionKind::Fat | PartitionKind::Linux
        )
    }
}

/// Raw partition table entry a [`Partition`] was decoded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RawEntry {
    Mbr(MbrEntry),
    Gpt(GptEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeIdentity {
    Gpt(Uuid),
    Mbr { disk_signature: u32, start_lba: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub device_path: PathBuf,
    pub entry: RawEntry,
    pub mount_point: Option<PathBuf>,
    /// 1-based; MBR logical partitions start at 5
    pub number: u32,
    pub is_gpt: bool,
    pub identity: VolumeIdentity,
    pub start_offset: u64,
    pub length: u64,
    pub kind: PartitionKind,
    pub bootable: bool,
    /// Inside an extended partition
    pub logical: bool,
}

impl Partition {
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.length
    }

    pub fn start_sector(&self, sector_size: u32) -> u64 {
        self.start_offset / u64::from(sector_size)
    }
}

/// Snapshot of a drive's layout, built once per probe.
#[derive(Debug, Clone, Serialize)]
pub struct SystemDriveConfiguration {
    pub drive_number: u32,
    pub device_path: PathBuf,
    /// Ordered by start offset
    pub partitions: Vec<Partition>,
    pub system_partition: Partition,
    pub extra_boot_partition_present: bool,
    /// Free bytes directly after the system partition
    pub initial_unallocated_space: u64,
    /// Free bytes on the whole drive
    pub total_unallocated_space: u64,
    pub style: PartitionStyle,
    pub drive_size: u64,
    pub sector_size: u32,
    /// The MBR code area holds boot code
    pub system_loader_present: bool,
    pub disk_signature: u32,
    pub disk_guid: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    pub device_path: PathBuf,
    /// Explicit system partition number
    pub system_partition: Option<u32>,
    /// (device, mount point) pairs used to fill `Partition::mount_point`
    pub mounts: Vec<(PathBuf, PathBuf)>,
}

/// Partition device path: `/dev/sda` + 1 → `/dev/sda1`, `/dev/nvme0n1` + 1 → `/dev/nvme0n1p1`.
pub fn partition_device_path(drive: &Path, number: u32) -> PathBuf {
    let s = drive.to_string_lossy();
    if s.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        PathBuf::from(format!("{s}p{number}"))
    } else {
        PathBuf::from(format!("{s}{number}"))
    }
}

/// Parse a `/proc/self/mounts` style table into (device, mount point) pairs.
pub fn parse_mount_table(text: &str) -> Vec<(PathBuf, PathBuf)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let dev = fields.next()?;
            let mount = fields.next()?;
            dev.starts_with('/')
                .then(|| (PathBuf::from(dev), PathBuf::from(mount.replace("\\040", " "))))
        })
        .collect()
}

/// Read the current mount table; empty when unavailable.
pub fn read_mount_table() -> Vec<(PathBuf, PathBuf)> {
    match std::fs::read_to_string("/proc/self/mounts") {
        Ok(text) => parse_mount_table(&text),
        Err(e) => {
            tracing::debug!("mount table unavailable: {e}");
            Vec::new()
        }
    }
}

/// Read and classify the partition table of a drive.
pub fn probe(
    dev: &mut dyn BlockDevice,
    drive_number: u32,
    opts: &ProbeOptions,
) -> SysencResult<SystemDriveConfiguration> {
    let ss = dev.sector_size();
    let sector_size = u32::try_from(ss)
        .map_err(|_| SysencError::Device(format!("sector size {ss} out of range")))?;
    let drive_size = dev.len();
    let mut sector0 = vec![0u8; ss.max(mbr::MBR_SIZE)];
    dev.read_sectors(0, &mut sector0[..ss])
        .map_err(|e| SysencError::device("reading sector 0", e))?;
    let mbr = Mbr::parse(&sector0)?;

    let mount_of = |path: &Path| {
        opts.mounts
            .iter()
            .find(|(d, _)| d == path)
            .map(|(_, m)| m.clone())
    };

    let mut partitions = Vec::new();
    let (style, disk_guid, usable) = if mbr.is_gpt_protective() {
        let (header, entries) = gpt::read_gpt(dev)?;
        for (slot, entry) in entries {
            let number = slot + 1;
            let device_path = partition_device_path(&opts.device_path, number);
            partitions.push(Partition {
                mount_point: mount_of(&device_path),
                device_path,
                number,
                is_gpt: true,
                identity: VolumeIdentity::Gpt(entry.unique_guid),
                start_offset: entry.first_lba * u64::from(sector_size),
                length: entry.sector_count() * u64::from(sector_size),
                kind: PartitionKind::from_gpt_type(&entry.type_guid),
                bootable: false,
                logical: false,
                entry: RawEntry::Gpt(entry),
            });
        }
        let usable = (
            header.first_usable_lba * u64::from(sector_size),
            (header.last_usable_lba + 1) * u64::from(sector_size),
        );
        (PartitionStyle::Gpt, Some(header.disk_guid), usable)
    } else {
        let disk_signature = mbr.disk_signature();
        let mut push = |entry: MbrEntry, start_lba: u64, number: u32, logical: bool| {
            let device_path = partition_device_path(&opts.device_path, number);
            partitions.push(Partition {
                mount_point: mount_of(&device_path),
                device_path,
                number,
                is_gpt: false,
                identity: VolumeIdentity::Mbr {
                    disk_signature,
                    start_lba,
                },
                start_offset: start_lba * u64::from(sector_size),
                length: u64::from(entry.sector_count) * u64::from(sector_size),
                kind: PartitionKind::from_mbr_type(entry.partition_type),
                bootable: entry.bootable,
                logical,
                entry: RawEntry::Mbr(entry),
            });
        };

        let mut extended = Vec::new();
        for (i, entry) in mbr.entries.iter().enumerate() {
            if entry.is_empty() {
                continue;
            }
            push(*entry, u64::from(entry.start_lba), i as u32 + 1, false);
            if mbr::is_extended_type(entry.partition_type) {
                extended.push(u64::from(entry.start_lba));
            }
        }
        let mut number = 5;
        for ext_lba in extended {
            for logical in mbr::read_logical_partitions(dev, ext_lba)? {
                push(logical.entry, logical.start_lba, number, true);
                number += 1;
            }
        }
        (
            PartitionStyle::Mbr,
            None,
            (u64::from(sector_size), drive_size),
        )
    };

    partitions.sort_by_key(|p| (p.start_offset, p.logical));

    let system_partition = choose_system_partition(&partitions, opts.system_partition)?.clone();
    let extra_boot_partition_present = partitions.iter().any(|p| {
        p.kind == PartitionKind::EfiSystem
            || (p.bootable && p.number != system_partition.number)
    });

    let top_level: Vec<&Partition> = partitions.iter().filter(|p| !p.logical).collect();
    let initial_unallocated_space = unallocated_after(&partitions, &system_partition, usable.1);
    let total_unallocated_space = total_unallocated(&top_level, usable);

    let config = SystemDriveConfiguration {
        drive_number,
        device_path: opts.device_path.clone(),
        system_partition,
        extra_boot_partition_present,
        initial_unallocated_space,
        total_unallocated_space,
        style,
        drive_size,
        sector_size,
        system_loader_present: !mbr.code_area_is_blank(),
        disk_signature: mbr.disk_signature(),
        disk_guid,
        partitions,
    };

    tracing::info!(
        drive = drive_number,
        style = ?config.style,
        partitions = config.partitions.len(),
        system_partition = config.system_partition.number,
        "drive probed"
    );
    Ok(config)
}

fn choose_system_partition(
    partitions: &[Partition],
    hint: Option<u32>,
) -> SysencResult<&Partition> {
    if let Some(number) = hint {
        return partitions
            .iter()
            .find(|p| p.number == number)
            .ok_or_else(|| {
                SysencError::InvalidState(format!("system partition {number} not found"))
            });
    }
    if let Some(active) = partitions
        .iter()
        .find(|p| p.bootable && p.kind.is_data())
    {
        return Ok(active);
    }
    partitions
        .iter()
        .filter(|p| p.kind.is_data())
        .max_by_key(|p| p.length)
        .ok_or_else(|| SysencError::UnsupportedLayout("no system partition candidate".into()))
}

fn unallocated_after(partitions: &[Partition], system: &Partition, usable_end: u64) -> u64 {
    let end = system.end_offset();
    let next_start = partitions
        .iter()
        .filter(|p| p.start_offset >= end)
        .filter(|p| p.logical == system.logical || !p.logical)
        .map(|p| p.start_offset)
        .min()
        .unwrap_or(usable_end);
    next_start.saturating_sub(end)
}

fn total_unallocated(top_level: &[&Partition], usable: (u64, u64)) -> u64 {
    let (mut cursor, end) = usable;
    let mut free = 0;
    for p in top_level {
        if p.start_offset > cursor {
            free += p.start_offset - cursor;
        }
        cursor = cursor.max(p.end_offset());
    }
    free + end.saturating_sub(cursor)
}

/// Fails with `UnsupportedLayout` for dynamic disks, more than one
/// extended partition or partition types outside the standard set.
pub fn check_supported_layout(config: &SystemDriveConfiguration) -> SysencResult<()> {
    if config.contains_partition_type(PartitionKind::Dynamic) {
        return Err(SysencError::UnsupportedLayout(
            "dynamic (LDM) disks are not supported".into(),
        ));
    }
    let extended = config
        .partitions
        .iter()
        .filter(|p| p.kind == PartitionKind::Extended)
        .count();
    if extended > 1 {
        return Err(SysencError::UnsupportedLayout(format!(
            "{extended} extended partitions"
        )));
    }
    if let Some(p) = config
        .partitions
        .iter()
        .find(|p| p.kind == PartitionKind::Unknown)
    {
        let ty = match &p.entry {
            RawEntry::Mbr(e) => format!("0x{:02x}", e.partition_type),
            RawEntry::Gpt(e) => e.type_guid.to_string(),
        };
        return Err(SysencError::UnsupportedLayout(format!(
            "partition {} has non-standard type {ty}",
            p.number
        )));
    }
    Ok(())
}

impl SystemDriveConfiguration {
    pub fn contains_partition_type(&self, kind: PartitionKind) -> bool {
        self.partitions.iter().any(|p| p.kind == kind)
    }

    pub fn contains_extended_partition(&self) -> bool {
        self.contains_partition_type(PartitionKind::Extended)
    }

    /// No other data partitions and no room left: everything besides boot
    /// support partitions belongs to the system partition.
    pub fn system_partition_covers_whole_drive(&self) -> bool {
        let others = self.partitions.iter().any(|p| {
            p.number != self.system_partition.number
                && !matches!(
                    p.kind,
                    PartitionKind::EfiSystem | PartitionKind::MsReserved | PartitionKind::Recovery
                )
        });
        !others && self.initial_unallocated_space < 64 * 1024 * 1024
    }

    pub fn esp_partition(&self) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.kind == PartitionKind::EfiSystem)
    }

    /// The partition that starts closest after the system partition.
    pub fn partition_after_system(&self) -> Option<&Partition> {
        let end = self.system_partition.end_offset();
        self.partitions
            .iter()
            .filter(|p| p.start_offset >= end && p.kind != PartitionKind::Extended)
            .min_by_key(|p| p.start_offset)
    }

    pub fn is_gpt(&self) -> bool {
        self.style == PartitionStyle::Gpt
    }
}
