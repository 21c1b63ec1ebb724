//! Master boot record and extended boot record codec

use serde::Serialize;
use sysenc_core::{SysencError, SysencResult};

use crate::device::BlockDevice;

pub const MBR_SIZE: usize = 512;
pub const CODE_AREA_SIZE: usize = 446;
pub const DISK_SIGNATURE_OFFSET: usize = 440;
pub const PARTITION_TABLE_OFFSET: usize = 446;
pub const PARTITION_ENTRY_SIZE: usize = 16;
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

pub const TYPE_EMPTY: u8 = 0x00;
pub const TYPE_FAT12: u8 = 0x01;
pub const TYPE_FAT16_SMALL: u8 = 0x04;
pub const TYPE_EXTENDED: u8 = 0x05;
pub const TYPE_FAT16: u8 = 0x06;
pub const TYPE_NTFS: u8 = 0x07;
pub const TYPE_FAT32: u8 = 0x0B;
pub const TYPE_FAT32_LBA: u8 = 0x0C;
pub const TYPE_FAT16_LBA: u8 = 0x0E;
pub const TYPE_EXTENDED_LBA: u8 = 0x0F;
pub const TYPE_RECOVERY: u8 = 0x27;
pub const TYPE_DYNAMIC: u8 = 0x42;
pub const TYPE_LINUX_SWAP: u8 = 0x82;
pub const TYPE_LINUX: u8 = 0x83;
pub const TYPE_LINUX_EXTENDED: u8 = 0x85;
pub const TYPE_LINUX_LVM: u8 = 0x8E;
pub const TYPE_GPT_PROTECTIVE: u8 = 0xEE;
pub const TYPE_EFI_SYSTEM: u8 = 0xEF;

/// Partition type bytes we know how to leave alone.
pub const STANDARD_TYPES: &[u8] = &[
    TYPE_FAT12,
    TYPE_FAT16_SMALL,
    TYPE_EXTENDED,
    TYPE_FAT16,
    TYPE_NTFS,
    TYPE_FAT32,
    TYPE_FAT32_LBA,
    TYPE_FAT16_LBA,
    TYPE_EXTENDED_LBA,
    TYPE_RECOVERY,
    TYPE_DYNAMIC,
    TYPE_LINUX_SWAP,
    TYPE_LINUX,
    TYPE_LINUX_EXTENDED,
    TYPE_LINUX_LVM,
    TYPE_GPT_PROTECTIVE,
    TYPE_EFI_SYSTEM,
];

pub fn is_extended_type(t: u8) -> bool {
    matches!(t, TYPE_EXTENDED | TYPE_EXTENDED_LBA | TYPE_LINUX_EXTENDED)
}

/// One 16-byte partition table slot. CHS fields are not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MbrEntry {
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    pub fn is_empty(&self) -> bool {
        self.partition_type == TYPE_EMPTY || self.sector_count == 0
    }

    fn parse(raw: &[u8]) -> Self {
        Self {
            bootable: raw[0] == 0x80,
            partition_type: raw[4],
            start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sector_count: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out.fill(0);
        if self.is_empty() {
            return;
        }
        out[0] = if self.bootable { 0x80 } else { 0x00 };
        // CHS "beyond 1024 cylinders" markers; LBA fields are authoritative.
        out[1..4].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
        out[4] = self.partition_type;
        out[5..8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
        out[8..12].copy_from_slice(&self.start_lba.to_le_bytes());
        out[12..16].copy_from_slice(&self.sector_count.to_le_bytes());
    }
}

/// Decoded sector 0.
#[derive(Clone, PartialEq, Eq)]
pub struct Mbr {
    pub code: [u8; CODE_AREA_SIZE],
    pub entries: [MbrEntry; 4],
}

impl std::fmt::Debug for Mbr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbr")
            .field("disk_signature", &format_args!("{:08x}", self.disk_signature()))
            .field("code_blank", &self.code_area_is_blank())
            .field("entries", &self.entries)
            .finish()
    }
}

impl Mbr {
    pub fn parse(sector: &[u8]) -> SysencResult<Self> {
        if sector.len() < MBR_SIZE {
            return Err(SysencError::InvalidBufferSize {
                expected: MBR_SIZE,
                actual: sector.len(),
            });
        }
        if sector[510..512] != BOOT_SIGNATURE {
            return Err(SysencError::Device(
                "partition table unreadable: missing 55 AA boot signature".into(),
            ));
        }
        let mut code = [0u8; CODE_AREA_SIZE];
        code.copy_from_slice(&sector[..CODE_AREA_SIZE]);
        let mut entries = [MbrEntry::default(); 4];
        for (i, entry) in entries.iter_mut().enumerate() {
            let off = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            *entry = MbrEntry::parse(&sector[off..off + PARTITION_ENTRY_SIZE]);
        }
        Ok(Self { code, entries })
    }

    pub fn to_bytes(&self) -> [u8; MBR_SIZE] {
        let mut out = [0u8; MBR_SIZE];
        out[..CODE_AREA_SIZE].copy_from_slice(&self.code);
        for (i, entry) in self.entries.iter().enumerate() {
            let off = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            entry.encode(&mut out[off..off + PARTITION_ENTRY_SIZE]);
        }
        out[510..512].copy_from_slice(&BOOT_SIGNATURE);
        out
    }

    /// Disk signature stored inside the code area at 440.
    pub fn disk_signature(&self) -> u32 {
        let o = DISK_SIGNATURE_OFFSET;
        u32::from_le_bytes([self.code[o], self.code[o + 1], self.code[o + 2], self.code[o + 3]])
    }

    pub fn set_disk_signature(&mut self, signature: u32) {
        let o = DISK_SIGNATURE_OFFSET;
        self.code[o..o + 4].copy_from_slice(&signature.to_le_bytes());
    }

    /// True when no boot code is present (bytes before the disk signature are zero).
    pub fn code_area_is_blank(&self) -> bool {
        self.code[..DISK_SIGNATURE_OFFSET].iter().all(|&b| b == 0)
    }

    pub fn is_gpt_protective(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.partition_type == TYPE_GPT_PROTECTIVE)
    }

    /// Replace the boot code, keeping disk signature and partition table.
    pub fn with_boot_code(&self, code: &[u8]) -> SysencResult<Self> {
        if code.len() > DISK_SIGNATURE_OFFSET {
            return Err(SysencError::ResourceExhausted(format!(
                "boot code is {} bytes, code area holds {DISK_SIGNATURE_OFFSET}",
                code.len()
            )));
        }
        let mut out = self.clone();
        out.code[..DISK_SIGNATURE_OFFSET].fill(0);
        out.code[..code.len()].copy_from_slice(code);
        Ok(out)
    }
}

/// A logical partition found in an extended partition's EBR chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalPartition {
    /// Absolute LBA of the EBR describing this partition
    pub ebr_lba: u64,
    pub entry: MbrEntry,
    /// Absolute start LBA of the partition data
    pub start_lba: u64,
}

/// Upper bound on EBR links followed; guards against loops.
const MAX_LOGICAL_PARTITIONS: usize = 128;

/// Walk the EBR chain of an extended partition starting at `extended_lba`.
pub fn read_logical_partitions(
    dev: &mut dyn BlockDevice,
    extended_lba: u64,
) -> SysencResult<Vec<LogicalPartition>> {
    let ss = dev.sector_size();
    let mut sector = vec![0u8; ss.max(MBR_SIZE)];
    let mut out = Vec::new();
    let mut ebr_lba = extended_lba;

    for _ in 0..MAX_LOGICAL_PARTITIONS {
        dev.read_sectors(ebr_lba, &mut sector[..ss])?;
        let ebr = Mbr::parse(&sector)?;
        let data = ebr.entries[0];
        if !data.is_empty() {
            out.push(LogicalPartition {
                ebr_lba,
                entry: data,
                start_lba: ebr_lba + u64::from(data.start_lba),
            });
        }
        let link = ebr.entries[1];
        if link.is_empty() || !is_extended_type(link.partition_type) {
            return Ok(out);
        }
        // Link offsets are relative to the outermost extended partition.
        ebr_lba = extended_lba + u64::from(link.start_lba);
    }

    Err(SysencError::UnsupportedLayout(format!(
        "extended partition at LBA {extended_lba} has more than {MAX_LOGICAL_PARTITIONS} logical partitions"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn sample() -> Mbr {
        let mut mbr = Mbr {
            code: [0u8; CODE_AREA_SIZE],
            entries: [MbrEntry::default(); 4],
        };
        mbr.set_disk_signature(0xDEADBEEF);
        mbr.entries[0] = MbrEntry {
            bootable: true,
            partition_type: TYPE_NTFS,
            start_lba: 2048,
            sector_count: 100_000,
        };
        mbr.entries[1] = MbrEntry {
            bootable: false,
            partition_type: TYPE_EXTENDED,
            start_lba: 102_048,
            sector_count: 50_000,
        };
        mbr
    }

    #[test]
    fn encode_parse() {
        let mbr = sample();
        let bytes = mbr.to_bytes();
        assert_eq!(&bytes[510..], &BOOT_SIGNATURE);
        assert_eq!(bytes[446], 0x80);
        assert_eq!(bytes[446 + 4], TYPE_NTFS);
        let parsed = Mbr::parse(&bytes).unwrap();
        assert_eq!(parsed, mbr);
        assert_eq!(parsed.disk_signature(), 0xDEADBEEF);
        assert!(parsed.code_area_is_blank());
    }

    #[test]
    fn missing_signature_is_device_error() {
        assert!(matches!(
            Mbr::parse(&[0u8; 512]),
            Err(SysencError::Device(_))
        ));
    }

    #[test]
    fn boot_code_keeps_table_and_signature() {
        let mbr = sample();
        let with_code = mbr.with_boot_code(&[0xEB, 0x63, 0x90]).unwrap();
        assert!(!with_code.code_area_is_blank());
        assert_eq!(with_code.disk_signature(), 0xDEADBEEF);
        assert_eq!(with_code.entries, mbr.entries);
        assert!(mbr.with_boot_code(&[0u8; 441]).is_err());
    }

    #[test]
    fn ebr_chain() {
        let mut dev = MemoryDevice::new(512 * 200, 512);
        let extended = 100u64;
        // EBR 1 at 100: logical at +1, link to EBR at extended+50
        let mut ebr1 = sample();
        ebr1.code = [0u8; CODE_AREA_SIZE];
        ebr1.entries = [MbrEntry::default(); 4];
        ebr1.entries[0] = MbrEntry {
            partition_type: TYPE_FAT32,
            start_lba: 1,
            sector_count: 40,
            ..MbrEntry::default()
        };
        ebr1.entries[1] = MbrEntry {
            partition_type: TYPE_EXTENDED,
            start_lba: 50,
            sector_count: 41,
            ..MbrEntry::default()
        };
        let mut ebr2 = ebr1.clone();
        ebr2.entries[0].sector_count = 30;
        ebr2.entries[1] = MbrEntry::default();
        dev.write_sectors(extended, &ebr1.to_bytes()).unwrap();
        dev.write_sectors(extended + 50, &ebr2.to_bytes()).unwrap();

        let logical = read_logical_partitions(&mut dev, extended).unwrap();
        assert_eq!(logical.len(), 2);
        assert_eq!(logical[0].start_lba, 101);
        assert_eq!(logical[1].start_lba, 151);
        assert_eq!(logical[1].entry.sector_count, 30);
    }
}
