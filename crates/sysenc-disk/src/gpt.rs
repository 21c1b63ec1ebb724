//! GUID partition table codec.
//!
//! Header at LBA 1, 128-byte entries at the LBA the header names. CRC
//! fields are carried through on read but not validated.

use serde::Serialize;
use sysenc_core::{SysencError, SysencResult};
use uuid::Uuid;

use crate::device::BlockDevice;

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_HEADER_SIZE: u32 = 92;
pub const PARTITION_ENTRY_SIZE: usize = 128;
pub const MAX_PARTITION_ENTRIES: u32 = 128;

pub const EFI_SYSTEM: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
pub const BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
pub const MS_RESERVED: Uuid = Uuid::from_u128(0xE3C9E316_0B5C_4DB8_817D_F92DF00215AE);
pub const MS_RECOVERY: Uuid = Uuid::from_u128(0xDE94BBA4_06D1_4D40_A16A_BFD50179D6AC);
pub const LDM_METADATA: Uuid = Uuid::from_u128(0x5808C8AA_7E8F_42E0_85D2_E1E90434CFB3);
pub const LDM_DATA: Uuid = Uuid::from_u128(0xAF9B60A0_1431_4F62_BC68_3311714A69AD);
pub const LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);
pub const LINUX_SWAP: Uuid = Uuid::from_u128(0x0657FD6D_A4AB_43C4_84E5_0933C84B4F4F);
pub const LINUX_LVM: Uuid = Uuid::from_u128(0xE6D6D379_F507_44C2_A23C_238F2A3DF928);

pub const STANDARD_TYPES: &[Uuid] = &[
    EFI_SYSTEM,
    BASIC_DATA,
    MS_RESERVED,
    MS_RECOVERY,
    LDM_METADATA,
    LDM_DATA,
    LINUX_FILESYSTEM,
    LINUX_SWAP,
    LINUX_LVM,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

fn le_u32(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
}

fn le_u64(b: &[u8], o: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[o..o + 8]);
    u64::from_le_bytes(a)
}

fn guid_at(b: &[u8], o: usize) -> Uuid {
    let mut a = [0u8; 16];
    a.copy_from_slice(&b[o..o + 16]);
    Uuid::from_bytes_le(a)
}

impl GptHeader {
    pub fn parse(sector: &[u8]) -> SysencResult<Self> {
        if sector.len() < GPT_HEADER_SIZE as usize {
            return Err(SysencError::InvalidBufferSize {
                expected: GPT_HEADER_SIZE as usize,
                actual: sector.len(),
            });
        }
        if &sector[0..8] != GPT_SIGNATURE {
            return Err(SysencError::Device(
                "partition table unreadable: missing EFI PART signature".into(),
            ));
        }
        let header = Self {
            revision: le_u32(sector, 8),
            header_size: le_u32(sector, 12),
            header_crc32: le_u32(sector, 16),
            current_lba: le_u64(sector, 24),
            backup_lba: le_u64(sector, 32),
            first_usable_lba: le_u64(sector, 40),
            last_usable_lba: le_u64(sector, 48),
            disk_guid: guid_at(sector, 56),
            entries_lba: le_u64(sector, 72),
            num_entries: le_u32(sector, 80),
            entry_size: le_u32(sector, 84),
            entries_crc32: le_u32(sector, 88),
        };
        if header.entry_size as usize != PARTITION_ENTRY_SIZE {
            return Err(SysencError::UnsupportedLayout(format!(
                "GPT entry size {} (expected {PARTITION_ENTRY_SIZE})",
                header.entry_size
            )));
        }
        Ok(header)
    }

    pub fn to_bytes(&self, sector_size: usize) -> Vec<u8> {
        let mut out = vec![0u8; sector_size];
        out[0..8].copy_from_slice(GPT_SIGNATURE);
        out[8..12].copy_from_slice(&self.revision.to_le_bytes());
        out[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.header_crc32.to_le_bytes());
        out[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        out[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        out[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        out[72..80].copy_from_slice(&self.entries_lba.to_le_bytes());
        out[80..84].copy_from_slice(&self.num_entries.to_le_bytes());
        out[84..88].copy_from_slice(&self.entry_size.to_le_bytes());
        out[88..92].copy_from_slice(&self.entries_crc32.to_le_bytes());
        out
    }

    /// A fresh header for a disk of `total_sectors`, entries at LBA 2.
    pub fn new_for_disk(total_sectors: u64, sector_size: usize, disk_guid: Uuid) -> Self {
        let entry_sectors = (MAX_PARTITION_ENTRIES as u64 * PARTITION_ENTRY_SIZE as u64)
            .div_ceil(sector_size as u64);
        Self {
            revision: GPT_REVISION,
            header_size: GPT_HEADER_SIZE,
            header_crc32: 0,
            current_lba: 1,
            backup_lba: total_sectors - 1,
            first_usable_lba: 2 + entry_sectors,
            last_usable_lba: total_sectors - 2 - entry_sectors,
            disk_guid,
            entries_lba: 2,
            num_entries: MAX_PARTITION_ENTRIES,
            entry_size: PARTITION_ENTRY_SIZE as u32,
            entries_crc32: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    /// Inclusive
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let type_guid = guid_at(raw, 0);
        if type_guid.is_nil() {
            return None;
        }
        let units: Vec<u16> = raw[56..128]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        Some(Self {
            type_guid,
            unique_guid: guid_at(raw, 16),
            first_lba: le_u64(raw, 32),
            last_lba: le_u64(raw, 40),
            attributes: le_u64(raw, 48),
            name: String::from_utf16_lossy(&units),
        })
    }

    pub fn encode(&self) -> [u8; PARTITION_ENTRY_SIZE] {
        let mut out = [0u8; PARTITION_ENTRY_SIZE];
        out[0..16].copy_from_slice(&self.type_guid.to_bytes_le());
        out[16..32].copy_from_slice(&self.unique_guid.to_bytes_le());
        out[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in self.name.encode_utf16().take(36).enumerate() {
            out[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        out
    }

    pub fn sector_count(&self) -> u64 {
        self.last_lba.saturating_sub(self.first_lba) + 1
    }
}

/// Read the primary GPT header and its used entries, in table order.
/// Each entry is paired with its zero-based slot index.
pub fn read_gpt(dev: &mut dyn BlockDevice) -> SysencResult<(GptHeader, Vec<(u32, GptEntry)>)> {
    let ss = dev.sector_size();
    let mut sector = vec![0u8; ss];
    dev.read_sectors(1, &mut sector)?;
    let header = GptHeader::parse(&sector)?;

    let count = header.num_entries.min(MAX_PARTITION_ENTRIES);
    let table_bytes = count as usize * PARTITION_ENTRY_SIZE;
    let mut table = vec![0u8; table_bytes.div_ceil(ss) * ss];
    dev.read_sectors(header.entries_lba, &mut table)?;

    let entries = table[..table_bytes]
        .chunks_exact(PARTITION_ENTRY_SIZE)
        .enumerate()
        .filter_map(|(i, raw)| GptEntry::parse(raw).map(|e| (i as u32, e)))
        .collect();
    Ok((header, entries))
}

/// Write a primary GPT (protective MBR, header, entries). Used to build
/// test drives and blank images.
pub fn write_gpt(
    dev: &mut dyn BlockDevice,
    header: &GptHeader,
    entries: &[GptEntry],
) -> SysencResult<()> {
    use crate::mbr::{Mbr, MbrEntry, CODE_AREA_SIZE, TYPE_GPT_PROTECTIVE};

    let ss = dev.sector_size();
    let total = dev.sector_count();
    let mut protective = Mbr {
        code: [0u8; CODE_AREA_SIZE],
        entries: [MbrEntry::default(); 4],
    };
    protective.entries[0] = MbrEntry {
        bootable: false,
        partition_type: TYPE_GPT_PROTECTIVE,
        start_lba: 1,
        sector_count: u32::try_from(total - 1).unwrap_or(u32::MAX),
    };
    let mut sector0 = vec![0u8; ss];
    sector0[..512].copy_from_slice(&protective.to_bytes());
    dev.write_sectors(0, &sector0)?;
    dev.write_sectors(1, &header.to_bytes(ss))?;

    let table_bytes = header.num_entries as usize * PARTITION_ENTRY_SIZE;
    let mut table = vec![0u8; table_bytes.div_ceil(ss) * ss];
    for (i, entry) in entries.iter().enumerate() {
        let off = i * PARTITION_ENTRY_SIZE;
        table[off..off + PARTITION_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }
    dev.write_sectors(header.entries_lba, &table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn guid_mixed_endian_layout() {
        // First three fields little-endian on disk
        let bytes = EFI_SYSTEM.to_bytes_le();
        assert_eq!(&bytes[..4], &[0x28, 0x73, 0x2A, 0xC1]);
    }

    #[test]
    fn entry_roundtrip_with_name() {
        let entry = GptEntry {
            type_guid: BASIC_DATA,
            unique_guid: Uuid::new_v4(),
            first_lba: 2048,
            last_lba: 4095,
            attributes: 0,
            name: "Basic data partition".into(),
        };
        let parsed = GptEntry::parse(&entry.encode()).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.sector_count(), 2048);
        assert!(GptEntry::parse(&[0u8; 128]).is_none());
    }

    #[test]
    fn write_then_read() {
        let mut dev = MemoryDevice::new(512 * 4096, 512);
        let header = GptHeader::new_for_disk(4096, 512, Uuid::new_v4());
        let esp = GptEntry {
            type_guid: EFI_SYSTEM,
            unique_guid: Uuid::new_v4(),
            first_lba: 40,
            last_lba: 239,
            attributes: 0,
            name: "EFI system partition".into(),
        };
        write_gpt(&mut dev, &header, &[esp.clone()]).unwrap();

        let (read_header, entries) = read_gpt(&mut dev).unwrap();
        assert_eq!(read_header.disk_guid, header.disk_guid);
        assert_eq!(read_header.first_usable_lba, 34);
        assert_eq!(entries, vec![(0, esp)]);
    }

    #[test]
    fn bad_signature() {
        let mut dev = MemoryDevice::new(512 * 64, 512);
        assert!(matches!(read_gpt(&mut dev), Err(SysencError::Device(_))));
    }
}
