//! The reserved area in front of the first partition.
//!
//! Sector 0 holds the boot sector, sectors 1..62 the loader, sector 62 the
//! boot volume header. Both BIOS and EFI installs keep the header there.

use rand::RngCore;
use sysenc_core::{SysencError, SysencResult};
use sysenc_crypto::{VolumeHeader, HEADER_SIZE};
use sysenc_disk::{BlockDevice, SystemDriveConfiguration};

pub const SECTOR_SIZE: usize = 512;
pub const LOADER_FIRST_SECTOR: u64 = 1;
pub const LOADER_AREA_SECTORS: u64 = 61;
pub const BOOT_VOLUME_HEADER_SECTOR: u64 = 62;
/// Sectors 0..=62
pub const RESERVED_SECTORS: u64 = 63;

pub(crate) fn require_512(dev: &dyn BlockDevice) -> SysencResult<()> {
    if dev.sector_size() != SECTOR_SIZE {
        return Err(SysencError::UnsupportedLayout(format!(
            "boot encryption needs 512-byte sectors, drive has {}",
            dev.sector_size()
        )));
    }
    Ok(())
}

/// Every partition must start past the reserved area.
pub fn check_reserved_area_free(config: &SystemDriveConfiguration) -> SysencResult<()> {
    let ss = config.sector_size;
    if let Some(p) = config
        .partitions
        .iter()
        .find(|p| p.start_sector(ss) < RESERVED_SECTORS)
    {
        return Err(SysencError::UnsupportedLayout(format!(
            "partition {} starts at sector {}, inside the boot loader area",
            p.number,
            p.start_sector(ss)
        )));
    }
    Ok(())
}

pub fn write_boot_volume_header(dev: &mut dyn BlockDevice, header: &VolumeHeader) -> SysencResult<()> {
    require_512(&*dev)?;
    dev.write_sectors(BOOT_VOLUME_HEADER_SECTOR, header.as_bytes())?;
    dev.flush()
}

pub fn read_boot_volume_header(dev: &mut dyn BlockDevice) -> SysencResult<VolumeHeader> {
    require_512(&*dev)?;
    let mut buf = [0u8; HEADER_SIZE];
    dev.read_sectors(BOOT_VOLUME_HEADER_SECTOR, &mut buf)?;
    VolumeHeader::from_bytes(&buf)
}

/// Overwrite the header sector `passes` times with random bytes, then
/// leave `final_bytes` in it.
pub fn erase_boot_volume_header(
    dev: &mut dyn BlockDevice,
    passes: u32,
    final_bytes: &[u8; SECTOR_SIZE],
) -> SysencResult<()> {
    require_512(&*dev)?;
    let mut buf = [0u8; SECTOR_SIZE];
    for _ in 0..passes {
        rand::rngs::OsRng.fill_bytes(&mut buf);
        dev.write_sectors(BOOT_VOLUME_HEADER_SECTOR, &buf)?;
        dev.flush()?;
    }
    dev.write_sectors(BOOT_VOLUME_HEADER_SECTOR, final_bytes)?;
    dev.flush()?;
    tracing::info!(passes, "boot volume header erased");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysenc_disk::MemoryDevice;

    #[test]
    fn header_sector_roundtrip_and_erase() {
        let mut dev = MemoryDevice::new(64 * 1024, 512);
        let header = VolumeHeader::from_bytes(&[0x3C; 512]).unwrap();
        write_boot_volume_header(&mut dev, &header).unwrap();
        assert_eq!(read_boot_volume_header(&mut dev).unwrap(), header);
        assert_eq!(dev.snapshot()[62 * 512], 0x3C);

        dev.clear_write_log();
        erase_boot_volume_header(&mut dev, 3, &[0u8; 512]).unwrap();
        assert_eq!(dev.write_log().len(), 4);
        assert!(dev.snapshot()[62 * 512..63 * 512].iter().all(|&b| b == 0));
        // Neighbours untouched.
        assert_eq!(dev.snapshot()[61 * 512], 0);
    }

    #[test]
    fn rejects_large_sectors() {
        let mut dev = MemoryDevice::new(64 * 4096, 4096);
        assert!(matches!(
            read_boot_volume_header(&mut dev),
            Err(SysencError::UnsupportedLayout(_))
        ));
    }
}
