//! BIOS target: boot sector in the MBR code area, loader in sectors 1..62.

use sysenc_core::{SysencError, SysencResult};
use sysenc_crypto::LoaderFingerprint;
use sysenc_disk::mbr::{Mbr, DISK_SIGNATURE_OFFSET, TYPE_GPT_PROTECTIVE};
use sysenc_disk::BlockDevice;

use crate::area::{
    erase_boot_volume_header, require_512, BOOT_VOLUME_HEADER_SECTOR, LOADER_AREA_SECTORS,
    LOADER_FIRST_SECTOR, RESERVED_SECTORS, SECTOR_SIZE,
};
use crate::image::{BootLoaderImage, InstalledLoader, CONFIG_OFFSET};

/// Sectors 0..=62 as they were before the first install.
#[derive(Clone, PartialEq, Eq)]
pub struct BiosBackup {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for BiosBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiosBackup")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl BiosBackup {
    const LEN: usize = RESERVED_SECTORS as usize * SECTOR_SIZE;

    pub fn from_bytes(bytes: Vec<u8>) -> SysencResult<Self> {
        if bytes.len() != Self::LEN {
            return Err(SysencError::InvalidBufferSize {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The original sector 0.
    pub fn mbr_sector(&self) -> &[u8] {
        &self.bytes[..SECTOR_SIZE]
    }

    fn loader_area(&self) -> &[u8] {
        let start = LOADER_FIRST_SECTOR as usize * SECTOR_SIZE;
        &self.bytes[start..start + LOADER_AREA_SECTORS as usize * SECTOR_SIZE]
    }

    fn header_sector(&self) -> [u8; SECTOR_SIZE] {
        let start = BOOT_VOLUME_HEADER_SECTOR as usize * SECTOR_SIZE;
        let mut out = [0u8; SECTOR_SIZE];
        out.copy_from_slice(&self.bytes[start..start + SECTOR_SIZE]);
        out
    }
}

fn read_reserved(dev: &mut dyn BlockDevice) -> SysencResult<Vec<u8>> {
    require_512(&*dev)?;
    let mut area = vec![0u8; RESERVED_SECTORS as usize * SECTOR_SIZE];
    dev.read_sectors(0, &mut area)?;
    Ok(area)
}

fn check_partitions_clear(mbr: &Mbr) -> SysencResult<()> {
    let clash = mbr.entries.iter().find(|e| {
        !e.is_empty()
            && e.partition_type != TYPE_GPT_PROTECTIVE
            && u64::from(e.start_lba) < RESERVED_SECTORS
    });
    if let Some(entry) = clash {
        return Err(SysencError::UnsupportedLayout(format!(
            "partition at LBA {} overlaps the boot loader area",
            entry.start_lba
        )));
    }
    Ok(())
}

/// The loader currently on the drive, if it is one of ours.
pub fn installed_loader(dev: &mut dyn BlockDevice) -> SysencResult<Option<InstalledLoader>> {
    let area = read_reserved(dev)?;
    Ok(InstalledLoader::parse(&area))
}

pub fn installed_fingerprint(dev: &mut dyn BlockDevice) -> SysencResult<Option<LoaderFingerprint>> {
    Ok(installed_loader(dev)?.map(|l| l.fingerprint()))
}

/// Write `image` to the drive.
///
/// The partition table and disk signature stay as they are. When a foreign
/// loader is replaced, the returned backup holds the original reserved area.
/// With `preserve_user_config`, an existing install's user flags and message
/// carry over into the new boot sector.
pub fn install(
    dev: &mut dyn BlockDevice,
    image: &BootLoaderImage,
    preserve_user_config: bool,
) -> SysencResult<Option<BiosBackup>> {
    let area = read_reserved(dev)?;
    let mbr = Mbr::parse(&area[..SECTOR_SIZE])?;
    check_partitions_clear(&mbr)?;

    let installed = InstalledLoader::parse(&area);
    let backup = match installed {
        Some(_) => None,
        None => Some(BiosBackup { bytes: area }),
    };

    let mut image = image.clone();
    if preserve_user_config {
        if let Some(current) = &installed {
            image.set_user_config(current.user_config());
            image.set_raw_message(&current.raw_message());
        }
    }

    let new_mbr = mbr.with_boot_code(&image.boot_sector()[..DISK_SIGNATURE_OFFSET])?;
    // Loader first: a boot sector must never point at a half-written loader.
    dev.write_sectors(LOADER_FIRST_SECTOR, image.loader())?;
    dev.flush()?;
    dev.write_sectors(0, &new_mbr.to_bytes())?;
    dev.flush()?;

    tracing::info!(
        loader_sectors = image.loader_sectors(),
        replaced_foreign = backup.is_some(),
        "BIOS boot loader installed"
    );
    Ok(backup)
}

/// Replace the `mask` bits of the installed boot sector's configuration
/// byte with `value`. The loader itself is left alone.
pub fn update_boot_config(dev: &mut dyn BlockDevice, mask: u8, value: u8) -> SysencResult<()> {
    let area = read_reserved(dev)?;
    if InstalledLoader::parse(&area).is_none() {
        return Err(SysencError::InvalidState(
            "no sysenc boot loader on the drive".into(),
        ));
    }
    let mut sector = [0u8; SECTOR_SIZE];
    sector.copy_from_slice(&area[..SECTOR_SIZE]);
    sector[CONFIG_OFFSET] = (sector[CONFIG_OFFSET] & !mask) | (value & mask);
    dev.write_sectors(0, &sector)?;
    dev.flush()
}

/// Remove the loader and the boot volume header.
///
/// With a backup, the original boot code and loader area come back;
/// otherwise both are zeroed. The partition table is never touched.
pub fn uninstall(
    dev: &mut dyn BlockDevice,
    backup: Option<&BiosBackup>,
    header_wipe_passes: u32,
) -> SysencResult<()> {
    let area = read_reserved(dev)?;
    let mbr = Mbr::parse(&area[..SECTOR_SIZE])?;

    let (code, loader_area, header_sector) = match backup {
        Some(b) => (
            b.mbr_sector()[..DISK_SIGNATURE_OFFSET].to_vec(),
            b.loader_area().to_vec(),
            b.header_sector(),
        ),
        None => (
            Vec::new(),
            vec![0u8; LOADER_AREA_SECTORS as usize * SECTOR_SIZE],
            [0u8; SECTOR_SIZE],
        ),
    };

    erase_boot_volume_header(dev, header_wipe_passes, &header_sector)?;
    dev.write_sectors(0, &mbr.with_boot_code(&code)?.to_bytes())?;
    dev.flush()?;
    dev.write_sectors(LOADER_FIRST_SECTOR, &loader_area)?;
    dev.flush()?;

    tracing::info!(restored = backup.is_some(), "BIOS boot loader removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::USER_CFG_DISPLAY_MESSAGE;
    use crate::test_source;
    use sysenc_core::{EncryptionAlgorithm, Prf};
    use sysenc_disk::mbr::{MbrEntry, TYPE_NTFS};
    use sysenc_disk::MemoryDevice;

    fn drive_with_foreign_loader() -> MemoryDevice {
        let mut dev = MemoryDevice::new(4096 * 512, 512);
        let mut sector = [0u8; 512];
        sector[..440].fill(0xF0);
        sector[510..].copy_from_slice(&[0x55, 0xAA]);
        let mut mbr = Mbr::parse(&sector).unwrap();
        mbr.set_disk_signature(0xCAFEBABE);
        mbr.entries[0] = MbrEntry {
            bootable: true,
            partition_type: TYPE_NTFS,
            start_lba: 2048,
            sector_count: 2048,
        };
        dev.write_sectors(0, &mbr.to_bytes()).unwrap();
        dev.write_sectors(1, &[0x6B; 61 * 512]).unwrap();
        dev.write_sectors(62, &[0x77; 512]).unwrap();
        dev
    }

    fn image(loader_len: usize) -> BootLoaderImage {
        BootLoaderImage::assemble(
            &test_source(loader_len),
            EncryptionAlgorithm::Aes,
            Prf::Sha512,
            false,
            false,
        )
        .unwrap()
    }

    #[test]
    fn install_keeps_partition_table_and_signature() {
        let mut dev = drive_with_foreign_loader();
        let before = Mbr::parse(&dev.snapshot()[..512]).unwrap();
        let img = image(5000);

        let backup = install(&mut dev, &img, false).unwrap().unwrap();
        assert_eq!(&backup.mbr_sector()[..440], &[0xF0; 440][..]);

        let after = Mbr::parse(&dev.snapshot()[..512]).unwrap();
        assert_eq!(after.entries, before.entries);
        assert_eq!(after.disk_signature(), 0xCAFEBABE);
        assert_eq!(&after.code[..440], &img.boot_sector()[..440]);

        let found = installed_loader(&mut dev).unwrap().unwrap();
        assert_eq!(found.fingerprint(), img.fingerprint());
    }

    #[test]
    fn reinstall_does_not_replace_backup() {
        let mut dev = drive_with_foreign_loader();
        assert!(install(&mut dev, &image(3000), false).unwrap().is_some());
        assert!(install(&mut dev, &image(4000), false).unwrap().is_none());
    }

    #[test]
    fn preserve_user_config_carries_message() {
        let mut dev = drive_with_foreign_loader();
        let mut first = image(3000);
        first.set_custom_message("hello").unwrap();
        install(&mut dev, &first, false).unwrap();

        install(&mut dev, &image(3000), true).unwrap();
        let found = installed_loader(&mut dev).unwrap().unwrap();
        assert_ne!(found.user_config() & USER_CFG_DISPLAY_MESSAGE, 0);
        assert_eq!(&found.raw_message()[..5], b"hello");

        install(&mut dev, &image(3000), false).unwrap();
        let found = installed_loader(&mut dev).unwrap().unwrap();
        assert_eq!(found.user_config(), 0);
    }

    #[test]
    fn uninstall_restores_original() {
        let mut dev = drive_with_foreign_loader();
        let original = dev.snapshot()[..63 * 512].to_vec();
        let backup = install(&mut dev, &image(3000), false).unwrap().unwrap();
        dev.write_sectors(62, &[0x11; 512]).unwrap();

        uninstall(&mut dev, Some(&backup), 2).unwrap();
        assert_eq!(&dev.snapshot()[..63 * 512], &original[..]);
        assert!(installed_loader(&mut dev).unwrap().is_none());
    }

    #[test]
    fn uninstall_without_backup_blanks_code() {
        let mut dev = drive_with_foreign_loader();
        install(&mut dev, &image(3000), false).unwrap();
        uninstall(&mut dev, None, 0).unwrap();
        let mbr = Mbr::parse(&dev.snapshot()[..512]).unwrap();
        assert!(mbr.code_area_is_blank());
        assert_eq!(mbr.disk_signature(), 0xCAFEBABE);
        assert!(dev.snapshot()[512..63 * 512].iter().all(|&b| b == 0));
    }

    #[test]
    fn partition_inside_loader_area_rejected() {
        let mut dev = drive_with_foreign_loader();
        let mut mbr = Mbr::parse(&dev.snapshot()[..512]).unwrap();
        mbr.entries[0].start_lba = 63 - 1;
        dev.write_sectors(0, &mbr.to_bytes()).unwrap();
        assert!(matches!(
            install(&mut dev, &image(3000), false),
            Err(SysencError::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn boot_config_bits_updated_in_place() {
        use crate::image::CFG_HIDDEN_OS_PHASE_MASK;

        let mut dev = drive_with_foreign_loader();
        let img = image(3000);
        install(&mut dev, &img, false).unwrap();

        update_boot_config(&mut dev, CFG_HIDDEN_OS_PHASE_MASK, 0x04).unwrap();
        let found = installed_loader(&mut dev).unwrap().unwrap();
        assert_eq!(found.config() & CFG_HIDDEN_OS_PHASE_MASK, 0x04);
        assert_eq!(found.fingerprint(), img.fingerprint());

        update_boot_config(&mut dev, CFG_HIDDEN_OS_PHASE_MASK, 0).unwrap();
        let found = installed_loader(&mut dev).unwrap().unwrap();
        assert_eq!(found.config() & CFG_HIDDEN_OS_PHASE_MASK, 0);
    }

    #[test]
    fn boot_config_needs_our_loader() {
        let mut dev = drive_with_foreign_loader();
        assert!(matches!(
            update_boot_config(&mut dev, 0x06, 0x02),
            Err(SysencError::InvalidState(_))
        ));
    }

    #[test]
    fn backup_size_checked() {
        assert!(BiosBackup::from_bytes(vec![0; 512]).is_err());
        assert!(BiosBackup::from_bytes(vec![0; 63 * 512]).is_ok());
    }
}
