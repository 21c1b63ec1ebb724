//! BIOS boot loader image: boot sector plus decompressor and loader code.
//!
//! The boot sector code area carries a small parameter block that the
//! loader reads at boot time:
//!
//! ```text
//! 24..48    custom user message (ASCII, zero padded)
//! 430..432  loader version (u16 LE, 0xMmP)
//! 432       user configuration flags
//! 433       boot sector configuration flags
//! 434..436  loader length in bytes (u16 LE, sector multiple)
//! 436..440  loader checksum (u32 LE)
//! 440..446  disk signature, kept from the drive at install time
//! ```

use sysenc_core::{EncryptionAlgorithm, Prf, SysencError, SysencResult};
use sysenc_crypto::{loader_checksum, LoaderFingerprint};
use sysenc_disk::mbr::{BOOT_SIGNATURE, DISK_SIGNATURE_OFFSET};

use crate::area::{LOADER_AREA_SECTORS, SECTOR_SIZE};
use crate::source::{LoaderComponent, LoaderSource};

pub const USER_MESSAGE_OFFSET: usize = 24;
pub const USER_MESSAGE_MAX_LEN: usize = 24;
pub const VERSION_OFFSET: usize = 430;
pub const USER_CONFIG_OFFSET: usize = 432;
pub const CONFIG_OFFSET: usize = 433;
pub const LOADER_LENGTH_OFFSET: usize = 434;
pub const LOADER_CHECKSUM_OFFSET: usize = 436;

/// 0.5.0
pub const BOOT_LOADER_VERSION: u16 = 0x0050;

pub const CFG_RESCUE: u8 = 0x01;
pub const CFG_HIDDEN_OS_PHASE_MASK: u8 = 0x06;
pub const CFG_HIDDEN_OS_CREATION: u8 = 0x02;
pub const CFG_BACKUP_LOADER_AVAILABLE: u8 = 0x08;

pub const USER_CFG_SILENT_MODE: u8 = 0x01;
pub const USER_CFG_DISABLE_ESC: u8 = 0x02;
pub const USER_CFG_DISPLAY_MESSAGE: u8 = 0x04;
pub const USER_CFG_DISABLE_PASSWORD_CACHE: u8 = 0x10;

const LOADER_AREA_SIZE: usize = LOADER_AREA_SECTORS as usize * SECTOR_SIZE;

/// `0x0050` → `"0.5.0"`.
pub fn version_string(version: u16) -> String {
    format!(
        "{}.{}.{}",
        version >> 8,
        (version >> 4) & 0x0F,
        version & 0x0F
    )
}

#[derive(Clone, PartialEq, Eq)]
pub struct BootLoaderImage {
    boot_sector: [u8; SECTOR_SIZE],
    /// Decompressor and loader, padded to whole sectors
    loader: Vec<u8>,
    algorithm: EncryptionAlgorithm,
    prf: Prf,
}

impl std::fmt::Debug for BootLoaderImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootLoaderImage")
            .field("algorithm", &self.algorithm)
            .field("prf", &self.prf)
            .field("rescue", &self.is_rescue())
            .field("loader_sectors", &self.loader_sectors())
            .field("version", &version_string(self.version()))
            .finish()
    }
}

impl BootLoaderImage {
    /// Build the image for a cipher and PRF. Fails with `ResourceExhausted`
    /// when the code does not fit the loader area.
    pub fn assemble(
        source: &dyn LoaderSource,
        algorithm: EncryptionAlgorithm,
        prf: Prf,
        rescue: bool,
        hidden_os: bool,
    ) -> SysencResult<Self> {
        let sector = source.load(LoaderComponent::BootSector { algorithm, rescue })?;
        if sector.len() != SECTOR_SIZE {
            return Err(SysencError::InvalidBufferSize {
                expected: SECTOR_SIZE,
                actual: sector.len(),
            });
        }
        let mut boot_sector = [0u8; SECTOR_SIZE];
        boot_sector.copy_from_slice(&sector);

        let mut loader = source.load(LoaderComponent::Decompressor)?;
        loader.extend_from_slice(&source.load(LoaderComponent::Loader {
            algorithm,
            prf,
            rescue,
        })?);
        let padded = loader.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        if padded > LOADER_AREA_SIZE {
            return Err(SysencError::ResourceExhausted(format!(
                "boot loader needs {} sectors, loader area holds {LOADER_AREA_SECTORS}",
                padded / SECTOR_SIZE
            )));
        }
        loader.resize(padded, 0);

        // Partition table area is filled from the target drive at install time.
        boot_sector[USER_MESSAGE_OFFSET..USER_MESSAGE_OFFSET + USER_MESSAGE_MAX_LEN].fill(0);
        boot_sector[VERSION_OFFSET..].fill(0);
        boot_sector[510..].copy_from_slice(&BOOT_SIGNATURE);
        boot_sector[VERSION_OFFSET..VERSION_OFFSET + 2]
            .copy_from_slice(&BOOT_LOADER_VERSION.to_le_bytes());
        boot_sector[LOADER_LENGTH_OFFSET..LOADER_LENGTH_OFFSET + 2]
            .copy_from_slice(&(padded as u16).to_le_bytes());
        boot_sector[LOADER_CHECKSUM_OFFSET..LOADER_CHECKSUM_OFFSET + 4]
            .copy_from_slice(&loader_checksum(&loader).to_le_bytes());

        let mut config = 0u8;
        if rescue {
            config |= CFG_RESCUE;
        }
        if hidden_os {
            config |= CFG_HIDDEN_OS_CREATION;
        }
        boot_sector[CONFIG_OFFSET] = config;

        tracing::debug!(
            algorithm = %algorithm,
            prf = %prf,
            rescue,
            hidden_os,
            loader_sectors = padded / SECTOR_SIZE,
            "boot loader image assembled"
        );
        Ok(Self {
            boot_sector,
            loader,
            algorithm,
            prf,
        })
    }

    pub fn boot_sector(&self) -> &[u8; SECTOR_SIZE] {
        &self.boot_sector
    }

    pub fn loader(&self) -> &[u8] {
        &self.loader
    }

    pub fn loader_sectors(&self) -> usize {
        self.loader.len() / SECTOR_SIZE
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    pub fn prf(&self) -> Prf {
        self.prf
    }

    /// Boot sector followed by the loader.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECTOR_SIZE + self.loader.len());
        out.extend_from_slice(&self.boot_sector);
        out.extend_from_slice(&self.loader);
        out
    }

    pub fn version(&self) -> u16 {
        read_u16(&self.boot_sector, VERSION_OFFSET)
    }

    pub fn config(&self) -> u8 {
        self.boot_sector[CONFIG_OFFSET]
    }

    pub fn set_config_flags(&mut self, flags: u8, enabled: bool) {
        if enabled {
            self.boot_sector[CONFIG_OFFSET] |= flags;
        } else {
            self.boot_sector[CONFIG_OFFSET] &= !flags;
        }
    }

    pub fn is_rescue(&self) -> bool {
        self.config() & CFG_RESCUE != 0
    }

    pub fn user_config(&self) -> u8 {
        self.boot_sector[USER_CONFIG_OFFSET]
    }

    pub fn set_user_config(&mut self, flags: u8) {
        self.boot_sector[USER_CONFIG_OFFSET] = flags;
    }

    pub fn custom_message(&self) -> String {
        let raw = &self.boot_sector[USER_MESSAGE_OFFSET..USER_MESSAGE_OFFSET + USER_MESSAGE_MAX_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// Printable ASCII, at most 24 characters. An empty message clears the
    /// display flag.
    pub fn set_custom_message(&mut self, message: &str) -> SysencResult<()> {
        if message.len() > USER_MESSAGE_MAX_LEN {
            return Err(SysencError::ResourceExhausted(format!(
                "boot message is {} characters, at most {USER_MESSAGE_MAX_LEN} fit",
                message.len()
            )));
        }
        if !message.bytes().all(|b| (0x20..0x7F).contains(&b)) {
            return Err(SysencError::Config(
                "boot message must be printable ASCII".into(),
            ));
        }
        let mut raw = [0u8; USER_MESSAGE_MAX_LEN];
        raw[..message.len()].copy_from_slice(message.as_bytes());
        self.set_raw_message(&raw);
        let flags = self.user_config();
        if message.is_empty() {
            self.set_user_config(flags & !USER_CFG_DISPLAY_MESSAGE);
        } else {
            self.set_user_config(flags | USER_CFG_DISPLAY_MESSAGE);
        }
        Ok(())
    }

    pub(crate) fn set_raw_message(&mut self, raw: &[u8; USER_MESSAGE_MAX_LEN]) {
        self.boot_sector[USER_MESSAGE_OFFSET..USER_MESSAGE_OFFSET + USER_MESSAGE_MAX_LEN]
            .copy_from_slice(raw);
    }

    /// Digest of the code, excluding the user-editable fields.
    pub fn fingerprint(&self) -> LoaderFingerprint {
        fingerprint_of(&self.boot_sector, &self.loader)
    }
}

/// A boot loader found on a drive, recognised by its length and checksum fields.
#[derive(Debug, Clone)]
pub struct InstalledLoader {
    pub boot_sector: [u8; SECTOR_SIZE],
    pub loader: Vec<u8>,
}

impl InstalledLoader {
    /// `area` holds sectors 0 through the end of the loader area. Returns
    /// `None` when the boot sector is not one of ours.
    pub fn parse(area: &[u8]) -> Option<Self> {
        if area.len() < SECTOR_SIZE || area[510..512] != BOOT_SIGNATURE {
            return None;
        }
        let len = read_u16(area, LOADER_LENGTH_OFFSET) as usize;
        if len == 0 || len % SECTOR_SIZE != 0 || len > LOADER_AREA_SIZE {
            return None;
        }
        let loader = area.get(SECTOR_SIZE..SECTOR_SIZE + len)?;
        let stored = u32::from_le_bytes([
            area[LOADER_CHECKSUM_OFFSET],
            area[LOADER_CHECKSUM_OFFSET + 1],
            area[LOADER_CHECKSUM_OFFSET + 2],
            area[LOADER_CHECKSUM_OFFSET + 3],
        ]);
        if stored != loader_checksum(loader) {
            return None;
        }
        let mut boot_sector = [0u8; SECTOR_SIZE];
        boot_sector.copy_from_slice(&area[..SECTOR_SIZE]);
        Some(Self {
            boot_sector,
            loader: loader.to_vec(),
        })
    }

    pub fn version(&self) -> u16 {
        read_u16(&self.boot_sector, VERSION_OFFSET)
    }

    pub fn config(&self) -> u8 {
        self.boot_sector[CONFIG_OFFSET]
    }

    pub fn user_config(&self) -> u8 {
        self.boot_sector[USER_CONFIG_OFFSET]
    }

    pub fn raw_message(&self) -> [u8; USER_MESSAGE_MAX_LEN] {
        let mut raw = [0u8; USER_MESSAGE_MAX_LEN];
        raw.copy_from_slice(
            &self.boot_sector[USER_MESSAGE_OFFSET..USER_MESSAGE_OFFSET + USER_MESSAGE_MAX_LEN],
        );
        raw
    }

    pub fn fingerprint(&self) -> LoaderFingerprint {
        fingerprint_of(&self.boot_sector, &self.loader)
    }
}

fn fingerprint_of(boot_sector: &[u8; SECTOR_SIZE], loader: &[u8]) -> LoaderFingerprint {
    LoaderFingerprint::compute_parts(&[
        &boot_sector[..USER_MESSAGE_OFFSET],
        &boot_sector[USER_MESSAGE_OFFSET + USER_MESSAGE_MAX_LEN..USER_CONFIG_OFFSET],
        &boot_sector[LOADER_LENGTH_OFFSET..DISK_SIGNATURE_OFFSET],
        loader,
    ])
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_source;

    fn assemble(source: &dyn LoaderSource, rescue: bool) -> BootLoaderImage {
        BootLoaderImage::assemble(source, EncryptionAlgorithm::Aes, Prf::Sha512, rescue, false)
            .unwrap()
    }

    #[test]
    fn fields_written_into_boot_sector() {
        let source = test_source(2900);
        let image = assemble(&source, false);

        assert_eq!(image.loader_sectors(), 6);
        assert_eq!(image.version(), BOOT_LOADER_VERSION);
        assert_eq!(read_u16(image.boot_sector(), LOADER_LENGTH_OFFSET), 3072);
        assert_eq!(&image.boot_sector()[510..], &BOOT_SIGNATURE);
        assert!(!image.is_rescue());
        assert_eq!(image.to_bytes().len(), 512 + 3072);

        let parsed = InstalledLoader::parse(&image.to_bytes()).unwrap();
        assert_eq!(parsed.version(), BOOT_LOADER_VERSION);
        assert_eq!(parsed.fingerprint(), image.fingerprint());
    }

    #[test]
    fn rescue_and_hidden_flags() {
        let source = test_source(1000);
        let rescue = assemble(&source, true);
        assert!(rescue.is_rescue());

        let hidden =
            BootLoaderImage::assemble(&source, EncryptionAlgorithm::Aes, Prf::Sha512, false, true)
                .unwrap();
        assert_eq!(hidden.config() & CFG_HIDDEN_OS_PHASE_MASK, CFG_HIDDEN_OS_CREATION);
    }

    #[test]
    fn loader_must_fit_area() {
        // 61 sectors fit exactly; one more byte does not.
        let decompressor_len = 100;
        let fits = test_source(LOADER_AREA_SIZE - decompressor_len);
        assert_eq!(assemble(&fits, false).loader_sectors(), 61);

        let too_big = test_source(LOADER_AREA_SIZE - decompressor_len + 1);
        let err = BootLoaderImage::assemble(
            &too_big,
            EncryptionAlgorithm::Aes,
            Prf::Sha512,
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, SysencError::ResourceExhausted(_)));
    }

    #[test]
    fn custom_message_does_not_change_fingerprint() {
        let source = test_source(2000);
        let mut image = assemble(&source, false);
        let before = image.fingerprint();
        image.set_custom_message("Property of ACME").unwrap();
        assert_eq!(image.custom_message(), "Property of ACME");
        assert_ne!(image.user_config() & USER_CFG_DISPLAY_MESSAGE, 0);
        assert_eq!(image.fingerprint(), before);

        image.set_custom_message("").unwrap();
        assert_eq!(image.user_config() & USER_CFG_DISPLAY_MESSAGE, 0);

        assert!(image.set_custom_message(&"x".repeat(25)).is_err());
        assert!(image.set_custom_message("tab\there").is_err());
    }

    #[test]
    fn corrupted_loader_not_recognised() {
        let source = test_source(2000);
        let mut bytes = assemble(&source, false).to_bytes();
        bytes[700] ^= 0xFF;
        assert!(InstalledLoader::parse(&bytes).is_none());
        assert!(InstalledLoader::parse(&[0u8; 1024]).is_none());
    }

    #[test]
    fn version_formatting() {
        assert_eq!(version_string(0x0050), "0.5.0");
        assert_eq!(version_string(0x0126), "1.2.6");
    }
}
