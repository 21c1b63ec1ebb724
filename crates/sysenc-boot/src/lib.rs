//! sysenc-boot: places the pre-boot decryptor on a system drive.
//!
//! BIOS installs write a boot sector and loader into the reserved sectors in
//! front of the first partition ([`bios`]); EFI installs copy loader files
//! onto the EFI system partition ([`efi`]). Either way the boot volume
//! header lives at sector 62 ([`area`]).

pub mod area;
pub mod bios;
pub mod conf;
pub mod efi;
pub mod image;
pub mod rescue;
pub mod source;

pub use area::{
    check_reserved_area_free, erase_boot_volume_header, read_boot_volume_header,
    write_boot_volume_header, BOOT_VOLUME_HEADER_SECTOR,
};
pub use bios::BiosBackup;
pub use conf::{BootConfig, BootSettings};
pub use efi::{EfiInstaller, EfiLayout};
pub use image::{version_string, BootLoaderImage, InstalledLoader, BOOT_LOADER_VERSION};
pub use rescue::{build_rescue_image, parse_rescue_image, verify_rescue_image, RESCUE_ISO_SIZE};
pub use source::{DirectoryLoaderSource, EfiFile, LoaderComponent, LoaderSource, MemoryLoaderSource};

/// Every component for AES and all PRFs: a 100-byte decompressor and
/// `loader_len`-byte loaders.
#[cfg(test)]
pub(crate) fn test_source(loader_len: usize) -> MemoryLoaderSource {
    use sysenc_core::{EncryptionAlgorithm, Prf};

    let mut source = MemoryLoaderSource::new();
    source.insert(LoaderComponent::Decompressor, vec![0xD0; 100]);
    for rescue in [false, true] {
        let mut sector = vec![0xB5; 512];
        sector[0] = u8::from(rescue);
        source.insert(
            LoaderComponent::BootSector {
                algorithm: EncryptionAlgorithm::Aes,
                rescue,
            },
            sector,
        );
        for prf in Prf::ALL {
            let loader = (0..loader_len)
                .map(|i| (i as u8) ^ prf.id() ^ u8::from(rescue))
                .collect();
            source.insert(
                LoaderComponent::Loader {
                    algorithm: EncryptionAlgorithm::Aes,
                    prf,
                    rescue,
                },
                loader,
            );
        }
    }
    for file in EfiFile::INSTALLED.into_iter().chain([EfiFile::Rescue]) {
        source.insert(
            LoaderComponent::Efi(file),
            format!("efi:{}", file.file_name()).into_bytes(),
        );
    }
    source
}
