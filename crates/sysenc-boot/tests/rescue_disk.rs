//! Rescue disk round trip with a real volume header.

use secrecy::SecretString;
use sysenc_boot::{
    bios, build_rescue_image, read_boot_volume_header, verify_rescue_image,
    write_boot_volume_header, BootLoaderImage, LoaderComponent, MemoryLoaderSource,
};
use sysenc_core::{ChainingMode, EncryptionAlgorithm, Prf, SysencError};
use sysenc_crypto::{HeaderKind, HeaderOptions, KdfParams, ParseOptions, VolumeGeometry, VolumeHeader};
use sysenc_disk::{BlockDevice, MemoryDevice};

fn source() -> MemoryLoaderSource {
    let mut source = MemoryLoaderSource::new();
    source.insert(LoaderComponent::Decompressor, vec![0xDC; 700]);
    for rescue in [false, true] {
        source.insert(
            LoaderComponent::BootSector {
                algorithm: EncryptionAlgorithm::Aes,
                rescue,
            },
            vec![if rescue { 0xEE } else { 0xBB }; 512],
        );
        source.insert(
            LoaderComponent::Loader {
                algorithm: EncryptionAlgorithm::Aes,
                prf: Prf::Sha256,
                rescue,
            },
            vec![0x4C; 9000],
        );
    }
    source
}

fn header_opts() -> HeaderOptions {
    HeaderOptions {
        prf: Prf::Sha256,
        pim: 1,
        kind: HeaderKind::System,
        kdf: KdfParams::default(),
    }
}

#[test]
fn rescue_disk_carries_a_usable_header() {
    let password = SecretString::from("correct horse".to_string());
    let geometry = VolumeGeometry {
        sector_size: 512,
        volume_size: 1 << 20,
        encrypted_area_start: 2048 * 512,
        encrypted_area_length: 0,
    };
    let (header, _ctx) = VolumeHeader::create(
        &password,
        EncryptionAlgorithm::Aes,
        ChainingMode::Xts,
        &header_opts(),
        geometry,
    )
    .unwrap();

    let mut drive = MemoryDevice::new(4096 * 512, 512);
    let mut mbr = [0u8; 512];
    mbr[..4].copy_from_slice(b"GRUB");
    mbr[510..].copy_from_slice(&[0x55, 0xAA]);
    drive.write_sectors(0, &mbr).unwrap();

    let image =
        BootLoaderImage::assemble(&source(), EncryptionAlgorithm::Aes, Prf::Sha256, false, false)
            .unwrap();
    let backup = bios::install(&mut drive, &image, false).unwrap().unwrap();
    write_boot_volume_header(&mut drive, &header).unwrap();
    assert_eq!(read_boot_volume_header(&mut drive).unwrap(), header);

    let rescue =
        BootLoaderImage::assemble(&source(), EncryptionAlgorithm::Aes, Prf::Sha256, true, false)
            .unwrap();
    let iso = build_rescue_image(&rescue, &header, backup.mbr_sector()).unwrap();

    let contents = verify_rescue_image(&iso, &rescue, Some(&header)).unwrap();
    assert_eq!(&contents.original_mbr[..4], b"GRUB");

    let parse = ParseOptions {
        prf: Some(Prf::Sha256),
        kind: HeaderKind::System,
        kdf: KdfParams::default(),
    };
    let (fields, _) = contents.header.parse(&password, 1, &parse).unwrap();
    assert_eq!(fields.geometry, geometry);

    // The installed (non-rescue) loader is not what the rescue disk holds.
    assert!(matches!(
        verify_rescue_image(&iso, &image, None),
        Err(SysencError::IntegrityMismatch(_))
    ));
}
