//! UEFI flow: loader files on the ESP, header at sector 62 of a GPT drive.

mod common;

use common::*;
use sysenc_boot::EfiFile;
use sysenc_core::{ChainingMode, EncryptionAlgorithm, Prf, SysencError, WipeAlgorithm};
use sysenc_engine::{Firmware, SetupResult, SetupStatus};

#[test]
fn efi_install_encrypt_and_remove() {
    let fx = Fixture::efi(301);
    let esp = fx.dir.path().join("esp");
    let boot_path = esp.join("EFI/Boot/bootx64.efi");
    std::fs::write(&boot_path, b"vendor loader").unwrap();

    let mut be = fx.orchestrator();
    assert!(matches!(
        be.check_requirements(false, false),
        Err(SysencError::UnsupportedLayout(_))
    ));
    be.check_requirements(true, false).unwrap();

    be.prepare_installation(
        true,
        &pw("efi pw"),
        EncryptionAlgorithm::Aes,
        ChainingMode::Xts,
        Prf::Sha256,
        1,
        &fx.rescue_path(),
    )
    .unwrap();
    assert!(matches!(
        be.install(true, Prf::Sha256),
        Err(SysencError::UnsupportedLayout(_))
    ));
    be.install(false, Prf::Sha256).unwrap();

    let state = be.state();
    assert_eq!(state.firmware, Some(Firmware::Efi));
    assert_eq!(
        std::fs::read(&boot_path).unwrap(),
        format!("sysenc:{}", EfiFile::Boot.file_name()).into_bytes()
    );
    let backup = state.original_loader_backup.unwrap();
    assert_eq!(std::fs::read(&backup).unwrap(), b"vendor loader");
    be.check_bootloader_fingerprint().unwrap();
    assert!(be.installed_boot_loader_version().unwrap().is_some());

    be.start_encryption(WipeAlgorithm::None, false).unwrap();
    wait_idle(&be);
    assert_eq!(be.check_encryption_setup_result().unwrap(), SetupResult::Completed);
    let header = fx.open_header("efi pw").unwrap();
    assert!(decrypts_to_pattern(&fx.dev, &header, 4096, 8192));

    be.change_password(&pw("efi pw"), 1, &pw("next"), Prf::Sha512, 1, 1)
        .unwrap();
    assert!(fx.open_header("next").is_ok());

    be.start_decryption(false).unwrap();
    wait_idle(&be);
    assert_eq!(be.check_encryption_setup_result().unwrap(), SetupResult::Completed);
    assert_eq!(be.state().status, SetupStatus::Uninstalled);
    assert!(is_plaintext(&fx.dev, 4096, 8192));
    assert_eq!(std::fs::read(&boot_path).unwrap(), b"vendor loader");
    assert!(!backup.exists());
    assert_eq!(&fx.dev.snapshot()[62 * 512..63 * 512], &[0u8; 512][..]);
}
