//! Shared fixtures: in-memory drives, a scripted host and fast KDF settings.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use tempfile::TempDir;
use uuid::Uuid;

use sysenc_boot::{EfiFile, LoaderComponent, MemoryLoaderSource};
use sysenc_core::config::SysencConfig;
use sysenc_core::privileged::LocalExecutor;
use sysenc_core::{EncryptionAlgorithm, Prf, SysencResult};
use sysenc_crypto::{HeaderKind, KdfParams, ParseOptions, SectorStream, UnlockedHeader};
use sysenc_disk::gpt::{self, write_gpt, GptEntry, GptHeader};
use sysenc_disk::mbr::{Mbr, MbrEntry, CODE_AREA_SIZE};
use sysenc_disk::{BlockDevice, MemoryDevice};
use sysenc_engine::{BootEncryption, DeviceProvider, Firmware, Host, SystemEnvironment};

pub const SECTOR: u64 = 512;
pub const DRIVE_PATH: &str = "/dev/sdt";

pub fn pw(s: &str) -> SecretString {
    SecretString::from(s)
}

/// Every loader component for AES and all PRFs.
pub fn loader_source() -> MemoryLoaderSource {
    let mut source = MemoryLoaderSource::new();
    source.insert(LoaderComponent::Decompressor, vec![0xDC; 300]);
    for rescue in [false, true] {
        let mut sector = vec![0xB0; 512];
        sector[1] = u8::from(rescue);
        source.insert(
            LoaderComponent::BootSector {
                algorithm: EncryptionAlgorithm::Aes,
                rescue,
            },
            sector,
        );
        for prf in Prf::ALL {
            let loader = (0..4000u32)
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
            format!("sysenc:{}", file.file_name()).into_bytes(),
        );
    }
    source
}

/// Plaintext of a sector before anything touched it.
pub fn pattern(sector: u64) -> Vec<u8> {
    (0..SECTOR)
        .map(|i| (sector.wrapping_mul(31) ^ i) as u8)
        .collect()
}

/// MBR drive of `sectors` sectors with foreign boot code, a loader-area
/// filler and patterned partition contents.
/// Entries are (type, start LBA, sector count, bootable).
pub fn mbr_drive(sectors: u64, entries: &[(u8, u32, u32, bool)]) -> MemoryDevice {
    let mut dev = MemoryDevice::new((sectors * SECTOR) as usize, SECTOR as usize);
    let mut table = [MbrEntry::default(); 4];
    for (slot, &(partition_type, start_lba, sector_count, bootable)) in entries.iter().enumerate() {
        table[slot] = MbrEntry {
            bootable,
            partition_type,
            start_lba,
            sector_count,
        };
        for s in u64::from(start_lba)..u64::from(start_lba) + u64::from(sector_count) {
            dev.write_sectors(s, &pattern(s)).unwrap();
        }
    }
    let mut mbr = Mbr {
        code: [0xF0; CODE_AREA_SIZE],
        entries: table,
    };
    mbr.set_disk_signature(0x5EC0_0001);
    dev.write_sectors(0, &mbr.to_bytes()).unwrap();
    dev.write_sectors(1, &vec![0x6B; 61 * 512]).unwrap();
    dev
}

/// 8 MiB BIOS drive: 1 MiB NTFS system partition, 3 MiB data partition.
pub fn bios_drive() -> MemoryDevice {
    mbr_drive(
        16_384,
        &[
            (sysenc_disk::mbr::TYPE_NTFS, 2048, 2048, true),
            (sysenc_disk::mbr::TYPE_NTFS, 4096, 6144, false),
        ],
    )
}

/// 8 MiB GPT drive: 1 MiB ESP, 2 MiB basic-data system partition.
pub fn efi_drive() -> MemoryDevice {
    let mut dev = MemoryDevice::new((16_384 * SECTOR) as usize, SECTOR as usize);
    let header = GptHeader::new_for_disk(dev.sector_count(), 512, Uuid::new_v4());
    let esp = GptEntry {
        type_guid: gpt::EFI_SYSTEM,
        unique_guid: Uuid::new_v4(),
        first_lba: 2048,
        last_lba: 4095,
        attributes: 0,
        name: "EFI".into(),
    };
    let data = GptEntry {
        type_guid: gpt::BASIC_DATA,
        unique_guid: Uuid::new_v4(),
        first_lba: 4096,
        last_lba: 8191,
        attributes: 0,
        name: "OS".into(),
    };
    write_gpt(&mut dev, &header, &[esp, data]).unwrap();
    for s in 4096..8192 {
        dev.write_sectors(s, &pattern(s)).unwrap();
    }
    dev
}

/// Every drive number resolves to the same in-memory drive.
pub struct MemoryDrives {
    pub dev: MemoryDevice,
}

impl DeviceProvider for MemoryDrives {
    fn device_path(&self, _drive_number: u32) -> PathBuf {
        PathBuf::from(DRIVE_PATH)
    }

    fn open(&self, _drive_number: u32) -> SysencResult<Box<dyn BlockDevice>> {
        Ok(Box::new(self.dev.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct FakeEnvironment {
    pub firmware: Firmware,
    pub paging_files: Vec<PathBuf>,
    pub cd_recorder: bool,
    pub mounts: Vec<(PathBuf, PathBuf)>,
}

impl FakeEnvironment {
    pub fn new(firmware: Firmware) -> Self {
        Self {
            firmware,
            paging_files: Vec::new(),
            cd_recorder: false,
            mounts: Vec::new(),
        }
    }
}

impl SystemEnvironment for FakeEnvironment {
    fn firmware(&self) -> Firmware {
        self.firmware
    }

    fn paging_files(&self) -> Vec<PathBuf> {
        self.paging_files.clone()
    }

    fn has_cd_recorder(&self) -> bool {
        self.cd_recorder
    }

    fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.mounts.clone()
    }
}

/// Small KDF costs, 64-sector batches and a state file under `dir`.
pub fn test_config(dir: &Path) -> SysencConfig {
    let mut config = SysencConfig::default();
    config.encryption.prf = Prf::Sha256;
    config.encryption.pim = 1;
    config.encryption.argon2_mem_cost_kib = 64;
    config.encryption.argon2_time_cost = 1;
    config.encryption.argon2_parallelism = 1;
    config.encryption.header_wipe_passes = 1;
    config.drive.state_file = dir.join("state").join("state.json");
    config.drive.batch_sectors = 64;
    config.boot.esp_mount = Some(dir.join("esp"));
    config.boot.rescue_iso = dir.join("rescue.iso");
    config
}

pub fn kdf(config: &SysencConfig) -> KdfParams {
    KdfParams::from(&config.encryption)
}

/// A drive plus everything needed to build orchestrators over it.
pub struct Fixture {
    pub dir: TempDir,
    pub dev: MemoryDevice,
    pub config: SysencConfig,
    pub env: FakeEnvironment,
    pub drive_number: u32,
}

impl Fixture {
    pub fn new(dev: MemoryDevice, firmware: Firmware, drive_number: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        Self {
            dir,
            dev,
            config,
            env: FakeEnvironment::new(firmware),
            drive_number,
        }
    }

    pub fn bios(drive_number: u32) -> Self {
        Self::new(bios_drive(), Firmware::Bios, drive_number)
    }

    pub fn efi(drive_number: u32) -> Self {
        let fixture = Self::new(efi_drive(), Firmware::Efi, drive_number);
        std::fs::create_dir_all(fixture.dir.path().join("esp/EFI/Boot")).unwrap();
        fixture
    }

    pub fn host(&self) -> Host {
        Host {
            devices: Arc::new(MemoryDrives {
                dev: self.dev.clone(),
            }),
            environment: Arc::new(self.env.clone()),
            executor: Arc::new(LocalExecutor),
            loaders: Arc::new(loader_source()),
        }
    }

    pub fn orchestrator(&self) -> BootEncryption {
        BootEncryption::new(self.config.clone(), self.drive_number, self.host()).unwrap()
    }

    pub fn rescue_path(&self) -> PathBuf {
        self.config.boot.rescue_iso.clone()
    }

    pub fn state_path(&self) -> PathBuf {
        self.config.drive.state_file.clone()
    }

    /// Prepare and install system-partition encryption under `password`.
    pub fn installed(&self, password: &str) -> BootEncryption {
        let mut be = self.orchestrator();
        be.prepare_installation(
            true,
            &pw(password),
            EncryptionAlgorithm::Aes,
            sysenc_core::ChainingMode::Xts,
            Prf::Sha256,
            1,
            &self.rescue_path(),
        )
        .unwrap();
        be.install(false, Prf::Sha256).unwrap();
        be
    }

    /// The boot volume header on the drive, opened with `password`.
    pub fn open_header(&self, password: &str) -> SysencResult<UnlockedHeader> {
        let mut dev = self.dev.clone();
        let header = sysenc_boot::read_boot_volume_header(&mut dev)?;
        header.unlock(
            &pw(password),
            1,
            &ParseOptions {
                prf: None,
                kind: HeaderKind::System,
                kdf: kdf(&self.config),
            },
        )
    }
}

/// Poll until no worker is running.
pub fn wait_idle(be: &BootEncryption) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while be.query_status().setup_in_progress {
        assert!(Instant::now() < deadline, "worker did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// True when every sector in `[first, last)` decrypts to its original
/// pattern under `header`. Tweaks count from the header's area start.
pub fn decrypts_to_pattern(dev: &MemoryDevice, header: &UnlockedHeader, first: u64, last: u64) -> bool {
    let stream = SectorStream::new(header.context(), SECTOR as usize).unwrap();
    let origin = header.fields().geometry.encrypted_area_start / SECTOR;
    let mut dev = dev.clone();
    let mut buf = vec![0u8; SECTOR as usize];
    (first..last).all(|s| {
        dev.read_sectors(s, &mut buf).unwrap();
        stream.decrypt_sector_in_place(s - origin, &mut buf).unwrap();
        buf == pattern(s)
    })
}

/// True when every sector in `[first, last)` still holds its pattern.
pub fn is_plaintext(dev: &MemoryDevice, first: u64, last: u64) -> bool {
    let mut dev = dev.clone();
    let mut buf = vec![0u8; SECTOR as usize];
    (first..last).all(|s| {
        dev.read_sectors(s, &mut buf).unwrap();
        buf == pattern(s)
    })
}
