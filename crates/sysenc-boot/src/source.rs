//! Where boot loader components come from

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sysenc_core::{EncryptionAlgorithm, Prf, SysencError, SysencResult};

/// Files of the EFI loader set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EfiFile {
    /// Main loader, also copied over the ESP default boot path
    Boot,
    /// Password prompt and header unlock
    Interface,
    /// Configuration and recovery tool
    Config,
    Info,
    /// Rescue loader (only placed on rescue media)
    Rescue,
}

impl EfiFile {
    /// Files copied into the vendor directory on install.
    pub const INSTALLED: [EfiFile; 4] = [
        EfiFile::Boot,
        EfiFile::Interface,
        EfiFile::Config,
        EfiFile::Info,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            EfiFile::Boot => "sysenc_boot.efi",
            EfiFile::Interface => "sysenc_int.efi",
            EfiFile::Config => "sysenc_cfg.efi",
            EfiFile::Info => "sysenc_info.efi",
            EfiFile::Rescue => "sysenc_rescue.efi",
        }
    }
}

/// One raw piece of a boot loader image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderComponent {
    /// Shared decompressor placed right after the boot sector
    Decompressor,
    BootSector {
        algorithm: EncryptionAlgorithm,
        rescue: bool,
    },
    Loader {
        algorithm: EncryptionAlgorithm,
        prf: Prf,
        rescue: bool,
    },
    Efi(EfiFile),
}

impl LoaderComponent {
    /// Relative file name inside a loader directory.
    pub fn file_name(&self) -> String {
        let suffix = |rescue: bool| if rescue { "_rescue" } else { "" };
        match self {
            LoaderComponent::Decompressor => "decompressor.bin".into(),
            LoaderComponent::BootSector { algorithm, rescue } => {
                format!("boot_sector_{algorithm}{}.bin", suffix(*rescue))
            }
            LoaderComponent::Loader {
                algorithm,
                prf,
                rescue,
            } => format!("loader_{algorithm}_{prf}{}.bin", suffix(*rescue)),
            LoaderComponent::Efi(file) => format!("efi/{}", file.file_name()),
        }
    }
}

/// Supplies raw loader components.
pub trait LoaderSource: Send + Sync {
    fn load(&self, component: LoaderComponent) -> SysencResult<Vec<u8>>;
}

/// Reads components from a directory laid out by [`LoaderComponent::file_name`].
#[derive(Debug, Clone)]
pub struct DirectoryLoaderSource {
    root: PathBuf,
}

impl DirectoryLoaderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LoaderSource for DirectoryLoaderSource {
    fn load(&self, component: LoaderComponent) -> SysencResult<Vec<u8>> {
        let path = self.root.join(component.file_name());
        let bytes = std::fs::read(&path).map_err(|e| {
            SysencError::device(format!("reading loader component {}", path.display()), e)
        })?;
        tracing::debug!(component = ?component, len = bytes.len(), "loaded boot component");
        Ok(bytes)
    }
}

/// Components held in memory, e.g. compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoaderSource {
    parts: HashMap<LoaderComponent, Vec<u8>>,
}

impl MemoryLoaderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, component: LoaderComponent, bytes: Vec<u8>) -> &mut Self {
        self.parts.insert(component, bytes);
        self
    }
}

impl LoaderSource for MemoryLoaderSource {
    fn load(&self, component: LoaderComponent) -> SysencResult<Vec<u8>> {
        self.parts.get(&component).cloned().ok_or_else(|| {
            SysencError::Config(format!(
                "boot loader component {} not available",
                component.file_name()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_file_names() {
        let bs = LoaderComponent::BootSector {
            algorithm: EncryptionAlgorithm::Aes,
            rescue: true,
        };
        assert_eq!(bs.file_name(), "boot_sector_aes_rescue.bin");
        let loader = LoaderComponent::Loader {
            algorithm: EncryptionAlgorithm::Aes,
            prf: Prf::Argon2id,
            rescue: false,
        };
        assert_eq!(loader.file_name(), "loader_aes_argon2id.bin");
        assert_eq!(
            LoaderComponent::Efi(EfiFile::Boot).file_name(),
            "efi/sysenc_boot.efi"
        );
    }

    #[test]
    fn directory_source_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("decompressor.bin"), b"dc").unwrap();
        let source = DirectoryLoaderSource::new(dir.path());
        assert_eq!(source.load(LoaderComponent::Decompressor).unwrap(), b"dc");

        let missing = source.load(LoaderComponent::Efi(EfiFile::Info)).unwrap_err();
        assert!(matches!(missing, SysencError::Device(_)));
    }

    #[test]
    fn memory_source_missing_component() {
        let mut source = MemoryLoaderSource::new();
        source.insert(LoaderComponent::Decompressor, vec![1, 2, 3]);
        assert_eq!(source.load(LoaderComponent::Decompressor).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            source.load(LoaderComponent::Efi(EfiFile::Boot)),
            Err(SysencError::Config(_))
        ));
    }
}
