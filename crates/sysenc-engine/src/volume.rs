//! Standard (non-system) volumes: a header at the front, a backup header at
//! the back and an encrypted FAT filesystem in between.

use std::ops::ControlFlow;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use sysenc_core::config::SysencConfig;
use sysenc_core::{ChainingMode, EncryptionAlgorithm, Prf, SysencError, SysencResult};
use sysenc_crypto::{
    HeaderKind, HeaderOptions, KdfParams, ParseOptions, UnlockedHeader, VolumeGeometry,
    VolumeHeader, HEADER_SIZE,
};
use sysenc_disk::{compute_geometry, format, BlockDevice, FatParams, FormatOptions};

use crate::worker::Worker;

/// Bytes reserved for each of the two header areas.
pub const VOLUME_HEADER_AREA: u64 = 128 * 1024;

/// Where the pieces of a standard volume sit on its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLayout {
    pub total: u64,
    pub data_start: u64,
    pub data_length: u64,
    pub backup_header_offset: u64,
}

impl VolumeLayout {
    pub fn for_size(total: u64, sector_size: u64) -> SysencResult<Self> {
        let usable = total / sector_size * sector_size;
        if usable <= 2 * VOLUME_HEADER_AREA {
            return Err(SysencError::ResourceExhausted(format!(
                "{total} bytes cannot hold a volume"
            )));
        }
        Ok(Self {
            total: usable,
            data_start: VOLUME_HEADER_AREA,
            data_length: usable - 2 * VOLUME_HEADER_AREA,
            backup_header_offset: usable - VOLUME_HEADER_AREA,
        })
    }

    pub fn geometry(&self, sector_size: u32) -> VolumeGeometry {
        VolumeGeometry {
            sector_size,
            volume_size: self.data_length,
            encrypted_area_start: self.data_start,
            encrypted_area_length: self.data_length,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolumeOptions {
    pub algorithm: EncryptionAlgorithm,
    pub mode: ChainingMode,
    pub prf: Prf,
    pub pim: u32,
    pub kdf: KdfParams,
    /// Sectors per cluster, 0 picks one from the volume size
    pub cluster_size: u32,
    pub format: FormatOptions,
}

impl VolumeOptions {
    pub fn from_config(config: &SysencConfig) -> Self {
        let enc = &config.encryption;
        Self {
            algorithm: enc.algorithm,
            mode: enc.mode,
            prf: enc.prf,
            pim: enc.pim,
            kdf: KdfParams::from(enc),
            cluster_size: config.format.cluster_size,
            format: FormatOptions {
                quick_format: config.format.quick_format,
                write_buffer_size: config.format.write_buffer_kib as usize * 1024,
                volume_id: None,
            },
        }
    }

    fn header_options(&self) -> HeaderOptions {
        HeaderOptions {
            prf: self.prf,
            pim: self.pim,
            kind: HeaderKind::Standard,
            kdf: self.kdf.clone(),
        }
    }
}

/// A freshly created volume.
pub struct CreatedVolume {
    pub layout: VolumeLayout,
    pub filesystem: FatParams,
    pub header: UnlockedHeader,
}

fn fill_random(dev: &mut dyn BlockDevice, offset: u64, length: u64) -> SysencResult<()> {
    let mut at = offset;
    while at < offset + length {
        let chunk = VolumeHeader::random_fill();
        dev.write_at(at, &chunk)?;
        at += chunk.len() as u64;
    }
    Ok(())
}

/// Write a standard volume over the whole of `dev`.
///
/// `progress` gets (bytes formatted, bytes total); cancelling `cancel`
/// stops the format with [`SysencError::Cancelled`] and leaves no valid
/// header behind.
pub fn create_volume(
    dev: &mut dyn BlockDevice,
    password: &SecretString,
    options: &VolumeOptions,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(u64, u64),
) -> SysencResult<CreatedVolume> {
    let ss = dev.sector_size() as u64;
    let layout = VolumeLayout::for_size(dev.len(), ss)?;
    let geometry = layout.geometry(ss as u32);
    let header_opts = options.header_options();
    let (header, unlocked) = VolumeHeader::create_unlocked(
        password,
        options.algorithm,
        options.mode,
        &header_opts,
        geometry,
    )?;

    fill_random(dev, 0, VOLUME_HEADER_AREA)?;
    fill_random(dev, layout.backup_header_offset, VOLUME_HEADER_AREA)?;

    let params = compute_geometry(layout.data_length / ss, ss as u32, options.cluster_size)?;
    let total = layout.data_length;
    let filesystem = format(
        dev,
        layout.data_start / ss,
        &params,
        unlocked.context(),
        &options.format,
        &mut |done| {
            progress(done, total);
            if cancel.is_cancelled() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        },
    )?;

    let backup = unlocked.backup_copy(password, options.pim, &options.kdf)?;
    dev.write_at(layout.backup_header_offset, backup.as_bytes())?;
    dev.write_at(0, header.as_bytes())?;
    dev.flush()?;
    tracing::info!(
        size = layout.total,
        fat = ?filesystem.fat_type,
        "volume created"
    );
    Ok(CreatedVolume {
        layout,
        filesystem,
        header: unlocked,
    })
}

/// Run [`create_volume`] on a worker thread that owns `dev`.
pub fn spawn_format(
    mut dev: Box<dyn BlockDevice>,
    password: SecretString,
    options: VolumeOptions,
    progress: impl FnMut(u64, u64) + Send + 'static,
) -> SysencResult<Worker<SysencResult<CreatedVolume>>> {
    Worker::spawn("sysenc-format", move |cancel| {
        let mut progress = progress;
        create_volume(dev.as_mut(), &password, &options, &cancel, &mut progress)
    })
}

/// Read a header sector at `offset`.
pub fn read_header(dev: &mut dyn BlockDevice, offset: u64) -> SysencResult<VolumeHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    dev.read_at(offset, &mut buf)?;
    VolumeHeader::from_bytes(&buf)
}

/// Unlock a standard volume, falling back to the backup header when the
/// primary does not open.
pub fn open_volume(
    dev: &mut dyn BlockDevice,
    password: &SecretString,
    pim: u32,
    prf: Option<Prf>,
    kdf: &KdfParams,
) -> SysencResult<UnlockedHeader> {
    let layout = VolumeLayout::for_size(dev.len(), dev.sector_size() as u64)?;
    let opts = ParseOptions {
        prf,
        kind: HeaderKind::Standard,
        kdf: kdf.clone(),
    };
    let primary = read_header(dev, 0).and_then(|h| h.unlock(password, pim, &opts));
    match primary {
        Err(SysencError::WrongPassword) => {
            tracing::warn!("primary header did not open, trying the backup header");
            read_header(dev, layout.backup_header_offset)?.unlock(password, pim, &opts)
        }
        other => other,
    }
}
