//! FAT12/16/32 geometry and the encrypted formatter.
//!
//! [`compute_geometry`] picks the FAT width, cluster size and table sizes
//! for a volume. [`format`] then writes every filesystem structure through
//! the sector cipher, so the volume is encrypted as it is created.

use std::ops::ControlFlow;

use rand::RngCore;
use serde::Serialize;
use sysenc_core::{SysencError, SysencResult};
use sysenc_crypto::{CryptoContext, SectorStream};
use zeroize::Zeroizing;

use crate::device::BlockDevice;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Largest cluster, in bytes
pub const MAX_CLUSTER_SIZE: u64 = 256 * KIB;
const MAX_SECTORS_PER_CLUSTER: u32 = 128;
const LEGACY_SECTOR_SIZE: u32 = 512;
/// FAT32 data area alignment when the sector size is 512
const DATA_ALIGNMENT: u32 = 4096;
/// Quick format on a container touches one sector per this many bytes
pub const QUICK_FORMAT_STRIDE: u64 = 128 * MIB;

pub const FAT12_MAX_CLUSTERS: i64 = 4085;
pub const FAT16_MAX_CLUSTERS: i64 = 65525;

pub const DEFAULT_LABEL: &[u8; 11] = b"NO NAME    ";
const OEM_NAME: &[u8; 8] = b"MSDOS5.0";
const BOOT_SIGNATURE_OFFSET: usize = 510;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }

    fn fs_type_label(self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
            FatType::Fat32 => b"FAT32   ",
        }
    }
}

/// Everything needed to lay out one FAT volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatParams {
    pub num_sectors: u64,
    pub sector_size: u32,
    /// Sectors per cluster
    pub cluster_size: u32,
    pub reserved: u32,
    pub fats: u32,
    pub dir_entries: u32,
    /// Root directory size in bytes
    pub size_root_dir: u32,
    pub fat_type: FatType,
    /// Sectors per FAT
    pub fat_length: u32,
    pub cluster_count: u32,
    pub media: u8,
    pub secs_track: u16,
    pub heads: u16,
    pub hidden: u32,
    /// 16-bit total sectors; 0 when `total_sect` is used
    pub sectors: u16,
    pub total_sect: u32,
    pub volume_id: [u8; 4],
    pub volume_name: [u8; 11],
}

impl FatParams {
    pub fn root_dir_sectors(&self) -> u32 {
        self.size_root_dir / self.sector_size
    }

    /// Sectors before the data area's free space: reserved, FATs, root directory.
    pub fn metadata_sectors(&self) -> u64 {
        u64::from(self.reserved)
            + u64::from(self.fat_length) * u64::from(self.fats)
            + u64::from(self.root_dir_sectors())
    }

    pub fn free_space_sectors(&self) -> u64 {
        self.num_sectors.saturating_sub(self.metadata_sectors())
    }

    pub fn set_label(&mut self, label: &str) {
        let mut name = *DEFAULT_LABEL;
        if !label.is_empty() {
            name = [b' '; 11];
            for (dst, src) in name.iter_mut().zip(label.bytes().map(|b| b.to_ascii_uppercase())) {
                *dst = src;
            }
        }
        self.volume_name = name;
    }
}

fn default_cluster_bytes(volume_size: u64) -> u64 {
    match volume_size {
        s if s >= 2 * TIB => 256 * KIB,
        s if s >= 512 * GIB => 128 * KIB,
        s if s >= 128 * GIB => 64 * KIB,
        s if s >= 64 * GIB => 32 * KIB,
        s if s >= 32 * GIB => 16 * KIB,
        s if s >= 16 * GIB => 8 * KIB,
        s if s >= 512 * MIB => 4 * KIB,
        s if s >= 256 * MIB => 2 * KIB,
        s if s >= MIB => KIB,
        _ => 512,
    }
}

/// Compute the FAT layout for `sector_count` sectors.
///
/// `requested_cluster_size` is in sectors; 0 picks one from the volume size.
pub fn compute_geometry(
    sector_count: u64,
    sector_size: u32,
    requested_cluster_size: u32,
) -> SysencResult<FatParams> {
    sysenc_crypto::validate_sector_size(sector_size as usize)?;
    if sector_count > u64::from(u32::MAX) {
        return Err(SysencError::InvalidState(format!(
            "{sector_count} sectors exceed the FAT32 sector count limit"
        )));
    }
    if requested_cluster_size > MAX_SECTORS_PER_CLUSTER
        || (requested_cluster_size != 0 && !requested_cluster_size.is_power_of_two())
    {
        return Err(SysencError::InvalidState(format!(
            "invalid cluster size of {requested_cluster_size} sectors"
        )));
    }

    let ss = u64::from(sector_size);
    let volume_size = sector_count * ss;
    let num = sector_count as i64;
    let ss_i = i64::from(sector_size);

    let mut cluster_size = requested_cluster_size;
    if cluster_size == 0 {
        cluster_size = ((default_cluster_bytes(volume_size) / ss) as u32).max(1);
        if u64::from(cluster_size) * ss > MAX_CLUSTER_SIZE {
            cluster_size = (MAX_CLUSTER_SIZE / ss) as u32;
        }
        cluster_size = cluster_size.min(MAX_SECTORS_PER_CLUSTER);
    }
    if volume_size <= MAX_CLUSTER_SIZE * 4 {
        cluster_size = 1;
    }
    let cs = i64::from(cluster_size);

    let dir_entries = 512u32;
    let fats = 2u32;
    let mut size_root_dir = dir_entries * 32;
    let root_sectors = (i64::from(size_root_dir) + ss_i - 1) / ss_i;

    // FAT12
    let mut fat_type = FatType::Fat12;
    let mut reserved = 2i64;
    let mut fatsecs = num - root_sectors - reserved;
    let mut cluster_count = fatsecs / cs;
    let mut fat_length = (((cluster_count * 3 + 1) >> 1) + ss_i - 1) / ss_i;

    if cluster_count >= FAT12_MAX_CLUSTERS {
        fat_type = FatType::Fat16;
        fatsecs = num - root_sectors - reserved;
        cluster_count = fatsecs / cs;
        fat_length = (cluster_count * 2 + ss_i - 1) / ss_i;
    }

    if cluster_count >= FAT16_MAX_CLUSTERS {
        fat_type = FatType::Fat32;
        reserved = 31;
        loop {
            reserved += 1;
            fatsecs = num - reserved;
            size_root_dir = cluster_size * sector_size;
            cluster_count = fatsecs / cs;
            fat_length = (cluster_count * 4 + ss_i - 1) / ss_i;

            let aligned = (reserved * ss_i + fat_length * i64::from(fats) * ss_i)
                % i64::from(DATA_ALIGNMENT)
                == 0;
            if sector_size != LEGACY_SECTOR_SIZE || aligned {
                break;
            }
        }
    }

    cluster_count -= fat_length * i64::from(fats) / cs;

    let root_dir_sectors = i64::from(size_root_dir) / ss_i;
    if fatsecs <= 0
        || cluster_count <= 0
        || reserved + fat_length * i64::from(fats) + root_dir_sectors > num
    {
        return Err(SysencError::InvalidState(format!(
            "{sector_count} sectors is too small for a FAT filesystem"
        )));
    }

    let (sectors, total_sect) = if sector_count >= 65536 || fat_type == FatType::Fat32 {
        (0u16, sector_count as u32)
    } else {
        (sector_count as u16, 0u32)
    };

    Ok(FatParams {
        num_sectors: sector_count,
        sector_size,
        cluster_size,
        reserved: reserved as u32,
        fats,
        dir_entries,
        size_root_dir,
        fat_type,
        fat_length: fat_length as u32,
        cluster_count: cluster_count as u32,
        media: 0xF8,
        secs_track: 1,
        heads: 1,
        hidden: 0,
        sectors,
        total_sect,
        volume_id: [0; 4],
        volume_name: *DEFAULT_LABEL,
    })
}

/// Encode the boot sector into `boot` (one sector, at least 512 bytes).
pub fn put_boot(params: &FatParams, boot: &mut [u8]) -> SysencResult<()> {
    if boot.len() < 512 {
        return Err(SysencError::InvalidBufferSize {
            expected: 512,
            actual: boot.len(),
        });
    }
    boot.fill(0);
    let fat32 = params.fat_type == FatType::Fat32;

    boot[0] = 0xEB;
    boot[1] = if fat32 { 0x58 } else { 0x3C };
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(OEM_NAME);
    boot[11..13].copy_from_slice(&(params.sector_size as u16).to_le_bytes());
    boot[13] = params.cluster_size as u8;
    boot[14..16].copy_from_slice(&(params.reserved as u16).to_le_bytes());
    boot[16] = params.fats as u8;
    if !fat32 {
        boot[17..19].copy_from_slice(&(params.dir_entries as u16).to_le_bytes());
    }
    boot[19..21].copy_from_slice(&params.sectors.to_le_bytes());
    boot[21] = params.media;
    if !fat32 {
        boot[22..24].copy_from_slice(&(params.fat_length as u16).to_le_bytes());
    }
    boot[24..26].copy_from_slice(&params.secs_track.to_le_bytes());
    boot[26..28].copy_from_slice(&params.heads.to_le_bytes());
    boot[28..32].copy_from_slice(&params.hidden.to_le_bytes());
    boot[32..36].copy_from_slice(&params.total_sect.to_le_bytes());

    let ext = if fat32 {
        boot[36..40].copy_from_slice(&params.fat_length.to_le_bytes());
        // ExtFlags and FSVer stay zero
        boot[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        boot[48..50].copy_from_slice(&1u16.to_le_bytes()); // FSInfo sector
        boot[50..52].copy_from_slice(&6u16.to_le_bytes()); // backup boot sector
        64
    } else {
        36
    };

    boot[ext] = 0x00; // drive number
    boot[ext + 2] = 0x29;
    boot[ext + 3..ext + 7].copy_from_slice(&params.volume_id);
    boot[ext + 7..ext + 18].copy_from_slice(&params.volume_name);
    boot[ext + 18..ext + 26].copy_from_slice(params.fat_type.fs_type_label());
    boot[BOOT_SIGNATURE_OFFSET] = 0x55;
    boot[BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
    Ok(())
}

/// Decode a boot sector written by [`put_boot`].
///
/// `cluster_count` is derived from the data area, which is what a reader of
/// the volume sees.
pub fn parse_boot(boot: &[u8]) -> SysencResult<FatParams> {
    if boot.len() < 512 {
        return Err(SysencError::InvalidBufferSize {
            expected: 512,
            actual: boot.len(),
        });
    }
    if boot[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2] != [0x55, 0xAA] {
        return Err(SysencError::InvalidState("boot sector signature missing".into()));
    }
    let u16_at = |o: usize| u16::from_le_bytes([boot[o], boot[o + 1]]);
    let u32_at = |o: usize| u32::from_le_bytes([boot[o], boot[o + 1], boot[o + 2], boot[o + 3]]);

    let fat32 = u16_at(22) == 0 && u16_at(17) == 0;
    let ext = if fat32 { 64 } else { 36 };
    let fat_type = match &boot[ext + 18..ext + 26] {
        b"FAT12   " => FatType::Fat12,
        b"FAT16   " => FatType::Fat16,
        b"FAT32   " => FatType::Fat32,
        other => {
            return Err(SysencError::InvalidState(format!(
                "unknown FAT type label {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };

    let sector_size = u32::from(u16_at(11));
    let cluster_size = u32::from(boot[13]);
    if sector_size == 0 || cluster_size == 0 {
        return Err(SysencError::InvalidState("zero sector or cluster size".into()));
    }
    let reserved = u32::from(u16_at(14));
    let fats = u32::from(boot[16]);
    let dir_entries = u32::from(u16_at(17));
    let sectors = u16_at(19);
    let total_sect = u32_at(32);
    let fat_length = if fat32 { u32_at(36) } else { u32::from(u16_at(22)) };
    let size_root_dir = if fat32 {
        cluster_size * sector_size
    } else {
        dir_entries * 32
    };
    let num_sectors = if sectors != 0 {
        u64::from(sectors)
    } else {
        u64::from(total_sect)
    };

    let mut volume_id = [0u8; 4];
    volume_id.copy_from_slice(&boot[ext + 3..ext + 7]);
    let mut volume_name = [0u8; 11];
    volume_name.copy_from_slice(&boot[ext + 7..ext + 18]);

    let mut params = FatParams {
        num_sectors,
        sector_size,
        cluster_size,
        reserved,
        fats,
        dir_entries: if fat32 { 512 } else { dir_entries },
        size_root_dir,
        fat_type,
        fat_length,
        cluster_count: 0,
        media: boot[21],
        secs_track: u16_at(24),
        heads: u16_at(26),
        hidden: u32_at(28),
        sectors,
        total_sect,
        volume_id,
        volume_name,
    };
    params.cluster_count = (params.free_space_sectors() / u64::from(cluster_size)) as u32;
    Ok(params)
}

/// FAT32 FSInfo sector contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_clusters: u32,
    pub next_free: u32,
}

pub fn put_fsinfo(params: &FatParams, sector: &mut [u8]) -> SysencResult<()> {
    if sector.len() < 512 {
        return Err(SysencError::InvalidBufferSize {
            expected: 512,
            actual: sector.len(),
        });
    }
    sector.fill(0);
    sector[0..4].copy_from_slice(b"RRaA");
    sector[484..488].copy_from_slice(b"rrAa");
    let root_clusters = params.size_root_dir / params.sector_size / params.cluster_size;
    let free = params.cluster_count.saturating_sub(root_clusters);
    sector[488..492].copy_from_slice(&free.to_le_bytes());
    sector[492..496].copy_from_slice(&2u32.to_le_bytes());
    sector[508..512].copy_from_slice(&[0x00, 0x00, 0x55, 0xAA]);
    Ok(())
}

pub fn parse_fsinfo(sector: &[u8]) -> SysencResult<FsInfo> {
    if sector.len() < 512 {
        return Err(SysencError::InvalidBufferSize {
            expected: 512,
            actual: sector.len(),
        });
    }
    if &sector[0..4] != b"RRaA"
        || &sector[484..488] != b"rrAa"
        || sector[508..512] != [0x00, 0x00, 0x55, 0xAA]
    {
        return Err(SysencError::InvalidState("FSInfo signatures missing".into()));
    }
    Ok(FsInfo {
        free_clusters: u32::from_le_bytes([sector[488], sector[489], sector[490], sector[491]]),
        next_free: u32::from_le_bytes([sector[492], sector[493], sector[494], sector[495]]),
    })
}

/// First FAT sector: media descriptor and end-of-chain markers.
fn put_fat_signature(params: &FatParams, sector: &mut [u8]) {
    let media = params.media;
    match params.fat_type {
        FatType::Fat32 => sector[..12].copy_from_slice(&[
            media, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F,
        ]),
        FatType::Fat16 => sector[..4].copy_from_slice(&[media, 0xFF, 0xFF, 0xFF]),
        FatType::Fat12 => sector[..4].copy_from_slice(&[media, 0xFF, 0xFF, 0x00]),
    }
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Leave free space untouched instead of filling it with ciphertext
    pub quick_format: bool,
    /// Size of the buffered write window in bytes
    pub write_buffer_size: usize,
    /// Fixed volume id; random when `None`
    pub volume_id: Option<[u8; 4]>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            quick_format: false,
            write_buffer_size: 1024 * 1024,
            volume_id: None,
        }
    }
}

/// Bytes written so far; `Break` cancels the format.
pub type FormatProgress<'a> = dyn FnMut(u64) -> ControlFlow<()> + 'a;

/// Buffers plaintext sectors, encrypts each full buffer as one batch and
/// writes it at the next sector position.
struct SectorWriter<'d> {
    dev: &'d mut dyn BlockDevice,
    buf: Zeroizing<Vec<u8>>,
    capacity: usize,
    sector_size: usize,
    /// Sector index of the first buffered sector
    buffered_from: u64,
    /// Next sector index to be assigned
    next: u64,
    start: u64,
}

impl<'d> SectorWriter<'d> {
    fn new(dev: &'d mut dyn BlockDevice, start: u64, sector_size: usize, buffer_size: usize) -> Self {
        let capacity = (buffer_size / sector_size).max(1) * sector_size;
        Self {
            dev,
            buf: Zeroizing::new(Vec::with_capacity(capacity)),
            capacity,
            sector_size,
            buffered_from: start,
            next: start,
            start,
        }
    }

    fn bytes_done(&self) -> u64 {
        (self.next - self.start) * self.sector_size as u64
    }

    fn write_sector(
        &mut self,
        sector: &[u8],
        stream: &SectorStream<'_>,
        progress: &mut FormatProgress<'_>,
    ) -> SysencResult<()> {
        self.buf.extend_from_slice(sector);
        self.next += 1;
        if self.buf.len() >= self.capacity {
            self.flush(stream)?;
            if progress(self.bytes_done()).is_break() {
                return Err(SysencError::Cancelled);
            }
        }
        Ok(())
    }

    fn flush(&mut self, stream: &SectorStream<'_>) -> SysencResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        stream.encrypt_sectors(self.buffered_from, &mut self.buf)?;
        self.dev
            .write_sectors(self.buffered_from, &self.buf)
            .map_err(|e| SysencError::device(format!("writing sector {}", self.buffered_from), e))?;
        self.buf.clear();
        self.buffered_from = self.next;
        Ok(())
    }

    /// Raw, unencrypted write outside the buffer.
    fn write_raw(&mut self, sector_index: u64, sector: &[u8]) -> SysencResult<()> {
        self.dev.write_sectors(sector_index, sector)
    }
}

/// Write a complete FAT filesystem through `ctx`, starting at `start_sector`.
///
/// Returns the parameters actually written (with the volume id filled in).
pub fn format(
    dev: &mut dyn BlockDevice,
    start_sector: u64,
    params: &FatParams,
    ctx: &CryptoContext,
    options: &FormatOptions,
    progress: &mut FormatProgress<'_>,
) -> SysencResult<FatParams> {
    let ss = params.sector_size as usize;
    if ss != dev.sector_size() {
        return Err(SysencError::InvalidBufferSize {
            expected: dev.sector_size(),
            actual: ss,
        });
    }
    if start_sector + params.num_sectors > dev.sector_count() {
        return Err(SysencError::InvalidState(format!(
            "volume of {} sectors at {start_sector} does not fit a device of {} sectors",
            params.num_sectors,
            dev.sector_count()
        )));
    }

    let mut params = params.clone();
    params.volume_id = match options.volume_id {
        Some(id) => id,
        None => {
            let mut id = [0u8; 4];
            rand::rngs::OsRng.fill_bytes(&mut id);
            id
        }
    };

    let is_device = dev.is_device();
    let stream = SectorStream::new(ctx, ss)?;
    let mut w = SectorWriter::new(dev, start_sector, ss, options.write_buffer_size);
    let mut sector = Zeroizing::new(vec![0u8; ss]);

    tracing::info!(
        fat = params.fat_type.bits(),
        sectors = params.num_sectors,
        cluster_size = params.cluster_size,
        quick = options.quick_format,
        "formatting FAT volume"
    );

    put_boot(&params, &mut sector)?;
    w.write_sector(&sector, &stream, progress)?;

    if params.fat_type == FatType::Fat32 {
        put_fsinfo(&params, &mut sector)?;
        w.write_sector(&sector, &stream, progress)?;

        while w.next - start_sector < 6 {
            sector.fill(0);
            sector[510] = 0x55;
            sector[511] = 0xAA;
            w.write_sector(&sector, &stream, progress)?;
        }

        put_boot(&params, &mut sector)?;
        w.write_sector(&sector, &stream, progress)?;
        put_fsinfo(&params, &mut sector)?;
        w.write_sector(&sector, &stream, progress)?;
    }

    while w.next - start_sector < u64::from(params.reserved) {
        sector.fill(0);
        w.write_sector(&sector, &stream, progress)?;
    }

    for _ in 0..params.fats {
        for n in 0..params.fat_length {
            sector.fill(0);
            if n == 0 {
                put_fat_signature(&params, &mut sector);
            }
            w.write_sector(&sector, &stream, progress)?;
        }
    }

    sector.fill(0);
    for _ in 0..params.root_dir_sectors() {
        w.write_sector(&sector, &stream, progress)?;
    }

    let free = params.free_space_sectors();
    let total_bytes = params.num_sectors * ss as u64;

    if !options.quick_format {
        w.flush(&stream)?;
        // Free space gets ciphertext under keys nobody keeps.
        let temporary = ctx.generate_temporary()?;
        let fill = SectorStream::new(&temporary, ss)?;
        for _ in 0..free {
            w.write_sector(&sector, &fill, progress)?;
        }
        w.flush(&fill)?;
        // Ignored: the format is complete.
        let _ = progress(w.bytes_done());
    } else if !is_device {
        w.flush(&stream)?;
        let skip = QUICK_FORMAT_STRIDE / ss as u64;
        let mut remaining = free;
        while remaining >= skip {
            w.next += skip - 1;
            let at = w.next;
            if let Err(e) = w.write_raw(at, &sector) {
                tracing::warn!(sector = at, "quick format allocation write failed, retrying: {e}");
                w.write_raw(at, &sector)
                    .map_err(|e| SysencError::device(format!("writing sector {at}"), e))?;
            }
            w.next += 1;
            remaining -= skip;
            if progress(w.bytes_done()).is_break() {
                return Err(SysencError::Cancelled);
            }
        }
        w.next += remaining;
        w.buffered_from = w.next;
        let _ = progress(w.bytes_done());
    } else {
        let _ = progress(total_bytes);
        w.flush(&stream)?;
    }

    w.dev.flush()?;
    tracing::debug!(bytes = total_bytes, "FAT volume written");
    Ok(params)
}
