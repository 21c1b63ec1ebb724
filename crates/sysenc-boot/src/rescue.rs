//! Rescue disk: an ISO9660 image booting a 1.44 MB El Torito floppy.
//!
//! ISO layout (2048-byte sectors):
//!
//! ```text
//! 0..16    system area (zero)
//! 16       primary volume descriptor
//! 17       El Torito boot record
//! 18       descriptor set terminator
//! 19, 20   L and M path tables
//! 21       root directory
//! 22       boot catalog
//! 23..743  floppy image
//! ```
//!
//! Floppy layout (512-byte sectors): rescue boot sector at 0, loader from
//! 1, backup volume header at 62, original MBR at 63.

use sysenc_core::{SysencError, SysencResult};
use sysenc_crypto::{VolumeHeader, HEADER_SIZE};

use crate::area::{BOOT_VOLUME_HEADER_SECTOR, LOADER_FIRST_SECTOR, SECTOR_SIZE};
use crate::image::BootLoaderImage;

pub const RESCUE_ISO_SIZE: usize = 1_835_008;
pub const ISO_SECTOR_SIZE: usize = 2048;
pub const FLOPPY_SIZE: usize = 1_474_560;
pub const FLOPPY_ORIGINAL_MBR_SECTOR: usize = 63;

const PVD_LBA: usize = 16;
const BOOT_RECORD_LBA: usize = 17;
const TERMINATOR_LBA: usize = 18;
const L_PATH_TABLE_LBA: usize = 19;
const M_PATH_TABLE_LBA: usize = 20;
const ROOT_DIR_LBA: usize = 21;
const CATALOG_LBA: usize = 22;
const FLOPPY_LBA: usize = 23;

const CD001: &[u8; 5] = b"CD001";
const EL_TORITO_ID: &[u8] = b"EL TORITO SPECIFICATION";
const PATH_TABLE_SIZE: u32 = 10;
const CATALOG_ENTRY_SIZE: usize = 32;
const BOOTABLE: u8 = 0x88;
const MEDIA_FLOPPY_144: u8 = 0x02;

fn sector_mut(iso: &mut [u8], lba: usize) -> &mut [u8] {
    &mut iso[lba * ISO_SECTOR_SIZE..(lba + 1) * ISO_SECTOR_SIZE]
}

fn sector(iso: &[u8], lba: usize) -> &[u8] {
    &iso[lba * ISO_SECTOR_SIZE..(lba + 1) * ISO_SECTOR_SIZE]
}

fn both_u16(out: &mut [u8], v: u16) {
    out[..2].copy_from_slice(&v.to_le_bytes());
    out[2..4].copy_from_slice(&v.to_be_bytes());
}

fn both_u32(out: &mut [u8], v: u32) {
    out[..4].copy_from_slice(&v.to_le_bytes());
    out[4..8].copy_from_slice(&v.to_be_bytes());
}

fn padded(out: &mut [u8], text: &[u8], fill: u8) {
    out.fill(fill);
    out[..text.len()].copy_from_slice(text);
}

fn directory_record(out: &mut [u8], name: u8) {
    out[0] = 34;
    both_u32(&mut out[2..10], ROOT_DIR_LBA as u32);
    both_u32(&mut out[10..18], ISO_SECTOR_SIZE as u32);
    out[25] = 0x02;
    both_u16(&mut out[28..32], 1);
    out[32] = 1;
    out[33] = name;
}

fn write_pvd(out: &mut [u8]) {
    out[0] = 1;
    out[1..6].copy_from_slice(CD001);
    out[6] = 1;
    padded(&mut out[8..40], b"", b' ');
    padded(&mut out[40..72], b"SYSENC_RESCUE_DISK", b' ');
    both_u32(&mut out[80..88], (RESCUE_ISO_SIZE / ISO_SECTOR_SIZE) as u32);
    both_u16(&mut out[120..124], 1);
    both_u16(&mut out[124..128], 1);
    both_u16(&mut out[128..132], ISO_SECTOR_SIZE as u16);
    both_u32(&mut out[132..140], PATH_TABLE_SIZE);
    out[140..144].copy_from_slice(&(L_PATH_TABLE_LBA as u32).to_le_bytes());
    out[148..152].copy_from_slice(&(M_PATH_TABLE_LBA as u32).to_be_bytes());
    directory_record(&mut out[156..190], 0);
    padded(&mut out[190..318], b"", b' ');
    padded(&mut out[318..446], b"", b' ');
    padded(&mut out[446..574], b"", b' ');
    padded(&mut out[574..702], b"SYSENC RESCUE DISK", b' ');
    padded(&mut out[702..813], b"", b' ');
    // Creation, modification, expiration, effective: "not specified".
    for date in out[813..881].chunks_mut(17) {
        date[..16].fill(b'0');
        date[16] = 0;
    }
    out[881] = 1;
}

fn write_boot_record(out: &mut [u8]) {
    out[0] = 0;
    out[1..6].copy_from_slice(CD001);
    out[6] = 1;
    out[7..7 + EL_TORITO_ID.len()].copy_from_slice(EL_TORITO_ID);
    out[71..75].copy_from_slice(&(CATALOG_LBA as u32).to_le_bytes());
}

fn write_terminator(out: &mut [u8]) {
    out[0] = 255;
    out[1..6].copy_from_slice(CD001);
    out[6] = 1;
}

fn write_path_table(out: &mut [u8], big_endian: bool) {
    out[0] = 1;
    let (extent, parent) = if big_endian {
        ((ROOT_DIR_LBA as u32).to_be_bytes(), 1u16.to_be_bytes())
    } else {
        ((ROOT_DIR_LBA as u32).to_le_bytes(), 1u16.to_le_bytes())
    };
    out[2..6].copy_from_slice(&extent);
    out[6..8].copy_from_slice(&parent);
}

fn catalog_checksum(entry: &[u8]) -> u16 {
    entry
        .chunks_exact(2)
        .fold(0u16, |sum, w| sum.wrapping_add(u16::from_le_bytes([w[0], w[1]])))
}

fn write_catalog(out: &mut [u8]) {
    let validation = &mut out[..CATALOG_ENTRY_SIZE];
    validation[0] = 1;
    validation[1] = 0; // x86
    padded(&mut validation[4..28], b"SYSENC", 0);
    validation[30] = 0x55;
    validation[31] = 0xAA;
    let sum = catalog_checksum(validation);
    validation[28..30].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());

    let initial = &mut out[CATALOG_ENTRY_SIZE..2 * CATALOG_ENTRY_SIZE];
    initial[0] = BOOTABLE;
    initial[1] = MEDIA_FLOPPY_144;
    initial[6..8].copy_from_slice(&1u16.to_le_bytes());
    initial[8..12].copy_from_slice(&(FLOPPY_LBA as u32).to_le_bytes());
}

/// Build the rescue ISO from a rescue-flagged loader image, the rescue
/// copy of the volume header and the drive's original sector 0.
pub fn build_rescue_image(
    image: &BootLoaderImage,
    header: &VolumeHeader,
    original_mbr: &[u8],
) -> SysencResult<Vec<u8>> {
    if !image.is_rescue() {
        return Err(SysencError::InvalidState(
            "rescue disk needs a rescue boot loader image".into(),
        ));
    }
    if original_mbr.len() != SECTOR_SIZE {
        return Err(SysencError::InvalidBufferSize {
            expected: SECTOR_SIZE,
            actual: original_mbr.len(),
        });
    }

    let mut iso = vec![0u8; RESCUE_ISO_SIZE];
    write_pvd(sector_mut(&mut iso, PVD_LBA));
    write_boot_record(sector_mut(&mut iso, BOOT_RECORD_LBA));
    write_terminator(sector_mut(&mut iso, TERMINATOR_LBA));
    write_path_table(sector_mut(&mut iso, L_PATH_TABLE_LBA), false);
    write_path_table(sector_mut(&mut iso, M_PATH_TABLE_LBA), true);
    {
        let root = sector_mut(&mut iso, ROOT_DIR_LBA);
        directory_record(&mut root[..34], 0);
        directory_record(&mut root[34..68], 1);
    }
    write_catalog(sector_mut(&mut iso, CATALOG_LBA));

    let floppy = &mut iso[FLOPPY_LBA * ISO_SECTOR_SIZE..FLOPPY_LBA * ISO_SECTOR_SIZE + FLOPPY_SIZE];
    floppy[..SECTOR_SIZE].copy_from_slice(image.boot_sector());
    let loader_start = LOADER_FIRST_SECTOR as usize * SECTOR_SIZE;
    floppy[loader_start..loader_start + image.loader().len()].copy_from_slice(image.loader());
    let header_start = BOOT_VOLUME_HEADER_SECTOR as usize * SECTOR_SIZE;
    floppy[header_start..header_start + HEADER_SIZE].copy_from_slice(header.as_bytes());
    let mbr_start = FLOPPY_ORIGINAL_MBR_SECTOR * SECTOR_SIZE;
    floppy[mbr_start..mbr_start + SECTOR_SIZE].copy_from_slice(original_mbr);

    tracing::info!(size = iso.len(), "rescue disk image built");
    Ok(iso)
}

/// Pieces of a rescue image.
#[derive(Debug)]
pub struct RescueContents<'a> {
    pub boot_sector: &'a [u8],
    /// Loader area (sectors 1..62 of the floppy)
    pub loader_area: &'a [u8],
    pub header: VolumeHeader,
    pub original_mbr: &'a [u8],
}

fn mismatch(what: &str) -> SysencError {
    SysencError::IntegrityMismatch(format!("rescue disk image: {what}"))
}

/// Walk the ISO structures down to the floppy image.
pub fn parse_rescue_image(iso: &[u8]) -> SysencResult<RescueContents<'_>> {
    if iso.len() != RESCUE_ISO_SIZE {
        return Err(mismatch(&format!(
            "size is {} bytes, expected {RESCUE_ISO_SIZE}",
            iso.len()
        )));
    }
    let pvd = sector(iso, PVD_LBA);
    if pvd[0] != 1 || &pvd[1..6] != CD001 {
        return Err(mismatch("missing primary volume descriptor"));
    }
    let record = sector(iso, BOOT_RECORD_LBA);
    if record[0] != 0 || &record[1..6] != CD001 || &record[7..7 + EL_TORITO_ID.len()] != EL_TORITO_ID
    {
        return Err(mismatch("missing El Torito boot record"));
    }
    let catalog_lba =
        u32::from_le_bytes([record[71], record[72], record[73], record[74]]) as usize;
    if (catalog_lba + 1) * ISO_SECTOR_SIZE > iso.len() {
        return Err(mismatch("boot catalog outside the image"));
    }

    let catalog = sector(iso, catalog_lba);
    let validation = &catalog[..CATALOG_ENTRY_SIZE];
    if validation[0] != 1 || validation[30..32] != [0x55, 0xAA] || catalog_checksum(validation) != 0
    {
        return Err(mismatch("invalid boot catalog validation entry"));
    }
    let initial = &catalog[CATALOG_ENTRY_SIZE..2 * CATALOG_ENTRY_SIZE];
    if initial[0] != BOOTABLE || initial[1] != MEDIA_FLOPPY_144 {
        return Err(mismatch("boot entry is not a bootable 1.44 MB floppy"));
    }
    let floppy_lba =
        u32::from_le_bytes([initial[8], initial[9], initial[10], initial[11]]) as usize;
    let start = floppy_lba * ISO_SECTOR_SIZE;
    let floppy = iso
        .get(start..start + FLOPPY_SIZE)
        .ok_or_else(|| mismatch("floppy image outside the image"))?;

    let loader_start = LOADER_FIRST_SECTOR as usize * SECTOR_SIZE;
    let header_start = BOOT_VOLUME_HEADER_SECTOR as usize * SECTOR_SIZE;
    let mbr_start = FLOPPY_ORIGINAL_MBR_SECTOR * SECTOR_SIZE;
    Ok(RescueContents {
        boot_sector: &floppy[..SECTOR_SIZE],
        loader_area: &floppy[loader_start..header_start],
        header: VolumeHeader::from_bytes(&floppy[header_start..header_start + HEADER_SIZE])?,
        original_mbr: &floppy[mbr_start..mbr_start + SECTOR_SIZE],
    })
}

/// Check that `iso` carries `expected_loader` and, when given, exactly
/// `expected_header`.
pub fn verify_rescue_image<'a>(
    iso: &'a [u8],
    expected_loader: &BootLoaderImage,
    expected_header: Option<&VolumeHeader>,
) -> SysencResult<RescueContents<'a>> {
    let contents = parse_rescue_image(iso)?;
    if contents.boot_sector != expected_loader.boot_sector() {
        return Err(mismatch("boot sector differs"));
    }
    let loader = expected_loader.loader();
    if &contents.loader_area[..loader.len()] != loader {
        return Err(mismatch("boot loader differs"));
    }
    if let Some(header) = expected_header {
        if &contents.header != header {
            return Err(mismatch("volume header differs"));
        }
    }
    tracing::info!("rescue disk image verified");
    Ok(contents)
}
