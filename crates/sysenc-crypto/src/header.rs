//! Volume header codec.
//!
//! A header is one 512-byte region:
//!
//! ```text
//!   0..64    salt (clear)
//!  64..512   body, XTS-encrypted with the header key (tweak 0)
//!
//! body:
//!   0..4     magic "SENC"
//!   4..6     format version (LE)
//!   6        encryption algorithm id
//!   7        chaining mode id
//!   8        PRF id
//!   9        flags (bit 0: system volume)
//!  10..14    sector size (LE)
//!  16..24    volume size in bytes (LE)
//!  24..32    encrypted area start in bytes (LE)
//!  32..40    encrypted area length in bytes (LE)
//!  64..128   master key data (primary || secondary)
//! 416..448   BLAKE3 of body[0..416]
//! ```
//!
//! A wrong password, PIM or PRF decrypts to noise, so the magic or the
//! checksum fails and the header reads as `WrongPassword`.

use rand::RngCore;
use secrecy::SecretString;
use sysenc_core::{ChainingMode, EncryptionAlgorithm, Prf, SysencError, SysencResult};
use zeroize::Zeroizing;

use crate::kdf::{derive_header_key, HeaderKind, KdfParams, SALT_SIZE};
use crate::keys::{build_xts, CryptoContext, KeyMaterial, MASTER_KEYDATA_SIZE};

pub const HEADER_SIZE: usize = 512;
pub const HEADER_MAGIC: &[u8; 4] = b"SENC";
pub const HEADER_VERSION: u16 = 1;

const BODY_SIZE: usize = HEADER_SIZE - SALT_SIZE;
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_ALGORITHM: usize = 6;
const OFF_MODE: usize = 7;
const OFF_PRF: usize = 8;
const OFF_FLAGS: usize = 9;
const OFF_SECTOR_SIZE: usize = 10;
const OFF_VOLUME_SIZE: usize = 16;
const OFF_AREA_START: usize = 24;
const OFF_AREA_LENGTH: usize = 32;
const OFF_KEY_DATA: usize = 64;
const OFF_CHECKSUM: usize = 416;

const FLAG_SYSTEM: u8 = 0x01;

type Body = Zeroizing<[u8; BODY_SIZE]>;

/// Where the volume lives and how much of it is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeGeometry {
    pub sector_size: u32,
    pub volume_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
}

/// Decoded, non-secret header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    pub version: u16,
    pub algorithm: EncryptionAlgorithm,
    pub mode: ChainingMode,
    pub prf: Prf,
    pub kind: HeaderKind,
    pub geometry: VolumeGeometry,
}

/// Key-derivation settings for sealing a header.
#[derive(Debug, Clone)]
pub struct HeaderOptions {
    pub prf: Prf,
    pub pim: u32,
    pub kind: HeaderKind,
    pub kdf: KdfParams,
}

/// Key-derivation settings for opening a header.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Only try this PRF; `None` tries all of them.
    pub prf: Option<Prf>,
    pub kind: HeaderKind,
    pub kdf: KdfParams,
}

/// Raw 512 header bytes: salt followed by the encrypted body.
#[derive(Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    bytes: [u8; HEADER_SIZE],
}

impl std::fmt::Debug for VolumeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeHeader")
            .field("salt", &format_args!("{:02x?}..", &self.bytes[..4]))
            .finish()
    }
}

impl VolumeHeader {
    /// Generate new master keys and seal them under `password`.
    pub fn create(
        password: &SecretString,
        algorithm: EncryptionAlgorithm,
        mode: ChainingMode,
        opts: &HeaderOptions,
        geometry: VolumeGeometry,
    ) -> SysencResult<(Self, CryptoContext)> {
        let (header, unlocked) = Self::create_unlocked(password, algorithm, mode, opts, geometry)?;
        Ok((header, unlocked.into_context()))
    }

    /// Like [`VolumeHeader::create`], but keep the derived header key so the
    /// header can be re-sealed later without another KDF run.
    pub fn create_unlocked(
        password: &SecretString,
        algorithm: EncryptionAlgorithm,
        mode: ChainingMode,
        opts: &HeaderOptions,
        geometry: VolumeGeometry,
    ) -> SysencResult<(Self, UnlockedHeader)> {
        let ctx = CryptoContext::generate(algorithm, mode)?;
        let sealed = Self::seal_unlocked(password, opts, geometry, ctx)?;
        tracing::debug!(
            algorithm = %algorithm,
            prf = %opts.prf,
            volume_size = geometry.volume_size,
            "volume header created"
        );
        Ok(sealed)
    }

    /// Seal existing master keys under `password` with a fresh salt.
    pub fn seal(
        password: &SecretString,
        opts: &HeaderOptions,
        geometry: VolumeGeometry,
        ctx: &CryptoContext,
    ) -> SysencResult<Self> {
        let (header, _) = Self::seal_unlocked(password, opts, geometry, ctx.try_clone_protected()?)?;
        Ok(header)
    }

    fn seal_unlocked(
        password: &SecretString,
        opts: &HeaderOptions,
        geometry: VolumeGeometry,
        context: CryptoContext,
    ) -> SysencResult<(Self, UnlockedHeader)> {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let header_key = derive_header_key(password, &salt, opts.prf, opts.pim, opts.kind, &opts.kdf)?;
        let fields = HeaderFields {
            version: HEADER_VERSION,
            algorithm: context.algorithm(),
            mode: context.mode(),
            prf: opts.prf,
            kind: opts.kind,
            geometry,
        };
        let unlocked = UnlockedHeader {
            salt,
            header_key,
            fields,
            context,
        };
        Ok((unlocked.seal()?, unlocked))
    }

    pub fn from_bytes(bytes: &[u8]) -> SysencResult<Self> {
        let bytes: [u8; HEADER_SIZE] =
            bytes
                .try_into()
                .map_err(|_| SysencError::InvalidBufferSize {
                    expected: HEADER_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.bytes
    }

    pub fn salt(&self) -> &[u8] {
        &self.bytes[..SALT_SIZE]
    }

    /// Derive the header key and decode the header.
    pub fn unlock(
        &self,
        password: &SecretString,
        pim: u32,
        opts: &ParseOptions,
    ) -> SysencResult<UnlockedHeader> {
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&self.bytes[..SALT_SIZE]);

        let candidates: Vec<Prf> = match opts.prf {
            Some(prf) => vec![prf],
            None => Prf::ALL.to_vec(),
        };

        for prf in candidates {
            let header_key = derive_header_key(password, &salt, prf, pim, opts.kind, &opts.kdf)?;
            let Some(body) = open_body(&self.bytes, &header_key)? else {
                continue;
            };
            // Integrity holds from here on, so unknown ids are real.
            let (fields, key_data) = decode_body(&body)?;
            if fields.prf != prf {
                tracing::warn!(stored = %fields.prf, used = %prf, "header PRF id disagrees with derivation");
            }
            let context = CryptoContext::new(
                fields.algorithm,
                fields.mode,
                KeyMaterial::from_slice(&key_data[..])?,
            )?;
            tracing::debug!(prf = %prf, "volume header unlocked");
            return Ok(UnlockedHeader {
                salt,
                header_key,
                fields,
                context,
            });
        }

        Err(SysencError::WrongPassword)
    }

    /// Decode the header, returning its fields and the master key context.
    pub fn parse(
        &self,
        password: &SecretString,
        pim: u32,
        opts: &ParseOptions,
    ) -> SysencResult<(HeaderFields, CryptoContext)> {
        let unlocked = self.unlock(password, pim, opts)?;
        let fields = unlocked.fields.clone();
        Ok((fields, unlocked.into_context()))
    }

    /// Same master keys under a new password, PIM, PRF and salt.
    pub fn rewrap(
        &self,
        old_password: &SecretString,
        old_pim: u32,
        parse_opts: &ParseOptions,
        new_password: &SecretString,
        new_opts: &HeaderOptions,
    ) -> SysencResult<Self> {
        let (header, _) =
            self.rewrap_unlocked(old_password, old_pim, parse_opts, new_password, new_opts)?;
        Ok(header)
    }

    /// [`VolumeHeader::rewrap`], also returning the header opened under the
    /// new password.
    pub fn rewrap_unlocked(
        &self,
        old_password: &SecretString,
        old_pim: u32,
        parse_opts: &ParseOptions,
        new_password: &SecretString,
        new_opts: &HeaderOptions,
    ) -> SysencResult<(Self, UnlockedHeader)> {
        let unlocked = self.unlock(old_password, old_pim, parse_opts)?;
        let geometry = unlocked.fields.geometry;
        Self::seal_unlocked(new_password, new_opts, geometry, unlocked.into_context())
    }

    /// Header-sized random bytes, used as overwrite passes.
    pub fn random_fill() -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut buf);
        buf
    }
}

/// A header whose key has been derived. Re-sealing keeps the salt and
/// header key, so no KDF run is needed for bookkeeping updates.
pub struct UnlockedHeader {
    salt: [u8; SALT_SIZE],
    header_key: KeyMaterial,
    fields: HeaderFields,
    context: CryptoContext,
}

impl UnlockedHeader {
    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn context(&self) -> &CryptoContext {
        &self.context
    }

    pub fn into_context(self) -> CryptoContext {
        self.context
    }

    /// Re-encode with the same salt and header key.
    pub fn seal(&self) -> SysencResult<VolumeHeader> {
        seal_body(
            &self.salt,
            &self.header_key,
            &encode_body(&self.fields, self.context.key_data()),
        )
    }

    /// Record a new encrypted area and re-encode.
    pub fn with_encrypted_area(&mut self, start: u64, length: u64) -> SysencResult<VolumeHeader> {
        self.fields.geometry.encrypted_area_start = start;
        self.fields.geometry.encrypted_area_length = length;
        self.seal()
    }

    /// Encode with a different encrypted area, leaving `self` unchanged.
    pub fn seal_with_area(&self, start: u64, length: u64) -> SysencResult<VolumeHeader> {
        let mut fields = self.fields.clone();
        fields.geometry.encrypted_area_start = start;
        fields.geometry.encrypted_area_length = length;
        seal_body(
            &self.salt,
            &self.header_key,
            &encode_body(&fields, self.context.key_data()),
        )
    }

    /// A copy of this header under a fresh salt, for the backup location.
    pub fn backup_copy(
        &self,
        password: &SecretString,
        pim: u32,
        kdf: &KdfParams,
    ) -> SysencResult<VolumeHeader> {
        let opts = HeaderOptions {
            prf: self.fields.prf,
            pim,
            kind: self.fields.kind,
            kdf: kdf.clone(),
        };
        VolumeHeader::seal(password, &opts, self.fields.geometry, &self.context)
    }
}

impl std::fmt::Debug for UnlockedHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedHeader")
            .field("fields", &self.fields)
            .field("header_key", &"[REDACTED]")
            .finish()
    }
}

fn encode_body(fields: &HeaderFields, key_data: &[u8]) -> Body {
    let mut body: Body = Zeroizing::new([0u8; BODY_SIZE]);
    let g = &fields.geometry;
    body[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(HEADER_MAGIC);
    body[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&fields.version.to_le_bytes());
    body[OFF_ALGORITHM] = fields.algorithm.id();
    body[OFF_MODE] = fields.mode.id();
    body[OFF_PRF] = fields.prf.id();
    body[OFF_FLAGS] = match fields.kind {
        HeaderKind::System => FLAG_SYSTEM,
        HeaderKind::Standard => 0,
    };
    body[OFF_SECTOR_SIZE..OFF_SECTOR_SIZE + 4].copy_from_slice(&g.sector_size.to_le_bytes());
    body[OFF_VOLUME_SIZE..OFF_VOLUME_SIZE + 8].copy_from_slice(&g.volume_size.to_le_bytes());
    body[OFF_AREA_START..OFF_AREA_START + 8].copy_from_slice(&g.encrypted_area_start.to_le_bytes());
    body[OFF_AREA_LENGTH..OFF_AREA_LENGTH + 8]
        .copy_from_slice(&g.encrypted_area_length.to_le_bytes());
    body[OFF_KEY_DATA..OFF_KEY_DATA + MASTER_KEYDATA_SIZE].copy_from_slice(key_data);
    update_checksum(&mut body);
    body
}

fn update_checksum(body: &mut [u8; BODY_SIZE]) {
    let digest = blake3::hash(&body[..OFF_CHECKSUM]);
    body[OFF_CHECKSUM..].copy_from_slice(digest.as_bytes());
}

fn checksum_ok(body: &[u8; BODY_SIZE]) -> bool {
    let mut stored = [0u8; blake3::OUT_LEN];
    stored.copy_from_slice(&body[OFF_CHECKSUM..]);
    // blake3::Hash equality is constant-time
    blake3::Hash::from_bytes(stored) == blake3::hash(&body[..OFF_CHECKSUM])
}

fn seal_body(
    salt: &[u8; SALT_SIZE],
    header_key: &KeyMaterial,
    body: &[u8; BODY_SIZE],
) -> SysencResult<VolumeHeader> {
    let half = header_key.len() / 2;
    let xts = build_xts(&header_key.as_bytes()[..half], &header_key.as_bytes()[half..])?;
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[..SALT_SIZE].copy_from_slice(salt);
    bytes[SALT_SIZE..].copy_from_slice(body);
    xts.encrypt_sector(&mut bytes[SALT_SIZE..], [0u8; 16]);
    Ok(VolumeHeader { bytes })
}

fn open_body(bytes: &[u8; HEADER_SIZE], header_key: &KeyMaterial) -> SysencResult<Option<Body>> {
    let half = header_key.len() / 2;
    let xts = build_xts(&header_key.as_bytes()[..half], &header_key.as_bytes()[half..])?;
    let mut body: Body = Zeroizing::new([0u8; BODY_SIZE]);
    body.copy_from_slice(&bytes[SALT_SIZE..]);
    xts.decrypt_sector(&mut body[..], [0u8; 16]);
    if &body[OFF_MAGIC..OFF_MAGIC + 4] != HEADER_MAGIC || !checksum_ok(&body) {
        return Ok(None);
    }
    Ok(Some(body))
}

fn decode_body(body: &[u8; BODY_SIZE]) -> SysencResult<(HeaderFields, Zeroizing<[u8; MASTER_KEYDATA_SIZE]>)> {
    let u16_at = |o: usize| u16::from_le_bytes([body[o], body[o + 1]]);
    let u32_at = |o: usize| u32::from_le_bytes([body[o], body[o + 1], body[o + 2], body[o + 3]]);
    let u64_at = |o: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&body[o..o + 8]);
        u64::from_le_bytes(b)
    };

    let version = u16_at(OFF_VERSION);
    if version > HEADER_VERSION {
        return Err(SysencError::UnsupportedAlgorithm(format!(
            "header format version {version}"
        )));
    }

    let fields = HeaderFields {
        version,
        algorithm: EncryptionAlgorithm::from_id(body[OFF_ALGORITHM])?,
        mode: ChainingMode::from_id(body[OFF_MODE])?,
        prf: Prf::from_id(body[OFF_PRF])?,
        kind: if body[OFF_FLAGS] & FLAG_SYSTEM != 0 {
            HeaderKind::System
        } else {
            HeaderKind::Standard
        },
        geometry: VolumeGeometry {
            sector_size: u32_at(OFF_SECTOR_SIZE),
            volume_size: u64_at(OFF_VOLUME_SIZE),
            encrypted_area_start: u64_at(OFF_AREA_START),
            encrypted_area_length: u64_at(OFF_AREA_LENGTH),
        },
    };

    let mut key_data = Zeroizing::new([0u8; MASTER_KEYDATA_SIZE]);
    key_data.copy_from_slice(&body[OFF_KEY_DATA..OFF_KEY_DATA + MASTER_KEYDATA_SIZE]);
    Ok((fields, key_data))
}
