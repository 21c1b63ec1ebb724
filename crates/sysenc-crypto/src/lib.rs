//! sysenc-crypto: key material, sector encryption and volume headers
//!
//! Sectors are encrypted with AES-256 in XTS mode, one sector at a time,
//! tweaked by the sector index relative to the encrypted-area origin.
//!
//! Key hierarchy:
//! ```text
//! Password + PIM + salt ──PBKDF2-HMAC-SHA-512/256 or Argon2id──▶ header key (512-bit)
//!   └── Volume header body (XTS, tweak 0)
//!       └── Master key data (primary || secondary, 512-bit)
//!           └── Sector stream: XTS(primary, secondary, tweak = sector index)
//! ```
//!
//! Key bytes live in locked anonymous mappings ([`KeyMaterial`]) that are
//! zeroed on drop.

pub mod digest;
pub mod header;
pub mod kdf;
pub mod keys;
pub mod sector;

pub use digest::{loader_checksum, LoaderFingerprint};
pub use header::{
    HeaderFields, HeaderOptions, ParseOptions, UnlockedHeader, VolumeGeometry, VolumeHeader,
    HEADER_SIZE,
};
pub use kdf::{derive_header_key, HeaderKind, KdfParams, SALT_SIZE};
pub use keys::{CryptoContext, KeyMaterial, MASTER_KEYDATA_SIZE};
pub use sector::{validate_sector_size, SectorStream};
