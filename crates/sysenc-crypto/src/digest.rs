//! Boot loader fingerprints and checksums

use sha2::{Digest, Sha512};
use sysenc_core::{SysencError, SysencResult};

/// SHA-512 and BLAKE3 digests of a loader image.
#[derive(Clone, PartialEq, Eq)]
pub struct LoaderFingerprint {
    pub sha512: [u8; 64],
    pub blake3: [u8; 32],
}

impl LoaderFingerprint {
    pub fn compute(data: &[u8]) -> Self {
        let mut sha512 = [0u8; 64];
        sha512.copy_from_slice(&Sha512::digest(data));
        Self {
            sha512,
            blake3: *blake3::hash(data).as_bytes(),
        }
    }

    /// Compute over several byte ranges as if they were one buffer.
    pub fn compute_parts(parts: &[&[u8]]) -> Self {
        let mut sha = Sha512::new();
        let mut b3 = blake3::Hasher::new();
        for part in parts {
            sha.update(part);
            b3.update(part);
        }
        let mut sha512 = [0u8; 64];
        sha512.copy_from_slice(&sha.finalize());
        Self {
            sha512,
            blake3: *b3.finalize().as_bytes(),
        }
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(192);
        for b in self.sha512.iter().chain(self.blake3.iter()) {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// `IntegrityMismatch` unless both digests agree.
    pub fn verify(&self, expected: &LoaderFingerprint) -> SysencResult<()> {
        if self.blake3 != expected.blake3 || self.sha512 != expected.sha512 {
            return Err(SysencError::IntegrityMismatch(format!(
                "boot loader fingerprint {} does not match expected {}",
                &self.to_hex()[..16],
                &expected.to_hex()[..16]
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoaderFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoaderFingerprint({})", &self.to_hex()[..32])
    }
}

/// Rotating additive checksum stored next to the loader in the boot sector.
pub fn loader_checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)).rotate_left(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_equal_whole() {
        let data = b"boot sector then loader code";
        let whole = LoaderFingerprint::compute(data);
        let parts = LoaderFingerprint::compute_parts(&[&data[..11], &data[11..]]);
        assert_eq!(whole, parts);
        assert!(whole.verify(&parts).is_ok());
    }

    #[test]
    fn single_bit_flip_detected() {
        let mut data = vec![0x90u8; 4096];
        let expected = LoaderFingerprint::compute(&data);
        data[1234] ^= 0x01;
        let actual = LoaderFingerprint::compute(&data);
        assert!(matches!(
            actual.verify(&expected),
            Err(SysencError::IntegrityMismatch(_))
        ));
    }

    #[test]
    fn checksum_is_order_sensitive() {
        assert_eq!(loader_checksum(&[]), 0);
        assert_eq!(loader_checksum(&[1]), 2);
        assert_ne!(loader_checksum(&[1, 2]), loader_checksum(&[2, 1]));
    }

    #[test]
    fn hex_length() {
        assert_eq!(LoaderFingerprint::compute(b"x").to_hex().len(), 192);
    }
}
