//! Key material: locked, zeroed-on-drop buffers and the crypto context built on them

use aes::cipher::KeyInit;
use aes::Aes256;
use memmap2::MmapMut;
use rand::RngCore;
use sysenc_core::{ChainingMode, EncryptionAlgorithm, SysencError, SysencResult};
use xts_mode::Xts128;
use zeroize::Zeroize;

/// Bytes of master key data: primary key followed by the secondary (tweak) key.
pub const MASTER_KEYDATA_SIZE: usize = 64;

/// Sensitive bytes held in an anonymous mapping locked into RAM.
///
/// The mapping is zeroed when the guard is dropped, on every exit path.
/// Locking is best effort: a platform or rlimit refusal is logged once per
/// allocation and the buffer is still used.
pub struct KeyMaterial {
    map: MmapMut,
    len: usize,
}

impl KeyMaterial {
    /// Allocate `len` zero bytes of protected memory.
    pub fn zeroed(len: usize) -> SysencResult<Self> {
        if len == 0 {
            return Err(SysencError::ResourceExhausted(
                "zero-length key buffer requested".into(),
            ));
        }
        let map = MmapMut::map_anon(len).map_err(|e| {
            SysencError::ResourceExhausted(format!("allocating {len} bytes of key memory: {e}"))
        })?;
        #[cfg(unix)]
        if let Err(e) = map.lock() {
            tracing::debug!("key memory could not be locked (continuing unlocked): {e}");
        }
        Ok(Self { map, len })
    }

    /// Allocate protected memory filled from the OS random source.
    pub fn random(len: usize) -> SysencResult<Self> {
        let mut key = Self::zeroed(len)?;
        rand::rngs::OsRng.fill_bytes(key.as_bytes_mut());
        Ok(key)
    }

    /// Copy `bytes` into protected memory. The caller remains responsible
    /// for zeroing its own copy.
    pub fn from_slice(bytes: &[u8]) -> SysencResult<Self> {
        let mut key = Self::zeroed(bytes.len())?;
        key.as_bytes_mut().copy_from_slice(bytes);
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }

    /// The only way to duplicate key bytes: into another protected buffer.
    pub fn try_clone_protected(&self) -> SysencResult<Self> {
        Self::from_slice(self.as_bytes())
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.map[..].zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.len)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Selected cipher and mode, the master key data and the derived key schedule.
pub struct CryptoContext {
    algorithm: EncryptionAlgorithm,
    mode: ChainingMode,
    keys: KeyMaterial,
    cipher: Xts128<Aes256>,
}

impl CryptoContext {
    /// Build a context from 64 bytes of master key data.
    pub fn new(
        algorithm: EncryptionAlgorithm,
        mode: ChainingMode,
        keys: KeyMaterial,
    ) -> SysencResult<Self> {
        let key_size = algorithm.key_size();
        if keys.len() != key_size * 2 {
            return Err(SysencError::InvalidBufferSize {
                expected: key_size * 2,
                actual: keys.len(),
            });
        }
        let cipher = build_xts(&keys.as_bytes()[..key_size], &keys.as_bytes()[key_size..])?;
        Ok(Self {
            algorithm,
            mode,
            keys,
            cipher,
        })
    }

    /// Fresh random primary and secondary keys.
    pub fn generate(algorithm: EncryptionAlgorithm, mode: ChainingMode) -> SysencResult<Self> {
        let keys = KeyMaterial::random(algorithm.key_size() * 2)?;
        Self::new(algorithm, mode, keys)
    }

    /// An independent context with the same algorithm and mode but new
    /// random keys. Used to fill free space with ciphertext that cannot be
    /// told apart from real data; never persisted.
    pub fn generate_temporary(&self) -> SysencResult<Self> {
        Self::generate(self.algorithm, self.mode)
    }

    /// Duplicate into another protected context.
    pub fn try_clone_protected(&self) -> SysencResult<Self> {
        Self::new(self.algorithm, self.mode, self.keys.try_clone_protected()?)
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    pub fn mode(&self) -> ChainingMode {
        self.mode
    }

    /// True when both contexts hold the same master key data.
    pub fn same_keys(&self, other: &CryptoContext) -> bool {
        self.algorithm == other.algorithm
            && self.mode == other.mode
            && self.keys.as_bytes() == other.keys.as_bytes()
    }

    pub(crate) fn key_data(&self) -> &[u8] {
        self.keys.as_bytes()
    }

    pub(crate) fn cipher(&self) -> &Xts128<Aes256> {
        &self.cipher
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("algorithm", &self.algorithm)
            .field("mode", &self.mode)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

pub(crate) fn build_xts(primary: &[u8], secondary: &[u8]) -> SysencResult<Xts128<Aes256>> {
    let c1 = Aes256::new_from_slice(primary)
        .map_err(|e| SysencError::UnsupportedAlgorithm(format!("AES key schedule: {e}")))?;
    let c2 = Aes256::new_from_slice(secondary)
        .map_err(|e| SysencError::UnsupportedAlgorithm(format!("AES key schedule: {e}")))?;
    Ok(Xts128::new(c1, c2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_keys_differ() {
        let k1 = KeyMaterial::random(64).unwrap();
        let k2 = KeyMaterial::random(64).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn protected_clone_is_equal_but_distinct() {
        let k1 = KeyMaterial::random(32).unwrap();
        let k2 = k1.try_clone_protected().unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k1.as_bytes().as_ptr(), k2.as_bytes().as_ptr());
    }

    #[test]
    fn zero_length_rejected() {
        assert!(matches!(
            KeyMaterial::zeroed(0),
            Err(SysencError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn context_requires_two_keys() {
        let short = KeyMaterial::random(32).unwrap();
        let err = CryptoContext::new(EncryptionAlgorithm::Aes, ChainingMode::Xts, short).unwrap_err();
        assert!(matches!(
            err,
            SysencError::InvalidBufferSize {
                expected: 64,
                actual: 32
            }
        ));
    }

    #[test]
    fn temporary_context_has_new_keys() {
        let ctx = CryptoContext::generate(EncryptionAlgorithm::Aes, ChainingMode::Xts).unwrap();
        let tmp = ctx.generate_temporary().unwrap();
        assert_eq!(tmp.algorithm(), ctx.algorithm());
        assert_ne!(tmp.key_data(), ctx.key_data());
    }

    #[test]
    fn debug_redacts_keys() {
        let ctx = CryptoContext::generate(EncryptionAlgorithm::Aes, ChainingMode::Xts).unwrap();
        let dbg = format!("{ctx:?}");
        assert!(dbg.contains("REDACTED"));
    }
}
