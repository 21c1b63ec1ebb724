//! Per-sector AES-XTS transform.
//!
//! Every sector is encrypted independently with the sector index as the XTS
//! tweak (little-endian in the 128-bit tweak block). The index is relative
//! to the origin of the encrypted area, so the same plaintext at a
//! different index produces different ciphertext and a transform can be
//! restarted anywhere at a sector boundary.

use rayon::prelude::*;
use sysenc_core::{SysencError, SysencResult};
use xts_mode::get_tweak_default;
use zeroize::Zeroizing;

use crate::keys::CryptoContext;

pub const MIN_SECTOR_SIZE: usize = 512;
pub const MAX_SECTOR_SIZE: usize = 4096;

/// Reject sector sizes that are not a power of two in 512..=4096.
pub fn validate_sector_size(sector_size: usize) -> SysencResult<()> {
    if !sector_size.is_power_of_two()
        || !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&sector_size)
    {
        return Err(SysencError::InvalidState(format!(
            "unsupported sector size {sector_size}"
        )));
    }
    Ok(())
}

/// A crypto context bound to a sector size.
#[derive(Debug, Clone, Copy)]
pub struct SectorStream<'a> {
    ctx: &'a CryptoContext,
    sector_size: usize,
}

impl<'a> SectorStream<'a> {
    pub fn new(ctx: &'a CryptoContext, sector_size: usize) -> SysencResult<Self> {
        validate_sector_size(sector_size)?;
        Ok(Self { ctx, sector_size })
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn context(&self) -> &'a CryptoContext {
        self.ctx
    }

    fn check_one(&self, len: usize) -> SysencResult<()> {
        if len != self.sector_size {
            return Err(SysencError::InvalidBufferSize {
                expected: self.sector_size,
                actual: len,
            });
        }
        Ok(())
    }

    fn check_many(&self, len: usize) -> SysencResult<()> {
        if len == 0 || len % self.sector_size != 0 {
            return Err(SysencError::InvalidBufferSize {
                expected: len.div_ceil(self.sector_size).max(1) * self.sector_size,
                actual: len,
            });
        }
        Ok(())
    }

    pub fn encrypt_sector_in_place(&self, sector_index: u64, buf: &mut [u8]) -> SysencResult<()> {
        self.check_one(buf.len())?;
        self.ctx
            .cipher()
            .encrypt_sector(buf, get_tweak_default(u128::from(sector_index)));
        Ok(())
    }

    pub fn decrypt_sector_in_place(&self, sector_index: u64, buf: &mut [u8]) -> SysencResult<()> {
        self.check_one(buf.len())?;
        self.ctx
            .cipher()
            .decrypt_sector(buf, get_tweak_default(u128::from(sector_index)));
        Ok(())
    }

    /// Encrypt one sector into a new buffer.
    pub fn encrypt_sector(
        &self,
        plaintext: &[u8],
        sector_index: u64,
    ) -> SysencResult<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(plaintext.to_vec());
        self.encrypt_sector_in_place(sector_index, &mut out)?;
        Ok(out)
    }

    /// Decrypt one sector into a buffer that is zeroed on drop.
    pub fn decrypt_sector(
        &self,
        ciphertext: &[u8],
        sector_index: u64,
    ) -> SysencResult<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(ciphertext.to_vec());
        self.decrypt_sector_in_place(sector_index, &mut out)?;
        Ok(out)
    }

    /// Encrypt a contiguous run of sectors starting at `first_index`, in parallel.
    pub fn encrypt_sectors(&self, first_index: u64, buf: &mut [u8]) -> SysencResult<()> {
        self.check_many(buf.len())?;
        let cipher = self.ctx.cipher();
        buf.par_chunks_mut(self.sector_size)
            .enumerate()
            .for_each(|(i, sector)| {
                let index = u128::from(first_index) + i as u128;
                cipher.encrypt_sector(sector, get_tweak_default(index));
            });
        Ok(())
    }

    /// Decrypt a contiguous run of sectors starting at `first_index`, in parallel.
    pub fn decrypt_sectors(&self, first_index: u64, buf: &mut [u8]) -> SysencResult<()> {
        self.check_many(buf.len())?;
        let cipher = self.ctx.cipher();
        buf.par_chunks_mut(self.sector_size)
            .enumerate()
            .for_each(|(i, sector)| {
                let index = u128::from(first_index) + i as u128;
                cipher.decrypt_sector(sector, get_tweak_default(index));
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sysenc_core::{ChainingMode, EncryptionAlgorithm};

    fn ctx() -> CryptoContext {
        CryptoContext::generate(EncryptionAlgorithm::Aes, ChainingMode::Xts).unwrap()
    }

    #[test]
    fn sector_roundtrip() {
        let ctx = ctx();
        let stream = SectorStream::new(&ctx, 512).unwrap();
        let plain: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        let ct = stream.encrypt_sector(&plain, 7).unwrap();
        assert_ne!(*ct, plain);
        assert_eq!(*stream.decrypt_sector(&ct, 7).unwrap(), plain);
    }

    #[test]
    fn same_plaintext_different_index_differs() {
        let ctx = ctx();
        let stream = SectorStream::new(&ctx, 512).unwrap();
        let plain = vec![0u8; 512];
        let a = stream.encrypt_sector(&plain, 0).unwrap();
        let b = stream.encrypt_sector(&plain, 1).unwrap();
        assert_ne!(a, b, "tweak must change the ciphertext");
    }

    #[test]
    fn deterministic_for_same_context() {
        let ctx = ctx();
        let stream = SectorStream::new(&ctx, 4096).unwrap();
        let plain = vec![0xA5u8; 4096];
        assert_eq!(
            stream.encrypt_sector(&plain, 99).unwrap(),
            stream.encrypt_sector(&plain, 99).unwrap()
        );
    }

    #[test]
    fn wrong_length_rejected() {
        let ctx = ctx();
        let stream = SectorStream::new(&ctx, 512).unwrap();
        let err = stream.encrypt_sector(&[0u8; 511], 0).unwrap_err();
        assert!(matches!(
            err,
            SysencError::InvalidBufferSize {
                expected: 512,
                actual: 511
            }
        ));
        assert!(stream.encrypt_sectors(0, &mut [0u8; 700]).is_err());
        assert!(stream.encrypt_sectors(0, &mut []).is_err());
    }

    #[test]
    fn unsupported_sector_sizes() {
        let ctx = ctx();
        for size in [0, 256, 1000, 8192] {
            assert!(SectorStream::new(&ctx, size).is_err(), "size {size}");
        }
        for size in [512, 1024, 2048, 4096] {
            assert!(SectorStream::new(&ctx, size).is_ok(), "size {size}");
        }
    }

    #[test]
    fn batch_matches_single_sector_calls() {
        let ctx = ctx();
        let stream = SectorStream::new(&ctx, 512).unwrap();
        let plain: Vec<u8> = (0..512 * 9).map(|i| (i * 7 % 256) as u8).collect();

        let mut batch = plain.clone();
        stream.encrypt_sectors(100, &mut batch).unwrap();

        for (i, chunk) in plain.chunks(512).enumerate() {
            let single = stream.encrypt_sector(chunk, 100 + i as u64).unwrap();
            assert_eq!(&batch[i * 512..(i + 1) * 512], &single[..]);
        }

        stream.decrypt_sectors(100, &mut batch).unwrap();
        assert_eq!(batch, plain);
    }

    #[test]
    fn different_keys_differ() {
        let a = ctx();
        let b = a.generate_temporary().unwrap();
        let plain = vec![1u8; 512];
        let ca = SectorStream::new(&a, 512).unwrap().encrypt_sector(&plain, 3).unwrap();
        let cb = SectorStream::new(&b, 512).unwrap().encrypt_sector(&plain, 3).unwrap();
        assert_ne!(ca, cb);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 512..=512),
            index in any::<u64>(),
        ) {
            let ctx = ctx();
            let stream = SectorStream::new(&ctx, 512).unwrap();
            let ct = stream.encrypt_sector(&data, index).unwrap();
            let back = stream.decrypt_sector(&ct, index).unwrap();
            prop_assert_eq!(&back[..], &data[..]);
        }
    }
}
