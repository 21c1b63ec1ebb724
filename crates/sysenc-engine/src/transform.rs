//! In-place sector range transforms run by the worker thread.
//!
//! The encrypted part of an area is always a prefix `[start, boundary)`.
//! Encryption grows the prefix batch by batch from the front; decryption
//! shrinks it from the back. Each batch is written and then checkpointed,
//! and the cancellation token is only consulted between batches, so the
//! boundary always sits on a sector edge and resuming from the last
//! checkpoint yields the same bytes as an uninterrupted run.
//!
//! A batch write that fails part way is redone one sector at a time from
//! the boundary edge. The sectors that land move the boundary and are
//! checkpointed before the error is reported; on decryption, sectors past
//! the failure get their ciphertext back so the prefix stays contiguous.
//!
//! Sector tweaks count from the start of the area: the first sector of an
//! area (or of a clone destination) has tweak 0.

use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use sysenc_core::{SysencError, SysencResult, WipeAlgorithm};
use sysenc_crypto::{CryptoContext, SectorStream};
use sysenc_disk::BlockDevice;

use crate::state::TransformDirection;
use crate::status::TransformFailure;
use crate::wipe::Wiper;

/// Called after each batch with the device and the new boundary (or byte
/// count); an error stops the run.
pub type Checkpoint<'a> = dyn FnMut(&mut dyn BlockDevice, u64) -> SysencResult<()> + 'a;

#[derive(Debug, Clone)]
pub struct TransformParams {
    pub direction: TransformDirection,
    /// Byte range of the area, sector aligned
    pub area_start: u64,
    pub area_end: u64,
    pub batch_sectors: u32,
    /// Overwrite passes over plaintext before ciphertext lands (encryption only)
    pub wipe: WipeAlgorithm,
    /// Treat unreadable sectors as zeros instead of failing
    pub tolerate_unreadable: bool,
}

impl TransformParams {
    fn validate(&self, sector_size: u64, boundary: u64) -> SysencResult<()> {
        let aligned = |v: u64| v % sector_size == 0;
        if !aligned(self.area_start) || !aligned(self.area_end) || !aligned(boundary) {
            return Err(SysencError::InvalidState(format!(
                "area {}..{} (boundary {boundary}) is not aligned to {sector_size}-byte sectors",
                self.area_start, self.area_end
            )));
        }
        if self.area_start > self.area_end || boundary < self.area_start || boundary > self.area_end
        {
            return Err(SysencError::InvalidState(format!(
                "boundary {boundary} outside area {}..{}",
                self.area_start, self.area_end
            )));
        }
        if self.batch_sectors == 0 {
            return Err(SysencError::Config("batch_sectors must be non-zero".into()));
        }
        Ok(())
    }
}

fn fail(error: SysencError, confirmed_offset: u64) -> TransformFailure {
    TransformFailure {
        error,
        confirmed_offset,
    }
}

/// Read `buf` at `offset`. With `tolerate`, a failed batch read is retried
/// sector by sector and unreadable sectors come back zeroed; their indices
/// within the batch are returned.
fn read_batch(
    dev: &mut dyn BlockDevice,
    offset: u64,
    buf: &mut [u8],
    tolerate: bool,
) -> SysencResult<Vec<usize>> {
    let err = match dev.read_at(offset, buf) {
        Ok(()) => return Ok(Vec::new()),
        Err(e) => e,
    };
    if !tolerate {
        return Err(SysencError::device(format!("reading offset {offset}"), err));
    }

    let ss = dev.sector_size();
    let mut bad = Vec::new();
    for (i, sector) in buf.chunks_mut(ss).enumerate() {
        let at = offset + (i * ss) as u64;
        if let Err(e) = dev.read_at(at, sector) {
            tracing::warn!(offset = at, "unreadable sector replaced with zeros: {e}");
            sector.fill(0);
            bad.push(i);
        }
    }
    Ok(bad)
}

fn write_batch(dev: &mut dyn BlockDevice, offset: u64, buf: &[u8]) -> SysencResult<()> {
    dev.write_at(offset, buf)
        .map_err(|e| SysencError::device(format!("writing offset {offset}"), e))
}

/// A batch write that only partly went through.
struct TornWrite {
    error: SysencError,
    /// Sectors known to hold the new bytes, counted from the boundary edge
    landed: usize,
}

/// Write `buf` at `offset`. If the batch write fails, rewrite it sector by
/// sector starting at the edge that touches the boundary (the front when
/// encrypting, the back when decrypting) and stop at the first sector that
/// still fails.
fn write_from_edge(
    dev: &mut dyn BlockDevice,
    offset: u64,
    buf: &[u8],
    direction: TransformDirection,
) -> Result<(), TornWrite> {
    let error = match write_batch(dev, offset, buf) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    let ss = dev.sector_size();
    let count = buf.len() / ss;
    tracing::warn!(offset, sectors = count, "batch write failed, retrying per sector: {error}");

    let order: Box<dyn Iterator<Item = usize>> = match direction {
        TransformDirection::Encrypt => Box::new(0..count),
        TransformDirection::Decrypt => Box::new((0..count).rev()),
    };
    for (landed, i) in order.enumerate() {
        let at = offset + (i * ss) as u64;
        if let Err(error) = write_batch(dev, at, &buf[i * ss..(i + 1) * ss]) {
            tracing::warn!(offset = at, landed, "sector write failed: {error}");
            return Err(TornWrite { error, landed });
        }
    }
    tracing::info!(offset, "batch rewritten sector by sector");
    Ok(())
}

/// Move the boundary over the sectors of a torn batch that landed and
/// checkpoint it. Returns the boundary to report with the error.
#[allow(clippy::too_many_arguments)]
fn settle_torn_batch(
    dev: &mut dyn BlockDevice,
    direction: TransformDirection,
    boundary: u64,
    offset: u64,
    len: u64,
    landed: usize,
    ciphertext: &[u8],
    checkpoint: &mut Checkpoint<'_>,
) -> u64 {
    let ss = dev.sector_size() as u64;
    let landed = landed as u64 * ss;
    let next = match direction {
        TransformDirection::Encrypt => offset + landed,
        TransformDirection::Decrypt => {
            // the torn write may have put plaintext in front of the failed sector
            let front = &ciphertext[..(len - landed - ss) as usize];
            let restored = if front.is_empty() {
                Ok(())
            } else {
                write_from_edge(dev, offset, front, TransformDirection::Encrypt)
            };
            if let Err(e) = restored {
                tracing::error!(
                    offset,
                    restored = e.landed,
                    "could not restore ciphertext ahead of a failed write: {}",
                    e.error
                );
            }
            offset + len - landed
        }
    };
    if next == boundary {
        return boundary;
    }
    let settled = dev.flush().and_then(|()| checkpoint(&mut *dev, next));
    match settled {
        Ok(()) => {
            tracing::info!(boundary = next, "boundary moved over the sectors that landed");
            next
        }
        Err(e) => {
            tracing::error!(boundary, "checkpoint after a failed write: {e}");
            boundary
        }
    }
}

/// Encrypt or decrypt the area in place, starting from `boundary`.
///
/// Returns the final boundary: `area_end` after encryption, `area_start`
/// after decryption.
pub fn run_transform(
    dev: &mut dyn BlockDevice,
    ctx: &CryptoContext,
    params: &TransformParams,
    boundary: u64,
    cancel: &CancellationToken,
    checkpoint: &mut Checkpoint<'_>,
) -> Result<u64, TransformFailure> {
    let ss = dev.sector_size();
    params
        .validate(ss as u64, boundary)
        .map_err(|e| fail(e, boundary))?;
    let stream = SectorStream::new(ctx, ss).map_err(|e| fail(e, boundary))?;
    let batch_bytes = u64::from(params.batch_sectors) * ss as u64;
    let mut wiper = match params.direction {
        TransformDirection::Encrypt if params.wipe != WipeAlgorithm::None => {
            Some(Wiper::new(params.wipe))
        }
        _ => None,
    };

    let mut buf = Zeroizing::new(Vec::with_capacity(batch_bytes as usize));
    // ciphertext of the current batch, kept while decrypting
    let mut ciphertext = Zeroizing::new(Vec::new());
    let mut boundary = boundary;

    tracing::info!(
        direction = ?params.direction,
        start = params.area_start,
        end = params.area_end,
        from = boundary,
        "transform starting"
    );

    loop {
        let (offset, len) = match params.direction {
            TransformDirection::Encrypt if boundary < params.area_end => {
                (boundary, batch_bytes.min(params.area_end - boundary))
            }
            TransformDirection::Decrypt if boundary > params.area_start => {
                let len = batch_bytes.min(boundary - params.area_start);
                (boundary - len, len)
            }
            _ => break,
        };
        if cancel.is_cancelled() {
            tracing::info!(boundary, "transform aborted");
            return Err(fail(SysencError::Aborted, boundary));
        }

        buf.resize(len as usize, 0);
        let bad = read_batch(dev, offset, &mut buf, params.tolerate_unreadable)
            .map_err(|e| fail(e, boundary))?;
        let first_sector = (offset - params.area_start) / ss as u64;

        let step = match params.direction {
            TransformDirection::Encrypt => {
                if let Some(wiper) = wiper.as_mut() {
                    // plaintext is already overwritten; landing the ciphertext keeps it
                    if let Err(e) = wipe_passes(dev, wiper, offset, buf.len()) {
                        tracing::warn!(offset, "wipe pass failed, writing ciphertext: {e}");
                    }
                }
                stream.encrypt_sectors(first_sector, &mut buf)
            }
            TransformDirection::Decrypt => {
                ciphertext.clear();
                ciphertext.extend_from_slice(&buf);
                stream.decrypt_sectors(first_sector, &mut buf).map(|()| {
                    for i in &bad {
                        buf[i * ss..(i + 1) * ss].fill(0);
                    }
                })
            }
        };
        step.map_err(|e| fail(e, boundary))?;

        if let Err(torn) = write_from_edge(dev, offset, &buf, params.direction) {
            let reported = settle_torn_batch(
                dev,
                params.direction,
                boundary,
                offset,
                len,
                torn.landed,
                &ciphertext,
                checkpoint,
            );
            return Err(fail(torn.error, reported));
        }
        dev.flush().map_err(|e| fail(e, boundary))?;

        let next = match params.direction {
            TransformDirection::Encrypt => offset + len,
            TransformDirection::Decrypt => offset,
        };
        checkpoint(&mut *dev, next).map_err(|e| fail(e, boundary))?;
        boundary = next;
    }

    tracing::info!(boundary, direction = ?params.direction, "transform finished");
    Ok(boundary)
}

/// Run every wipe pass over `len` bytes at `offset`, flushing after each.
fn wipe_passes(
    dev: &mut dyn BlockDevice,
    wiper: &mut Wiper,
    offset: u64,
    len: usize,
) -> SysencResult<()> {
    let mut pattern = Zeroizing::new(vec![0u8; len]);
    let ss = dev.sector_size();
    for pass in 0..wiper.passes() {
        for chunk in pattern.chunks_mut(ss) {
            wiper.fill(pass, chunk)?;
        }
        write_batch(dev, offset, &pattern)?;
        dev.flush()?;
    }
    Ok(())
}

/// Overwrite `[offset, offset + length)` with `algorithm`, resuming after
/// `done` bytes. The checkpoint receives the number of bytes wiped.
#[allow(clippy::too_many_arguments)]
pub fn wipe_range(
    dev: &mut dyn BlockDevice,
    algorithm: WipeAlgorithm,
    offset: u64,
    length: u64,
    done: u64,
    batch_sectors: u32,
    cancel: &CancellationToken,
    checkpoint: &mut Checkpoint<'_>,
) -> Result<u64, TransformFailure> {
    if algorithm == WipeAlgorithm::None {
        return Err(fail(
            SysencError::Config("a wipe needs an algorithm other than none".into()),
            done,
        ));
    }
    let ss = dev.sector_size() as u64;
    let batch_bytes = u64::from(batch_sectors.max(1)) * ss;
    let mut wiper = Wiper::new(algorithm);
    let mut done = done;

    while done < length {
        if cancel.is_cancelled() {
            return Err(fail(SysencError::Aborted, done));
        }
        let len = batch_bytes.min(length - done);
        wipe_passes(dev, &mut wiper, offset + done, len as usize).map_err(|e| fail(e, done))?;
        checkpoint(&mut *dev, done + len).map_err(|e| fail(e, done))?;
        done += len;
    }
    Ok(done)
}

/// Copy `length` bytes from `src` to `dst`, encrypting on the way with
/// tweaks taken from the destination sectors. Resumes after `done` bytes;
/// the checkpoint receives the number of bytes copied.
#[allow(clippy::too_many_arguments)]
pub fn clone_encrypted(
    dev: &mut dyn BlockDevice,
    ctx: &CryptoContext,
    src: u64,
    dst: u64,
    length: u64,
    done: u64,
    batch_sectors: u32,
    cancel: &CancellationToken,
    checkpoint: &mut Checkpoint<'_>,
) -> Result<u64, TransformFailure> {
    let ss = dev.sector_size();
    let stream = SectorStream::new(ctx, ss).map_err(|e| fail(e, done))?;
    if [src, dst, length, done].iter().any(|v| v % ss as u64 != 0) {
        return Err(fail(
            SysencError::InvalidState("clone range is not sector aligned".into()),
            done,
        ));
    }
    if dst < src + length && src < dst + length {
        return Err(fail(
            SysencError::InvalidState("clone source and destination overlap".into()),
            done,
        ));
    }
    let batch_bytes = u64::from(batch_sectors.max(1)) * ss as u64;
    let mut buf = Zeroizing::new(Vec::with_capacity(batch_bytes as usize));
    let mut done = done;

    while done < length {
        if cancel.is_cancelled() {
            return Err(fail(SysencError::Aborted, done));
        }
        let len = batch_bytes.min(length - done);
        buf.resize(len as usize, 0);
        read_batch(dev, src + done, &mut buf, false)
            .and_then(|_| stream.encrypt_sectors(done / ss as u64, &mut buf))
            .and_then(|()| write_batch(dev, dst + done, &buf))
            .and_then(|()| dev.flush())
            .map_err(|e| fail(e, done))?;
        checkpoint(&mut *dev, done + len).map_err(|e| fail(e, done))?;
        done += len;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sysenc_core::{ChainingMode, EncryptionAlgorithm};
    use sysenc_disk::MemoryDevice;

    const SS: usize = 512;

    fn ctx() -> CryptoContext {
        CryptoContext::generate(EncryptionAlgorithm::Aes, ChainingMode::Xts).unwrap()
    }

    fn patterned(sectors: usize) -> MemoryDevice {
        let data = (0..sectors * SS).map(|i| (i % 251) as u8).collect();
        MemoryDevice::from_bytes(data, SS)
    }

    fn params(direction: TransformDirection, start: u64, end: u64, batch: u32) -> TransformParams {
        TransformParams {
            direction,
            area_start: start,
            area_end: end,
            batch_sectors: batch,
            wipe: WipeAlgorithm::None,
            tolerate_unreadable: false,
        }
    }

    fn run(
        dev: &mut MemoryDevice,
        ctx: &CryptoContext,
        p: &TransformParams,
        from: u64,
        stop_after: Option<usize>,
    ) -> Result<u64, TransformFailure> {
        let cancel = CancellationToken::new();
        let mut batches = 0;
        let token = cancel.clone();
        run_transform(dev, ctx, p, from, &cancel, &mut |_, _| {
            batches += 1;
            if Some(batches) == stop_after {
                token.cancel();
            }
            Ok(())
        })
    }

    #[test]
    fn encrypt_then_decrypt_restores_plaintext() {
        let ctx = ctx();
        let mut dev = patterned(64);
        let original = dev.snapshot();
        let (start, end) = (8 * SS as u64, 60 * SS as u64);

        let p = params(TransformDirection::Encrypt, start, end, 5);
        assert_eq!(run(&mut dev, &ctx, &p, start, None).unwrap(), end);
        let encrypted = dev.snapshot();
        assert_eq!(encrypted[..start as usize], original[..start as usize]);
        assert_eq!(encrypted[end as usize..], original[end as usize..]);
        assert_ne!(encrypted[start as usize..end as usize], original[start as usize..end as usize]);

        // Sector 9 is the second sector of an area starting at sector 8.
        let stream = SectorStream::new(&ctx, SS).unwrap();
        let s = 9 * SS;
        assert_eq!(
            &stream.decrypt_sector(&encrypted[s..s + SS], 1).unwrap()[..],
            &original[s..s + SS]
        );

        let p = params(TransformDirection::Decrypt, start, end, 7);
        assert_eq!(run(&mut dev, &ctx, &p, end, None).unwrap(), start);
        assert_eq!(dev.snapshot(), original);
    }

    #[test]
    fn decryption_keeps_an_encrypted_prefix() {
        let ctx = ctx();
        let mut dev = patterned(32);
        let original = dev.snapshot();
        let end = 32 * SS as u64;
        run(&mut dev, &ctx, &params(TransformDirection::Encrypt, 0, end, 4), 0, None).unwrap();
        let encrypted = dev.snapshot();

        let err = run(&mut dev, &ctx, &params(TransformDirection::Decrypt, 0, end, 4), end, Some(3))
            .unwrap_err();
        assert!(matches!(err.error, SysencError::Aborted));
        let boundary = err.confirmed_offset as usize;
        assert_eq!(boundary, 20 * SS);

        let now = dev.snapshot();
        assert_eq!(now[..boundary], encrypted[..boundary]);
        assert_eq!(now[boundary..], original[boundary..]);
    }

    #[test]
    fn unreadable_sector_fails_without_tolerance() {
        let ctx = ctx();
        let mut dev = patterned(16);
        dev.mark_bad_sector(6);
        let p = params(TransformDirection::Encrypt, 0, 16 * SS as u64, 4);
        let err = run(&mut dev, &ctx, &p, 0, None).unwrap_err();
        assert!(matches!(err.error, SysencError::Device(_)));
        assert_eq!(err.confirmed_offset, 4 * SS as u64);
    }

    #[test]
    fn unreadable_sector_is_zeroed_when_tolerated() {
        let ctx = ctx();
        let mut dev = patterned(16);
        dev.mark_bad_sector(6);
        let mut p = params(TransformDirection::Encrypt, 0, 16 * SS as u64, 4);
        p.tolerate_unreadable = true;
        run(&mut dev, &ctx, &p, 0, None).unwrap();

        let stream = SectorStream::new(&ctx, SS).unwrap();
        let snap = dev.snapshot();
        let plain = stream.decrypt_sector(&snap[6 * SS..7 * SS], 6).unwrap();
        assert!(plain.iter().all(|&b| b == 0));
    }

    #[test]
    fn wipe_passes_precede_ciphertext() {
        let ctx = ctx();
        let mut dev = patterned(8);
        dev.clear_write_log();
        let mut p = params(TransformDirection::Encrypt, 0, 8 * SS as u64, 8);
        p.wipe = WipeAlgorithm::Dod3;
        run(&mut dev, &ctx, &p, 0, None).unwrap();
        // Three wipe passes and the ciphertext, all at offset 0.
        let log = dev.write_log();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|(off, len)| *off == 0 && *len == 8 * SS));
    }

    #[test]
    fn torn_encryption_batch_checkpoints_the_landed_sectors() {
        let ctx = ctx();
        let end = 32 * SS as u64;
        let p = params(TransformDirection::Encrypt, 0, end, 8);
        let mut straight = patterned(32);
        run(&mut straight, &ctx, &p, 0, None).unwrap();

        let mut dev = patterned(32);
        let original = dev.snapshot();
        dev.mark_unwritable_sector(13);
        let cancel = CancellationToken::new();
        let mut checkpoints = Vec::new();
        let err = run_transform(&mut dev, &ctx, &p, 0, &cancel, &mut |_, b| {
            checkpoints.push(b);
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err.error, SysencError::Device(_)));
        assert_eq!(err.confirmed_offset, 13 * SS as u64);
        assert_eq!(checkpoints, vec![8 * SS as u64, 13 * SS as u64]);

        let snap = dev.snapshot();
        let edge = 13 * SS;
        assert_eq!(snap[..edge], straight.snapshot()[..edge]);
        assert_eq!(snap[edge..], original[edge..]);

        dev.clear_unwritable_sectors();
        run(&mut dev, &ctx, &p, err.confirmed_offset, None).unwrap();
        assert_eq!(dev.snapshot(), straight.snapshot());
    }

    #[test]
    fn torn_decryption_batch_keeps_the_prefix_encrypted() {
        let ctx = ctx();
        let end = 32 * SS as u64;
        let mut dev = patterned(32);
        let original = dev.snapshot();
        run(&mut dev, &ctx, &params(TransformDirection::Encrypt, 0, end, 8), 0, None).unwrap();
        let encrypted = dev.snapshot();

        // batch 16..24 is written back to front: 23..20 land, 19 is stuck
        dev.mark_unwritable_sector(19);
        let p = params(TransformDirection::Decrypt, 0, end, 8);
        let err = run(&mut dev, &ctx, &p, end, None).unwrap_err();
        assert!(matches!(err.error, SysencError::Device(_)));
        assert_eq!(err.confirmed_offset, 20 * SS as u64);

        let snap = dev.snapshot();
        let edge = 20 * SS;
        assert_eq!(snap[..edge], encrypted[..edge], "sectors 16..19 hold ciphertext again");
        assert_eq!(snap[edge..], original[edge..]);

        dev.clear_unwritable_sectors();
        assert_eq!(run(&mut dev, &ctx, &p, err.confirmed_offset, None).unwrap(), 0);
        assert_eq!(dev.snapshot(), original);
    }

    #[test]
    fn misaligned_boundary_rejected() {
        let ctx = ctx();
        let mut dev = patterned(8);
        let p = params(TransformDirection::Encrypt, 0, 8 * SS as u64, 2);
        let err = run(&mut dev, &ctx, &p, 100, None).unwrap_err();
        assert!(matches!(err.error, SysencError::InvalidState(_)));
    }

    #[test]
    fn failed_checkpoint_reports_previous_boundary() {
        let ctx = ctx();
        let mut dev = patterned(8);
        let p = params(TransformDirection::Encrypt, 0, 8 * SS as u64, 2);
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let err = run_transform(&mut dev, &ctx, &p, 0, &cancel, &mut |_, _| {
            calls += 1;
            if calls == 2 {
                Err(SysencError::Config("state file gone".into()))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(err.confirmed_offset, 2 * SS as u64);
    }

    #[test]
    fn wipe_range_resumes_and_counts() {
        let mut dev = patterned(10);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let done = wipe_range(
            &mut dev,
            WipeAlgorithm::Random1,
            2 * SS as u64,
            6 * SS as u64,
            2 * SS as u64,
            2,
            &cancel,
            &mut |_, d| {
                seen.push(d);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(done, 6 * SS as u64);
        assert_eq!(seen, vec![4 * SS as u64, 6 * SS as u64]);
        assert!(wipe_range(&mut dev, WipeAlgorithm::None, 0, 512, 0, 1, &cancel, &mut |_, _| Ok(()))
            .is_err());
    }

    #[test]
    fn clone_tweaks_count_from_the_destination() {
        let ctx = ctx();
        let mut dev = patterned(32);
        let original = dev.snapshot();
        let cancel = CancellationToken::new();
        clone_encrypted(
            &mut dev,
            &ctx,
            0,
            16 * SS as u64,
            8 * SS as u64,
            0,
            3,
            &cancel,
            &mut |_, _| Ok(()),
        )
        .unwrap();
        let stream = SectorStream::new(&ctx, SS).unwrap();
        let snap = dev.snapshot();
        let plain = stream.decrypt_sector(&snap[17 * SS..18 * SS], 1).unwrap();
        assert_eq!(&plain[..], &original[SS..2 * SS]);

        let overlap = clone_encrypted(
            &mut dev,
            &ctx,
            0,
            4 * SS as u64,
            8 * SS as u64,
            0,
            3,
            &cancel,
            &mut |_, _| Ok(()),
        );
        assert!(overlap.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn abort_and_resume_matches_uninterrupted(
            sectors in 4usize..40,
            batch in 1u32..9,
            stop in 1usize..12,
        ) {
            let ctx = ctx();
            let end = (sectors * SS) as u64;
            let p = params(TransformDirection::Encrypt, 0, end, batch);

            let mut straight = patterned(sectors);
            run(&mut straight, &ctx, &p, 0, None).unwrap();

            let mut interrupted = patterned(sectors);
            let resume_from = match run(&mut interrupted, &ctx, &p, 0, Some(stop)) {
                Ok(done) => done,
                Err(failure) => {
                    prop_assert!(matches!(failure.error, SysencError::Aborted));
                    prop_assert_eq!(failure.confirmed_offset % SS as u64, 0);
                    failure.confirmed_offset
                }
            };
            run(&mut interrupted, &ctx, &p, resume_from, None).unwrap();

            prop_assert_eq!(straight.snapshot(), interrupted.snapshot());
        }

        #[test]
        fn torn_write_and_resume_matches_uninterrupted(
            sectors in 4usize..40,
            batch in 1u32..9,
            stuck in 0usize..40,
        ) {
            let stuck = (stuck % sectors) as u64;
            let ctx = ctx();
            let end = (sectors * SS) as u64;
            let p = params(TransformDirection::Encrypt, 0, end, batch);

            let mut straight = patterned(sectors);
            run(&mut straight, &ctx, &p, 0, None).unwrap();

            let mut torn = patterned(sectors);
            torn.mark_unwritable_sector(stuck);
            let failure = run(&mut torn, &ctx, &p, 0, None).unwrap_err();
            prop_assert_eq!(failure.confirmed_offset, stuck * SS as u64);

            torn.clear_unwritable_sectors();
            run(&mut torn, &ctx, &p, failure.confirmed_offset, None).unwrap();
            prop_assert_eq!(straight.snapshot(), torn.snapshot());
        }
    }
}
