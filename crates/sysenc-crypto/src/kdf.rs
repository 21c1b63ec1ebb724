//! Header key derivation: password + salt + PIM → 512-bit header key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Sha256, Sha512};
use sysenc_core::config::EncryptionConfig;
use sysenc_core::{Prf, SysencError, SysencResult};

use crate::keys::{KeyMaterial, MASTER_KEYDATA_SIZE};

/// Bytes of random salt stored in the clear at the start of a header.
pub const SALT_SIZE: usize = 64;

/// Which iteration table a header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Boot/system volume, unlocked by the pre-boot loader
    System,
    /// Any other volume
    Standard,
}

/// Argon2id settings for headers that use the Argon2id PRF. PBKDF2 headers
/// ignore these and take their cost from [`pbkdf2_iterations`]; for Argon2id
/// the PIM, when set, replaces the time cost.
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// KiB of memory per derivation, 64 MiB unless configured
    pub mem_cost_kib: u32,
    /// Passes over memory for a header created without a PIM
    pub time_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&EncryptionConfig> for KdfParams {
    fn from(cfg: &EncryptionConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// PBKDF2 iteration count for a PIM.
pub fn pbkdf2_iterations(kind: HeaderKind, pim: u32) -> u32 {
    match (kind, pim) {
        (HeaderKind::System, 0) => 200_000,
        (HeaderKind::System, pim) => pim.saturating_mul(2048),
        (HeaderKind::Standard, 0) => 500_000,
        (HeaderKind::Standard, pim) => pim.saturating_mul(1000).saturating_add(15_000),
    }
}

/// Argon2id time cost for a PIM.
pub fn argon2_time_cost(params: &KdfParams, pim: u32) -> u32 {
    if pim == 0 {
        params.time_cost
    } else {
        pim
    }
}

/// Derive the header key (primary + secondary XTS keys) into protected memory.
pub fn derive_header_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    prf: Prf,
    pim: u32,
    kind: HeaderKind,
    params: &KdfParams,
) -> SysencResult<KeyMaterial> {
    let mut key = KeyMaterial::zeroed(MASTER_KEYDATA_SIZE)?;
    let pw = password.expose_secret().as_bytes();

    match prf {
        Prf::Sha512 => {
            pbkdf2::pbkdf2_hmac::<Sha512>(pw, salt, pbkdf2_iterations(kind, pim), key.as_bytes_mut())
        }
        Prf::Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(pw, salt, pbkdf2_iterations(kind, pim), key.as_bytes_mut())
        }
        Prf::Argon2id => {
            let argon2_params = Params::new(
                params.mem_cost_kib,
                argon2_time_cost(params, pim),
                params.parallelism,
                Some(MASTER_KEYDATA_SIZE),
            )
            .map_err(|e| SysencError::Config(format!("invalid Argon2id params: {e}")))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(pw, salt, key.as_bytes_mut())
                .map_err(|e| SysencError::ResourceExhausted(format!("Argon2id KDF failed: {e}")))?;
        }
    }

    tracing::trace!(prf = %prf, pim, ?kind, "header key derived");
    Ok(key)
}
