use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SysencError, SysencResult};

/// Block cipher used for sector encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    /// AES with a 256-bit key
    Aes,
}

impl EncryptionAlgorithm {
    pub const ALL: [EncryptionAlgorithm; 1] = [EncryptionAlgorithm::Aes];

    pub fn id(self) -> u8 {
        match self {
            EncryptionAlgorithm::Aes => 1,
        }
    }

    pub fn from_id(id: u8) -> SysencResult<Self> {
        match id {
            1 => Ok(EncryptionAlgorithm::Aes),
            other => Err(SysencError::UnsupportedAlgorithm(format!(
                "encryption algorithm id {other}"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes => "aes",
        }
    }

    /// Key size in bytes for one key of this cipher
    pub fn key_size(self) -> usize {
        match self {
            EncryptionAlgorithm::Aes => 32,
        }
    }
}

/// Wide-block chaining mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainingMode {
    Xts,
}

impl ChainingMode {
    pub fn id(self) -> u8 {
        match self {
            ChainingMode::Xts => 1,
        }
    }

    pub fn from_id(id: u8) -> SysencResult<Self> {
        match id {
            1 => Ok(ChainingMode::Xts),
            other => Err(SysencError::UnsupportedAlgorithm(format!(
                "chaining mode id {other}"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChainingMode::Xts => "xts",
        }
    }
}

/// Pseudo-random function used by the header key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Prf {
    /// PBKDF2 with HMAC-SHA-512
    Sha512,
    /// PBKDF2 with HMAC-SHA-256
    Sha256,
    /// Argon2id
    Argon2id,
}

impl Prf {
    /// Order in which `parse` tries PRFs when none is specified.
    pub const ALL: [Prf; 3] = [Prf::Sha512, Prf::Sha256, Prf::Argon2id];

    pub fn id(self) -> u8 {
        match self {
            Prf::Sha512 => 1,
            Prf::Sha256 => 2,
            Prf::Argon2id => 3,
        }
    }

    pub fn from_id(id: u8) -> SysencResult<Self> {
        match id {
            1 => Ok(Prf::Sha512),
            2 => Ok(Prf::Sha256),
            3 => Ok(Prf::Argon2id),
            other => Err(SysencError::UnsupportedAlgorithm(format!("PRF id {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Prf::Sha512 => "sha512",
            Prf::Sha256 => "sha256",
            Prf::Argon2id => "argon2id",
        }
    }
}

/// Overwrite pattern applied to plaintext sectors before they are replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WipeAlgorithm {
    #[default]
    None,
    /// One pass of random data
    Random1,
    /// US DoD 5220.22-M (3 passes)
    Dod3,
    /// US DoD 5220.22-M (8-306) / ECE (7 passes)
    Dod7,
    /// Gutmann (35 passes)
    Gutmann,
}

impl WipeAlgorithm {
    pub fn pass_count(self) -> usize {
        match self {
            WipeAlgorithm::None => 0,
            WipeAlgorithm::Random1 => 1,
            WipeAlgorithm::Dod3 => 3,
            WipeAlgorithm::Dod7 => 7,
            WipeAlgorithm::Gutmann => 35,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WipeAlgorithm::None => "none",
            WipeAlgorithm::Random1 => "random1",
            WipeAlgorithm::Dod3 => "dod3",
            WipeAlgorithm::Dod7 => "dod7",
            WipeAlgorithm::Gutmann => "gutmann",
        }
    }
}

macro_rules! impl_name_traits {
    ($ty:ty, $variants:expr) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $ty {
            type Err = SysencError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                $variants
                    .into_iter()
                    .find(|v: &$ty| v.name() == wanted)
                    .ok_or_else(|| {
                        SysencError::UnsupportedAlgorithm(format!(
                            "unknown {}: {s}",
                            stringify!($ty)
                        ))
                    })
            }
        }
    };
}

impl_name_traits!(EncryptionAlgorithm, EncryptionAlgorithm::ALL);
impl_name_traits!(ChainingMode, [ChainingMode::Xts]);
impl_name_traits!(Prf, Prf::ALL);
impl_name_traits!(
    WipeAlgorithm,
    [
        WipeAlgorithm::None,
        WipeAlgorithm::Random1,
        WipeAlgorithm::Dod3,
        WipeAlgorithm::Dod7,
        WipeAlgorithm::Gutmann,
    ]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip() {
        for prf in Prf::ALL {
            assert_eq!(Prf::from_id(prf.id()).unwrap(), prf);
        }
        assert_eq!(
            EncryptionAlgorithm::from_id(EncryptionAlgorithm::Aes.id()).unwrap(),
            EncryptionAlgorithm::Aes
        );
    }

    #[test]
    fn unknown_ids_are_unsupported() {
        assert!(matches!(
            EncryptionAlgorithm::from_id(9),
            Err(SysencError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            ChainingMode::from_id(0),
            Err(SysencError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            Prf::from_id(42),
            Err(SysencError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn parse_names() {
        assert_eq!("SHA512".parse::<Prf>().unwrap(), Prf::Sha512);
        assert_eq!("gutmann".parse::<WipeAlgorithm>().unwrap(), WipeAlgorithm::Gutmann);
        assert!("serpent".parse::<EncryptionAlgorithm>().is_err());
    }

    #[test]
    fn wipe_pass_counts() {
        assert_eq!(WipeAlgorithm::None.pass_count(), 0);
        assert_eq!(WipeAlgorithm::Dod3.pass_count(), 3);
        assert_eq!(WipeAlgorithm::Gutmann.pass_count(), 35);
    }
}
