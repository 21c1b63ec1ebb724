//! sysenc-core: shared identifiers, configuration schema, error taxonomy and
//! the privileged-operation boundary used by every other sysenc crate.

pub mod config;
pub mod error;
pub mod privileged;
pub mod types;

pub use error::{SysencError, SysencResult};
pub use types::{EncryptionAlgorithm, ChainingMode, Prf, WipeAlgorithm};
