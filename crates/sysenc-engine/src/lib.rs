//! sysenc-engine: the boot encryption state machine and the long-running
//! sector work behind it.
//!
//! [`BootEncryption`] owns one system drive. It prepares and installs the
//! boot loader and volume header, then encrypts or decrypts the area in
//! place on a worker thread, checkpointing after every batch so an abort,
//! crash or power loss resumes from the last confirmed offset.

pub mod claims;
pub mod environment;
pub mod orchestrator;
pub mod state;
pub mod status;
pub mod transform;
pub mod volume;
pub mod wipe;
pub mod worker;

pub use environment::{DeviceProvider, FileDeviceProvider, HostEnvironment, SystemEnvironment};
pub use orchestrator::{BootEncryption, Host};
pub use state::{
    DecoySystemWipeStatus, Firmware, HiddenOsCreationPhase, HiddenOsLayout, OperationState,
    SetupStatus, StateFile, TransformDirection,
};
pub use status::{EncryptionStatus, ProgressFn, SetupResult, TransformFailure};
pub use volume::{create_volume, open_volume, spawn_format, VolumeLayout, VolumeOptions};
