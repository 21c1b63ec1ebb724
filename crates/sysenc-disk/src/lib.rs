//! sysenc-disk: block devices, partition tables and the encrypted FAT formatter

pub mod device;
pub mod fat;
pub mod gpt;
pub mod inspect;
pub mod mbr;

pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use fat::{compute_geometry, format, FatParams, FatType, FormatOptions};
pub use inspect::{
    check_supported_layout, probe, Partition, PartitionKind, PartitionStyle, ProbeOptions,
    SystemDriveConfiguration,
};
