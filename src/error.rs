use std::io;
use thiserror::Error;

/// Errors surfaced by the raw block-device layer.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Invalid offset: {offset} exceeds device size {device_size}")]
    InvalidOffset { offset: u64, device_size: u64 },

    #[error("I/O error at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced while decoding NTFS on-disk structures.
///
/// `Malformed` is the recoverable kind: callers skip the offending
/// attribute or record and keep a counter. Everything else is fatal for
/// the operation that raised it.
#[derive(Error, Debug)]
pub enum NtfsError {
    #[error("No NTFS partition found in the partition table")]
    NoNtfsPartition,

    #[error("Invalid partition table: {0}")]
    InvalidPartitionTable(String),

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("Malformed {0}")]
    Malformed(&'static str),

    #[error("Record {record}: no {attribute} attribute")]
    MissingAttribute {
        record: u32,
        attribute: &'static str,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
