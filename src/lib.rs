//! mftap - forensic NTFS extraction engine
//!
//! Reads raw block devices with no filesystem driver in between:
//! reconstructs the Master File Table of every NTFS partition, catalogues
//! the named files on disk, extracts resident and non-resident file
//! content, and runs a live disk tap that races a monitored guest VM for
//! freshly written files.

pub mod catalog;
pub mod cli;
pub mod device;
pub mod engine;
pub mod error;
pub mod extract;
pub mod harvest;
pub mod layout;
pub mod record;
pub mod runlist;
pub mod tap;

pub use catalog::{CatalogEntry, FileCatalog};
pub use device::BlockDevice;
pub use engine::{Engine, EngineOptions};
pub use error::{DeviceError, NtfsError};
pub use extract::{ExtractOutcome, Extractor};
pub use harvest::Volume;
pub use runlist::DataRun;
pub use tap::{TapEvent, TapQueue};
