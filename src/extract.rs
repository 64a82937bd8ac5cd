//! File content extraction to the host filesystem.
//!
//! Resident content is copied straight out of the record buffer.
//! Non-resident content is reassembled by walking the data runs in on-disk
//! order and concatenating cluster reads; sparse runs are zero-filled, so
//! the output length always equals the run lengths times the cluster size.
//!
//! Output lands under `<root>/Resident/` or `<root>/NonResident/`. The
//! directories are the caller's to create. Existing files are overwritten.

use crate::device::BlockDevice;
use crate::error::NtfsError;
use crate::harvest::Volume;
use crate::record::{DataAttribute, DecodedRecord};
use crate::runlist::{self, DataRun};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Default ceiling on extracted file size.
pub const MAX_EXTRACT_FSIZE: u64 = 2 * 1024 * 1024;

pub const RESIDENT_DIR: &str = "Resident";
pub const NON_RESIDENT_DIR: &str = "NonResident";

const COPY_CHUNK: usize = 256 * 1024;

/// Result of one extraction attempt. Skips are policy, not errors.
#[derive(Debug)]
pub enum ExtractOutcome {
    Written {
        path: PathBuf,
        bytes: u64,
        sha256: String,
    },
    SkippedUnnamed,
    SkippedEmpty,
    SkippedTooLarge {
        size: u64,
        limit: u64,
    },
    SkippedOutOfRange,
    Cancelled,
}

impl ExtractOutcome {
    pub fn was_written(&self) -> bool {
        matches!(self, ExtractOutcome::Written { .. })
    }
}

impl fmt::Display for ExtractOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractOutcome::Written {
                path,
                bytes,
                sha256,
            } => write!(
                f,
                "extracted {} ({} bytes, sha256={})",
                path.display(),
                bytes,
                sha256
            ),
            ExtractOutcome::SkippedUnnamed => write!(f, "skipped: record has no usable name"),
            ExtractOutcome::SkippedEmpty => write!(f, "skipped: empty data stream"),
            ExtractOutcome::SkippedTooLarge { size, limit } => {
                write!(f, "skipped: {size} bytes exceeds the {limit}-byte limit")
            }
            ExtractOutcome::SkippedOutOfRange => {
                write!(f, "skipped: data run lies outside the device")
            }
            ExtractOutcome::Cancelled => write!(f, "cancelled, partial output removed"),
        }
    }
}

/// Extracts file content from the device to the host filesystem.
pub struct Extractor {
    device: Arc<Mutex<BlockDevice>>,
    output_root: PathBuf,
    max_extract_size: u64,
}

impl Extractor {
    pub fn new(
        device: Arc<Mutex<BlockDevice>>,
        output_root: impl Into<PathBuf>,
        max_extract_size: u64,
    ) -> Self {
        Self {
            device,
            output_root: output_root.into(),
            max_extract_size,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Dispatches on the record's data form. Unnamed records are skipped.
    pub fn extract_record_data(
        &self,
        decoded: &DecodedRecord,
        volume: &Volume,
        cancel: Option<&AtomicBool>,
    ) -> Result<ExtractOutcome, NtfsError> {
        let Some(name) = decoded.name().filter(|n| !n.is_empty()) else {
            return Ok(ExtractOutcome::SkippedUnnamed);
        };
        match &decoded.data {
            Some(DataAttribute::Resident { content }) => self.extract_resident(name, content),
            Some(DataAttribute::NonResident { runs, .. }) => {
                self.extract_non_resident(name, runs, volume, cancel)
            }
            None => Ok(ExtractOutcome::SkippedEmpty),
        }
    }

    /// Writes resident content as `<root>/Resident/<name>`, exactly as
    /// long as the content slice.
    pub fn extract_resident(
        &self,
        name: &str,
        content: &[u8],
    ) -> Result<ExtractOutcome, NtfsError> {
        let path = self.output_path(RESIDENT_DIR, name);
        let mut out = File::create(&path)?;
        if let Err(e) = out.write_all(content).and_then(|_| out.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        let sha256 = hex::encode(Sha256::digest(content));
        info!(path = %path.display(), bytes = content.len(), %sha256, "resident extraction");
        Ok(ExtractOutcome::Written {
            path,
            bytes: content.len() as u64,
            sha256,
        })
    }

    /// Reassembles a non-resident stream as `<root>/NonResident/<name>`.
    ///
    /// Sparse runs are zero-filled. The whole file is skipped when the
    /// aggregate size is zero or above the configured limit, or when any
    /// run falls outside [partition base, device end]. Cancellation is
    /// honoured between runs; a cancelled extraction removes its partial
    /// output.
    pub fn extract_non_resident(
        &self,
        name: &str,
        runs: &[DataRun],
        volume: &Volume,
        cancel: Option<&AtomicBool>,
    ) -> Result<ExtractOutcome, NtfsError> {
        let bpc = volume.bytes_per_cluster;
        let total = runlist::total_clusters(runs) * bpc;
        if total == 0 {
            return Ok(ExtractOutcome::SkippedEmpty);
        }
        if total > self.max_extract_size {
            return Ok(ExtractOutcome::SkippedTooLarge {
                size: total,
                limit: self.max_extract_size,
            });
        }

        let device_end = self.device.lock().size();
        for run in runs {
            let Some(lcn) = run.lcn else { continue };
            if lcn < 0 {
                return Ok(ExtractOutcome::SkippedOutOfRange);
            }
            let start = volume.base_bytes + lcn as u64 * bpc;
            let end = start + run.length * bpc;
            if end > device_end {
                warn!(name, lcn, end, device_end, "run beyond end of device");
                return Ok(ExtractOutcome::SkippedOutOfRange);
            }
        }

        let path = self.output_path(NON_RESIDENT_DIR, name);
        let mut out = File::create(&path)?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut chunk = vec![0u8; COPY_CHUNK];

        for run in runs {
            if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                drop(out);
                let _ = fs::remove_file(&path);
                return Ok(ExtractOutcome::Cancelled);
            }

            let run_bytes = run.length * bpc;
            match run.lcn {
                None => {
                    // Hole: materialise as zeros to keep stream offsets.
                    let mut remaining = run_bytes;
                    let zeros = vec![0u8; COPY_CHUNK];
                    while remaining > 0 {
                        let step = (remaining as usize).min(COPY_CHUNK);
                        if let Err(e) = out.write_all(&zeros[..step]) {
                            let _ = fs::remove_file(&path);
                            return Err(e.into());
                        }
                        hasher.update(&zeros[..step]);
                        remaining -= step as u64;
                        written += step as u64;
                    }
                }
                Some(lcn) => {
                    let mut device = self.device.lock();
                    if let Err(e) = device.seek_to(volume.base_bytes + lcn as u64 * bpc) {
                        let _ = fs::remove_file(&path);
                        return Err(e.into());
                    }
                    let mut remaining = run_bytes;
                    while remaining > 0 {
                        let step = (remaining as usize).min(COPY_CHUNK);
                        if let Err(e) = device.read_exact(&mut chunk[..step]) {
                            let _ = fs::remove_file(&path);
                            return Err(e.into());
                        }
                        if let Err(e) = out.write_all(&chunk[..step]) {
                            let _ = fs::remove_file(&path);
                            return Err(e.into());
                        }
                        hasher.update(&chunk[..step]);
                        remaining -= step as u64;
                        written += step as u64;
                    }
                }
            }
        }

        if let Err(e) = out.sync_all() {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        let sha256 = hex::encode(hasher.finalize());
        info!(path = %path.display(), bytes = written, %sha256, "non-resident extraction");
        Ok(ExtractOutcome::Written {
            path,
            bytes: written,
            sha256,
        })
    }

    fn output_path(&self, subdir: &str, name: &str) -> PathBuf {
        // Names come off the volume; keep them from escaping the tree.
        let safe: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.output_root.join(subdir).join(safe)
    }
}
