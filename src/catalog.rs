//! The file catalogue: a sweep over the local MFT image that turns every
//! named, in-use, non-directory record with data into a lookup entry.

use crate::error::NtfsError;
use crate::harvest::{self, Volume};
use crate::layout::{self, RECORD_SIZE, SECTOR_SIZE};
use crate::record;
use memmap2::Mmap;
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use tracing::{info, warn};

/// One catalogued file. Offsets are absolute on the source device, in
/// sectors; `cluster_offset` is `sector_offset` rounded down to the
/// enclosing cluster boundary.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub sector_offset: i64,
    pub cluster_offset: i64,
    pub size: u32,
    pub record_number: u32,
}

impl CatalogEntry {
    /// Fixed-width table row: record | sector offset | length | name.
    pub fn row(&self) -> String {
        format!(
            "{:>8} | {:>12} | {:>10} | {}",
            self.record_number, self.sector_offset, self.size, self.name
        )
    }
}

/// Sweep statistics, printed after every build.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CatalogCounters {
    pub files: u32,
    pub directories: u32,
    pub deleted: u32,
    pub other: u32,
    pub bad_attributes: u32,
    pub fragment_markers: u32,
    pub file_name_attributes: u32,
}

/// The catalogue of one or more swept volumes.
///
/// Entries are kept in sweep order and duplicates are permitted: a file
/// with several records or several $FILE_NAME attributes may appear more
/// than once. Built once at startup, read-only afterwards.
#[derive(Debug, Default, Serialize)]
pub struct FileCatalog {
    entries: Vec<CatalogEntry>,
    counters: CatalogCounters,
    volume_name: Option<String>,
}

impl FileCatalog {
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn counters(&self) -> &CatalogCounters {
        &self.counters
    }

    /// Volume name seen during the sweep ($Volume's $VOLUME_NAME), if any.
    pub fn volume_name(&self) -> Option<&str> {
        self.volume_name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds another volume's catalogue into this one.
    pub fn merge(&mut self, other: FileCatalog) {
        self.entries.extend(other.entries);
        let c = &mut self.counters;
        let o = other.counters;
        c.files += o.files;
        c.directories += o.directories;
        c.deleted += o.deleted;
        c.other += o.other;
        c.bad_attributes += o.bad_attributes;
        c.fragment_markers += o.fragment_markers;
        c.file_name_attributes += o.file_name_attributes;
        if self.volume_name.is_none() {
            self.volume_name = other.volume_name;
        }
    }

    pub fn search_by_record(&self, record_number: u32) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.record_number == record_number)
            .collect()
    }

    pub fn search_by_name(&self, name: &str) -> Vec<&CatalogEntry> {
        self.entries.iter().filter(|e| e.name == name).collect()
    }

    /// Matches entries whose record sits at the given sector, or whose
    /// enclosing cluster starts there.
    pub fn search_by_offset(&self, offset: i64) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.sector_offset == offset || e.cluster_offset == offset)
            .collect()
    }

    /// Fixed-width listing: record | sector offset | length | name.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str("  record |       sector |     length | name\n");
        out.push_str("---------+--------------+------------+-----------------\n");
        for entry in &self.entries {
            out.push_str(&entry.row());
            out.push('\n');
        }
        out.push_str(&format!("{} files on record.\n", self.entries.len()));
        out
    }

    pub fn summary(&self) -> String {
        let c = &self.counters;
        format!(
            "catalogue: {} entries ({} files, {} directories, {} deleted, {} other) \
             [{} fragment markers, {} file-name attributes, {} bad attributes]",
            self.entries.len(),
            c.files,
            c.directories,
            c.deleted,
            c.other,
            c.fragment_markers,
            c.file_name_attributes,
            c.bad_attributes,
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Sweeps a local MFT image and builds the catalogue for its volume.
///
/// The image alternates fragment markers and raw records. A marker resets
/// the running source cursor; each following record is then addressable at
/// `marker offset + index * 1024` on the device.
pub fn build_catalog(image_path: &Path, volume: &Volume) -> Result<FileCatalog, NtfsError> {
    let file = File::open(image_path)?;
    // Read-only map of a file we wrote ourselves.
    let image = unsafe { Mmap::map(&file)? };

    let mut catalog = FileCatalog::default();
    let sectors_per_record = (RECORD_SIZE as u64 / SECTOR_SIZE) as i64;
    let sectors_per_cluster = volume.sectors_per_cluster as i64;

    let mut group_base_sector: i64 = 0;
    let mut record_index: i64 = 0;
    let mut seen_marker = false;

    for block in image.chunks_exact(RECORD_SIZE) {
        if let Some(source_offset) = harvest::marker_source_offset(block) {
            group_base_sector = (source_offset / SECTOR_SIZE) as i64;
            record_index = 0;
            seen_marker = true;
            catalog.counters.fragment_markers += 1;
            continue;
        }

        if !layout::has_file_signature(block) {
            catalog.counters.other += 1;
            record_index += 1;
            continue;
        }
        if !seen_marker {
            warn!("record before first fragment marker, offsets start at zero");
            seen_marker = true;
        }

        let decoded = match record::decode_record(block) {
            Ok(decoded) => decoded,
            Err(_) => {
                catalog.counters.bad_attributes += 1;
                record_index += 1;
                continue;
            }
        };

        catalog.counters.bad_attributes += decoded.malformed_attrs;
        catalog.counters.file_name_attributes += decoded.file_name_attrs;
        if let Some(name) = &decoded.volume_name {
            catalog.volume_name = Some(name.clone());
        }

        let sector_offset = group_base_sector + record_index * sectors_per_record;
        let cluster_offset = sector_offset - sector_offset % sectors_per_cluster;
        record_index += 1;

        if !decoded.is_in_use() {
            catalog.counters.deleted += 1;
            continue;
        }
        if decoded.is_directory() {
            catalog.counters.directories += 1;
            continue;
        }
        let Some(data) = &decoded.data else {
            catalog.counters.other += 1;
            continue;
        };
        catalog.counters.files += 1;

        let Some(name) = decoded.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let size = data
            .catalog_size(volume.bytes_per_cluster)
            .min(u32::MAX as u64) as u32;

        catalog.entries.push(CatalogEntry {
            name: name.to_string(),
            sector_offset,
            cluster_offset,
            size,
            record_number: decoded.header.record_number,
        });
    }

    info!(
        partition = volume.partition_index,
        "{}", catalog.summary()
    );
    Ok(catalog)
}
