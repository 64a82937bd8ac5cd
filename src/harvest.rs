//! Partition discovery and MFT harvesting.
//!
//! The harvester locates NTFS partitions through the MBR, reads each
//! volume's boot sector for geometry, then follows the $MFT record's own
//! non-resident data runs and streams every extent into a local image file.
//! Each extent is preceded by a 1024-byte `FRAG` marker recording the
//! absolute device byte-offset the extent was read from, so the catalogue
//! builder can recover on-disk coordinates even when $MFT is fragmented.

use crate::device::BlockDevice;
use crate::error::NtfsError;
use crate::layout::{
    self, BootSector, PartitionEntry, FRAG_SIGNATURE, PARTITION_ENTRY_SIZE, PARTITION_TABLE_OFFSET,
    RECORD_SIZE, SECTOR_SIZE,
};
use crate::record::{self, DataAttribute};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Geometry of one NTFS volume, with all offsets absolute on the device.
#[derive(Debug, Clone)]
pub struct Volume {
    pub partition_index: usize,
    pub base_bytes: u64,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub bytes_per_cluster: u64,
    pub total_sectors: i64,
    pub mft_offset_bytes: u64,
    pub bootable: bool,
}

impl Volume {
    /// One byte past the last sector of the partition.
    pub fn end_bytes(&self) -> u64 {
        self.base_bytes + self.total_sectors as u64 * self.bytes_per_sector as u64
    }

    pub fn contains_byte(&self, offset: u64) -> bool {
        offset >= self.base_bytes && offset < self.end_bytes()
    }

    pub fn describe(&self) -> String {
        format!(
            "partition {}: NTFS{} base={} ({} sectors, {} bytes/cluster, MFT at {})",
            self.partition_index,
            if self.bootable { " (bootable)" } else { "" },
            self.base_bytes,
            self.total_sectors,
            self.bytes_per_cluster,
            self.mft_offset_bytes,
        )
    }
}

/// Reads the MBR and returns the four primary slots with their indices.
pub fn read_partition_table(
    device: &mut BlockDevice,
) -> Result<Vec<(usize, PartitionEntry)>, NtfsError> {
    let mbr = device.read_vec_at(0, SECTOR_SIZE as usize)?;
    if mbr[510] != 0x55 || mbr[511] != 0xAA {
        return Err(NtfsError::InvalidPartitionTable(
            "missing 0x55AA signature".to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(4);
    for slot in 0..4 {
        let start = PARTITION_TABLE_OFFSET + slot * PARTITION_ENTRY_SIZE;
        let entry = PartitionEntry::parse(&mbr[start..start + PARTITION_ENTRY_SIZE])?;
        entries.push((slot, entry));
    }
    Ok(entries)
}

/// Reads a partition's boot sector and derives the volume geometry.
pub fn open_volume(
    device: &mut BlockDevice,
    partition_index: usize,
    entry: &PartitionEntry,
) -> Result<Volume, NtfsError> {
    let sector = device.read_vec_at(entry.base_bytes(), SECTOR_SIZE as usize)?;
    let boot = BootSector::parse(&sector)?;
    if !boot.is_valid() {
        return Err(NtfsError::InvalidBootSector(format!(
            "partition {partition_index} does not carry a usable NTFS boot sector"
        )));
    }

    if boot.mft_record_size() != RECORD_SIZE as u64 {
        warn!(
            partition = partition_index,
            record_size = boot.mft_record_size(),
            "unusual MFT record size, proceeding with 1024"
        );
    }

    Ok(Volume {
        partition_index,
        base_bytes: entry.base_bytes(),
        bytes_per_sector: boot.bytes_per_sector,
        sectors_per_cluster: boot.sectors_per_cluster,
        bytes_per_cluster: boot.bytes_per_cluster(),
        total_sectors: boot.total_sectors,
        mft_offset_bytes: entry.base_bytes() + boot.mft_offset(),
        bootable: entry.is_bootable(),
    })
}

/// Discovers every NTFS volume on the device. Partitions typed NTFS whose
/// boot sector fails to parse are skipped with a warning.
pub fn discover_ntfs_volumes(device: &mut BlockDevice) -> Result<Vec<Volume>, NtfsError> {
    let mut volumes = Vec::new();
    for (slot, entry) in read_partition_table(device)? {
        if !entry.is_ntfs() {
            continue;
        }
        match open_volume(device, slot, &entry) {
            Ok(volume) => {
                info!("{}", volume.describe());
                volumes.push(volume);
            }
            Err(e) => {
                warn!(partition = slot, error = %e, "skipping NTFS-typed partition");
            }
        }
    }

    if volumes.is_empty() {
        return Err(NtfsError::NoNtfsPartition);
    }
    Ok(volumes)
}

/// Builds the 1024-byte fragment marker that precedes each harvested
/// extent: `FRAG`, the absolute source byte-offset, zero padding, and an
/// all-ones trailer.
pub fn fragment_marker(source_offset: u64) -> [u8; RECORD_SIZE] {
    let mut block = [0u8; RECORD_SIZE];
    block[0..4].copy_from_slice(FRAG_SIGNATURE);
    block[4..12].copy_from_slice(&source_offset.to_le_bytes());
    block[RECORD_SIZE - 4..].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    block
}

/// Reads the source offset out of a fragment marker. The trailer is
/// treated as padding.
pub fn marker_source_offset(block: &[u8]) -> Option<u64> {
    if !layout::has_frag_signature(block) || block.len() < 12 {
        return None;
    }
    Some(LittleEndian::read_u64(&block[4..12]))
}

/// Image file name for partition `p`.
pub fn image_file_name(partition_index: usize) -> String {
    format!("$MFT{partition_index}.data")
}

/// What one harvest run produced.
#[derive(Debug)]
pub struct HarvestSummary {
    pub partition_index: usize,
    pub image_path: PathBuf,
    pub fragments: u32,
    pub records: u64,
    pub bytes_copied: u64,
}

const COPY_CHUNK: usize = 64 * RECORD_SIZE;

/// Harvests a volume's MFT into `image_dir`.
///
/// Record 0 describes the MFT itself; its non-resident $DATA runs are the
/// extents to copy. Each extent lands in the image behind a fragment
/// marker carrying the absolute device offset it was read from.
pub fn harvest_mft(
    device: &mut BlockDevice,
    volume: &Volume,
    image_dir: &Path,
) -> Result<HarvestSummary, NtfsError> {
    let mut record_buf = vec![0u8; RECORD_SIZE];
    device.read_at(volume.mft_offset_bytes, &mut record_buf)?;

    let mft_record = record::decode_record(&record_buf)?;
    match mft_record.name() {
        Some("$MFT") => debug!(
            partition = volume.partition_index,
            "record 0 confirmed as $MFT"
        ),
        other => warn!(
            partition = volume.partition_index,
            name = ?other,
            "record 0 is not named $MFT, continuing anyway"
        ),
    }

    let runs = match mft_record.data {
        Some(DataAttribute::NonResident { runs, .. }) => runs,
        Some(DataAttribute::Resident { .. }) => {
            return Err(NtfsError::Malformed("resident $MFT data attribute"));
        }
        None => {
            return Err(NtfsError::MissingAttribute {
                record: 0,
                attribute: "$DATA",
            });
        }
    };

    let image_path = image_dir.join(image_file_name(volume.partition_index));
    let mut image = BufWriter::new(File::create(&image_path)?);

    let mut summary = HarvestSummary {
        partition_index: volume.partition_index,
        image_path: image_path.clone(),
        fragments: 0,
        records: 0,
        bytes_copied: 0,
    };

    let mut chunk = vec![0u8; COPY_CHUNK];
    for run in &runs {
        let Some(lcn) = run.lcn else {
            warn!(
                partition = volume.partition_index,
                clusters = run.length,
                "sparse run in $MFT data, skipping"
            );
            continue;
        };
        if lcn < 0 {
            warn!(
                partition = volume.partition_index,
                lcn, "negative LCN in $MFT data, skipping"
            );
            continue;
        }

        let source = volume.base_bytes + lcn as u64 * volume.bytes_per_cluster;
        device.seek_to(source)?;

        image.write_all(&fragment_marker(device.position()))?;
        summary.fragments += 1;

        let mut remaining = run.length * volume.bytes_per_cluster;
        while remaining > 0 {
            let step = (remaining as usize).min(COPY_CHUNK);
            device.read_exact(&mut chunk[..step])?;
            image.write_all(&chunk[..step])?;
            remaining -= step as u64;
            summary.bytes_copied += step as u64;
        }
    }
    image.flush()?;

    summary.records = summary.bytes_copied / RECORD_SIZE as u64;
    info!(
        partition = volume.partition_index,
        fragments = summary.fragments,
        records = summary.records,
        image = %image_path.display(),
        "MFT harvested"
    );

    Ok(summary)
}
