//! Shared builders for synthetic NTFS volumes: an MBR with one NTFS
//! partition, a boot sector, and hand-assembled MFT records.

#![allow(dead_code)]

use mftap::engine::{Engine, EngineOptions};
use mftap::extract::{NON_RESIDENT_DIR, RESIDENT_DIR};
use mftap::layout::{
    ATTR_DATA, ATTR_FILE_NAME, ATTR_STANDARD_INFORMATION, BOOT_INDICATOR_BOOTABLE, NTFS_OEM_ID,
    NTFS_PARTITION_TYPE, RECORD_SIZE,
};
use mftap::runlist::{encode_runs, DataRun};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Partition start, in sectors.
pub const PART_BASE_SECTOR: u32 = 2048;

/// Partition start, in bytes.
pub const PART_BASE_BYTES: u64 = PART_BASE_SECTOR as u64 * 512;

/// Partition length, in sectors (32 MiB).
pub const PART_TOTAL_SECTORS: u32 = 0x10000;

pub const BYTES_PER_CLUSTER: u64 = 4096;
pub const SECTORS_PER_CLUSTER: u64 = 8;

const END_MARKER: u32 = 0xFFFF_FFFF;

/// One extent of the synthetic MFT: where it sits (partition-relative
/// LCN), how many clusters it spans, and the records stored in it.
pub struct Extent {
    pub lcn: i64,
    pub clusters: u64,
    pub records: Vec<Vec<u8>>,
}

/// An MBR whose slot 0 describes the synthetic NTFS partition.
pub fn mbr() -> [u8; 512] {
    let mut sector = [0u8; 512];
    let entry = &mut sector[0x1BE..0x1BE + 16];
    entry[0] = BOOT_INDICATOR_BOOTABLE;
    entry[4] = NTFS_PARTITION_TYPE;
    entry[8..12].copy_from_slice(&PART_BASE_SECTOR.to_le_bytes());
    entry[12..16].copy_from_slice(&PART_TOTAL_SECTORS.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// A boot sector for 512-byte sectors, 8 sectors per cluster, and the MFT
/// at the given cluster.
pub fn boot_sector(mft_cluster: i64) -> [u8; 512] {
    let mut sector = [0u8; 512];
    sector[3..11].copy_from_slice(&NTFS_OEM_ID);
    sector[11..13].copy_from_slice(&512u16.to_le_bytes());
    sector[13] = SECTORS_PER_CLUSTER as u8;
    sector[40..48].copy_from_slice(&(PART_TOTAL_SECTORS as i64).to_le_bytes());
    sector[48..56].copy_from_slice(&mft_cluster.to_le_bytes());
    sector[56..64].copy_from_slice(&(mft_cluster + 1024).to_le_bytes());
    sector[64] = (-10i8) as u8; // 2^10 = 1024-byte records
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// Assembles a 1024-byte MFT record around the given attribute blobs.
pub fn build_record(record_number: u32, flags: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = vec![0u8; RECORD_SIZE];
    buf[0..4].copy_from_slice(b"FILE");
    let attrs_offset: u16 = 56;
    buf[20..22].copy_from_slice(&attrs_offset.to_le_bytes());
    buf[22..24].copy_from_slice(&flags.to_le_bytes());
    buf[44..48].copy_from_slice(&record_number.to_le_bytes());

    let mut cursor = attrs_offset as usize;
    for attr in attrs {
        buf[cursor..cursor + attr.len()].copy_from_slice(attr);
        cursor += attr.len();
    }
    buf[cursor..cursor + 4].copy_from_slice(&END_MARKER.to_le_bytes());
    cursor += 8;

    buf[24..28].copy_from_slice(&(cursor as u32).to_le_bytes());
    buf
}

fn resident_attr(type_code: u32, content: &[u8]) -> Vec<u8> {
    let content_offset: u16 = 24;
    let full = (content_offset as usize + content.len()).div_ceil(8) * 8;
    let mut attr = vec![0u8; full];
    attr[0..4].copy_from_slice(&type_code.to_le_bytes());
    attr[4..8].copy_from_slice(&(full as u32).to_le_bytes());
    attr[16..20].copy_from_slice(&(content.len() as u32).to_le_bytes());
    attr[20..22].copy_from_slice(&content_offset.to_le_bytes());
    attr[24..24 + content.len()].copy_from_slice(content);
    attr
}

pub fn attr_std_info(modified: u64) -> Vec<u8> {
    let mut content = vec![0u8; 48];
    content[8..16].copy_from_slice(&modified.to_le_bytes());
    resident_attr(ATTR_STANDARD_INFORMATION, &content)
}

pub fn attr_file_name(name: &str) -> Vec<u8> {
    let utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let mut content = vec![0u8; 66 + utf16.len()];
    content[64] = name.encode_utf16().count() as u8;
    content[65] = 1;
    content[66..].copy_from_slice(&utf16);
    resident_attr(ATTR_FILE_NAME, &content)
}

pub fn attr_data_resident(content: &[u8]) -> Vec<u8> {
    resident_attr(ATTR_DATA, content)
}

pub fn attr_data_non_resident(runs: &[DataRun], real_size: u64) -> Vec<u8> {
    let run_bytes = encode_runs(runs);
    let run_offset: u16 = 64;
    let full = (run_offset as usize + run_bytes.len()).div_ceil(8) * 8;
    let mut attr = vec![0u8; full];
    attr[0..4].copy_from_slice(&ATTR_DATA.to_le_bytes());
    attr[4..8].copy_from_slice(&(full as u32).to_le_bytes());
    attr[8] = 1;
    attr[32..34].copy_from_slice(&run_offset.to_le_bytes());
    attr[48..56].copy_from_slice(&real_size.to_le_bytes());
    attr[64..64 + run_bytes.len()].copy_from_slice(&run_bytes);
    attr
}

/// A plain file record: standard information, a name, resident content.
pub fn file_record(record_number: u32, name: &str, content: &[u8], modified: u64) -> Vec<u8> {
    build_record(
        record_number,
        0x0001,
        &[
            attr_std_info(modified),
            attr_file_name(name),
            attr_data_resident(content),
        ],
    )
}

/// Builds the whole device image: MBR, boot sector, a $MFT record whose
/// data runs describe `extents`, and every extent's records in place.
///
/// The $MFT record itself is prepended to the first extent, so the boot
/// sector's MFT cluster is `extents[0].lcn`.
pub fn synthetic_device(extents: &[Extent]) -> Vec<u8> {
    assert!(!extents.is_empty());

    let device_size = PART_BASE_BYTES + PART_TOTAL_SECTORS as u64 * 512;
    let mut device = vec![0u8; device_size as usize];

    device[..512].copy_from_slice(&mbr());
    let base = PART_BASE_BYTES as usize;
    device[base..base + 512].copy_from_slice(&boot_sector(extents[0].lcn));

    let runs: Vec<DataRun> = extents
        .iter()
        .map(|e| DataRun::new(e.clusters, e.lcn))
        .collect();
    let total_bytes: u64 = extents.iter().map(|e| e.clusters * BYTES_PER_CLUSTER).sum();
    let mft_record = build_record(
        0,
        0x0001,
        &[
            attr_std_info(0),
            attr_file_name("$MFT"),
            attr_data_non_resident(&runs, total_bytes),
        ],
    );

    for (index, extent) in extents.iter().enumerate() {
        let capacity = (extent.clusters * BYTES_PER_CLUSTER) as usize / RECORD_SIZE;
        let mut records: Vec<&[u8]> = Vec::new();
        if index == 0 {
            records.push(&mft_record);
        }
        records.extend(extent.records.iter().map(|r| r.as_slice()));
        assert!(
            records.len() <= capacity,
            "extent {index} holds {} records but has room for {capacity}",
            records.len()
        );

        let start = PART_BASE_BYTES as usize + (extent.lcn as usize) * BYTES_PER_CLUSTER as usize;
        for (slot, record) in records.iter().enumerate() {
            let at = start + slot * RECORD_SIZE;
            device[at..at + RECORD_SIZE].copy_from_slice(record);
        }
    }

    device
}

/// Fills a partition-relative cluster with one byte value.
pub fn fill_cluster(device: &mut [u8], lcn: u64, value: u8) {
    let start = PART_BASE_BYTES as usize + (lcn * BYTES_PER_CLUSTER) as usize;
    device[start..start + BYTES_PER_CLUSTER as usize].fill(value);
}

/// Absolute device sector of a record placed in an extent.
pub fn record_sector(lcn: i64, slot: i64) -> i64 {
    (PART_BASE_BYTES as i64 + lcn * BYTES_PER_CLUSTER as i64) / 512 + slot * 2
}

static SOCKET_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A socket name no other test in this process will bind.
pub fn unique_socket_name(tag: &str) -> String {
    format!(
        "mftap-test-{tag}-{}-{}",
        std::process::id(),
        SOCKET_SEQ.fetch_add(1, Ordering::SeqCst)
    )
}

/// A volume holding `hi.txt` (resident "HELLO") and `big.bin`
/// (non-resident, clusters 100-101 and 200 filled with 0xAA/0xBB/0xCC).
pub fn device_with_files() -> Vec<u8> {
    let mut device = synthetic_device(&[Extent {
        lcn: 256,
        clusters: 1,
        records: vec![
            file_record(1, "hi.txt", b"HELLO", 0),
            build_record(
                2,
                0x0001,
                &[
                    attr_std_info(0),
                    attr_file_name("big.bin"),
                    attr_data_non_resident(&[DataRun::new(2, 100), DataRun::new(1, 200)], 12_000),
                ],
            ),
        ],
    }]);
    fill_cluster(&mut device, 100, 0xAA);
    fill_cluster(&mut device, 101, 0xBB);
    fill_cluster(&mut device, 200, 0xCC);
    device
}

/// Writes [`device_with_files`] to disk and bootstraps an engine over it.
/// The extraction tree lives under `<tempdir>/EXTRACTED_FILES`.
pub fn bootstrapped_engine(tag: &str) -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    let device_path = dir.path().join("disk.img");
    fs::write(&device_path, device_with_files()).unwrap();

    let output_root = dir.path().join("EXTRACTED_FILES");
    fs::create_dir_all(output_root.join(RESIDENT_DIR)).unwrap();
    fs::create_dir_all(output_root.join(NON_RESIDENT_DIR)).unwrap();

    let engine = Engine::bootstrap(&EngineOptions {
        device_path,
        image_dir: dir.path().to_path_buf(),
        output_root,
        max_extract_size: 2 * 1024 * 1024,
        max_modify_age_secs: 300,
        socket_name: unique_socket_name(tag),
    })
    .unwrap();

    (dir, engine)
}
