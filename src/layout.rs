//! Little-endian decoders for the fixed on-disk structures consumed by the
//! engine: MBR partition entries, the NTFS boot sector, MFT record headers,
//! attribute headers, and the resident attribute payloads we care about
//! ($STANDARD_INFORMATION, $FILE_NAME, $VOLUME_NAME).
//!
//! Every decoder works field by field on a byte slice. None of them keep
//! state, and a length field that contradicts the enclosing structure is
//! reported as malformed rather than trusted.

use crate::error::NtfsError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sector size assumed throughout; raw NTFS volumes on MBR disks use 512.
pub const SECTOR_SIZE: u64 = 512;

/// MFT record size. Fixed at 1024 bytes for the volumes this engine handles.
pub const RECORD_SIZE: usize = 1024;

/// Byte offset of the first partition entry inside the MBR.
pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;

/// Size of one MBR partition entry.
pub const PARTITION_ENTRY_SIZE: usize = 16;

/// Partition type byte identifying NTFS.
pub const NTFS_PARTITION_TYPE: u8 = 0x07;

/// Boot indicator value marking a partition bootable ("active").
pub const BOOT_INDICATOR_BOOTABLE: u8 = 0x80;

/// NTFS boot sector OEM ID "NTFS    "
pub const NTFS_OEM_ID: [u8; 8] = [0x4E, 0x54, 0x46, 0x53, 0x20, 0x20, 0x20, 0x20];

/// MFT record signature "FILE"
pub const FILE_SIGNATURE: &[u8; 4] = b"FILE";

/// Fragment marker signature used in the local MFT image.
pub const FRAG_SIGNATURE: &[u8; 4] = b"FRAG";

// Attribute type codes.
pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_OBJECT_ID: u32 = 0x40;
pub const ATTR_SECURITY_DESCRIPTOR: u32 = 0x50;
pub const ATTR_VOLUME_NAME: u32 = 0x60;
pub const ATTR_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_BITMAP: u32 = 0xB0;
pub const ATTR_REPARSE_POINT: u32 = 0xC0;
pub const ATTR_EA_INFORMATION: u32 = 0xD0;
pub const ATTR_EA: u32 = 0xE0;
pub const ATTR_LOGGED_UTILITY_STREAM: u32 = 0x100;

/// Attribute chain terminator.
pub const ATTR_END_MARKER: u32 = 0xFFFF_FFFF;

/// MFT record header flag: record is in use.
pub const RECORD_FLAG_IN_USE: u16 = 0x0001;

/// MFT record header flag: record describes a directory.
pub const RECORD_FLAG_DIRECTORY: u16 = 0x0002;

/// One 16-byte MBR partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub boot_indicator: u8,
    pub start_head: u8,
    pub start_sector: u8,
    pub start_cylinder: u8,
    pub partition_type: u8,
    pub end_head: u8,
    pub end_sector: u8,
    pub end_cylinder: u8,
    pub relative_sector: u32,
    pub total_sectors: u32,
}

impl PartitionEntry {
    pub fn parse(data: &[u8]) -> Result<Self, NtfsError> {
        if data.len() < PARTITION_ENTRY_SIZE {
            return Err(NtfsError::Malformed("partition entry"));
        }

        let mut cursor = Cursor::new(data);
        Ok(Self {
            boot_indicator: cursor.read_u8()?,
            start_head: cursor.read_u8()?,
            start_sector: cursor.read_u8()?,
            start_cylinder: cursor.read_u8()?,
            partition_type: cursor.read_u8()?,
            end_head: cursor.read_u8()?,
            end_sector: cursor.read_u8()?,
            end_cylinder: cursor.read_u8()?,
            relative_sector: cursor.read_u32::<LittleEndian>()?,
            total_sectors: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; PARTITION_ENTRY_SIZE] {
        let mut out = [0u8; PARTITION_ENTRY_SIZE];
        out[0] = self.boot_indicator;
        out[1] = self.start_head;
        out[2] = self.start_sector;
        out[3] = self.start_cylinder;
        out[4] = self.partition_type;
        out[5] = self.end_head;
        out[6] = self.end_sector;
        out[7] = self.end_cylinder;
        out[8..12].copy_from_slice(&self.relative_sector.to_le_bytes());
        out[12..16].copy_from_slice(&self.total_sectors.to_le_bytes());
        out
    }

    /// An entry with zero total sectors is an empty slot.
    pub fn is_occupied(&self) -> bool {
        self.total_sectors > 0
    }

    pub fn is_ntfs(&self) -> bool {
        self.is_occupied() && self.partition_type == NTFS_PARTITION_TYPE
    }

    pub fn is_bootable(&self) -> bool {
        self.boot_indicator == BOOT_INDICATOR_BOOTABLE
    }

    /// Absolute byte offset of the partition's first sector.
    pub fn base_bytes(&self) -> u64 {
        self.relative_sector as u64 * SECTOR_SIZE
    }
}

/// The NTFS boot sector fields the engine uses.
#[derive(Debug, Clone, Copy)]
pub struct BootSector {
    pub oem_id: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: i64,
    pub mft_cluster: i64,
    pub mft_mirror_cluster: i64,
    pub clusters_per_mft_record: i8,
}

impl BootSector {
    /// Parses a 512-byte boot sector.
    pub fn parse(data: &[u8]) -> Result<Self, NtfsError> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(NtfsError::InvalidBootSector(
                "boot sector too small".to_string(),
            ));
        }

        let mut oem_id = [0u8; 8];
        oem_id.copy_from_slice(&data[3..11]);

        let mut cursor = Cursor::new(data);

        cursor.set_position(11);
        let bytes_per_sector = cursor.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = cursor.read_u8()?;

        cursor.set_position(40);
        let total_sectors = cursor.read_i64::<LittleEndian>()?;
        let mft_cluster = cursor.read_i64::<LittleEndian>()?;
        let mft_mirror_cluster = cursor.read_i64::<LittleEndian>()?;
        let clusters_per_mft_record = cursor.read_i8()?;

        Ok(Self {
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_mft_record,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.oem_id == NTFS_OEM_ID
            && self.bytes_per_sector >= 512
            && self.sectors_per_cluster > 0
            && self.total_sectors > 0
            && self.mft_cluster > 0
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// MFT record size in bytes. A negative clusters-per-record value means
    /// the size is 2^|value| bytes.
    pub fn mft_record_size(&self) -> u64 {
        if self.clusters_per_mft_record > 0 {
            self.bytes_per_cluster() * self.clusters_per_mft_record as u64
        } else {
            1u64 << (-self.clusters_per_mft_record as u64)
        }
    }

    /// MFT byte offset relative to the start of the partition.
    pub fn mft_offset(&self) -> u64 {
        self.mft_cluster as u64 * self.bytes_per_cluster()
    }
}

/// Header of a 1024-byte MFT record.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub signature: [u8; 4],
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence: u16,
    pub hard_links: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_record: u64,
    pub next_attr_id: u16,
    pub record_number: u32,
}

impl RecordHeader {
    pub fn parse(data: &[u8]) -> Result<Self, NtfsError> {
        if data.len() < 48 {
            return Err(NtfsError::Malformed("record header"));
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        let mut cursor = Cursor::new(data);
        cursor.set_position(4);
        let usa_offset = cursor.read_u16::<LittleEndian>()?;
        let usa_count = cursor.read_u16::<LittleEndian>()?;
        let lsn = cursor.read_u64::<LittleEndian>()?;
        let sequence = cursor.read_u16::<LittleEndian>()?;
        let hard_links = cursor.read_u16::<LittleEndian>()?;
        let attrs_offset = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let used_size = cursor.read_u32::<LittleEndian>()?;
        let allocated_size = cursor.read_u32::<LittleEndian>()?;
        let base_record = cursor.read_u64::<LittleEndian>()?;
        let next_attr_id = cursor.read_u16::<LittleEndian>()?;
        cursor.set_position(44);
        let record_number = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            signature,
            usa_offset,
            usa_count,
            lsn,
            sequence,
            hard_links,
            attrs_offset,
            flags,
            used_size,
            allocated_size,
            base_record,
            next_attr_id,
            record_number,
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & RECORD_FLAG_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_FLAG_DIRECTORY != 0
    }
}

/// True if the buffer begins with the MFT record magic. Covers both the
/// bare "FILE" form and the "FILE0" variant, whose fifth byte is simply the
/// low byte of the update-sequence offset.
pub fn has_file_signature(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == *FILE_SIGNATURE
}

/// True if the buffer begins with the fragment-marker magic.
pub fn has_frag_signature(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == *FRAG_SIGNATURE
}

/// Resident or non-resident payload description of an attribute.
#[derive(Debug, Clone, Copy)]
pub enum AttributeForm {
    Resident {
        content_length: u32,
        content_offset: u16,
        indexed: u8,
    },
    NonResident {
        start_vcn: u64,
        end_vcn: u64,
        run_offset: u16,
        compression_unit: u16,
        allocated_size: u64,
        real_size: u64,
        stream_size: u64,
    },
}

/// Common attribute header plus the resident/non-resident union.
#[derive(Debug, Clone, Copy)]
pub struct AttributeHeader {
    pub type_code: u32,
    pub full_length: u32,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub form: AttributeForm,
}

impl AttributeHeader {
    /// Parses an attribute header from a slice starting at the attribute's
    /// first byte. Only the header is validated here; content bounds are the
    /// caller's to check against the enclosing record.
    pub fn parse(data: &[u8]) -> Result<Self, NtfsError> {
        if data.len() < 16 {
            return Err(NtfsError::Malformed("attribute header"));
        }

        let mut cursor = Cursor::new(data);
        let type_code = cursor.read_u32::<LittleEndian>()?;
        let full_length = cursor.read_u32::<LittleEndian>()?;
        let non_resident = cursor.read_u8()?;
        let name_length = cursor.read_u8()?;
        let name_offset = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let id = cursor.read_u16::<LittleEndian>()?;

        let form = if non_resident == 0 {
            if data.len() < 24 {
                return Err(NtfsError::Malformed("resident attribute header"));
            }
            let content_length = cursor.read_u32::<LittleEndian>()?;
            let content_offset = cursor.read_u16::<LittleEndian>()?;
            let indexed = cursor.read_u8()?;
            AttributeForm::Resident {
                content_length,
                content_offset,
                indexed,
            }
        } else {
            if data.len() < 64 {
                return Err(NtfsError::Malformed("non-resident attribute header"));
            }
            let start_vcn = cursor.read_u64::<LittleEndian>()?;
            let end_vcn = cursor.read_u64::<LittleEndian>()?;
            let run_offset = cursor.read_u16::<LittleEndian>()?;
            let compression_unit = cursor.read_u16::<LittleEndian>()?;
            cursor.set_position(40);
            let allocated_size = cursor.read_u64::<LittleEndian>()?;
            let real_size = cursor.read_u64::<LittleEndian>()?;
            let stream_size = cursor.read_u64::<LittleEndian>()?;
            AttributeForm::NonResident {
                start_vcn,
                end_vcn,
                run_offset,
                compression_unit,
                allocated_size,
                real_size,
                stream_size,
            }
        };

        Ok(Self {
            type_code,
            full_length,
            name_length,
            name_offset,
            flags,
            id,
            form,
        })
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.form, AttributeForm::Resident { .. })
    }
}

/// $STANDARD_INFORMATION timestamps and DOS permissions.
///
/// All timestamps are NTFS time: 100-ns intervals since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy)]
pub struct StandardInformation {
    pub created: u64,
    pub modified: u64,
    pub mft_changed: u64,
    pub read: u64,
    pub permissions: u32,
}

impl StandardInformation {
    pub fn parse(content: &[u8]) -> Result<Self, NtfsError> {
        if content.len() < 36 {
            return Err(NtfsError::Malformed("$STANDARD_INFORMATION"));
        }

        let mut cursor = Cursor::new(content);
        Ok(Self {
            created: cursor.read_u64::<LittleEndian>()?,
            modified: cursor.read_u64::<LittleEndian>()?,
            mft_changed: cursor.read_u64::<LittleEndian>()?,
            read: cursor.read_u64::<LittleEndian>()?,
            permissions: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Decoded $FILE_NAME attribute content.
#[derive(Debug, Clone)]
pub struct FileNameAttr {
    pub parent_reference: u64,
    pub created: i64,
    pub altered: i64,
    pub mft_changed: i64,
    pub read: i64,
    pub allocated_size: i64,
    pub real_size: i64,
    pub flags: u32,
    pub name_length: u8,
    pub namespace: u8,
    pub name: String,
}

impl FileNameAttr {
    pub fn parse(content: &[u8]) -> Result<Self, NtfsError> {
        if content.len() < 66 {
            return Err(NtfsError::Malformed("$FILE_NAME"));
        }

        let mut cursor = Cursor::new(content);
        let parent_reference = cursor.read_u64::<LittleEndian>()?;
        let created = cursor.read_i64::<LittleEndian>()?;
        let altered = cursor.read_i64::<LittleEndian>()?;
        let mft_changed = cursor.read_i64::<LittleEndian>()?;
        let read = cursor.read_i64::<LittleEndian>()?;
        let allocated_size = cursor.read_i64::<LittleEndian>()?;
        let real_size = cursor.read_i64::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        cursor.set_position(64);
        let name_length = cursor.read_u8()?;
        let namespace = cursor.read_u8()?;

        let name_bytes = 2 * name_length as usize;
        if 66 + name_bytes > content.len() {
            return Err(NtfsError::Malformed("$FILE_NAME name"));
        }
        let name = extract_low_byte_name(&content[66..66 + name_bytes]);

        Ok(Self {
            parent_reference,
            created,
            altered,
            mft_changed,
            read,
            allocated_size,
            real_size,
            flags,
            name_length,
            namespace,
            name,
        })
    }
}

/// Best-effort 8-bit projection of a UTF-16LE name: keeps every byte in
/// (0x14, 0x80), which passes printable ASCII through and drops the high
/// halves of BMP code units along with control characters.
pub fn extract_low_byte_name(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|&b| b > 0x14 && b < 0x80)
        .map(char::from)
        .collect()
}

/// Decodes a $VOLUME_NAME attribute payload (UTF-16LE, not terminated).
pub fn parse_volume_name(content: &[u8]) -> String {
    extract_low_byte_name(content)
}

// NTFS time base: 100-ns intervals since 1601-01-01 UTC.

pub const NTFS_TICKS_PER_SECOND: u64 = 10_000_000;

/// 100-ns intervals between 1601-01-01 and 1970-01-01.
pub const NTFS_EPOCH_OFFSET: u64 = 116_444_736_000_000_000;

pub fn unix_to_ntfs_time(unix_seconds: u64) -> u64 {
    unix_seconds * NTFS_TICKS_PER_SECOND + NTFS_EPOCH_OFFSET
}

/// Current wall-clock time in NTFS 100-ns intervals.
pub fn ntfs_time_now() -> u64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix_to_ntfs_time(unix)
}
