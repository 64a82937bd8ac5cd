//! Decoding of a single 1024-byte MFT record: walk the attribute chain,
//! reject anything whose declared length escapes the record, and accumulate
//! the attributes the engine acts on.

use crate::error::NtfsError;
use crate::layout::{
    self, AttributeForm, AttributeHeader, FileNameAttr, RecordHeader, StandardInformation,
    ATTR_DATA, ATTR_END_MARKER, ATTR_FILE_NAME, ATTR_STANDARD_INFORMATION, ATTR_VOLUME_NAME,
    RECORD_SIZE,
};
use crate::runlist::{self, DataRun};
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

/// The $DATA attribute of a record, in whichever form it was stored.
#[derive(Debug, Clone)]
pub enum DataAttribute {
    Resident {
        content: Vec<u8>,
    },
    NonResident {
        runs: Vec<DataRun>,
        allocated_size: u64,
        real_size: u64,
    },
}

impl DataAttribute {
    /// Size in bytes the catalogue reports for this data stream.
    pub fn catalog_size(&self, bytes_per_cluster: u64) -> u64 {
        match self {
            DataAttribute::Resident { content } => content.len() as u64,
            DataAttribute::NonResident { runs, .. } => {
                runlist::total_clusters(runs) * bytes_per_cluster
            }
        }
    }
}

/// Everything extracted from one record's attribute chain.
///
/// When a record carries several $FILE_NAME attributes (hard links, DOS
/// short names) the last one observed wins.
#[derive(Debug)]
pub struct DecodedRecord {
    pub header: RecordHeader,
    pub std_info: Option<StandardInformation>,
    pub file_name: Option<FileNameAttr>,
    pub data: Option<DataAttribute>,
    pub volume_name: Option<String>,
    pub file_name_attrs: u32,
    pub malformed_attrs: u32,
    pub skipped_attrs: u32,
}

impl DecodedRecord {
    pub fn name(&self) -> Option<&str> {
        self.file_name.as_ref().map(|f| f.name.as_str())
    }

    pub fn is_in_use(&self) -> bool {
        self.header.is_in_use()
    }

    pub fn is_directory(&self) -> bool {
        self.header.is_directory()
    }
}

/// Walks the attribute chain of a record buffer.
///
/// The walk starts at the header's first-attribute offset and stops at the
/// 0xFFFFFFFF sentinel, at the record's used length, or at the first
/// attribute whose declared length does not fit the record. A malformed
/// attribute ends the walk for this record only; whatever was decoded
/// before it is kept.
pub fn decode_record(buf: &[u8]) -> Result<DecodedRecord, NtfsError> {
    if !layout::has_file_signature(buf) {
        return Err(NtfsError::Malformed("record signature"));
    }

    let header = RecordHeader::parse(buf)?;
    let record_end = RECORD_SIZE.min(buf.len());
    let used = (header.used_size as usize).min(record_end);

    let mut decoded = DecodedRecord {
        header,
        std_info: None,
        file_name: None,
        data: None,
        volume_name: None,
        file_name_attrs: 0,
        malformed_attrs: 0,
        skipped_attrs: 0,
    };

    let mut cursor = header.attrs_offset as usize;
    while cursor + 8 < used {
        let type_code = LittleEndian::read_u32(&buf[cursor..cursor + 4]);
        if type_code == ATTR_END_MARKER {
            break;
        }

        let attr = match AttributeHeader::parse(&buf[cursor..record_end]) {
            Ok(attr) => attr,
            Err(_) => {
                decoded.malformed_attrs += 1;
                break;
            }
        };

        let full_length = attr.full_length as usize;
        if full_length == 0 || full_length > record_end - cursor {
            decoded.malformed_attrs += 1;
            break;
        }
        let attr_slice = &buf[cursor..cursor + full_length];

        match attr.type_code {
            ATTR_STANDARD_INFORMATION => match resident_content(&attr, attr_slice) {
                Some(content) => match StandardInformation::parse(content) {
                    Ok(si) => {
                        debug!(
                            record = header.record_number,
                            modified = si.modified,
                            permissions = si.permissions,
                            "standard information"
                        );
                        decoded.std_info = Some(si);
                    }
                    Err(_) => decoded.malformed_attrs += 1,
                },
                None => decoded.malformed_attrs += 1,
            },

            ATTR_FILE_NAME => match resident_content(&attr, attr_slice) {
                Some(content) => match FileNameAttr::parse(content) {
                    Ok(name) => {
                        debug!(
                            record = header.record_number,
                            namespace = name.namespace,
                            name = %name.name,
                            "file name"
                        );
                        decoded.file_name_attrs += 1;
                        decoded.file_name = Some(name);
                    }
                    Err(_) => decoded.malformed_attrs += 1,
                },
                None => decoded.malformed_attrs += 1,
            },

            ATTR_DATA => match attr.form {
                AttributeForm::Resident { .. } => match resident_content(&attr, attr_slice) {
                    Some(content) => {
                        debug!(
                            record = header.record_number,
                            bytes = content.len(),
                            "resident data"
                        );
                        decoded.data = Some(DataAttribute::Resident {
                            content: content.to_vec(),
                        });
                    }
                    None => decoded.malformed_attrs += 1,
                },
                AttributeForm::NonResident {
                    run_offset,
                    allocated_size,
                    real_size,
                    ..
                } => {
                    let run_offset = run_offset as usize;
                    if run_offset >= full_length {
                        decoded.malformed_attrs += 1;
                    } else {
                        match runlist::decode_runs(&attr_slice[run_offset..]) {
                            Ok(runs) => {
                                debug!(
                                    record = header.record_number,
                                    runs = runs.len(),
                                    real_size,
                                    "non-resident data"
                                );
                                decoded.data = Some(DataAttribute::NonResident {
                                    runs,
                                    allocated_size,
                                    real_size,
                                });
                            }
                            Err(_) => decoded.malformed_attrs += 1,
                        }
                    }
                }
            },

            ATTR_VOLUME_NAME => match resident_content(&attr, attr_slice) {
                Some(content) => {
                    decoded.volume_name = Some(layout::parse_volume_name(content));
                }
                None => decoded.malformed_attrs += 1,
            },

            _ => {
                decoded.skipped_attrs += 1;
            }
        }

        cursor += full_length;
    }

    Ok(decoded)
}

/// The content slice of a resident attribute, or `None` when the declared
/// content window escapes the attribute.
fn resident_content<'a>(attr: &AttributeHeader, attr_slice: &'a [u8]) -> Option<&'a [u8]> {
    match attr.form {
        AttributeForm::Resident {
            content_length,
            content_offset,
            ..
        } => {
            let start = content_offset as usize;
            let end = start.checked_add(content_length as usize)?;
            attr_slice.get(start..end)
        }
        AttributeForm::NonResident { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FILE_SIGNATURE, RECORD_FLAG_IN_USE};
    use crate::runlist::encode_runs;

    fn build_record(record_number: u32, flags: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(FILE_SIGNATURE);
        let attrs_offset: u16 = 56;
        buf[20..22].copy_from_slice(&attrs_offset.to_le_bytes());
        buf[22..24].copy_from_slice(&flags.to_le_bytes());
        buf[44..48].copy_from_slice(&record_number.to_le_bytes());

        let mut cursor = attrs_offset as usize;
        for attr in attrs {
            buf[cursor..cursor + attr.len()].copy_from_slice(attr);
            cursor += attr.len();
        }
        buf[cursor..cursor + 4].copy_from_slice(&ATTR_END_MARKER.to_le_bytes());
        cursor += 8;

        buf[24..28].copy_from_slice(&(cursor as u32).to_le_bytes());
        buf
    }

    fn resident_attr(type_code: u32, content: &[u8]) -> Vec<u8> {
        let content_offset: u16 = 24;
        let mut full = content_offset as usize + content.len();
        full = full.div_ceil(8) * 8;
        let mut attr = vec![0u8; full];
        attr[0..4].copy_from_slice(&type_code.to_le_bytes());
        attr[4..8].copy_from_slice(&(full as u32).to_le_bytes());
        attr[8] = 0;
        attr[16..20].copy_from_slice(&(content.len() as u32).to_le_bytes());
        attr[20..22].copy_from_slice(&content_offset.to_le_bytes());
        attr[24..24 + content.len()].copy_from_slice(content);
        attr
    }

    fn file_name_content(name: &str) -> Vec<u8> {
        let utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut content = vec![0u8; 66 + utf16.len()];
        content[64] = name.encode_utf16().count() as u8;
        content[65] = 1;
        content[66..].copy_from_slice(&utf16);
        content
    }

    fn std_info_content(modified: u64) -> Vec<u8> {
        let mut content = vec![0u8; 48];
        content[8..16].copy_from_slice(&modified.to_le_bytes());
        content
    }

    fn non_resident_data_attr(runs: &[DataRun], real_size: u64) -> Vec<u8> {
        let run_bytes = encode_runs(runs);
        let run_offset: u16 = 64;
        let mut full = run_offset as usize + run_bytes.len();
        full = full.div_ceil(8) * 8;
        let mut attr = vec![0u8; full];
        attr[0..4].copy_from_slice(&ATTR_DATA.to_le_bytes());
        attr[4..8].copy_from_slice(&(full as u32).to_le_bytes());
        attr[8] = 1;
        attr[32..34].copy_from_slice(&run_offset.to_le_bytes());
        attr[48..56].copy_from_slice(&real_size.to_le_bytes());
        attr[64..64 + run_bytes.len()].copy_from_slice(&run_bytes);
        attr
    }

    #[test]
    fn decodes_attributes_in_on_disk_order() {
        let record = build_record(
            5,
            RECORD_FLAG_IN_USE,
            &[
                resident_attr(ATTR_STANDARD_INFORMATION, &std_info_content(77)),
                resident_attr(ATTR_FILE_NAME, &file_name_content("hi.txt")),
                resident_attr(ATTR_DATA, b"HELLO"),
            ],
        );

        let decoded = decode_record(&record).unwrap();
        assert_eq!(decoded.header.record_number, 5);
        assert!(decoded.is_in_use());
        assert_eq!(decoded.std_info.unwrap().modified, 77);
        assert_eq!(decoded.name(), Some("hi.txt"));
        match decoded.data.unwrap() {
            DataAttribute::Resident { content } => assert_eq!(content, b"HELLO"),
            other => panic!("unexpected data form: {other:?}"),
        }
        assert_eq!(decoded.malformed_attrs, 0);
    }

    #[test]
    fn last_file_name_wins() {
        let record = build_record(
            9,
            RECORD_FLAG_IN_USE,
            &[
                resident_attr(ATTR_FILE_NAME, &file_name_content("LONGN~1.TXT")),
                resident_attr(ATTR_FILE_NAME, &file_name_content("long name.txt")),
            ],
        );

        let decoded = decode_record(&record).unwrap();
        assert_eq!(decoded.file_name_attrs, 2);
        assert_eq!(decoded.name(), Some("long name.txt"));
    }

    #[test]
    fn non_resident_data_runs_are_absolute() {
        let runs = vec![DataRun::new(2, 100), DataRun::new(1, 200)];
        let record = build_record(
            12,
            RECORD_FLAG_IN_USE,
            &[non_resident_data_attr(&runs, 12_000)],
        );

        let decoded = decode_record(&record).unwrap();
        match decoded.data.unwrap() {
            DataAttribute::NonResident {
                runs: decoded_runs,
                real_size,
                ..
            } => {
                assert_eq!(decoded_runs, runs);
                assert_eq!(real_size, 12_000);
            }
            other => panic!("unexpected data form: {other:?}"),
        }
    }

    #[test]
    fn oversized_attribute_stops_the_walk() {
        let mut record = build_record(
            3,
            RECORD_FLAG_IN_USE,
            &[
                resident_attr(ATTR_FILE_NAME, &file_name_content("kept.txt")),
                resident_attr(ATTR_DATA, b"LOST"),
            ],
        );
        // Corrupt the second attribute's length so it escapes the record.
        let second = 56 + resident_attr(ATTR_FILE_NAME, &file_name_content("kept.txt")).len();
        record[second + 4..second + 8].copy_from_slice(&0x2000u32.to_le_bytes());

        let decoded = decode_record(&record).unwrap();
        assert_eq!(decoded.name(), Some("kept.txt"));
        assert!(decoded.data.is_none());
        assert_eq!(decoded.malformed_attrs, 1);
    }

    #[test]
    fn unknown_attribute_types_are_skipped() {
        let record = build_record(
            4,
            RECORD_FLAG_IN_USE,
            &[
                resident_attr(0xB0, &[0xFF; 8]),
                resident_attr(ATTR_DATA, b"D"),
            ],
        );

        let decoded = decode_record(&record).unwrap();
        assert_eq!(decoded.skipped_attrs, 1);
        assert!(decoded.data.is_some());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut record = build_record(1, RECORD_FLAG_IN_USE, &[]);
        record[0..4].copy_from_slice(b"BAAD");
        assert!(decode_record(&record).is_err());
    }

    #[test]
    fn catalog_size_resident_and_non_resident() {
        let resident = DataAttribute::Resident {
            content: b"HELLO".to_vec(),
        };
        assert_eq!(resident.catalog_size(4096), 5);

        let non_resident = DataAttribute::NonResident {
            runs: vec![DataRun::new(2, 100), DataRun::new(1, 200)],
            allocated_size: 12_288,
            real_size: 12_000,
        };
        assert_eq!(non_resident.catalog_size(4096), 12_288);
    }
}
