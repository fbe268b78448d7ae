// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf

//! The MFT catalogue: one pass over every file record, keeping what path
//! resolution and index carving need. Directories are kept whether live or
//! deleted; plain files are kept only while in use (their liveness feeds the
//! active-file filter).

use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::{Read, Seek};

use crate::NtfsVolume;
use crate::errors::{ExhumeIndxError, Result};
use crate::fixup::apply_fixup;
use crate::mft::{
    Attribute, AttributeListEntry, AttributeType, FileNameAttribute, FileReference, MftRecord,
    parse_attribute_list,
};
use crate::runlist::{NonResidentReader, decode_runlist};

/// Upper bound on `$MFT` `$DATA` extension streams; a sane volume has a
/// handful at most.
const MAX_MFT_STREAMS: usize = 128;

/// What the catalogue keeps per `(record number, sequence)` key.
#[derive(Debug, Clone, Default)]
pub struct CatalogRecord {
    pub is_allocated: bool,
    pub is_directory: bool,
    pub file_names: Vec<FileNameAttribute>,
    /// `$I30` `$INDEX_ALLOCATION` instances as `(starting VCN, reader)`,
    /// sorted by starting VCN after the walk.
    pub index_allocations: Vec<(u64, NonResidentReader)>,
    pub index_block_size: u64,
    /// `$ATTRIBUTE_LIST` entries of the base record: which extension record
    /// carries which slice of which attribute.
    pub attribute_list: Vec<AttributeListEntry>,
}

impl CatalogRecord {
    /// Primary `$FILE_NAME`: Win32&DOS > Win32 > POSIX > DOS.
    pub fn best_name(&self) -> Option<&FileNameAttribute> {
        self.file_names
            .iter()
            .max_by_key(|f| f.namespace.priority())
    }
}

pub struct MftCatalog {
    pub records: BTreeMap<(u64, u16), CatalogRecord>,
    pub mft_record_count: u64,
    pub ntfs_version: Option<(u8, u8)>,
}

impl MftCatalog {
    /// Walk the whole MFT of `vol` and build the catalogue. Errors returned
    /// from here (unreadable record 0, unsupported NTFS version) are fatal;
    /// everything per-record is logged and skipped.
    pub fn build<T: Read + Seek>(vol: &mut NtfsVolume<T>) -> Result<Self> {
        let record_size = vol.pbs.file_record_size();
        let chunk_size = vol.pbs.mft_chunk_size();
        let default_index_block = vol.pbs.index_block_size();

        let mft_data = first_mft_data_reader(vol)?;
        let mft_record_count = if mft_data.real_size > 0 {
            mft_data.real_size / record_size
        } else {
            mft_data.run_bytes() / record_size
        };

        let ntfs_version = read_ntfs_version(vol, &mft_data, record_size)?;

        let mut catalog = MftCatalog {
            records: BTreeMap::new(),
            mft_record_count,
            ntfs_version,
        };

        let mut pending = vec![mft_data];
        let mut streams_seen = 1usize;
        while let Some(stream) = pending.pop() {
            let mut extra =
                catalog.walk_stream(vol, &stream, record_size, chunk_size, default_index_block);
            streams_seen += extra.len();
            if streams_seen > MAX_MFT_STREAMS {
                warn!("more than {MAX_MFT_STREAMS} $MFT data streams; ignoring the rest");
                extra.clear();
            }
            pending.append(&mut extra);
        }

        for record in catalog.records.values_mut() {
            record.index_allocations.sort_by_key(|(vcn, _)| *vcn);
        }
        Ok(catalog)
    }

    /// Is this exact incarnation still in use?
    pub fn is_live(&self, reference: FileReference) -> bool {
        self.records
            .get(&reference.key())
            .is_some_and(|r| r.is_allocated)
    }

    /// Keys of every directory that has index blocks to carve.
    pub fn directory_keys(&self) -> Vec<(u64, u16)> {
        self.records
            .iter()
            .filter(|(_, r)| r.is_directory && !r.index_allocations.is_empty())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Process one `$MFT` `$DATA` stream; returns extension streams found on
    /// the way (records based on reference `(0, 1)`).
    fn walk_stream<T: Read + Seek>(
        &mut self,
        vol: &mut NtfsVolume<T>,
        stream: &NonResidentReader,
        record_size: u64,
        chunk_size: u64,
        default_index_block: u64,
    ) -> Vec<NonResidentReader> {
        let mut extra_streams = Vec::new();
        let total = stream.run_bytes();
        let mut offset = 0u64;

        while offset < total {
            let chunk = match stream.read_chunk(vol, offset, chunk_size) {
                Ok(c) => c,
                Err(e) => {
                    warn!("could not read MFT chunk at offset {offset:#x}: {e}");
                    break;
                }
            };
            let records_in_chunk = chunk.len() / record_size as usize;

            for slot in 0..records_in_chunk {
                let raw = &chunk[slot * record_size as usize..(slot + 1) * record_size as usize];
                if !MftRecord::has_valid_signature(raw) {
                    continue;
                }
                let mut raw = raw.to_vec();
                let slot_number =
                    u32::from_le_bytes([raw[44], raw[45], raw[46], raw[47]]) as u64;
                let usa_offset = u16::from_le_bytes([raw[4], raw[5]]);
                let usa_count = u16::from_le_bytes([raw[6], raw[7]]);
                if let Err(e) = apply_fixup(&mut raw, usa_offset, usa_count, "FILE record") {
                    warn!("skipping file record {slot_number}: {e}");
                    continue;
                }
                let record = match MftRecord::from_bytes(&raw) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("skipping file record {slot_number}: {e}");
                        continue;
                    }
                };

                if record.header.base_record.key() == (0, 1) {
                    // An extension of $MFT itself: its $DATA runs carry more
                    // of the MFT.
                    if record.header.is_in_use() {
                        extra_streams.extend(self.data_readers(vol, &record));
                    }
                    continue;
                }
                self.absorb(vol, record, default_index_block);
            }
            offset += chunk_size;
        }
        extra_streams
    }

    /// Merge one parsed record into the catalogue.
    fn absorb<T: Read + Seek>(
        &mut self,
        vol: &mut NtfsVolume<T>,
        record: MftRecord,
        default_index_block: u64,
    ) {
        let header = &record.header;
        let record_number = header.record_number as u64;

        let key = if header.is_base_record() {
            if !header.is_directory() && !header.is_in_use() {
                return; // deleted plain file: nothing references it
            }
            (record_number, header.effective_sequence())
        } else {
            // Extension record: everything it carries belongs to its base,
            // whether or not the extension itself is still in use.
            header.base_record.key()
        };

        let index_allocations = self.index_allocation_readers(vol, &record);
        let attribute_list = self.attribute_list_entries(vol, &record);

        let entry = self.records.entry(key).or_default();
        if header.is_base_record() {
            entry.is_allocated = header.is_in_use();
            entry.is_directory = header.is_directory();
            entry.index_block_size = record.index_block_size(default_index_block);
        } else if entry.index_block_size == 0 {
            entry.index_block_size = default_index_block;
        }
        if !header.is_base_record()
            && !entry.attribute_list.is_empty()
            && !entry
                .attribute_list
                .iter()
                .any(|e| e.extension.record == record_number)
        {
            debug!(
                "extension record {record_number} is not named by the $ATTRIBUTE_LIST \
                 of its base record {}",
                key.0
            );
        }
        entry.file_names.extend(record.file_names());
        entry.index_allocations.extend(index_allocations);
        entry.attribute_list.extend(attribute_list);
    }

    /// Parse the `$ATTRIBUTE_LIST` of `record`, reassembling a non-resident
    /// list through its runlist first.
    fn attribute_list_entries<T: Read + Seek>(
        &self,
        vol: &mut NtfsVolume<T>,
        record: &MftRecord,
    ) -> Vec<AttributeListEntry> {
        let mut entries = Vec::new();
        for attr in record.attributes_of(AttributeType::AttributeList) {
            let data = match attr {
                Attribute::Resident { value, .. } => Some(value.clone()),
                Attribute::NonResident {
                    non_resident,
                    run_list,
                    ..
                } => match decode_runlist(run_list) {
                    Ok(runs) if !runs.is_empty() => {
                        let reader = NonResidentReader::new(
                            runs,
                            vol.pbs.cluster_size(),
                            non_resident.allocated_size,
                            non_resident.real_size,
                        );
                        let len = non_resident.real_size.min(reader.run_bytes());
                        match reader.read_chunk(vol, 0, len) {
                            Ok(data) => Some(data),
                            Err(e) => {
                                warn!(
                                    "could not read the $ATTRIBUTE_LIST of file record {}: {e}",
                                    record.header.record_number
                                );
                                None
                            }
                        }
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            "bad $ATTRIBUTE_LIST runlist in file record {}: {e}",
                            record.header.record_number
                        );
                        None
                    }
                },
            };
            if let Some(data) = data {
                entries.extend(parse_attribute_list(&data));
            }
        }
        entries
    }

    /// Readers for every `$I30` `$INDEX_ALLOCATION` of `record`.
    fn index_allocation_readers<T: Read + Seek>(
        &self,
        vol: &mut NtfsVolume<T>,
        record: &MftRecord,
    ) -> Vec<(u64, NonResidentReader)> {
        let mut readers = Vec::new();
        for attr in record.attributes_of(AttributeType::IndexAllocation) {
            if attr.name() != Some("$I30") {
                continue;
            }
            if let Attribute::NonResident {
                non_resident,
                run_list,
                ..
            } = attr
            {
                match decode_runlist(run_list) {
                    Ok(runs) if runs.is_empty() => {
                        debug!(
                            "empty $INDEX_ALLOCATION runlist in file record {}",
                            record.header.record_number
                        );
                    }
                    Ok(runs) => {
                        let reader = NonResidentReader::new(
                            runs,
                            vol.pbs.cluster_size(),
                            non_resident.allocated_size,
                            non_resident.real_size,
                        );
                        if let Err(e) = reader.validate_against(vol.pbs.volume_size()) {
                            warn!(
                                "ignoring $INDEX_ALLOCATION of file record {}: {e}",
                                record.header.record_number
                            );
                            continue;
                        }
                        readers.push((non_resident.lowest_vcn, reader));
                    }
                    Err(e) => {
                        warn!(
                            "ignoring $INDEX_ALLOCATION of file record {}: {e}",
                            record.header.record_number
                        );
                    }
                }
            }
        }
        readers
    }

    /// Readers for the unnamed non-resident `$DATA` attributes of `record`.
    fn data_readers<T: Read + Seek>(
        &self,
        vol: &mut NtfsVolume<T>,
        record: &MftRecord,
    ) -> Vec<NonResidentReader> {
        let mut readers = Vec::new();
        for attr in record.attributes_of(AttributeType::Data) {
            if attr.name().is_some() {
                continue;
            }
            if let Attribute::NonResident {
                non_resident,
                run_list,
                ..
            } = attr
            {
                match decode_runlist(run_list) {
                    Ok(runs) if !runs.is_empty() => {
                        let reader = NonResidentReader::new(
                            runs,
                            vol.pbs.cluster_size(),
                            non_resident.allocated_size,
                            non_resident.real_size,
                        );
                        match reader.validate_against(vol.pbs.volume_size()) {
                            Ok(()) => readers.push(reader),
                            Err(e) => warn!(
                                "ignoring $DATA of file record {}: {e}",
                                record.header.record_number
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        "ignoring $DATA of file record {}: {e}",
                        record.header.record_number
                    ),
                }
            }
        }
        readers
    }
}

/// Read record 0 straight off the volume and return a reader over the MFT's
/// own `$DATA`. Any failure here is fatal: without it there is no MFT.
fn first_mft_data_reader<T: Read + Seek>(vol: &mut NtfsVolume<T>) -> Result<NonResidentReader> {
    let record_size = vol.pbs.file_record_size();
    let mft_offset = vol.mft_offset();
    let mut raw = vol.read_vec(mft_offset, record_size as usize)?;

    if !MftRecord::has_valid_signature(&raw) {
        return Err(ExhumeIndxError::BadAttribute {
            record: 0,
            reason: "invalid 'FILE' signature in the first file record".to_string(),
        });
    }
    let usa_offset = u16::from_le_bytes([raw[4], raw[5]]);
    let usa_count = u16::from_le_bytes([raw[6], raw[7]]);
    apply_fixup(&mut raw, usa_offset, usa_count, "FILE record")?;
    let record = MftRecord::from_bytes(&raw)?;

    for attr in record.attributes_of(AttributeType::Data) {
        if attr.name().is_some() {
            continue;
        }
        if let Attribute::NonResident {
            non_resident,
            run_list,
            ..
        } = attr
        {
            let runs = decode_runlist(run_list)?;
            if runs.is_empty() {
                continue;
            }
            let reader = NonResidentReader::new(
                runs,
                vol.pbs.cluster_size(),
                non_resident.allocated_size,
                non_resident.real_size,
            );
            reader.validate_against(vol.pbs.volume_size())?;
            return Ok(reader);
        }
    }
    Err(ExhumeIndxError::BadAttribute {
        record: 0,
        reason: "no non-resident $DATA in the first file record".to_string(),
    })
}

/// `$Volume` (record 3) carries `$VOLUME_INFORMATION` with the NTFS version.
/// Anything other than 3.1 is refused; a missing or unreadable `$Volume` is
/// tolerated.
fn read_ntfs_version<T: Read + Seek>(
    vol: &mut NtfsVolume<T>,
    mft_data: &NonResidentReader,
    record_size: u64,
) -> Result<Option<(u8, u8)>> {
    if mft_data.run_bytes() < 4 * record_size {
        return Ok(None);
    }
    let mut raw = match mft_data.read_chunk(vol, 3 * record_size, record_size) {
        Ok(r) => r,
        Err(e) => {
            debug!("could not read $Volume: {e}");
            return Ok(None);
        }
    };
    if !MftRecord::has_valid_signature(&raw) {
        return Ok(None);
    }
    let usa_offset = u16::from_le_bytes([raw[4], raw[5]]);
    let usa_count = u16::from_le_bytes([raw[6], raw[7]]);
    if apply_fixup(&mut raw, usa_offset, usa_count, "FILE record").is_err() {
        return Ok(None);
    }
    let record = match MftRecord::from_bytes(&raw) {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };

    for attr in record.attributes_of(AttributeType::VolumeInformation) {
        if let Attribute::Resident { value, .. } = attr {
            if value.len() >= 10 {
                let (major, minor) = (value[8], value[9]);
                if (major, minor) != (3, 1) {
                    return Err(ExhumeIndxError::UnsupportedNtfsVersion { major, minor });
                }
                return Ok(Some((major, minor)));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mft::FilenameNamespace;
    use crate::testkit;
    use std::io::Cursor;

    fn dir_record(number: u32, seq: u16, name: &str, in_use: bool) -> Vec<u8> {
        let fname = testkit::filename_value(
            FileReference {
                record: 5,
                sequence: 5,
            },
            name,
            FilenameNamespace::Win32,
            testkit::FILETIME_2023,
            0,
        );
        testkit::record_builder(number, seq)
            .in_use(in_use)
            .directory(true)
            .resident_attr(AttributeType::FileName, &fname)
            .resident_attr(AttributeType::IndexRoot, &testkit::index_root_value(4096))
            .non_resident_attr(
                AttributeType::IndexAllocation,
                Some("$I30"),
                &[0x11, 0x01, 0x10, 0x00], // one cluster at LCN 16
                4096,
                4096,
            )
            .build()
    }

    fn file_record(number: u32, seq: u16, name: &str, in_use: bool) -> Vec<u8> {
        let fname = testkit::filename_value(
            FileReference {
                record: 8,
                sequence: 2,
            },
            name,
            FilenameNamespace::Win32,
            testkit::FILETIME_2023,
            4096,
        );
        testkit::record_builder(number, seq)
            .in_use(in_use)
            .resident_attr(AttributeType::FileName, &fname)
            .build()
    }

    fn base_records() -> Vec<(usize, Vec<u8>)> {
        vec![
            (0, testkit::mft_record_zero()),
            (3, testkit::volume_record(3, 1)),
            (5, testkit::root_record()),
            (8, dir_record(8, 2, "Documents", true)),
            (9, file_record(9, 1, "a.txt", true)),
            (10, file_record(10, 4, "b.txt", false)),
        ]
    }

    fn build_catalog(records: Vec<(usize, Vec<u8>)>) -> Result<MftCatalog> {
        let img = testkit::volume_image(&records, &[]);
        let mut vol = NtfsVolume::new(Cursor::new(img), 0, 512).unwrap();
        MftCatalog::build(&mut vol)
    }

    #[test]
    fn catalogues_directories_and_live_files() {
        let catalog = build_catalog(base_records()).unwrap();
        assert_eq!(catalog.mft_record_count, 16);
        assert_eq!(catalog.ntfs_version, Some((3, 1)));

        let dir = &catalog.records[&(8, 2)];
        assert!(dir.is_directory && dir.is_allocated);
        assert_eq!(dir.best_name().unwrap().name, "Documents");
        assert_eq!(dir.index_allocations.len(), 1);
        assert_eq!(dir.index_block_size, 4096);

        assert!(catalog.is_live(FileReference {
            record: 9,
            sequence: 1
        }));
        // deleted plain file is not kept at all
        assert!(!catalog.records.contains_key(&(10, 3)));
        assert_eq!(catalog.directory_keys(), vec![(8, 2)]);
    }

    #[test]
    fn deleted_directory_is_kept_under_decremented_sequence() {
        let mut records = base_records();
        records.push((11, dir_record(11, 7, "Gone", false)));
        let catalog = build_catalog(records).unwrap();
        let dir = &catalog.records[&(11, 6)];
        assert!(dir.is_directory && !dir.is_allocated);
    }

    #[test]
    fn extension_record_merges_into_base() {
        let mut records = base_records();
        // record 12 extends directory 8 with a second $I30 extent at VCN 1
        let ext = testkit::record_builder(12, 1)
            .base_record(FileReference {
                record: 8,
                sequence: 2,
            })
            .non_resident_attr_at_vcn(
                AttributeType::IndexAllocation,
                Some("$I30"),
                &[0x11, 0x01, 0x11, 0x00],
                1,
                4096,
                4096,
            )
            .build();
        records.push((12, ext));
        let catalog = build_catalog(records).unwrap();
        let dir = &catalog.records[&(8, 2)];
        assert_eq!(dir.index_allocations.len(), 2);
        // sorted by starting VCN
        assert_eq!(dir.index_allocations[0].0, 0);
        assert_eq!(dir.index_allocations[1].0, 1);
    }

    #[test]
    fn attribute_list_names_extension_extents() {
        let mut records = base_records();
        // base directory 8 gains a resident $ATTRIBUTE_LIST describing its
        // $I30 split across itself and record 12
        let mut list = Vec::new();
        list.extend_from_slice(&testkit::attribute_list_entry(
            0xA0,
            0,
            FileReference {
                record: 8,
                sequence: 2,
            },
            Some("$I30"),
        ));
        list.extend_from_slice(&testkit::attribute_list_entry(
            0xA0,
            1,
            FileReference {
                record: 12,
                sequence: 1,
            },
            Some("$I30"),
        ));
        let fname = testkit::filename_value(
            FileReference {
                record: 5,
                sequence: 5,
            },
            "Documents",
            FilenameNamespace::Win32,
            testkit::FILETIME_2023,
            0,
        );
        let base = testkit::record_builder(8, 2)
            .directory(true)
            .resident_attr(AttributeType::FileName, &fname)
            .resident_attr(AttributeType::AttributeList, &list)
            .resident_attr(AttributeType::IndexRoot, &testkit::index_root_value(4096))
            .non_resident_attr(
                AttributeType::IndexAllocation,
                Some("$I30"),
                &[0x11, 0x01, 0x10, 0x00],
                4096,
                4096,
            )
            .build();
        records[3] = (8, base);
        let ext = testkit::record_builder(12, 1)
            .base_record(FileReference {
                record: 8,
                sequence: 2,
            })
            .non_resident_attr_at_vcn(
                AttributeType::IndexAllocation,
                Some("$I30"),
                &[0x11, 0x01, 0x11, 0x00],
                1,
                4096,
                4096,
            )
            .build();
        records.push((12, ext));

        let catalog = build_catalog(records).unwrap();
        let dir = &catalog.records[&(8, 2)];
        assert_eq!(dir.attribute_list.len(), 2);
        assert_eq!(dir.attribute_list[1].extension.record, 12);
        assert_eq!(dir.attribute_list[1].starting_vcn, 1);
        assert_eq!(dir.index_allocations.len(), 2);
    }

    #[test]
    fn fixup_corrupt_record_is_skipped() {
        let mut records = base_records();
        let mut broken = dir_record(11, 2, "Broken", true);
        broken[510] ^= 0x5A; // tear the first stride stamp
        records.push((11, broken));
        let catalog = build_catalog(records).unwrap();
        assert!(!catalog.records.keys().any(|&(n, _)| n == 11));
        // the rest of the MFT still got catalogued
        assert!(catalog.records.contains_key(&(8, 2)));
    }

    #[test]
    fn refuses_non_31_version() {
        let mut records = base_records();
        records[1] = (3, testkit::volume_record(3, 0));
        assert!(matches!(
            build_catalog(records),
            Err(ExhumeIndxError::UnsupportedNtfsVersion { major: 3, minor: 0 })
        ));
    }

    #[test]
    fn mft_extension_stream_is_followed() {
        let mut records = base_records();
        // record 15 is based on (0, 1) and maps one more MFT cluster at LCN 20
        let ext = testkit::record_builder(15, 1)
            .base_record(FileReference {
                record: 0,
                sequence: 1,
            })
            .non_resident_attr(
                AttributeType::Data,
                None,
                &[0x11, 0x01, 0x14, 0x00],
                4096,
                4096,
            )
            .build();
        records.push((15, ext));
        // cluster 20 carries file record 16
        let mut extra_chunk = vec![0u8; 4096];
        let extra = file_record(16, 1, "ext.txt", true);
        extra_chunk[..1024].copy_from_slice(&extra);
        let img = testkit::volume_image(&records, &[(20, extra_chunk)]);
        let mut vol = NtfsVolume::new(Cursor::new(img), 0, 512).unwrap();
        let catalog = MftCatalog::build(&mut vol).unwrap();
        assert!(catalog.records.contains_key(&(16, 1)));
    }

    #[test]
    fn missing_record_zero_is_fatal() {
        let records = vec![(3, testkit::volume_record(3, 1))];
        assert!(build_catalog(records).is_err());
    }
}
