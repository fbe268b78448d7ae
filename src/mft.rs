// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor, Seek, SeekFrom};

use crate::errors::{ExhumeIndxError, Result};

/// 48-bit MFT record number plus 16-bit sequence number; identifies one
/// incarnation of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct FileReference {
    pub record: u64,
    pub sequence: u16,
}

impl FileReference {
    pub fn from_u64(raw: u64) -> Self {
        FileReference {
            record: raw & 0x0000_FFFF_FFFF_FFFF,
            sequence: (raw >> 48) as u16,
        }
    }

    pub fn is_null(&self) -> bool {
        self.record == 0
    }

    /// A reference is usable if it is non-zero and does not point past the
    /// end of the MFT.
    pub fn is_valid(&self, mft_record_count: u64) -> bool {
        !self.is_null() && self.record <= mft_record_count
    }

    pub fn key(&self) -> (u64, u16) {
        (self.record, self.sequence)
    }
}

impl std::fmt::Display for FileReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.record, self.sequence)
    }
}

pub const FILE_RECORD_MAGIC: &[u8; 4] = b"FILE";

pub const RECORD_FLAG_IN_USE: u16 = 0x0001;
pub const RECORD_FLAG_DIRECTORY: u16 = 0x0002;

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRecordHeader {
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_record: FileReference,
    pub next_attr_id: u16,
    pub record_number: u32,
}

impl FileRecordHeader {
    pub fn is_in_use(&self) -> bool {
        self.flags & RECORD_FLAG_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_FLAG_DIRECTORY != 0
    }

    pub fn is_base_record(&self) -> bool {
        self.base_record.is_null()
    }

    /// The sequence number this record is catalogued under. NTFS increments
    /// the stored sequence when a record is deallocated, so a deleted
    /// record's last live incarnation is `sequence - 1`.
    pub fn effective_sequence(&self) -> u16 {
        if self.is_in_use() {
            self.sequence_number
        } else {
            self.sequence_number.wrapping_sub(1)
        }
    }
}

/// AttributeHeader for resident and non-resident.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeHeaderCommon {
    pub attr_type: AttributeType,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub name: Option<String>,
}

/// Additional 8-byte header present only when the attribute is resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResidentHeader {
    pub value_length: u32,
    pub value_offset: u16,
    pub resident_flags: u8, // 0 = indexed (for $I30), 1 = normal
}

/// Additional 48-byte header present only when the attribute is non-resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NonResidentHeader {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub mapping_pairs_offset: u16,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
}

/// High-level representation of a single attribute (header + raw value bytes).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum Attribute {
    Resident {
        header: AttributeHeaderCommon,
        resident: ResidentHeader,
        value: Vec<u8>,
    },
    NonResident {
        header: AttributeHeaderCommon,
        non_resident: NonResidentHeader,
        run_list: Vec<u8>,
    },
}

impl Attribute {
    pub fn header(&self) -> &AttributeHeaderCommon {
        match self {
            Attribute::Resident { header, .. } => header,
            Attribute::NonResident { header, .. } => header,
        }
    }

    pub fn attr_type(&self) -> AttributeType {
        self.header().attr_type
    }

    pub fn name(&self) -> Option<&str> {
        self.header().name.as_deref()
    }

}

/// A fully parsed MFT record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MftRecord {
    pub header: FileRecordHeader,
    pub attributes: Vec<Attribute>,
}

impl MftRecord {
    /// Whether `buf` starts with the FILE signature. Slots without it are
    /// unused or overwritten and simply skipped by the catalogue walk.
    pub fn has_valid_signature(buf: &[u8]) -> bool {
        buf.len() >= 4 && &buf[..4] == FILE_RECORD_MAGIC
    }

    /// Parse a record buffer. The fixup must already be applied.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if !Self::has_valid_signature(buf) {
            return Err(ExhumeIndxError::BadAttribute {
                record: 0,
                reason: "record signature is not 'FILE'".to_string(),
            });
        }
        let header = parse_header(buf).map_err(|e| ExhumeIndxError::BadAttribute {
            record: 0,
            reason: format!("truncated record header: {e}"),
        })?;
        let record = header.record_number as u64;
        let attributes =
            parse_attributes(buf, header.attrs_offset as usize).map_err(|e| {
                ExhumeIndxError::BadAttribute {
                    record,
                    reason: e.to_string(),
                }
            })?;
        Ok(MftRecord { header, attributes })
    }

    pub fn attributes_of(&self, attr_type: AttributeType) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(move |a| a.attr_type() == attr_type)
    }

    /// Every `$FILE_NAME` carried by this record.
    pub fn file_names(&self) -> Vec<FileNameAttribute> {
        self.attributes_of(AttributeType::FileName)
            .filter_map(|a| {
                if let Attribute::Resident { value, .. } = a {
                    FileNameAttribute::parse(value)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Fetch the size of an index block for this directory, from the
    /// `$INDEX_ROOT` header if one is present and sane.
    pub fn index_block_size(&self, default: u64) -> u64 {
        if let Some(root) = self.attributes_of(AttributeType::IndexRoot).find_map(|a| {
            if let Attribute::Resident { value, .. } = a {
                Some(value)
            } else {
                None
            }
        }) {
            if root.len() >= 0x0C {
                let mut c = Cursor::new(root.as_slice());
                c.set_position(8); // skip attr-type & collation
                if let Ok(sz) = c.read_u32::<LittleEndian>() {
                    let sz = sz as u64;
                    if sz.is_power_of_two() && (512..=65_536).contains(&sz) {
                        return sz;
                    }
                }
            }
        }
        default
    }
}

/// Parse a FILE record header
fn parse_header(buf: &[u8]) -> io::Result<FileRecordHeader> {
    let mut cursor = Cursor::new(buf);
    cursor.seek(SeekFrom::Start(4))?; // past the signature
    let usa_offset = cursor.read_u16::<LittleEndian>()?;
    let usa_count = cursor.read_u16::<LittleEndian>()?;
    let lsn = cursor.read_u64::<LittleEndian>()?;
    let sequence_number = cursor.read_u16::<LittleEndian>()?;
    let hard_link_count = cursor.read_u16::<LittleEndian>()?;
    let attrs_offset = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let bytes_in_use = cursor.read_u32::<LittleEndian>()?;
    let bytes_allocated = cursor.read_u32::<LittleEndian>()?;
    let base_record = FileReference::from_u64(cursor.read_u64::<LittleEndian>()?);
    let next_attr_id = cursor.read_u16::<LittleEndian>()?;
    cursor.seek(SeekFrom::Current(2))?; // alignment
    let record_number = cursor.read_u32::<LittleEndian>()?;

    Ok(FileRecordHeader {
        usa_offset,
        usa_count,
        lsn,
        sequence_number,
        hard_link_count,
        attrs_offset,
        flags,
        bytes_in_use,
        bytes_allocated,
        base_record,
        next_attr_id,
        record_number,
    })
}

/// Collect attributes from `attrs_offset` to the 0xFFFFFFFF terminator or
/// the end of the record. Attributes of types we do not model are skipped.
fn parse_attributes(buf: &[u8], attrs_offset: usize) -> io::Result<Vec<Attribute>> {
    let mut cursor = Cursor::new(buf);
    cursor.seek(SeekFrom::Start(attrs_offset as u64))?;

    let mut attributes = Vec::new();
    loop {
        let start_pos = cursor.stream_position()?;
        if start_pos as usize + 4 > buf.len() {
            break;
        }
        let attr_type_num = cursor.read_u32::<LittleEndian>()?;
        if attr_type_num == 0xFFFF_FFFF {
            break; // End of attribute list
        }
        let length = cursor.read_u32::<LittleEndian>()? as u64;
        if length < 16 || length % 8 != 0 || start_pos + length > buf.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("attribute with implausible length {length}"),
            ));
        }

        match AttributeType::try_from(attr_type_num) {
            Ok(attr_type) => {
                let attr = parse_attribute(&mut cursor, buf, start_pos, attr_type, length as u32)?;
                attributes.push(attr);
            }
            Err(_) => {} // unmodelled attribute type
        }

        // Proceed to the next
        cursor.seek(SeekFrom::Start(start_pos + length))?;
    }
    Ok(attributes)
}

/// Parse one attribute; the cursor sits just past the type and length fields.
fn parse_attribute(
    cursor: &mut Cursor<&[u8]>,
    buf: &[u8],
    start_pos: u64,
    attr_type: AttributeType,
    length: u32,
) -> io::Result<Attribute> {
    let non_resident = cursor.read_u8()? != 0;
    let name_length = cursor.read_u8()?;
    let name_offset = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let id = cursor.read_u16::<LittleEndian>()?;

    let name = if name_length > 0 {
        let name_pos = start_pos as usize + name_offset as usize;
        let name_end = name_pos + name_length as usize * 2;
        if name_end > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "attribute name out of bounds",
            ));
        }
        read_utf16le(&buf[name_pos..name_end])
    } else {
        None
    };

    let common = AttributeHeaderCommon {
        attr_type,
        length,
        non_resident,
        name_length,
        name_offset,
        flags,
        id,
        name,
    };

    if !non_resident {
        // Resident attribute - 8 byte resident header
        let value_length = cursor.read_u32::<LittleEndian>()?;
        let value_offset = cursor.read_u16::<LittleEndian>()?;
        let resident_flags = cursor.read_u8()?;
        cursor.read_u8()?; // padding

        let value_pos = start_pos as usize + value_offset as usize;
        let value_end = value_pos + value_length as usize;
        if value_end > buf.len() || value_end > (start_pos + length as u64) as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "resident value out of bounds",
            ));
        }
        Ok(Attribute::Resident {
            header: common,
            resident: ResidentHeader {
                value_length,
                value_offset,
                resident_flags,
            },
            value: buf[value_pos..value_end].to_vec(),
        })
    } else {
        // Non-resident attribute - 48 byte header plus the runlist bytes
        let lowest_vcn = cursor.read_u64::<LittleEndian>()?;
        let highest_vcn = cursor.read_u64::<LittleEndian>()?;
        let mapping_pairs_offset = cursor.read_u16::<LittleEndian>()?;
        let compression_unit = cursor.read_u16::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(4))?; // reserved
        let allocated_size = cursor.read_u64::<LittleEndian>()?;
        let real_size = cursor.read_u64::<LittleEndian>()?;
        let initialized_size = cursor.read_u64::<LittleEndian>()?;

        let run_list_pos = start_pos as usize + mapping_pairs_offset as usize;
        let run_list_end = (start_pos + length as u64) as usize;
        if run_list_pos > run_list_end || run_list_end > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "runlist out of bounds",
            ));
        }
        Ok(Attribute::NonResident {
            header: common,
            non_resident: NonResidentHeader {
                lowest_vcn,
                highest_vcn,
                mapping_pairs_offset,
                compression_unit,
                allocated_size,
                real_size,
                initialized_size,
            },
            run_list: buf[run_list_pos..run_list_end].to_vec(),
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    PropertySet = 0xF0,
    LoggedUtilityStream = 0x100,
}

impl TryFrom<u32> for AttributeType {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        use AttributeType::*;
        Ok(match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            _ => return Err("unknown attribute type".to_string()),
        })
    }
}

/// Windows FILETIME → chrono, UTC. `None` for values outside chrono's range.
pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    const EPOCH_DELTA_MICROS: i64 = 11_644_473_600_000_000;
    let unix_micros = (ft / 10) as i64 - EPOCH_DELTA_MICROS;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = unix_micros.rem_euclid(1_000_000) * 1_000;
    Utc.timestamp_opt(secs, nanos as u32).single()
}

/// Filename namespaces, in on-disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[repr(u8)]
pub enum FilenameNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32Dos = 3,
}

impl FilenameNamespace {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => FilenameNamespace::Posix,
            1 => FilenameNamespace::Win32,
            2 => FilenameNamespace::Dos,
            3 => FilenameNamespace::Win32Dos,
            _ => return None,
        })
    }

    /// Best-name preference: Win32&DOS > Win32 > POSIX > DOS.
    pub fn priority(&self) -> u8 {
        match self {
            FilenameNamespace::Win32Dos => 3,
            FilenameNamespace::Win32 => 2,
            FilenameNamespace::Posix => 1,
            FilenameNamespace::Dos => 0,
        }
    }
}

/// Parsed `$FILE_NAME` value (the 66-byte fixed part plus the UTF-16LE name).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileNameAttribute {
    pub parent: FileReference,
    pub created: u64,
    pub modified: u64,
    pub mft_changed: u64,
    pub accessed: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub namespace: FilenameNamespace,
    pub name: String,
}

pub const FILENAME_VALUE_HEADER_LEN: usize = 66;

impl FileNameAttribute {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < FILENAME_VALUE_HEADER_LEN {
            return None;
        }
        let mut cur = Cursor::new(raw);

        let parent = FileReference::from_u64(cur.read_u64::<LittleEndian>().ok()?);
        let created = cur.read_u64::<LittleEndian>().ok()?;
        let modified = cur.read_u64::<LittleEndian>().ok()?;
        let mft_changed = cur.read_u64::<LittleEndian>().ok()?;
        let accessed = cur.read_u64::<LittleEndian>().ok()?;
        let allocated_size = cur.read_u64::<LittleEndian>().ok()?;
        let real_size = cur.read_u64::<LittleEndian>().ok()?;
        let flags = cur.read_u32::<LittleEndian>().ok()?;
        let _reparse = cur.read_u32::<LittleEndian>().ok()?;
        let name_len = cur.read_u8().ok()? as usize; // characters
        let namespace = FilenameNamespace::from_u8(cur.read_u8().ok()?)?;

        if name_len == 0 || raw.len() < FILENAME_VALUE_HEADER_LEN + name_len * 2 {
            return None;
        }
        let name = read_utf16le(
            &raw[FILENAME_VALUE_HEADER_LEN..FILENAME_VALUE_HEADER_LEN + name_len * 2],
        )?;

        Some(Self {
            parent,
            created,
            modified,
            mft_changed,
            accessed,
            allocated_size,
            real_size,
            flags,
            namespace,
            name,
        })
    }
}

/// One entry of an `$ATTRIBUTE_LIST` value: which record carries which slice
/// of which attribute.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeListEntry {
    pub attr_type: u32,
    pub starting_vcn: u64,
    pub extension: FileReference,
    pub name: Option<String>,
}

/// Parse a resident (or reassembled) `$ATTRIBUTE_LIST` value.
pub fn parse_attribute_list(raw: &[u8]) -> Vec<AttributeListEntry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + 26 <= raw.len() {
        let mut cur = Cursor::new(&raw[pos..]);
        let attr_type = match cur.read_u32::<LittleEndian>() {
            Ok(t) if t != 0 => t,
            _ => break,
        };
        let record_length = match cur.read_u16::<LittleEndian>() {
            Ok(l) if l >= 26 => l as usize,
            _ => break,
        };
        let name_length = match cur.read_u8() {
            Ok(l) => l as usize,
            Err(_) => break,
        };
        let name_offset = match cur.read_u8() {
            Ok(o) => o as usize,
            Err(_) => break,
        };
        let starting_vcn = match cur.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => break,
        };
        let extension = match cur.read_u64::<LittleEndian>() {
            Ok(r) => FileReference::from_u64(r),
            Err(_) => break,
        };

        let name = if name_length > 0 && pos + name_offset + name_length * 2 <= raw.len() {
            read_utf16le(&raw[pos + name_offset..pos + name_offset + name_length * 2])
        } else {
            None
        };

        entries.push(AttributeListEntry {
            attr_type,
            starting_vcn,
            extension,
            name,
        });

        if pos + record_length > raw.len() {
            break;
        }
        pos += record_length;
    }
    entries
}

fn read_utf16le(raw: &[u8]) -> Option<String> {
    String::from_utf16(
        &raw.chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect::<Vec<_>>(),
    )
    .ok()
}
