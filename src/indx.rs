// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/index_record.html

//! `$INDEX_ALLOCATION` block parsing: the allocated entry walk, and the
//! opportunistic scanner that carves stale entries out of the slack region
//! behind the last valid entry.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::Datelike;
use log::warn;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::errors::{ExhumeIndxError, Result};
use crate::mft::{FILENAME_VALUE_HEADER_LEN, FileNameAttribute, FileReference, filetime_to_datetime};

pub const INDX_MAGIC: &[u8; 4] = b"INDX";
pub const NODE_HEADER_OFFSET: usize = 24;

/// Size of a bare index-entry header.
pub const MIN_ENTRY_SIZE: usize = 16;
/// The embedded `$FILE_NAME` starts right after the entry header.
pub const FILENAME_OFFSET_IN_ENTRY: usize = 16;
/// Smallest byte count a carvable entry can occupy: header plus the fixed
/// part of `$FILE_NAME`.
pub const MIN_CARVABLE_ENTRY: usize = FILENAME_OFFSET_IN_ENTRY + FILENAME_VALUE_HEADER_LEN;

/// Timestamp window for slack acceptance. An entry whose four timestamps do
/// not all fall inside it is treated as noise.
pub const MIN_PLAUSIBLE_YEAR: i32 = 1980;
pub const MAX_PLAUSIBLE_YEAR: i32 = 2200;

pub const ENTRY_FLAG_HAS_CHILD: u16 = 0x01;
pub const ENTRY_FLAG_LAST: u16 = 0x02;

/// Where an entry was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum EntrySource {
    Allocated,
    Slack,
}

impl std::fmt::Display for EntrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntrySource::Allocated => write!(f, "ALLOCATED"),
            EntrySource::Slack => write!(f, "SLACK"),
        }
    }
}

/// INDX record header plus the node header, with offsets made absolute.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexRecordHeader {
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub vcn: u64,
    pub entries_offset: usize,
    pub entries_end: usize,
    pub allocated_end: usize,
}

pub fn has_indx_magic(block: &[u8]) -> bool {
    block.len() >= 4 && &block[..4] == INDX_MAGIC
}

impl IndexRecordHeader {
    pub fn parse(block: &[u8]) -> Result<Self> {
        if !has_indx_magic(block) {
            return Err(ExhumeIndxError::BadIndexBlock(
                "no INDX signature".to_string(),
            ));
        }
        if block.len() < NODE_HEADER_OFFSET + 16 {
            return Err(ExhumeIndxError::BadIndexBlock(
                "block too small for a node header".to_string(),
            ));
        }
        let mut c = Cursor::new(block);
        c.set_position(4);
        let usa_offset = c.read_u16::<LittleEndian>()?;
        let usa_count = c.read_u16::<LittleEndian>()?;
        let lsn = c.read_u64::<LittleEndian>()?;
        let vcn = c.read_u64::<LittleEndian>()?;
        let entries_offset = c.read_u32::<LittleEndian>()? as usize + NODE_HEADER_OFFSET;
        let entries_end = c.read_u32::<LittleEndian>()? as usize + NODE_HEADER_OFFSET;
        let allocated_end = c.read_u32::<LittleEndian>()? as usize + NODE_HEADER_OFFSET;

        if entries_offset < NODE_HEADER_OFFSET + 16
            || entries_offset > entries_end
            || entries_end > allocated_end
            || allocated_end > block.len()
        {
            return Err(ExhumeIndxError::BadIndexBlock(format!(
                "inconsistent node header: entries [{entries_offset}, {entries_end}), \
                 allocated end {allocated_end}, block {}",
                block.len()
            )));
        }
        Ok(IndexRecordHeader {
            usa_offset,
            usa_count,
            lsn,
            vcn,
            entries_offset,
            entries_end,
            allocated_end,
        })
    }
}

/// One recovered index entry. `filename` carries the child's name, parent
/// reference and MACB timestamps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexEntry {
    pub file_reference: FileReference,
    pub entry_size: u16,
    pub flags: u16,
    pub child_vcn: Option<u64>,
    pub filename: FileNameAttribute,
    pub source: EntrySource,
}

/// Everything recovered from one INDX block.
#[derive(Debug, Clone, Default)]
pub struct ParsedBlock {
    /// Parent reference of the first allocated entry; the path anchor for
    /// chunks of deleted directories.
    pub parent_hint: Option<FileReference>,
    pub entries: Vec<IndexEntry>,
}

/// Walk the allocated entries and scan the slack of one block. The fixup
/// must already be applied. An entry that cannot be parsed mid-walk demotes
/// the rest of the allocated region to slack; slack rejections are silent by
/// design.
pub fn parse_entries(
    block: &[u8],
    header: &IndexRecordHeader,
    mft_record_count: u64,
) -> ParsedBlock {
    let mut parsed = ParsedBlock::default();
    let mut off = header.entries_offset;
    let mut aborted = false;

    // Allocated region: [entries_offset, entries_end)
    while off + MIN_ENTRY_SIZE <= header.entries_end {
        let mut c = Cursor::new(&block[off..]);
        let file_reference = FileReference::from_u64(c.read_u64::<LittleEndian>().unwrap_or(0));
        let entry_size = c.read_u16::<LittleEndian>().unwrap_or(0) as usize;
        let _key_length = c.read_u16::<LittleEndian>().unwrap_or(0);
        let flags = c.read_u16::<LittleEndian>().unwrap_or(0);

        if flags & ENTRY_FLAG_LAST != 0 {
            break;
        }
        if entry_size < MIN_CARVABLE_ENTRY || off + entry_size > header.entries_end {
            warn!(
                "malformed index entry at offset {off} of INDX block vcn {}; \
                 treating the rest of the entry region as slack",
                header.vcn
            );
            aborted = true;
            break;
        }
        let filename = match FileNameAttribute::parse(
            &block[off + FILENAME_OFFSET_IN_ENTRY..off + entry_size],
        ) {
            Some(f) => f,
            None => {
                warn!(
                    "index entry with malformed $FILE_NAME at offset {off} of INDX block \
                     vcn {}; treating the rest of the entry region as slack",
                    header.vcn
                );
                aborted = true;
                break;
            }
        };

        if parsed.parent_hint.is_none() {
            parsed.parent_hint = Some(filename.parent);
        }

        let child_vcn = if flags & ENTRY_FLAG_HAS_CHILD != 0 && entry_size >= 8 {
            let mut v = Cursor::new(&block[off + entry_size - 8..off + entry_size]);
            v.read_u64::<LittleEndian>().ok()
        } else {
            None
        };

        if !file_reference.is_null() {
            parsed.entries.push(IndexEntry {
                file_reference,
                entry_size: entry_size as u16,
                flags,
                child_vcn,
                filename,
                source: EntrySource::Allocated,
            });
        }
        off += entry_size;
    }

    // Slack region: [entries_end, allocated_end), or from the abort point if
    // the allocated walk broke early.
    let mut off = if aborted { off } else { header.entries_end };
    while off + MIN_CARVABLE_ENTRY <= header.allocated_end {
        match carve_entry(&block[off..header.allocated_end], mft_record_count) {
            Some(entry) => {
                let advance = entry.entry_size as usize;
                parsed.entries.push(entry);
                off += advance;
            }
            None => off += 8,
        }
    }

    parsed
}

/// Try to read one index entry at the start of `slice`. The acceptance rule
/// makes the scanner usable on arbitrary bytes: a declared size of at least
/// one header, the embedded `$FILE_NAME` fully in bounds with a non-empty
/// name and a known namespace, all four timestamps inside the plausible-year
/// window, and a child reference within the MFT.
fn carve_entry(slice: &[u8], mft_record_count: u64) -> Option<IndexEntry> {
    let mut c = Cursor::new(slice);
    let file_reference = FileReference::from_u64(c.read_u64::<LittleEndian>().ok()?);
    let entry_size = c.read_u16::<LittleEndian>().ok()? as usize;

    if entry_size < MIN_ENTRY_SIZE {
        return None;
    }
    let filename = FileNameAttribute::parse(&slice[FILENAME_OFFSET_IN_ENTRY..])?;
    if !plausible_filetime(filename.created)
        || !plausible_filetime(filename.modified)
        || !plausible_filetime(filename.mft_changed)
        || !plausible_filetime(filename.accessed)
    {
        return None;
    }
    if !file_reference.is_valid(mft_record_count) {
        return None;
    }

    Some(IndexEntry {
        file_reference,
        entry_size: entry_size as u16,
        flags: 0,
        child_vcn: None,
        filename,
        source: EntrySource::Slack,
    })
}

fn plausible_filetime(ft: u64) -> bool {
    match filetime_to_datetime(ft) {
        Some(dt) => (MIN_PLAUSIBLE_YEAR..=MAX_PLAUSIBLE_YEAR).contains(&dt.year()),
        None => false,
    }
}
