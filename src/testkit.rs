//! Fixture builders shared by the unit tests: synthetic FILE records, INDX
//! blocks and whole miniature volumes, assembled byte by byte.

use crate::fixup::FIXUP_STRIDE;
use crate::mft::{AttributeType, FileReference, FilenameNamespace};

/// FILETIME for 2023-01-02T03:04:05Z.
pub(crate) const FILETIME_2023: u64 = 133_171_022_450_000_000;

pub(crate) fn align8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// Stamp the update-sequence protection onto `buf`: the current stride
/// trailers are saved into the array at `usa_offset` and replaced by `usn`.
pub(crate) fn protect(buf: &mut [u8], usa_offset: usize, usn: u16) {
    let strides = buf.len() / FIXUP_STRIDE;
    buf[usa_offset..usa_offset + 2].copy_from_slice(&usn.to_le_bytes());
    for i in 0..strides {
        let tail = (i + 1) * FIXUP_STRIDE - 2;
        let saved = usa_offset + 2 * (i + 1);
        let original = [buf[tail], buf[tail + 1]];
        buf[saved..saved + 2].copy_from_slice(&original);
        buf[tail..tail + 2].copy_from_slice(&usn.to_le_bytes());
    }
}

/// Encode a `$FILE_NAME` value: 66-byte fixed part plus UTF-16LE name. All
/// four timestamps get `filetime`; the allocated size is the real size
/// rounded up to 4 KiB.
pub(crate) fn filename_value(
    parent: FileReference,
    name: &str,
    namespace: FilenameNamespace,
    filetime: u64,
    real_size: u64,
) -> Vec<u8> {
    let utf16: Vec<u16> = name.encode_utf16().collect();
    let mut buf = Vec::with_capacity(66 + utf16.len() * 2);
    let parent_raw = parent.record | (parent.sequence as u64) << 48;
    buf.extend_from_slice(&parent_raw.to_le_bytes());
    for _ in 0..4 {
        buf.extend_from_slice(&filetime.to_le_bytes());
    }
    let allocated = real_size.div_ceil(4096) * 4096;
    buf.extend_from_slice(&allocated.to_le_bytes());
    buf.extend_from_slice(&real_size.to_le_bytes());
    buf.extend_from_slice(&0x20u32.to_le_bytes()); // ARCHIVE
    buf.extend_from_slice(&0u32.to_le_bytes()); // reparse
    buf.push(utf16.len() as u8);
    buf.push(namespace as u8);
    for unit in utf16 {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

/// Encode one `$ATTRIBUTE_LIST` entry.
pub(crate) fn attribute_list_entry(
    attr_type: u32,
    starting_vcn: u64,
    extension: FileReference,
    name: Option<&str>,
) -> Vec<u8> {
    let utf16: Vec<u16> = name.unwrap_or("").encode_utf16().collect();
    let record_length = align8(26 + utf16.len() * 2);
    let mut buf = vec![0u8; record_length];
    buf[0..4].copy_from_slice(&attr_type.to_le_bytes());
    buf[4..6].copy_from_slice(&(record_length as u16).to_le_bytes());
    buf[6] = utf16.len() as u8;
    buf[7] = 26;
    buf[8..16].copy_from_slice(&starting_vcn.to_le_bytes());
    let raw_ref = extension.record | (extension.sequence as u64) << 48;
    buf[16..24].copy_from_slice(&raw_ref.to_le_bytes());
    for (i, unit) in utf16.iter().enumerate() {
        buf[26 + 2 * i..28 + 2 * i].copy_from_slice(&unit.to_le_bytes());
    }
    buf
}

pub(crate) struct RecordBuilder {
    record_number: u32,
    sequence: u16,
    in_use: bool,
    directory: bool,
    base: FileReference,
    attrs: Vec<Vec<u8>>,
}

pub(crate) fn record_builder(record_number: u32, sequence: u16) -> RecordBuilder {
    RecordBuilder {
        record_number,
        sequence,
        in_use: true,
        directory: false,
        base: FileReference {
            record: 0,
            sequence: 0,
        },
        attrs: Vec::new(),
    }
}

impl RecordBuilder {
    pub(crate) fn in_use(mut self, in_use: bool) -> Self {
        self.in_use = in_use;
        self
    }

    pub(crate) fn directory(mut self, directory: bool) -> Self {
        self.directory = directory;
        self
    }

    pub(crate) fn base_record(mut self, base: FileReference) -> Self {
        self.base = base;
        self
    }

    pub(crate) fn resident_attr(self, attr_type: AttributeType, value: &[u8]) -> Self {
        self.resident_named_attr(attr_type, None, value)
    }

    pub(crate) fn resident_named_attr(
        mut self,
        attr_type: AttributeType,
        name: Option<&str>,
        value: &[u8],
    ) -> Self {
        let utf16: Vec<u16> = name.unwrap_or("").encode_utf16().collect();
        let name_bytes = utf16.len() * 2;
        let value_offset = align8(24 + name_bytes);
        let length = align8(value_offset + value.len());

        let mut buf = vec![0u8; length];
        buf[0..4].copy_from_slice(&(attr_type as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        buf[8] = 0; // resident
        buf[9] = utf16.len() as u8;
        buf[10..12].copy_from_slice(&24u16.to_le_bytes()); // name offset
        buf[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
        buf[20..22].copy_from_slice(&(value_offset as u16).to_le_bytes());
        for (i, unit) in utf16.iter().enumerate() {
            buf[24 + 2 * i..26 + 2 * i].copy_from_slice(&unit.to_le_bytes());
        }
        buf[value_offset..value_offset + value.len()].copy_from_slice(value);
        self.attrs.push(buf);
        self
    }

    pub(crate) fn non_resident_attr(
        mut self,
        attr_type: AttributeType,
        name: Option<&str>,
        run_list: &[u8],
        allocated_size: u64,
        real_size: u64,
    ) -> Self {
        self.attrs.push(non_resident_attr_bytes(
            attr_type,
            name,
            run_list,
            0,
            allocated_size,
            real_size,
        ));
        self
    }

    pub(crate) fn non_resident_attr_at_vcn(
        mut self,
        attr_type: AttributeType,
        name: Option<&str>,
        run_list: &[u8],
        lowest_vcn: u64,
        allocated_size: u64,
        real_size: u64,
    ) -> Self {
        self.attrs.push(non_resident_attr_bytes(
            attr_type,
            name,
            run_list,
            lowest_vcn,
            allocated_size,
            real_size,
        ));
        self
    }

    /// Serialize to a 1024-byte record with live trailer bytes (no fixup
    /// stamps). `MftRecord::from_bytes` can consume this directly.
    pub(crate) fn build_unprotected(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[0..4].copy_from_slice(b"FILE");
        buf[4..6].copy_from_slice(&48u16.to_le_bytes()); // usa offset
        buf[6..8].copy_from_slice(&3u16.to_le_bytes()); // usa count
        buf[16..18].copy_from_slice(&self.sequence.to_le_bytes());
        buf[18..20].copy_from_slice(&1u16.to_le_bytes()); // hard links
        buf[20..22].copy_from_slice(&56u16.to_le_bytes()); // attrs offset
        let mut flags = 0u16;
        if self.in_use {
            flags |= 0x0001;
        }
        if self.directory {
            flags |= 0x0002;
        }
        buf[22..24].copy_from_slice(&flags.to_le_bytes());
        buf[28..32].copy_from_slice(&1024u32.to_le_bytes());
        let base_raw = self.base.record | (self.base.sequence as u64) << 48;
        buf[32..40].copy_from_slice(&base_raw.to_le_bytes());
        buf[44..48].copy_from_slice(&self.record_number.to_le_bytes());

        let mut pos = 56usize;
        for attr in &self.attrs {
            buf[pos..pos + attr.len()].copy_from_slice(attr);
            pos += attr.len();
        }
        buf[pos..pos + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf[24..28].copy_from_slice(&((pos + 4) as u32).to_le_bytes()); // bytes in use
        buf
    }

    /// Serialize with the update-sequence protection applied, as the record
    /// would sit on disk.
    pub(crate) fn build(&self) -> Vec<u8> {
        let mut buf = self.build_unprotected();
        protect(&mut buf, 48, 0x0100 + self.sequence);
        buf
    }
}

fn non_resident_attr_bytes(
    attr_type: AttributeType,
    name: Option<&str>,
    run_list: &[u8],
    lowest_vcn: u64,
    allocated_size: u64,
    real_size: u64,
) -> Vec<u8> {
    let utf16: Vec<u16> = name.unwrap_or("").encode_utf16().collect();
    let runs_offset = align8(64 + utf16.len() * 2);
    let length = align8(runs_offset + run_list.len());

    let mut buf = vec![0u8; length];
    buf[0..4].copy_from_slice(&(attr_type as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    buf[8] = 1; // non-resident
    buf[9] = utf16.len() as u8;
    buf[10..12].copy_from_slice(&64u16.to_le_bytes()); // name offset
    buf[16..24].copy_from_slice(&lowest_vcn.to_le_bytes());
    buf[32..34].copy_from_slice(&(runs_offset as u16).to_le_bytes());
    buf[40..48].copy_from_slice(&allocated_size.to_le_bytes());
    buf[48..56].copy_from_slice(&real_size.to_le_bytes());
    buf[56..64].copy_from_slice(&real_size.to_le_bytes()); // initialized
    for (i, unit) in utf16.iter().enumerate() {
        buf[64 + 2 * i..66 + 2 * i].copy_from_slice(&unit.to_le_bytes());
    }
    buf[runs_offset..runs_offset + run_list.len()].copy_from_slice(run_list);
    buf
}

/// Encode one index entry: 16-byte header plus an embedded `$FILE_NAME`.
pub(crate) fn index_entry_bytes(file_ref: FileReference, filename: &[u8]) -> Vec<u8> {
    let entry_size = align8(16 + filename.len());
    let mut buf = vec![0u8; entry_size];
    let raw_ref = file_ref.record | (file_ref.sequence as u64) << 48;
    buf[0..8].copy_from_slice(&raw_ref.to_le_bytes());
    buf[8..10].copy_from_slice(&(entry_size as u16).to_le_bytes());
    buf[10..12].copy_from_slice(&(filename.len() as u16).to_le_bytes());
    buf[16..16 + filename.len()].copy_from_slice(filename);
    buf
}

/// The terminal entry closing every allocated entry list.
pub(crate) fn terminal_entry() -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    buf[8..10].copy_from_slice(&16u16.to_le_bytes());
    buf[12..14].copy_from_slice(&2u16.to_le_bytes()); // LAST_ENTRY
    buf
}

/// Assemble a protected INDX block: header, allocated entries, slack bytes
/// right behind them.
pub(crate) fn indx_block(
    block_size: usize,
    entries: &[Vec<u8>],
    slack: &[u8],
    usn: u16,
) -> Vec<u8> {
    let mut buf = vec![0u8; block_size];
    buf[0..4].copy_from_slice(b"INDX");
    buf[4..6].copy_from_slice(&40u16.to_le_bytes()); // usa offset
    let usa_count = (block_size / FIXUP_STRIDE + 1) as u16;
    buf[6..8].copy_from_slice(&usa_count.to_le_bytes());

    let entries_abs = 64usize;
    let mut pos = entries_abs;
    for entry in entries {
        buf[pos..pos + entry.len()].copy_from_slice(entry);
        pos += entry.len();
    }
    // node header, offsets relative to byte 24
    buf[24..28].copy_from_slice(&((entries_abs - 24) as u32).to_le_bytes());
    buf[28..32].copy_from_slice(&((pos - 24) as u32).to_le_bytes());
    buf[32..36].copy_from_slice(&((block_size - 24) as u32).to_le_bytes());

    buf[pos..pos + slack.len()].copy_from_slice(slack);

    protect(&mut buf, 40, usn);
    buf
}

/// Geometry shared by the miniature volumes: 512-byte sectors, 4 KiB
/// clusters, 1 KiB records, MFT at cluster 4, 1024 sectors in total.
pub(crate) fn small_boot_sector() -> Vec<u8> {
    let mut vbr = crate::pbs::sample_boot_sector();
    vbr[40..48].copy_from_slice(&1024u64.to_le_bytes());
    vbr
}

/// Lay out a 512 KiB volume image: boot sector, MFT record slots at cluster
/// 4, arbitrary cluster payloads (INDX blocks) elsewhere.
pub(crate) fn volume_image(records: &[(usize, Vec<u8>)], clusters: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut img = vec![0u8; 512 * 1024];
    let vbr = small_boot_sector();
    img[..512].copy_from_slice(&vbr);
    for (slot, record) in records {
        let offset = 4 * 4096 + slot * 1024;
        img[offset..offset + record.len()].copy_from_slice(record);
    }
    for (lcn, payload) in clusters {
        let offset = (*lcn as usize) * 4096;
        img[offset..offset + payload.len()].copy_from_slice(payload);
    }
    img
}

/// `$MFT` record 0 for the miniature volumes: 4 clusters of MFT at LCN 4
/// (16 records).
pub(crate) fn mft_record_zero() -> Vec<u8> {
    let fname = filename_value(
        FileReference {
            record: 5,
            sequence: 5,
        },
        "$MFT",
        FilenameNamespace::Win32Dos,
        FILETIME_2023,
        16384,
    );
    record_builder(0, 1)
        .resident_attr(AttributeType::FileName, &fname)
        .non_resident_attr(
            AttributeType::Data,
            None,
            &[0x11, 0x04, 0x04, 0x00],
            16384,
            16384,
        )
        .build()
}

/// `$Volume` record 3 claiming NTFS `major.minor`.
pub(crate) fn volume_record(major: u8, minor: u8) -> Vec<u8> {
    let mut info = vec![0u8; 12];
    info[8] = major;
    info[9] = minor;
    record_builder(3, 3)
        .resident_attr(AttributeType::VolumeInformation, &info)
        .build()
}

/// Root directory record 5 (`.`), no index allocation.
pub(crate) fn root_record() -> Vec<u8> {
    let fname = filename_value(
        FileReference {
            record: 5,
            sequence: 5,
        },
        ".",
        FilenameNamespace::Win32Dos,
        FILETIME_2023,
        0,
    );
    record_builder(5, 5)
        .directory(true)
        .resident_attr(AttributeType::FileName, &fname)
        .build()
}

/// `$INDEX_ROOT` value advertising 4 KiB index blocks.
pub(crate) fn index_root_value(block_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    buf[0..4].copy_from_slice(&0x30u32.to_le_bytes()); // indexed attribute: $FILE_NAME
    buf[4..8].copy_from_slice(&1u32.to_le_bytes()); // collation: filename
    buf[8..12].copy_from_slice(&block_size.to_le_bytes());
    buf[12] = 1;
    buf
}
