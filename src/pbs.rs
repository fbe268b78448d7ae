// Sources:
// - https://en.wikipedia.org/wiki/NTFS
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf

//! Parse an NTFS Partition-Boot-Sector with std::io::Cursor

use byteorder::{LittleEndian, ReadBytesExt};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, Cursor, Read};

use crate::errors::{ExhumeIndxError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionBootSector {
    /* -- 0x00-0x0A ------------------------------------------ */
    pub jump_instruction: [u8; 3], // x86 JMP + NOP
    pub oem_id: [u8; 8],           // "NTFS    "

    /* -- BIOS Parameter Block (BPB) – 0x0B-0x23 ------------- */
    pub bytes_per_sector: u16,   // 0x0B
    pub sectors_per_cluster: u8, // 0x0D, 244..=255 encode 2^(256-n)
    pub reserved_sectors: u16,   // 0x0E
    pub fat_fields: [u8; 5],     // 0x10, FAT leftovers, zero on NTFS
    pub media_descriptor: u8,    // 0x15
    pub sectors_per_fat: u16,    // 0x16, zero on NTFS
    pub sectors_per_track: u16,  // 0x18
    pub number_of_heads: u16,    // 0x1A
    pub hidden_sectors: u32,     // 0x1C
    pub large_sector_count: u32, // 0x20, zero on NTFS
    pub reserved: u32,           // 0x24, 0x80008000 on NTFS

    /* -- Extended BPB – 0x28-0x53 ---------------------------- */
    pub total_sectors: u64,           // 0x28
    pub mft_cluster: u64,             // 0x30
    pub mft_mirror_cluster: u64,      // 0x38
    pub clusters_per_file_record: i8, // 0x40, negative encodes 2^-n bytes
    pub reserved1: [u8; 3],
    pub clusters_per_index_buffer: i8, // 0x44, negative encodes 2^-n bytes
    pub reserved2: [u8; 3],
    pub volume_serial_number: u64, // 0x48
    pub checksum: u32,             // 0x50

    /* -- Bootstrap code & signature – 0x54-0x1FF ------------ */
    pub bootstrap_code: Vec<u8>,   // 0x54-0x1FD
    pub end_of_sector_marker: u16, // 0x1FE (0xAA55)
}

fn read_bytes<const N: usize>(c: &mut Cursor<&[u8]>) -> io::Result<[u8; N]> {
    let mut tmp = [0u8; N];
    c.read_exact(&mut tmp)?;
    Ok(tmp)
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";
    pub const BITLOCKER_OEM_ID: [u8; 8] = *b"-FVE-FS-";

    /// Parse the 512-byte sector into `PartitionBootSector`
    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < 512 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Boot sector must be exactly 512 bytes",
            ));
        }
        let mut c = Cursor::new(buf);

        let jump_instruction = read_bytes::<3>(&mut c)?;
        let oem_id = read_bytes::<8>(&mut c)?;
        let bytes_per_sector = c.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = c.read_u8()?;
        let reserved_sectors = c.read_u16::<LittleEndian>()?;
        let fat_fields = read_bytes::<5>(&mut c)?;
        let media_descriptor = c.read_u8()?;
        let sectors_per_fat = c.read_u16::<LittleEndian>()?;
        let sectors_per_track = c.read_u16::<LittleEndian>()?;
        let number_of_heads = c.read_u16::<LittleEndian>()?;
        let hidden_sectors = c.read_u32::<LittleEndian>()?;
        let large_sector_count = c.read_u32::<LittleEndian>()?;
        let reserved = c.read_u32::<LittleEndian>()?;
        let total_sectors = c.read_u64::<LittleEndian>()?;
        let mft_cluster = c.read_u64::<LittleEndian>()?;
        let mft_mirror_cluster = c.read_u64::<LittleEndian>()?;
        let clusters_per_file_record = c.read_i8()?;
        let reserved1 = read_bytes::<3>(&mut c)?;
        let clusters_per_index_buffer = c.read_i8()?;
        let reserved2 = read_bytes::<3>(&mut c)?;
        let volume_serial_number = c.read_u64::<LittleEndian>()?;
        let checksum = c.read_u32::<LittleEndian>()?;
        let mut bootstrap_code = vec![0u8; 426];
        c.read_exact(&mut bootstrap_code)?;
        let end_of_sector_marker = c.read_u16::<LittleEndian>()?;

        Ok(Self {
            jump_instruction,
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_fields,
            media_descriptor,
            sectors_per_fat,
            sectors_per_track,
            number_of_heads,
            hidden_sectors,
            large_sector_count,
            reserved,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_file_record,
            reserved1,
            clusters_per_index_buffer,
            reserved2,
            volume_serial_number,
            checksum,
            bootstrap_code,
            end_of_sector_marker,
        })
    }

    /// Check if the oem_id is valid
    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    /// Check if the partition is BitLocker-encrypted.
    ///
    /// BitLocker replaces the NTFS OEM identifier with `-FVE-FS-` in the
    /// volume boot sector.
    pub fn is_bitlocker(&self) -> bool {
        self.oem_id == Self::BITLOCKER_OEM_ID
    }

    /// Reject boot sectors that cannot describe an NTFS volume.
    pub fn validate(&self) -> Result<()> {
        if !self.oem_id_is_valid() {
            let reason = if self.is_bitlocker() {
                "volume is BitLocker-encrypted".to_string()
            } else {
                "the OEM identifier is not 'NTFS    '".to_string()
            };
            return Err(ExhumeIndxError::BadBootSector(reason));
        }
        if !self.bytes_per_sector.is_power_of_two() || self.bytes_per_sector < 256 {
            return Err(ExhumeIndxError::BadBootSector(format!(
                "implausible sector size {}",
                self.bytes_per_sector
            )));
        }
        if self.mft_cluster == 0 || self.total_sectors == 0 {
            return Err(ExhumeIndxError::BadBootSector(
                "zero MFT cluster or volume size".to_string(),
            ));
        }
        Ok(())
    }

    /// Sectors per cluster. Raw values 244..=255 encode 2^(256 - n).
    pub fn sectors_per_cluster_count(&self) -> u64 {
        if self.sectors_per_cluster >= 244 {
            1u64 << (256u32 - self.sectors_per_cluster as u32)
        } else {
            self.sectors_per_cluster as u64
        }
    }

    /// Get the size of one cluster
    pub fn cluster_size(&self) -> u64 {
        self.sectors_per_cluster_count() * self.bytes_per_sector as u64
    }

    /// Compute actual bytes per file-record segment
    pub fn file_record_size(&self) -> u64 {
        if self.clusters_per_file_record > 0 {
            self.clusters_per_file_record as u64 * self.cluster_size()
        } else {
            1u64 << (-self.clusters_per_file_record as u32)
        }
    }

    /// Compute actual bytes per index block (INDX record)
    pub fn index_block_size(&self) -> u64 {
        if self.clusters_per_index_buffer > 0 {
            self.clusters_per_index_buffer as u64 * self.cluster_size()
        } else {
            1u64 << (-self.clusters_per_index_buffer as u32)
        }
    }

    /// The MFT is walked in chunks of one cluster or one record, whichever
    /// is larger, so a chunk always holds a whole number of records.
    pub fn mft_chunk_size(&self) -> u64 {
        self.cluster_size().max(self.file_record_size())
    }

    /// Get the logical byte address of the MFT, relative to partition start
    pub fn mft_address(&self) -> u64 {
        self.mft_cluster * self.cluster_size()
    }

    /// Get the logical byte address of the MFT mirror
    pub fn mft_backup(&self) -> u64 {
        self.mft_mirror_cluster * self.cluster_size()
    }

    /// Total size of the volume in bytes
    pub fn volume_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut table = Table::new();

        table.add_row(row!["Field", "Value"]);
        table.add_row(row![
            "OEM ID",
            String::from_utf8_lossy(&self.oem_id).trim().to_string()
        ]);
        table.add_row(row!["Bytes per sector", self.bytes_per_sector.to_string()]);
        table.add_row(row![
            "Sectors per cluster",
            self.sectors_per_cluster_count().to_string()
        ]);
        table.add_row(row!["Reserved sectors", self.reserved_sectors.to_string()]);
        table.add_row(row![
            "Media descriptor",
            format!("{:02X}", self.media_descriptor)
        ]);
        table.add_row(row!["Hidden sectors", self.hidden_sectors.to_string()]);
        table.add_row(row!["Total sectors", self.total_sectors.to_string()]);
        table.add_row(row!["MFT cluster", self.mft_cluster.to_string()]);
        table.add_row(row![
            "MFT mirror cluster",
            self.mft_mirror_cluster.to_string()
        ]);
        table.add_row(row![
            "File record size (bytes)",
            self.file_record_size().to_string()
        ]);
        table.add_row(row![
            "Index block size (bytes)",
            self.index_block_size().to_string()
        ]);
        table.add_row(row![
            "Cluster size (bytes)",
            self.cluster_size().to_string()
        ]);
        table.add_row(row!["MFT address", format!("0x{:X}", self.mft_address())]);
        table.add_row(row!["MFT backup", format!("0x{:X}", self.mft_backup())]);
        table.add_row(row![
            "Volume serial number",
            format!("0x{:X}", self.volume_serial_number)
        ]);
        table.add_row(row![
            "End of sector marker",
            format!("{:04X}", self.end_of_sector_marker)
        ]);
        table.to_string()
    }
}

/// 512-byte boot sector used across the crate's unit tests: 4 KiB clusters,
/// 1 KiB records, MFT at cluster 4, 64 MiB volume.
#[cfg(test)]
pub(crate) fn sample_boot_sector() -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    buf[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    buf[3..11].copy_from_slice(b"NTFS    ");
    buf[11..13].copy_from_slice(&512u16.to_le_bytes());
    buf[13] = 8; // sectors per cluster
    buf[40..48].copy_from_slice(&131072u64.to_le_bytes()); // total sectors
    buf[48..56].copy_from_slice(&4u64.to_le_bytes()); // MFT cluster
    buf[56..64].copy_from_slice(&8192u64.to_le_bytes());
    buf[64] = 0xF6; // -10 => 1024-byte records
    buf[68] = 1; // 1 cluster per index block
    buf[72..80].copy_from_slice(&0xDEADBEEFu64.to_le_bytes());
    buf[510] = 0x55;
    buf[511] = 0xAA;
    buf
}
