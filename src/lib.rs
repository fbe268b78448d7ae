use std::io::{Read, Seek, SeekFrom};

use crate::errors::{ExhumeIndxError, Result};
use crate::pbs::PartitionBootSector;

// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS
pub mod catalog;
pub mod driver;
pub mod errors;
pub mod fixup;
pub mod indx;
pub mod mft;
pub mod output;
pub mod paths;
pub mod pbs;
pub mod runlist;
#[cfg(test)]
pub(crate) mod testkit;

/// Random-access view of one NTFS volume inside a larger byte source.
///
/// All offsets taken by [`NtfsVolume::read_at`] are relative to the start of
/// the partition. Reads against the underlying source are always issued on
/// `device_sector_size` boundaries: live Windows volumes (`\\.\D:`) refuse
/// unaligned reads, and the buffering is harmless on image files.
pub struct NtfsVolume<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    pub body: T,
    partition_offset: u64,
    device_sector_size: u64,
}

impl<T: Read + Seek> NtfsVolume<T> {
    /// Read and validate the boot sector at `partition_offset` bytes into
    /// `body`, keeping the source for later reads.
    pub fn new(mut body: T, partition_offset: u64, device_sector_size: u64) -> Result<Self> {
        let mut sector = vec![0u8; 512.max(device_sector_size as usize)];
        body.seek(SeekFrom::Start(partition_offset))?;
        body.read_exact(&mut sector).map_err(|_| {
            ExhumeIndxError::BadBootSector("could not read a full boot sector".to_string())
        })?;

        let pbs = PartitionBootSector::from_bytes(&sector)
            .map_err(|e| ExhumeIndxError::BadBootSector(e.to_string()))?;
        pbs.validate()?;

        Ok(NtfsVolume {
            pbs,
            body,
            partition_offset,
            device_sector_size: device_sector_size.max(1),
        })
    }

    /// Byte offset of the MFT, relative to the partition start.
    pub fn mft_offset(&self) -> u64 {
        self.pbs.mft_address()
    }

    /// Fill `buf` from `volume_offset` (relative to the partition start).
    pub fn read_at(&mut self, volume_offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let absolute = self.partition_offset + volume_offset;
        let aligned_start = absolute - absolute % self.device_sector_size;
        let lead = (absolute - aligned_start) as usize;

        let wanted = lead + buf.len();
        let padded = wanted.div_ceil(self.device_sector_size as usize)
            * self.device_sector_size as usize;
        let mut tmp = vec![0u8; padded];

        self.body.seek(SeekFrom::Start(aligned_start))?;
        let mut got = 0usize;
        while got < tmp.len() {
            match self.body.read(&mut tmp[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if got < wanted {
            return Err(ExhumeIndxError::ShortRead {
                offset: volume_offset,
                wanted: buf.len(),
                got: got.saturating_sub(lead),
            });
        }
        buf.copy_from_slice(&tmp[lead..lead + buf.len()]);
        Ok(())
    }

    /// Convenience wrapper allocating the buffer.
    pub fn read_vec(&mut self, volume_offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(volume_offset, &mut buf)?;
        Ok(buf)
    }
}
