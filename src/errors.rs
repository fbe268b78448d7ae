use thiserror::Error;

/// Every failure the carver can hit, split the way the run reacts to it:
/// boot-sector, version and output errors abort the run; the per-record and
/// per-block kinds are logged and skipped.
#[derive(Error, Debug)]
pub enum ExhumeIndxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read at volume offset {offset:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("invalid volume boot record: {0}")]
    BadBootSector(String),

    #[error("fixup validation failed in {record} (stride {stride})")]
    FixupMismatch { record: &'static str, stride: usize },

    #[error("bad runlist: {0}")]
    BadRunlist(String),

    #[error("bad attribute in file record {record}: {reason}")]
    BadAttribute { record: u64, reason: String },

    #[error("bad index block: {0}")]
    BadIndexBlock(String),

    #[error("unsupported NTFS version {major}.{minor} (only 3.1 is supported)")]
    UnsupportedNtfsVersion { major: u8, minor: u8 },

    #[error("could not write output: {0}")]
    OutputWrite(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExhumeIndxError>;
