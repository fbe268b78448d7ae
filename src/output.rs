//! Output formatting and the line sink. One line per recovered entry;
//! deduplication, when requested, is plain set membership on the formatted
//! line.

use serde_json::json;
use std::collections::HashSet;
use std::io::Write;

use crate::errors::{ExhumeIndxError, Result};
use crate::indx::EntrySource;
use crate::mft::{FileReference, filetime_to_datetime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Bodyfile,
    Jsonl,
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "csv" => OutputFormat::Csv,
            "bodyfile" => OutputFormat::Bodyfile,
            "jsonl" => OutputFormat::Jsonl,
            _ => return None,
        })
    }

    pub fn header(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Csv => Some(
                "Path,Size,AllocatedSize,CreationTime,ModificationTime,\
                 ChangedTime,AccessTime,Source,FileReference",
            ),
            OutputFormat::Bodyfile | OutputFormat::Jsonl => None,
        }
    }
}

/// One recovered entry, fully resolved and ready for the sink.
#[derive(Debug, Clone)]
pub struct EmittedEntry {
    pub full_path: String,
    pub name: String,
    pub real_size: u64,
    pub allocated_size: u64,
    pub created: u64,
    pub modified: u64,
    pub mft_changed: u64,
    pub accessed: u64,
    pub source: EntrySource,
    pub child_ref: FileReference,
    /// The parent reference the path was derived from (the directory for
    /// live entries, the chunk hint for deleted-directory entries).
    pub parent_ref: FileReference,
}

impl EmittedEntry {
    pub fn format_line(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Csv => format!(
                "{},{},{},{},{},{},{},{},{}",
                csv_quote(&self.full_path),
                self.real_size,
                self.allocated_size,
                iso(self.created),
                iso(self.modified),
                iso(self.mft_changed),
                iso(self.accessed),
                self.source,
                self.child_ref,
            ),
            OutputFormat::Bodyfile => format!(
                "0|{}|0|0|0|0|{}|{}|{}|{}|{}",
                self.full_path,
                self.real_size,
                epoch(self.accessed),
                epoch(self.modified),
                epoch(self.mft_changed),
                epoch(self.created),
            ),
            OutputFormat::Jsonl => json!({
                "path": self.full_path,
                "filename": self.name,
                "size": self.real_size,
                "allocated_size": self.allocated_size,
                "creation_time": iso(self.created),
                "modification_time": iso(self.modified),
                "changed_time": iso(self.mft_changed),
                "access_time": iso(self.accessed),
                "source": self.source.to_string(),
                "file_reference": self.child_ref.to_string(),
                "parent_reference": self.parent_ref.to_string(),
            })
            .to_string(),
        }
    }
}

/// ISO-8601 with microsecond precision, UTC, no timezone shift.
fn iso(ft: u64) -> String {
    filetime_to_datetime(ft)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
        .unwrap_or_default()
}

fn epoch(ft: u64) -> i64 {
    filetime_to_datetime(ft).map(|dt| dt.timestamp()).unwrap_or(0)
}

fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Line sink over any writer. The output file is opened in append mode by
/// the caller; dedup only considers lines written in this run.
pub struct EntrySink<W: Write> {
    out: W,
    dedup: bool,
    seen: HashSet<String>,
}

impl<W: Write> EntrySink<W> {
    pub fn new(out: W, dedup: bool) -> Self {
        EntrySink {
            out,
            dedup,
            seen: HashSet::new(),
        }
    }

    /// The format header, if any. Never deduplicated away.
    pub fn write_header(&mut self, format: OutputFormat) -> Result<()> {
        if let Some(header) = format.header() {
            writeln!(self.out, "{header}").map_err(ExhumeIndxError::OutputWrite)?;
        }
        Ok(())
    }

    pub fn emit(&mut self, entry: &EmittedEntry, format: OutputFormat) -> Result<()> {
        let line = entry.format_line(format);
        if self.dedup && !self.seen.insert(line.clone()) {
            return Ok(());
        }
        writeln!(self.out, "{line}").map_err(ExhumeIndxError::OutputWrite)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(ExhumeIndxError::OutputWrite)
    }
}
