//! Top-level orchestration: build the catalogue, walk every directory's
//! `$INDEX_ALLOCATION` block by block, resolve paths, filter, emit.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{Read, Seek, Write};

use crate::NtfsVolume;
use crate::catalog::{CatalogRecord, MftCatalog};
use crate::errors::Result;
use crate::fixup::apply_fixup;
use crate::indx::{self, EntrySource, IndexRecordHeader};
use crate::mft::FileReference;
use crate::output::{EmittedEntry, EntrySink, OutputFormat};
use crate::paths::PathResolver;

/// Everything the CLI decides for one run.
#[derive(Debug, Clone)]
pub struct RipOptions {
    /// Prepended verbatim to every emitted path.
    pub mount_point: String,
    pub format: OutputFormat,
    pub no_active_files: bool,
    pub skip_deleted_dirs: bool,
    pub dedup: bool,
}

impl Default for RipOptions {
    fn default() -> Self {
        RipOptions {
            mount_point: String::new(),
            format: OutputFormat::Csv,
            no_active_files: false,
            skip_deleted_dirs: false,
            dedup: false,
        }
    }
}

/// Carve every directory index of `vol` and stream the results into `out`.
pub fn rip<T: Read + Seek, W: Write>(
    vol: &mut NtfsVolume<T>,
    opts: &RipOptions,
    out: W,
) -> Result<()> {
    let catalog = MftCatalog::build(vol)?;
    info!(
        "catalogued {} records, {} directories with index blocks",
        catalog.records.len(),
        catalog.directory_keys().len()
    );

    let mut resolver = PathResolver::new();
    let mut sink = EntrySink::new(out, opts.dedup);
    sink.write_header(opts.format)?;

    for key in catalog.directory_keys() {
        let dir = &catalog.records[&key];
        if !dir.is_allocated && opts.skip_deleted_dirs {
            debug!("skipping deleted directory {}", key.0);
            continue;
        }
        process_directory(vol, &catalog, &mut resolver, key, dir, opts, &mut sink)?;
    }
    sink.flush()
}

/// Carve one directory: gather candidates from every block of every `$I30`
/// instance, apply the active-file filter, emit in stream order.
fn process_directory<T: Read + Seek, W: Write>(
    vol: &mut NtfsVolume<T>,
    catalog: &MftCatalog,
    resolver: &mut PathResolver,
    key: (u64, u16),
    dir: &CatalogRecord,
    opts: &RipOptions,
    sink: &mut EntrySink<W>,
) -> Result<()> {
    let block_size = if dir.index_block_size > 0 {
        dir.index_block_size
    } else {
        vol.pbs.index_block_size()
    };
    let live_path = if dir.is_allocated {
        Some(resolver.resolve(catalog, key))
    } else {
        None
    };

    let mut candidates: Vec<EmittedEntry> = Vec::new();
    for (_, reader) in &dir.index_allocations {
        let total = reader.run_bytes();
        let mut offset = 0u64;
        while offset < total {
            let mut block = match reader.read_chunk(vol, offset, block_size) {
                Ok(b) => b,
                Err(e) => {
                    warn!("could not read an index block of directory {}: {e}", key.0);
                    break;
                }
            };
            offset += block_size;

            if !indx::has_indx_magic(&block) {
                // Normal for deleted directories: the cluster was reused.
                debug!("non-INDX chunk in directory {}", key.0);
                continue;
            }
            let header = match IndexRecordHeader::parse(&block) {
                Ok(h) => h,
                Err(e) => {
                    warn!("skipping an index block of directory {}: {e}", key.0);
                    continue;
                }
            };
            if let Err(e) = apply_fixup(&mut block, header.usa_offset, header.usa_count, "INDX block")
            {
                warn!("skipping an index block of directory {}: {e}", key.0);
                continue;
            }

            let parsed = indx::parse_entries(&block, &header, catalog.mft_record_count);

            // Path anchor for this chunk. A live directory anchors every
            // chunk at its own resolved path; a deleted directory is only
            // trusted as far as the chunk's first allocated entry points.
            let (parent_path, parent_ref) = match &live_path {
                Some(path) => (
                    path.clone(),
                    FileReference {
                        record: key.0,
                        sequence: key.1,
                    },
                ),
                None => match parsed.parent_hint {
                    Some(hint) if catalog.records.contains_key(&hint.key()) => {
                        (resolver.resolve(catalog, hint.key()), hint)
                    }
                    Some(hint) => ("<Unknown>".to_string(), hint),
                    None => (
                        "<Unknown>".to_string(),
                        FileReference {
                            record: 0,
                            sequence: 0,
                        },
                    ),
                },
            };

            for entry in &parsed.entries {
                candidates.push(EmittedEntry {
                    full_path: format!(
                        "{}{}/{}",
                        opts.mount_point, parent_path, entry.filename.name
                    ),
                    name: entry.filename.name.clone(),
                    real_size: entry.filename.real_size,
                    allocated_size: entry.filename.allocated_size,
                    created: entry.filename.created,
                    modified: entry.filename.modified,
                    mft_changed: entry.filename.mft_changed,
                    accessed: entry.filename.accessed,
                    source: entry.source,
                    child_ref: entry.file_reference,
                    parent_ref,
                });
            }
        }
    }

    // Active-file filter; deleted directories bypass it entirely.
    if opts.no_active_files && dir.is_allocated {
        let allocated_names: HashMap<String, FileReference> = candidates
            .iter()
            .filter(|c| c.source == EntrySource::Allocated)
            .map(|c| (c.name.clone(), c.child_ref))
            .collect();
        candidates.retain(|c| match c.source {
            EntrySource::Allocated => !catalog.is_live(c.child_ref),
            EntrySource::Slack => allocated_names.get(&c.name) != Some(&c.child_ref),
        });
    }

    for candidate in &candidates {
        sink.emit(candidate, opts.format)?;
    }
    Ok(())
}
