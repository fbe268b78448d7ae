//! Path reconstruction over the catalogue's parent-reference graph. The
//! graph can dangle (reused or wiped parents) and can even contain cycles on
//! damaged volumes, so resolution runs with a visit marker and terminal
//! labels instead of trusting the chain.

use std::collections::{HashMap, HashSet};

use crate::catalog::MftCatalog;

/// Terminal label for records whose parent chain cannot be followed.
pub const ORPHAN_LABEL: &str = "/$Orphan";
/// Terminal label for records that carry no `$FILE_NAME` at all.
pub const NO_NAME_LABEL: &str = "/$NoName";

/// The root directory's record number; its path is the empty string.
pub const ROOT_RECORD: u64 = 5;

/// Memoised `(record, sequence) -> path` resolution.
#[derive(Debug, Default)]
pub struct PathResolver {
    cache: HashMap<(u64, u16), String>,
    in_progress: HashSet<(u64, u16)>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute path of the directory under `key`, `/`-joined, without a
    /// trailing separator. The root resolves to `""` so that children become
    /// `"/name"`. A deleted ancestor whose name survives still contributes a
    /// path component; only an absent or mismatched incarnation (or a cycle)
    /// downgrades the chain to `/$Orphan`, and a nameless record to
    /// `/$NoName`.
    pub fn resolve(&mut self, catalog: &MftCatalog, key: (u64, u16)) -> String {
        if key.0 == ROOT_RECORD {
            return String::new();
        }
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        if !self.in_progress.insert(key) {
            // Revisit while unwinding the same chain: a cycle.
            return ORPHAN_LABEL.to_string();
        }

        let path = match catalog.records.get(&key) {
            None => ORPHAN_LABEL.to_string(),
            Some(record) => match record.best_name() {
                None => NO_NAME_LABEL.to_string(),
                Some(filename) => {
                    let parent = self.resolve(catalog, filename.parent.key());
                    format!("{}/{}", parent, filename.name)
                }
            },
        };

        self.in_progress.remove(&key);
        self.cache.insert(key, path.clone());
        path
    }
}
