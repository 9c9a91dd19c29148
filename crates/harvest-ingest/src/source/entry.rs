//! Entry records: one retrievable unit per remote file or archive member.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Suffix carried by gzip-compressed downloads; stripped in place on
/// decompression.
pub const GZIP_SUFFIX: &str = ".gz";

/// Non-data sidecar suffixes (checksums, readme-style text files) that are
/// excluded from listing results.
pub const SIDECAR_SUFFIXES: &[&str] = &[".md5", ".txt"];

/// One retrievable unit from a remote source, with its lifecycle state and
/// local artifact path.
///
/// Records are created when listing/archive loading completes and are owned
/// by their connector for their entire lifetime. The lifecycle flags are
/// atomics because `for_each` marks entries from concurrently running
/// fetch/decompress operations while the connector keeps ownership.
#[derive(Debug)]
pub struct EntryRecord {
    name: String,
    local_path: PathBuf,
    fetched: AtomicBool,
    decompressed: AtomicBool,
}

impl EntryRecord {
    /// Create a record for `name`, rooted under the configured temp dir.
    pub fn new(name: impl Into<String>, tmp_dir: &Path) -> Self {
        let name = name.into();
        let local_path = tmp_dir.join(&name);
        Self {
            name,
            local_path,
            fetched: AtomicBool::new(false),
            decompressed: AtomicBool::new(false),
        }
    }

    /// Remote name (identity of the entry).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the raw download (or extracted archive member) lands locally.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Local path of the decompressed artifact: the gzip suffix stripped in
    /// place. Identical to [`local_path`](Self::local_path) for
    /// non-compressed entries.
    pub fn output_path(&self) -> PathBuf {
        let full = self.local_path.to_string_lossy();
        match full.strip_suffix(GZIP_SUFFIX) {
            Some(stripped) => PathBuf::from(stripped),
            None => self.local_path.clone(),
        }
    }

    /// Whether the name carries the gzip suffix.
    pub fn is_compressed(&self) -> bool {
        self.name.ends_with(GZIP_SUFFIX)
    }

    /// Whether this is a known non-data sidecar (checksum or text file).
    pub fn is_sidecar(&self) -> bool {
        SIDECAR_SUFFIXES.iter().any(|s| self.name.ends_with(s))
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched.load(Ordering::Acquire)
    }

    pub(crate) fn mark_fetched(&self) {
        self.fetched.store(true, Ordering::Release);
    }

    pub fn is_decompressed(&self) -> bool {
        self.decompressed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_decompressed(&self) {
        self.decompressed.store(true, Ordering::Release);
    }
}
