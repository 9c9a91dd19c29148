//! Protocol-polymorphic source connector.
//!
//! One connector owns the listing/retrieval/decompression/cleanup lifecycle
//! of a set of [`EntryRecord`]s, regardless of transport. The two transports
//! are a closed set chosen at construction: a *listing* (an FTP directory of
//! independently fetchable files) or an *archive* (one zip container whose
//! members are extracted locally).

pub mod archive;
pub mod entry;
pub mod ftp;

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use archive::{ArchiveContainer, ArchiveEndpoint};
pub use entry::EntryRecord;
pub use ftp::FtpEndpoint;

use crate::error::SourceError;

/// Connector-level configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Root for all local artifacts; each entry maps to exactly one path
    /// under it.
    pub tmp_dir: PathBuf,

    /// Cap on the number of listed entries (resource budget, not
    /// correctness); `None` keeps everything.
    pub max_entries: Option<usize>,

    /// Default cap on concurrent per-entry operations.
    pub concurrency: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            tmp_dir: std::env::temp_dir(),
            max_entries: None,
            concurrency: 1,
        }
    }
}

impl SourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// What a decompression produced.
#[derive(Debug)]
pub enum Extracted {
    /// Artifact materialized at this local path.
    File(PathBuf),

    /// Member content kept in memory; nothing written to disk.
    Inline(String),

    /// Entry was not compressed; nothing to do.
    Skipped,
}

enum Transport {
    Listing(FtpEndpoint),
    Archive(ArchiveContainer),
}

/// Uniform listing, retrieval, decompression and cleanup of remote entries.
///
/// The connector is the sole owner of its entry records and of the container
/// handle (archive variant); callers borrow entries for the duration of one
/// operation.
pub struct SourceConnector {
    config: SourceConfig,
    transport: Transport,
    client: reqwest::Client,
    entries: Vec<EntryRecord>,
    listed: bool,
}

impl SourceConnector {
    /// Listing variant over an FTP directory.
    pub fn listing(endpoint: FtpEndpoint, config: SourceConfig) -> Self {
        Self {
            config,
            transport: Transport::Listing(endpoint),
            client: reqwest::Client::new(),
            entries: Vec::new(),
            listed: false,
        }
    }

    /// Archive variant over an HTTP-hosted zip container.
    pub fn archive(endpoint: ArchiveEndpoint, config: SourceConfig) -> Self {
        let container = ArchiveContainer::new(endpoint, &config.tmp_dir);
        Self {
            config,
            transport: Transport::Archive(container),
            client: reqwest::Client::new(),
            entries: Vec::new(),
            listed: false,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Listed entries, after sidecar filtering and truncation. Empty until
    /// [`list`](Self::list) has succeeded.
    pub fn entries(&self) -> &[EntryRecord] {
        &self.entries
    }

    /// Enumerate remote entries. Populates the entry set exactly once; a
    /// second call returns the existing records without touching the remote.
    ///
    /// Listing variant: opens a session, changes into the configured path,
    /// verifies the resulting location, lists, and closes. Sidecar files
    /// (checksums, text notes) are excluded. Archive variant: downloads the
    /// container (if not already local) and enumerates its members.
    pub async fn list(&mut self) -> Result<&[EntryRecord], SourceError> {
        if self.listed {
            return Ok(&self.entries);
        }

        let names = match &self.transport {
            Transport::Listing(endpoint) => {
                let endpoint = endpoint.clone();
                let raw = tokio::task::spawn_blocking(move || ftp::list_names(&endpoint))
                    .await
                    .map_err(|e| SourceError::Connection(format!("list task failed: {}", e)))??;
                info!("Listed {} remote files", raw.len());
                raw
            },
            Transport::Archive(container) => container.load(&self.client).await?,
        };

        let filter_sidecars = matches!(self.transport, Transport::Listing(_));
        self.entries = build_entries(
            names,
            filter_sidecars,
            self.config.max_entries,
            &self.config.tmp_dir,
        );
        self.listed = true;

        debug!("{} entries after filtering", self.entries.len());
        Ok(&self.entries)
    }

    /// Retrieve one entry to local storage.
    ///
    /// Listing variant: a fresh transport session per call, so concurrent
    /// fetches never share a session. Archive variant: the container is
    /// already local, so this only marks the entry fetched.
    pub async fn fetch_one(&self, entry: &EntryRecord) -> Result<(), SourceError> {
        if !self.listed {
            return Err(SourceError::NotListed);
        }

        match &self.transport {
            Transport::Listing(endpoint) => {
                let endpoint = endpoint.clone();
                let name = entry.name().to_string();
                let dest = entry.local_path().to_path_buf();
                tokio::task::spawn_blocking(move || ftp::fetch_to_path(&endpoint, &name, &dest))
                    .await
                    .map_err(|e| SourceError::fetch(entry.name(), e))??;
            },
            Transport::Archive(_) => {},
        }

        entry.mark_fetched();
        Ok(())
    }

    /// Decompress one entry.
    ///
    /// Listing variant: gzip-streams the download into the suffix-stripped
    /// sibling path and deletes the compressed source on success; entries
    /// without the gzip suffix are skipped, not errors. Archive variant:
    /// extracts the member to disk, or returns it as an in-memory string
    /// when the endpoint's `inflate` flag is off.
    pub async fn decompress_one(&self, entry: &EntryRecord) -> Result<Extracted, SourceError> {
        if !self.listed {
            return Err(SourceError::NotListed);
        }

        let extracted = match &self.transport {
            Transport::Listing(_) => {
                if !entry.is_compressed() {
                    info!("Skipping decompression for {}", entry.name());
                    return Ok(Extracted::Skipped);
                }
                let src = entry.local_path().to_path_buf();
                let dest = entry.output_path();
                let name = entry.name().to_string();
                let out = tokio::task::spawn_blocking(move || {
                    gunzip_to_sibling(&name, &src, &dest).map(|_| dest)
                })
                .await
                .map_err(|e| SourceError::decompress(entry.name(), e))??;
                Extracted::File(out)
            },
            Transport::Archive(container) => {
                if container.endpoint().inflate {
                    container.extract_to_path(entry.name(), entry.local_path())?;
                    Extracted::File(entry.local_path().to_path_buf())
                } else {
                    Extracted::Inline(container.extract_to_string(entry.name())?)
                }
            },
        };

        entry.mark_decompressed();
        Ok(extracted)
    }

    /// Apply `op` to every listed entry with at most `concurrency` in
    /// flight. The first error stops dispatch of new work; operations
    /// already in flight run to completion but their results are discarded.
    pub async fn for_each<'a, F, Fut>(&'a self, concurrency: usize, op: F) -> Result<(), SourceError>
    where
        F: Fn(&'a EntryRecord) -> Fut,
        Fut: Future<Output = Result<(), SourceError>> + 'a,
    {
        let cap = concurrency.max(1);
        let mut pending = self.entries.iter();
        let mut in_flight = FuturesUnordered::new();
        let mut first_err: Option<SourceError> = None;

        loop {
            while first_err.is_none() && in_flight.len() < cap {
                match pending.next() {
                    Some(entry) => in_flight.push(op(entry)),
                    None => break,
                }
            }

            match in_flight.next().await {
                Some(Ok(())) => {},
                Some(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    } else {
                        warn!("Discarding error from in-flight operation: {}", e);
                    }
                },
                None => break,
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove every entry's local decompressed artifact, then (archive
    /// variant) the container file itself. Every entry is attempted even
    /// after a failure; the first error is surfaced. Safe to call twice.
    pub async fn cleanup_all(&self) -> Result<(), SourceError> {
        let mut first_err: Option<SourceError> = None;

        for entry in &self.entries {
            let artifact = match &self.transport {
                Transport::Listing(_) => entry.output_path(),
                Transport::Archive(_) => entry.local_path().to_path_buf(),
            };
            if let Err(e) = remove_if_present(&artifact) {
                warn!("Cleanup failed for {:?}: {}", artifact, e);
                first_err.get_or_insert(SourceError::Cleanup {
                    path: artifact,
                    source: e,
                });
            }
        }

        if let Transport::Archive(container) = &self.transport {
            container.release();
            let path = container.archive_path().to_path_buf();
            if let Err(e) = remove_if_present(&path) {
                warn!("Cleanup failed for {:?}: {}", path, e);
                first_err.get_or_insert(SourceError::Cleanup { path, source: e });
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Filter sidecars (listing variant only), keep original order, truncate to
/// the entry budget.
fn build_entries(
    names: Vec<String>,
    filter_sidecars: bool,
    max_entries: Option<usize>,
    tmp_dir: &Path,
) -> Vec<EntryRecord> {
    let records = names
        .into_iter()
        .map(|name| EntryRecord::new(name, tmp_dir))
        .filter(|e| !filter_sidecars || !e.is_sidecar());

    match max_entries {
        Some(max) => records.take(max).collect(),
        None => records.collect(),
    }
}

/// Stream-decompress `src` into `dest`, deleting `src` on success.
fn gunzip_to_sibling(name: &str, src: &Path, dest: &Path) -> Result<(), SourceError> {
    let input = std::fs::File::open(src).map_err(|e| SourceError::decompress(name, e))?;
    let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(input));
    let mut output = std::fs::File::create(dest).map_err(|e| SourceError::decompress(name, e))?;

    std::io::copy(&mut decoder, &mut output).map_err(|e| SourceError::decompress(name, e))?;
    std::fs::remove_file(src).map_err(|e| SourceError::decompress(name, e))?;

    debug!("Decompressed {:?} -> {:?}", src, dest);
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), std::io::Error> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
