//! Archive transport: one zip container fetched over HTTP, members
//! extracted on demand.
//!
//! The container file is downloaded once (skipped when already on disk) and
//! opened as a `zip::ZipArchive`. Extraction needs `&mut` on the handle, so
//! it lives behind a mutex; member reads never mutate the underlying file,
//! which makes concurrent `decompress_one` calls safe.

use futures::StreamExt;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::SourceError;

/// HTTP endpoint for the archive variant.
#[derive(Debug, Clone)]
pub struct ArchiveEndpoint {
    /// Full URL of the remote container.
    pub url: String,

    /// Local file name for the downloaded container.
    pub file_name: String,

    /// When true, members are materialized to disk on decompression;
    /// when false, they are returned as in-memory strings instead.
    pub inflate: bool,
}

impl ArchiveEndpoint {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            inflate: true,
        }
    }

    pub fn with_inflate(mut self, inflate: bool) -> Self {
        self.inflate = inflate;
        self
    }
}

/// Exclusively-owned container handle plus its local path, computed once.
pub struct ArchiveContainer {
    endpoint: ArchiveEndpoint,
    archive_path: PathBuf,
    handle: Mutex<Option<ZipArchive<std::fs::File>>>,
}

impl ArchiveContainer {
    pub(crate) fn new(endpoint: ArchiveEndpoint, tmp_dir: &Path) -> Self {
        let archive_path = tmp_dir.join(&endpoint.file_name);
        Self {
            endpoint,
            archive_path,
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn endpoint(&self) -> &ArchiveEndpoint {
        &self.endpoint
    }

    /// Local path of the downloaded container file.
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Download the container (unless already present) and enumerate its
    /// members. Directory entries are not members.
    pub(crate) async fn load(&self, client: &reqwest::Client) -> Result<Vec<String>, SourceError> {
        if self.archive_path.exists() {
            debug!("Archive already downloaded: {:?}", self.archive_path);
        } else {
            self.download(client).await?;
        }

        let file = std::fs::File::open(&self.archive_path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| SourceError::Connection(format!("open archive: {}", e)))?;

        // Enumerate by index so member order matches the archive directory.
        let mut members = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let member = archive
                .by_index_raw(i)
                .map_err(|e| SourceError::Connection(format!("read archive entry: {}", e)))?;
            if member.name().ends_with('/') {
                continue;
            }
            // Member names become paths under the temp root; anything that
            // could resolve outside it never becomes an entry.
            if !is_safe_member_name(member.name()) {
                warn!("Skipping archive member with unsafe path: {}", member.name());
                continue;
            }
            members.push(member.name().to_string());
        }

        *self
            .handle
            .lock()
            .map_err(|e| SourceError::Connection(format!("archive handle lock: {}", e)))? =
            Some(archive);

        info!(
            "Loaded archive {:?}: {} members",
            self.archive_path,
            members.len()
        );
        Ok(members)
    }

    async fn download(&self, client: &reqwest::Client) -> Result<(), SourceError> {
        info!("Downloading archive from {}", self.endpoint.url);

        let response = client
            .get(&self.endpoint.url)
            .send()
            .await
            .map_err(|e| SourceError::fetch(&self.endpoint.file_name, e))?;

        if !response.status().is_success() {
            return Err(SourceError::fetch(
                &self.endpoint.file_name,
                format!("status {}", response.status()),
            ));
        }

        if let Some(parent) = self.archive_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // A truncated container must not satisfy the next load()'s
        // already-downloaded check, so discard it on any stream error.
        let downloaded = match self.stream_to_file(response).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if self.archive_path.exists() {
                    if let Err(remove_err) = std::fs::remove_file(&self.archive_path) {
                        warn!(
                            "Failed to remove partial archive {:?}: {}",
                            self.archive_path, remove_err
                        );
                    }
                }
                return Err(e);
            },
        };

        info!(
            "Downloaded archive {:?} ({} bytes)",
            self.archive_path, downloaded
        );
        Ok(())
    }

    async fn stream_to_file(&self, response: reqwest::Response) -> Result<u64, SourceError> {
        let mut file = std::fs::File::create(&self.archive_path)?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SourceError::fetch(&self.endpoint.file_name, e))?;
            file.write_all(&chunk)
                .map_err(|e| SourceError::fetch(&self.endpoint.file_name, e))?;
            downloaded += chunk.len() as u64;
        }

        Ok(downloaded)
    }

    /// Stream one member out of the container into `dest`, creating parent
    /// directories as needed.
    pub(crate) fn extract_to_path(&self, name: &str, dest: &Path) -> Result<(), SourceError> {
        if !is_safe_member_name(name) {
            return Err(SourceError::decompress(name, "unsafe member path"));
        }
        let mut guard = self
            .handle
            .lock()
            .map_err(|e| SourceError::decompress(name, e))?;
        let archive = guard.as_mut().ok_or(SourceError::NotListed)?;

        let mut member = archive
            .by_name(name)
            .map_err(|e| SourceError::decompress(name, e))?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(dest)?;
        std::io::copy(&mut member, &mut out).map_err(|e| SourceError::decompress(name, e))?;

        debug!("Extracted {} to {:?}", name, dest);
        Ok(())
    }

    /// Read one member's content into memory without touching the
    /// filesystem. There is no size guard; callers with very large members
    /// should extract to disk instead.
    pub(crate) fn extract_to_string(&self, name: &str) -> Result<String, SourceError> {
        let mut guard = self
            .handle
            .lock()
            .map_err(|e| SourceError::decompress(name, e))?;
        let archive = guard.as_mut().ok_or(SourceError::NotListed)?;

        let mut member = archive
            .by_name(name)
            .map_err(|e| SourceError::decompress(name, e))?;

        let mut content = String::new();
        member
            .read_to_string(&mut content)
            .map_err(|e| SourceError::decompress(name, e))?;
        Ok(content)
    }

    /// Drop the container handle so the archive file can be unlinked.
    pub(crate) fn release(&self) {
        match self.handle.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

/// A member name is safe when joining it onto the temp root cannot resolve
/// outside that root: relative, with no parent-directory components.
fn is_safe_member_name(name: &str) -> bool {
    let path = Path::new(name);
    !path.is_absolute() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
