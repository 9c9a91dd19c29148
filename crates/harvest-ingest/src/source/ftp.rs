//! FTP transport for the listing variant.
//!
//! Sessions are cheap and never shared: every list/fetch call opens its own
//! connection, does its work and quits, so concurrent fetches cannot trample
//! one another's control channel. The blocking `suppaftp` client is driven
//! from `spawn_blocking` by the connector.

use std::io::Read;
use std::path::Path;
use suppaftp::FtpStream;
use tracing::{debug, warn};

use crate::error::SourceError;

/// FTP endpoint configuration for the listing variant.
#[derive(Debug, Clone)]
pub struct FtpEndpoint {
    /// FTP server hostname.
    pub host: String,

    /// FTP server port (usually 21).
    pub port: u16,

    /// Username, typically "anonymous" for public servers.
    pub username: String,

    /// Password, typically an email address for anonymous access.
    pub password: String,

    /// Remote directory to list, relative to the server root.
    pub path: String,
}

impl FtpEndpoint {
    /// Anonymous endpoint for `host`, listing `path`.
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 21,
            username: "anonymous".to_string(),
            password: "user@example.com".to_string(),
            path: path.into(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parsed FTP LIST line. Only the fields the connector needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpListEntry {
    pub name: String,
    pub is_directory: bool,
}

impl FtpListEntry {
    /// Parse a Unix-style LIST line, e.g.
    /// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 pubmed26n0001.xml.gz`.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return None;
        }

        Some(Self {
            name: parts.last()?.to_string(),
            is_directory: parts[0].starts_with('d'),
        })
    }
}

/// Open a session: connect, extended passive mode, login, binary transfers.
fn open_session(endpoint: &FtpEndpoint) -> Result<FtpStream, SourceError> {
    debug!("Connecting to FTP server: {}", endpoint.addr());

    let mut ftp = FtpStream::connect(endpoint.addr())
        .map_err(|e| SourceError::Connection(format!("connect {}: {}", endpoint.addr(), e)))?;

    // Extended passive mode behaves better behind NAT/containers.
    ftp.set_mode(suppaftp::Mode::ExtendedPassive);

    ftp.login(&endpoint.username, &endpoint.password)
        .map_err(|e| SourceError::Connection(format!("login: {}", e)))?;

    ftp.transfer_type(suppaftp::types::FileType::Binary)
        .map_err(|e| SourceError::Connection(format!("binary mode: {}", e)))?;

    Ok(ftp)
}

fn quit(mut ftp: FtpStream) {
    if let Err(e) = ftp.quit() {
        warn!("Failed to quit FTP session gracefully: {}", e);
    }
}

/// List the configured remote directory, verifying that the working
/// directory after `cwd` really is the configured path.
pub(crate) fn list_names(endpoint: &FtpEndpoint) -> Result<Vec<String>, SourceError> {
    let mut ftp = open_session(endpoint)?;

    ftp.cwd(&endpoint.path)
        .map_err(|e| SourceError::Connection(format!("cwd {}: {}", endpoint.path, e)))?;

    let pwd = ftp
        .pwd()
        .map_err(|e| SourceError::Connection(format!("pwd: {}", e)))?;
    if pwd.trim_start_matches('/') != endpoint.path.trim_start_matches('/') {
        quit(ftp);
        return Err(SourceError::PathMismatch {
            expected: endpoint.path.clone(),
            actual: pwd,
        });
    }

    debug!("Listing directory: {}", endpoint.path);
    let lines = ftp
        .list(None)
        .map_err(|e| SourceError::Connection(format!("list: {}", e)))?;
    quit(ftp);

    Ok(lines
        .iter()
        .filter_map(|line| FtpListEntry::parse(line))
        .filter(|e| !e.is_directory)
        .map(|e| e.name)
        .collect())
}

/// Stream one remote file into `dest` over a fresh session.
pub(crate) fn fetch_to_path(
    endpoint: &FtpEndpoint,
    name: &str,
    dest: &Path,
) -> Result<(), SourceError> {
    let mut ftp = open_session(endpoint)?;

    ftp.cwd(&endpoint.path)
        .map_err(|e| SourceError::Connection(format!("cwd {}: {}", endpoint.path, e)))?;

    debug!("Retrieving file: {}", name);
    let mut reader = ftp
        .retr_as_buffer(name)
        .map_err(|e| SourceError::fetch(name, e))?;

    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| SourceError::fetch(name, e))?;
    quit(ftp);

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, &data).map_err(|e| SourceError::fetch(name, e))?;

    debug!("Wrote {} bytes to {:?}", data.len(), dest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_entry() {
        let entry =
            FtpListEntry::parse("-rw-r--r--   1 ftp ftp  123456 Jan 15 12:00 pubmed26n0001.xml.gz")
                .unwrap();
        assert_eq!(entry.name, "pubmed26n0001.xml.gz");
        assert!(!entry.is_directory);
    }

    #[test]
    fn test_parse_directory_entry() {
        let entry =
            FtpListEntry::parse("drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 updatefiles").unwrap();
        assert_eq!(entry.name, "updatefiles");
        assert!(entry.is_directory);
    }

    #[test]
    fn test_parse_empty_line() {
        assert!(FtpListEntry::parse("").is_none());
        assert!(FtpListEntry::parse("   ").is_none());
    }

    #[test]
    fn test_endpoint_defaults() {
        let ep = FtpEndpoint::new("ftp.ncbi.nlm.nih.gov", "pubmed/baseline");
        assert_eq!(ep.port, 21);
        assert_eq!(ep.username, "anonymous");
        assert_eq!(ep.addr(), "ftp.ncbi.nlm.nih.gov:21");
    }
}
