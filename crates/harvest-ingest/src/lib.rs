//! Harvest Ingest Library
//!
//! Acquires large remote datasets and streams them into a CouchDB-style
//! document store via size-bounded bulk writes.
//!
//! Two source shapes are supported behind one connector interface:
//!
//! - **Listing**: an FTP directory of independently fetchable files
//!   (typically gzip-compressed), enumerated and downloaded one session per
//!   fetch.
//! - **Archive**: a single zip container fetched over HTTP, with members
//!   extracted on demand to disk or to memory.
//!
//! Downstream, the [`pipeline::IngestionPipeline`] drives many logical HTTP
//! reads under a bounded worker count, batches the parsed records, retries
//! transient overload responses with linear backoff, and flushes buckets to
//! the [`bulk::BulkWriter`].
//!
//! # Example
//!
//! ```no_run
//! use harvest_ingest::source::{SourceConfig, SourceConnector};
//! use harvest_ingest::source::ftp::FtpEndpoint;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let endpoint = FtpEndpoint::new("ftp.ncbi.nlm.nih.gov", "pubmed/baseline");
//!     let mut connector = SourceConnector::listing(endpoint, SourceConfig::default());
//!     connector.list().await?;
//!     let c = &connector;
//!     c.for_each(2, |entry| async move {
//!         c.fetch_one(entry).await?;
//!         c.decompress_one(entry).await?;
//!         Ok(())
//!     })
//!     .await?;
//!     connector.cleanup_all().await?;
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod error;
pub mod lines;
pub mod pipeline;
pub mod source;
pub mod xml;

pub use bulk::{BulkWriter, WriteOutcome};
pub use error::{ReadError, SourceError, WriteError};
pub use pipeline::{IngestionPipeline, PipelineOptions, ReadQuery, RunSummary};
pub use source::{SourceConfig, SourceConnector};
