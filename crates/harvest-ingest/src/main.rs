//! Harvest - remote dataset acquisition tool

use anyhow::Result;
use clap::Parser;
use harvest_common::logging::{init_logging, LogConfig, LogLevel};
use harvest_ingest::source::{
    ArchiveEndpoint, Extracted, FtpEndpoint, SourceConfig, SourceConnector,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(author, version, about = "Remote dataset acquisition tool")]
struct Cli {
    /// Remote source to acquire
    #[command(subcommand)]
    source: Source,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Source {
    /// Fetch and decompress files from an FTP directory listing
    Listing {
        /// FTP server hostname
        #[arg(long)]
        host: String,

        /// FTP server port
        #[arg(long, default_value_t = 21)]
        port: u16,

        /// Remote directory to list
        #[arg(long)]
        path: String,

        /// FTP username
        #[arg(long, default_value = "anonymous")]
        user: String,

        /// FTP password
        #[arg(long, default_value = "user@example.com", env = "HARVEST_FTP_PASSWORD")]
        password: String,

        /// Local working directory
        #[arg(short, long, default_value = "./data")]
        tmp_dir: PathBuf,

        /// Only acquire the first N files
        #[arg(short, long)]
        limit: Option<usize>,

        /// Concurrent fetches
        #[arg(short, long, default_value_t = 1)]
        concurrency: usize,

        /// Keep local artifacts instead of cleaning up
        #[arg(long)]
        keep: bool,
    },

    /// Download a zip archive over HTTP and extract its members
    Archive {
        /// Archive URL
        #[arg(long)]
        url: String,

        /// Local file name for the downloaded archive
        #[arg(long)]
        file_name: String,

        /// Local working directory
        #[arg(short, long, default_value = "./data")]
        tmp_dir: PathBuf,

        /// Only extract the first N members
        #[arg(short, long)]
        limit: Option<usize>,

        /// Concurrent extractions
        #[arg(short, long, default_value_t = 1)]
        concurrency: usize,

        /// Keep local artifacts instead of cleaning up
        #[arg(long)]
        keep: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("harvest".to_string())
        .build();

    // Merge with environment variables (they take precedence)
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    match cli.source {
        Source::Listing {
            host,
            port,
            path,
            user,
            password,
            tmp_dir,
            limit,
            concurrency,
            keep,
        } => {
            info!("Acquiring FTP listing from {}/{}", host, path);
            let endpoint = FtpEndpoint::new(host, path)
                .with_port(port)
                .with_credentials(user, password);
            let config = source_config(tmp_dir, limit, concurrency);
            let mut connector = SourceConnector::listing(endpoint, config);
            acquire(&mut connector, concurrency, keep).await?;
        },
        Source::Archive {
            url,
            file_name,
            tmp_dir,
            limit,
            concurrency,
            keep,
        } => {
            info!("Acquiring archive from {}", url);
            let endpoint = ArchiveEndpoint::new(url, file_name);
            let config = source_config(tmp_dir, limit, concurrency);
            let mut connector = SourceConnector::archive(endpoint, config);
            acquire(&mut connector, concurrency, keep).await?;
        },
    }

    info!("Acquisition complete");
    Ok(())
}

fn source_config(tmp_dir: PathBuf, limit: Option<usize>, concurrency: usize) -> SourceConfig {
    let mut config = SourceConfig::new()
        .with_tmp_dir(tmp_dir)
        .with_concurrency(concurrency);
    if let Some(limit) = limit {
        config = config.with_max_entries(limit);
    }
    config
}

/// List, fetch and decompress every entry, then clean up unless asked not to.
async fn acquire(
    connector: &mut SourceConnector,
    concurrency: usize,
    keep: bool,
) -> Result<()> {
    let entries = connector.list().await?;
    info!("{} entries to acquire", entries.len());

    let c = &*connector;
    c.for_each(concurrency, |entry| async move {
        c.fetch_one(entry).await?;
        match c.decompress_one(entry).await? {
            Extracted::File(path) => info!("Acquired {} -> {:?}", entry.name(), path),
            Extracted::Inline(content) => {
                info!("Acquired {} ({} bytes in memory)", entry.name(), content.len())
            },
            Extracted::Skipped => info!("Acquired {} (stored as-is)", entry.name()),
        }
        Ok(())
    })
    .await?;

    let done = connector
        .entries()
        .iter()
        .filter(|e| e.is_decompressed())
        .count();
    info!("{} entries acquired", done);

    if keep {
        info!("Keeping local artifacts");
    } else {
        connector.cleanup_all().await?;
        info!("Cleaned up local artifacts");
    }
    Ok(())
}
