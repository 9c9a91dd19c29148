//! Line-oriented access to decompressed artifacts.
//!
//! Feeds large files to callers one line at a time so a multi-gigabyte
//! artifact never has to sit in memory. [`MarkerAggregator`] reassembles
//! multi-line record units (e.g. one XML record spread over many lines)
//! from the line stream.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_stream::wrappers::LinesStream;

/// Buffered line reader over a file on disk.
pub struct LineStream {
    lines: Lines<BufReader<File>>,
}

impl LineStream {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }

    /// Next line, or `None` at end of file.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Adapt into a `Stream` of lines for combinator-style consumers.
    pub fn into_stream(self) -> LinesStream<BufReader<File>> {
        LinesStream::new(self.lines)
    }
}

/// Reassembles record units from lines using start/end text markers.
///
/// Accumulation begins at a line containing the start marker and ends at a
/// line containing the end marker, at which point the trimmed lines are
/// joined into one unit. Lines outside a unit, and end markers with no
/// preceding start marker, are dropped.
pub struct MarkerAggregator {
    start_marker: String,
    end_marker: String,
    pending: Vec<String>,
}

impl MarkerAggregator {
    pub fn new(start_marker: impl Into<String>, end_marker: impl Into<String>) -> Self {
        Self {
            start_marker: start_marker.into(),
            end_marker: end_marker.into(),
            pending: Vec::new(),
        }
    }

    /// Feed one line; returns a completed unit when this line closes one.
    pub fn feed(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.contains(&self.start_marker) {
            self.pending.clear();
            self.pending.push(line.to_string());
            None
        } else if line.contains(&self.end_marker) && !self.pending.is_empty() {
            self.pending.push(line.to_string());
            let unit = self.pending.join("");
            self.pending.clear();
            Some(unit)
        } else if !self.pending.is_empty() {
            self.pending.push(line.to_string());
            None
        } else {
            None
        }
    }

    /// Whether a unit is currently mid-accumulation.
    pub fn in_progress(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Read the whole file, returning every completed unit in order.
pub async fn aggregate_file(
    path: impl AsRef<Path>,
    aggregator: &mut MarkerAggregator,
) -> std::io::Result<Vec<String>> {
    let mut stream = LineStream::open(path).await?;
    let mut units = Vec::new();
    while let Some(line) = stream.next_line().await? {
        if let Some(unit) = aggregator.feed(&line) {
            units.push(unit);
        }
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_aggregates_one_unit() {
        let mut agg = MarkerAggregator::new("<Record>", "</Record>");
        assert_eq!(agg.feed("preamble"), None);
        assert_eq!(agg.feed("  <Record>"), None);
        assert!(agg.in_progress());
        assert_eq!(agg.feed("  <Field>x</Field>"), None);
        assert_eq!(
            agg.feed("  </Record>").as_deref(),
            Some("<Record><Field>x</Field></Record>")
        );
        assert!(!agg.in_progress());
    }

    #[test]
    fn test_stray_end_marker_is_dropped() {
        let mut agg = MarkerAggregator::new("<Record>", "</Record>");
        assert_eq!(agg.feed("</Record>"), None);
        assert!(!agg.in_progress());
    }

    #[test]
    fn test_restart_discards_partial_unit() {
        let mut agg = MarkerAggregator::new("<Record>", "</Record>");
        agg.feed("<Record>");
        agg.feed("<A/>");
        agg.feed("<Record>");
        assert_eq!(agg.feed("</Record>").as_deref(), Some("<Record></Record>"));
    }

    #[tokio::test]
    async fn test_aggregate_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("records.xml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "<Set>").unwrap();
        writeln!(file, "<Record>").unwrap();
        writeln!(file, "  <Id>1</Id>").unwrap();
        writeln!(file, "</Record>").unwrap();
        writeln!(file, "<Record>").unwrap();
        writeln!(file, "  <Id>2</Id>").unwrap();
        writeln!(file, "</Record>").unwrap();
        writeln!(file, "</Set>").unwrap();
        drop(file);

        let mut agg = MarkerAggregator::new("<Record>", "</Record>");
        let units = aggregate_file(&path, &mut agg).await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], "<Record><Id>1</Id></Record>");
        assert_eq!(units[1], "<Record><Id>2</Id></Record>");
    }

    #[tokio::test]
    async fn test_into_stream_feeds_combinators() {
        use tokio_stream::StreamExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lines.txt");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let stream = LineStream::open(&path).await.unwrap().into_stream();
        let upper: Vec<String> = stream
            .map(|line| line.unwrap().to_uppercase())
            .collect()
            .await;
        assert_eq!(upper, vec!["ONE", "TWO", "THREE"]);
    }

    #[tokio::test]
    async fn test_line_stream_reads_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lines.txt");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();

        let mut stream = LineStream::open(&path).await.unwrap();
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("alpha"));
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("beta"));
        assert_eq!(stream.next_line().await.unwrap(), None);
    }
}
