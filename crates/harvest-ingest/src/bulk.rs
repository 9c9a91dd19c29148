//! Bulk document writes against a CouchDB-style store.
//!
//! Saves go through `_bulk_docs` in fixed-size chunks with a bounded number
//! of chunks in flight. Per-document results are tallied by reason rather
//! than raised; a chunk-level transport failure is recorded but does not
//! cancel sibling chunks, so the caller always gets tallies for the work
//! that did complete.

use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::error::WriteError;

/// Reason key for successfully written documents.
pub const OK_REASON: &str = "ok";

/// Documents per `_bulk_docs` request.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Chunk requests in flight at once.
pub const DEFAULT_PARALLELISM: usize = 5;

/// Keys per `_all_docs` revision lookup request.
const LOOKUP_CHUNK_SIZE: usize = 10_000;

/// Per-reason tallies for one bulk operation. `ok` counts acknowledged
/// writes; everything else lands in `reasons` keyed by the store's reason
/// string (e.g. "conflict").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub ok: usize,
    pub reasons: BTreeMap<String, usize>,
}

impl WriteOutcome {
    pub fn merge(&mut self, other: &WriteOutcome) {
        self.ok += other.ok;
        for (reason, n) in &other.reasons {
            *self.reasons.entry(reason.clone()).or_insert(0) += n;
        }
    }

    /// Documents accounted for, written or not.
    pub fn total(&self) -> usize {
        self.ok + self.reasons.values().sum::<usize>()
    }
}

/// One row of a `_bulk_docs` response.
#[derive(Debug, Deserialize)]
struct DocResult {
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    key: String,
    #[serde(default)]
    value: Option<AllDocsValue>,
}

#[derive(Debug, Deserialize)]
struct AllDocsValue {
    rev: String,
}

/// Chunked, bounded-concurrency writer for one database.
pub struct BulkWriter {
    client: reqwest::Client,
    db_url: String,
    chunk_size: usize,
    parallelism: usize,
    silent: bool,
}

impl BulkWriter {
    /// Writer for the database at `db_url` (e.g. `http://127.0.0.1:5984/docs`).
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            db_url: db_url.into().trim_end_matches('/').to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            silent: false,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Suppress per-chunk result logging.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Write `docs` via `_bulk_docs`, `chunk_size` documents per request,
    /// `parallelism` requests in flight. All chunks are attempted; on any
    /// chunk-level transport failure the error carries the tallies of the
    /// chunks that completed.
    pub async fn save(&self, docs: Vec<Value>) -> Result<WriteOutcome, WriteError> {
        if docs.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let url = format!("{}/_bulk_docs", self.db_url);
        let chunks = split_chunks(docs, self.chunk_size);
        debug!("Saving {} chunk(s) to {}", chunks.len(), url);

        let mut results = stream::iter(chunks.into_iter().map(|chunk| {
            let client = &self.client;
            let url = &url;
            async move {
                let size = chunk.len();
                let response = client
                    .post(url)
                    .json(&serde_json::json!({ "docs": chunk }))
                    .send()
                    .await
                    .map_err(|e| (size, e.to_string()))?;

                if !response.status().is_success() {
                    return Err((size, format!("status {}", response.status())));
                }
                response
                    .json::<Vec<DocResult>>()
                    .await
                    .map_err(|e| (size, format!("malformed response: {}", e)))
            }
        }))
        .buffer_unordered(self.parallelism);

        let mut outcome = WriteOutcome::default();
        let mut first_err: Option<String> = None;

        while let Some(result) = results.next().await {
            match result {
                Ok(rows) => {
                    let chunk_outcome = tally(&rows);
                    if !self.silent {
                        info!(
                            "Bulk save: {} ok, {} rejected",
                            chunk_outcome.ok,
                            chunk_outcome.total() - chunk_outcome.ok
                        );
                        for (reason, n) in &chunk_outcome.reasons {
                            warn!("Bulk save rejection: {} x{}", reason, n);
                        }
                    }
                    outcome.merge(&chunk_outcome);
                },
                Err((size, reason)) => {
                    warn!("Bulk save chunk of {} docs failed: {}", size, reason);
                    first_err.get_or_insert(reason);
                },
            }
        }

        match first_err {
            None => Ok(outcome),
            Some(reason) => Err(WriteError {
                reason,
                partial: outcome,
            }),
        }
    }

    /// Update existing documents: look up current revisions by `_id`, stamp
    /// them onto the documents and save. Documents without an `_id`, or
    /// whose id is not in the store, go through without a revision and the
    /// store reports them individually.
    pub async fn update(&self, docs: Vec<Value>) -> Result<WriteOutcome, WriteError> {
        let ids: Vec<String> = docs
            .iter()
            .filter_map(|doc| doc.get("_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let revs = self.lookup_revs(&ids).await?;

        let docs = docs
            .into_iter()
            .map(|mut doc| {
                let rev = doc
                    .get("_id")
                    .and_then(Value::as_str)
                    .and_then(|id| revs.get(id))
                    .cloned();
                if let (Some(rev), Some(map)) = (rev, doc.as_object_mut()) {
                    map.insert("_rev".to_string(), Value::String(rev));
                }
                doc
            })
            .collect();

        self.save(docs).await
    }

    /// Delete documents by id: revisions are looked up and deletion stubs
    /// saved. Ids unknown to the store are skipped silently.
    pub async fn remove(&self, ids: Vec<String>) -> Result<WriteOutcome, WriteError> {
        let revs = self.lookup_revs(&ids).await?;

        let stubs = ids
            .iter()
            .filter_map(|id| {
                revs.get(id).map(|rev| {
                    serde_json::json!({
                        "_id": id,
                        "_rev": rev,
                        "_deleted": true,
                    })
                })
            })
            .collect();

        self.save(stubs).await
    }

    /// Current revision per id, via chunked `_all_docs` key lookups. Missing
    /// ids simply have no entry in the result.
    async fn lookup_revs(&self, ids: &[String]) -> Result<HashMap<String, String>, WriteError> {
        let url = format!("{}/_all_docs", self.db_url);
        let mut revs = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(LOOKUP_CHUNK_SIZE) {
            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "keys": chunk }))
                .send()
                .await
                .map_err(|e| WriteError {
                    reason: e.to_string(),
                    partial: WriteOutcome::default(),
                })?;

            if !response.status().is_success() {
                return Err(WriteError {
                    reason: format!("status {}", response.status()),
                    partial: WriteOutcome::default(),
                });
            }

            let parsed: AllDocsResponse = response.json().await.map_err(|e| WriteError {
                reason: format!("malformed response: {}", e),
                partial: WriteOutcome::default(),
            })?;

            for row in parsed.rows {
                if let Some(value) = row.value {
                    revs.insert(row.key, value.rev);
                }
            }
        }

        Ok(revs)
    }
}

/// Strip non-ASCII characters from every string in the document, keys
/// excluded. Some upstream feeds embed control and multi-byte characters
/// that the store rejects.
pub fn clean_doc(value: &mut Value) {
    match value {
        Value::String(s) => {
            if !s.is_ascii() {
                *s = s.chars().filter(char::is_ascii).collect();
            }
        },
        Value::Array(items) => {
            for item in items {
                clean_doc(item);
            }
        },
        Value::Object(map) => {
            for item in map.values_mut() {
                clean_doc(item);
            }
        },
        _ => {},
    }
}

fn split_chunks(mut docs: Vec<Value>, chunk_size: usize) -> Vec<Vec<Value>> {
    let mut chunks = Vec::with_capacity(docs.len().div_ceil(chunk_size));
    while docs.len() > chunk_size {
        let rest = docs.split_off(chunk_size);
        chunks.push(docs);
        docs = rest;
    }
    chunks.push(docs);
    chunks
}

fn tally(rows: &[DocResult]) -> WriteOutcome {
    let mut outcome = WriteOutcome::default();
    for row in rows {
        if row.ok == Some(true) {
            outcome.ok += 1;
        } else {
            let reason = row
                .reason
                .clone()
                .or_else(|| row.error.clone())
                .unwrap_or_else(|| "error".to_string());
            *outcome.reasons.entry(reason).or_insert(0) += 1;
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_chunks() {
        let docs: Vec<Value> = (0..7).map(|i| json!({ "i": i })).collect();
        let chunks = split_chunks(docs, 3);
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        assert_eq!(chunks[0][0], json!({ "i": 0 }));
        assert_eq!(chunks[2][0], json!({ "i": 6 }));
    }

    #[test]
    fn test_split_chunks_exact_multiple() {
        let docs: Vec<Value> = (0..6).map(|i| json!({ "i": i })).collect();
        let chunks = split_chunks(docs, 3);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_tally_groups_by_reason() {
        let rows: Vec<DocResult> = serde_json::from_value(json!([
            { "ok": true, "id": "a", "rev": "1-x" },
            { "ok": true, "id": "b", "rev": "1-y" },
            { "id": "c", "error": "conflict", "reason": "Document update conflict." },
            { "id": "d", "error": "conflict", "reason": "Document update conflict." },
            { "id": "e", "error": "forbidden" },
        ]))
        .unwrap();

        let outcome = tally(&rows);
        assert_eq!(outcome.ok, 2);
        assert_eq!(outcome.reasons["Document update conflict."], 2);
        assert_eq!(outcome.reasons["forbidden"], 1);
        assert_eq!(outcome.total(), 5);
    }

    #[test]
    fn test_outcome_merge() {
        let mut a = WriteOutcome {
            ok: 2,
            reasons: BTreeMap::from([("conflict".to_string(), 1)]),
        };
        let b = WriteOutcome {
            ok: 1,
            reasons: BTreeMap::from([("conflict".to_string(), 2), ("forbidden".to_string(), 1)]),
        };
        a.merge(&b);
        assert_eq!(a.ok, 3);
        assert_eq!(a.reasons["conflict"], 3);
        assert_eq!(a.reasons["forbidden"], 1);
    }

    #[test]
    fn test_clean_doc_strips_non_ascii() {
        let mut doc = json!({
            "title": "héllo wörld",
            "nested": { "text": "plain" },
            "list": ["café", 42],
        });
        clean_doc(&mut doc);
        assert_eq!(doc["title"], "hllo wrld");
        assert_eq!(doc["nested"]["text"], "plain");
        assert_eq!(doc["list"][0], "caf");
        assert_eq!(doc["list"][1], 42);
    }

    #[tokio::test]
    async fn test_save_empty_is_noop() {
        let writer = BulkWriter::new("http://127.0.0.1:1/db");
        let outcome = writer.save(Vec::new()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::default());
    }
}
