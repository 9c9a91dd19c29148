//! End-to-end tests for the ingestion pipeline against a mock store.
//!
//! These tests validate the full read-buffer-flush workflow including:
//! - Bucket-size flushing and the final drain
//! - Overload (503) retry with backoff and the attempt cap
//! - Not-found and empty-parse skips
//! - Per-reason write tallies and partial results on transport failure

use serde_json::{json, Value};
use std::time::Duration;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

use harvest_ingest::pipeline::{IngestionPipeline, JsonDocs, PipelineOptions, ReadQuery};
use harvest_ingest::BulkWriter;

/// `_bulk_docs` stand-in: acknowledges every document, except ids listed in
/// `conflicts`, which are rejected the way a revision clash would be.
struct BulkResponder {
    conflicts: Vec<String>,
}

impl BulkResponder {
    fn accepting() -> Self {
        Self {
            conflicts: Vec::new(),
        }
    }
}

impl Respond for BulkResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let docs = body["docs"].as_array().cloned().unwrap_or_default();
        let results: Vec<Value> = docs
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                let id = doc
                    .get("_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("generated-{}", i));
                if self.conflicts.contains(&id) {
                    json!({
                        "id": id,
                        "error": "conflict",
                        "reason": "Document update conflict."
                    })
                } else {
                    json!({ "ok": true, "id": id, "rev": "1-abc" })
                }
            })
            .collect();
        ResponseTemplate::new(201).set_body_json(results)
    }
}

/// `_all_docs` stand-in for revision lookups: every key resolves to rev
/// `3-xyz` unless it ends in `-missing`.
struct AllDocsResponder;

impl Respond for AllDocsResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let keys = body["keys"].as_array().cloned().unwrap_or_default();
        let rows: Vec<Value> = keys
            .iter()
            .filter_map(Value::as_str)
            .map(|key| {
                if key.ends_with("-missing") {
                    json!({ "key": key, "error": "not_found" })
                } else {
                    json!({ "id": key, "key": key, "value": { "rev": "3-xyz" } })
                }
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "rows": rows }))
    }
}

async fn mount_bulk_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(BulkResponder::accepting())
        .mount(server)
        .await;
}

async fn mount_doc(server: &MockServer, route: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn fast_options() -> PipelineOptions {
    PipelineOptions::default().with_retry_unit(Duration::from_millis(1))
}

fn pipeline_for(server: &MockServer, options: PipelineOptions) -> IngestionPipeline {
    let writer = BulkWriter::new(format!("{}/db", server.uri())).silent(true);
    IngestionPipeline::new(writer, JsonDocs, options)
}

fn bulk_docs_requests(requests: &[Request]) -> Vec<usize> {
    requests
        .iter()
        .filter(|r| r.url.path() == "/db/_bulk_docs")
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).unwrap();
            body["docs"].as_array().unwrap().len()
        })
        .collect()
}

#[tokio::test]
async fn test_bucket_flush_and_final_drain() {
    let server = MockServer::start().await;
    mount_bulk_ok(&server).await;
    for i in 1..=3 {
        mount_doc(&server, &format!("/read/{}", i), json!([{ "_id": format!("doc-{}", i) }]))
            .await;
    }

    let pipeline = pipeline_for(&server, fast_options().with_bucket_size(2));
    let queries = (1..=3)
        .map(|i| ReadQuery::get(format!("{}/read/{}", server.uri(), i)))
        .collect();
    let summary = pipeline.go(queries).await;

    assert_eq!(summary.reads, 3);
    assert_eq!(summary.flushes, 2);
    assert_eq!(summary.total_flushed, 3);
    assert_eq!(summary.total_saved, 3);
    assert!(summary.error.is_none());

    // One full bucket, then the drain with the remainder.
    let sizes = bulk_docs_requests(&server.received_requests().await.unwrap());
    assert_eq!(sizes, vec![2, 1]);
}

#[tokio::test]
async fn test_no_flush_when_nothing_accepted() {
    let server = MockServer::start().await;
    mount_bulk_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/read/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let pipeline = pipeline_for(&server, fast_options());
    let summary = pipeline
        .go(vec![ReadQuery::get(format!("{}/read/gone", server.uri()))])
        .await;

    assert_eq!(summary.reads, 1);
    assert_eq!(summary.skipped_not_found, 1);
    assert_eq!(summary.flushes, 0);
    assert!(summary.error.is_none());

    let sizes = bulk_docs_requests(&server.received_requests().await.unwrap());
    assert!(sizes.is_empty());
}

#[tokio::test]
async fn test_empty_parse_is_validation_skip() {
    let server = MockServer::start().await;
    mount_bulk_ok(&server).await;
    mount_doc(&server, "/read/empty", json!([])).await;
    mount_doc(&server, "/read/blank", json!([{}])).await;

    let pipeline = pipeline_for(&server, fast_options());
    let summary = pipeline
        .go(vec![
            ReadQuery::get(format!("{}/read/empty", server.uri())),
            ReadQuery::get(format!("{}/read/blank", server.uri())),
        ])
        .await;

    assert_eq!(summary.skipped_invalid, 2);
    assert_eq!(summary.flushes, 0);
    assert!(summary.error.is_none());
}

#[tokio::test]
async fn test_overload_retries_until_success() {
    let server = MockServer::start().await;
    mount_bulk_ok(&server).await;

    // Three 503s, then the real document.
    Mock::given(method("GET"))
        .and(path("/read/busy"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    mount_doc(&server, "/read/busy", json!([{ "_id": "doc-busy" }])).await;

    let pipeline = pipeline_for(&server, fast_options());
    let summary = pipeline
        .go(vec![ReadQuery::get(format!("{}/read/busy", server.uri()))])
        .await;

    assert_eq!(summary.total_saved, 1);
    assert!(summary.failures.is_empty());
    assert!(summary.error.is_none());

    let reads = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/read/busy")
        .count();
    assert_eq!(reads, 4);
}

#[tokio::test]
async fn test_overload_exhausts_at_attempt_cap() {
    let server = MockServer::start().await;
    mount_bulk_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/read/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let pipeline = pipeline_for(&server, fast_options());
    let summary = pipeline
        .go(vec![ReadQuery::get(format!("{}/read/down", server.uri()))])
        .await;

    assert_eq!(summary.failures.get("too_many_retries"), Some(&1));
    assert_eq!(summary.total_saved, 0);
    assert!(summary.error.as_deref().unwrap().contains("too_many_retries"));

    // Exactly ten attempts, never an eleventh.
    let reads = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/read/down")
        .count();
    assert_eq!(reads, 10);
}

#[tokio::test]
async fn test_timed_out_read_fails_without_retrying() {
    let server = MockServer::start().await;
    mount_bulk_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/read/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "_id": "doc-slow" }]))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let pipeline = pipeline_for(&server, fast_options());
    let query = ReadQuery::get(format!("{}/read/slow", server.uri()))
        .with_timeout(Duration::from_millis(50));
    let summary = pipeline.go(vec![query]).await;

    // Timeout takes the plain-failure branch, not the overload-retry branch.
    assert_eq!(summary.failures.get("timeout"), Some(&1));
    assert_eq!(summary.total_saved, 0);
    assert!(summary.error.is_some());

    let reads = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/read/slow")
        .count();
    assert_eq!(reads, 1);
}

#[tokio::test]
async fn test_one_failed_read_does_not_abort_batch() {
    let server = MockServer::start().await;
    mount_bulk_ok(&server).await;
    mount_doc(&server, "/read/good", json!([{ "_id": "doc-good" }])).await;
    Mock::given(method("GET"))
        .and(path("/read/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let pipeline = pipeline_for(&server, fast_options().with_threads(2));
    let summary = pipeline
        .go(vec![
            ReadQuery::get(format!("{}/read/broken", server.uri())),
            ReadQuery::get(format!("{}/read/good", server.uri())),
        ])
        .await;

    assert_eq!(summary.reads, 2);
    assert_eq!(summary.total_saved, 1);
    assert_eq!(summary.failures.get("read_error"), Some(&1));
    assert!(summary.error.is_some());
}

#[tokio::test]
async fn test_write_conflicts_are_tallied_not_raised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(BulkResponder {
            conflicts: vec!["doc-2".to_string()],
        })
        .mount(&server)
        .await;
    for i in 1..=3 {
        mount_doc(&server, &format!("/read/{}", i), json!([{ "_id": format!("doc-{}", i) }]))
            .await;
    }

    let pipeline = pipeline_for(&server, fast_options().with_bucket_size(3));
    let queries = (1..=3)
        .map(|i| ReadQuery::get(format!("{}/read/{}", server.uri(), i)))
        .collect();
    let summary = pipeline.go(queries).await;

    assert_eq!(summary.total_saved, 2);
    assert_eq!(
        summary.write_reasons.get("Document update conflict."),
        Some(&1)
    );
    assert!(summary.error.is_none());
}

#[tokio::test]
async fn test_chunk_transport_failure_keeps_partial_tallies() {
    let server = MockServer::start().await;

    // First chunk request dies at the transport level, the rest succeed.
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_bulk_ok(&server).await;

    let writer = BulkWriter::new(format!("{}/db", server.uri()))
        .with_chunk_size(1)
        .with_parallelism(1)
        .silent(true);
    let docs = vec![json!({ "_id": "doc-1" }), json!({ "_id": "doc-2" })];

    let err = writer.save(docs).await.unwrap_err();
    assert!(err.reason.contains("500"));
    assert_eq!(err.partial.ok, 1);

    // Both chunks were attempted despite the failure.
    let sizes = bulk_docs_requests(&server.received_requests().await.unwrap());
    assert_eq!(sizes, vec![1, 1]);
}

#[tokio::test]
async fn test_update_stamps_current_revisions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/_all_docs"))
        .respond_with(AllDocsResponder)
        .mount(&server)
        .await;
    mount_bulk_ok(&server).await;

    let writer = BulkWriter::new(format!("{}/db", server.uri())).silent(true);
    let outcome = writer
        .update(vec![
            json!({ "_id": "doc-1", "field": "new" }),
            json!({ "_id": "doc-missing", "field": "new" }),
        ])
        .await
        .unwrap();
    assert_eq!(outcome.ok, 2);

    let requests = server.received_requests().await.unwrap();
    let bulk_body: Value = requests
        .iter()
        .find(|r| r.url.path() == "/db/_bulk_docs")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .unwrap();
    let docs = bulk_body["docs"].as_array().unwrap();
    assert_eq!(docs[0]["_rev"], "3-xyz");
    // Unknown ids go through without a revision.
    assert!(docs[1].get("_rev").is_none());
}

#[tokio::test]
async fn test_remove_saves_deletion_stubs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/_all_docs"))
        .respond_with(AllDocsResponder)
        .mount(&server)
        .await;
    mount_bulk_ok(&server).await;

    let writer = BulkWriter::new(format!("{}/db", server.uri())).silent(true);
    let outcome = writer
        .remove(vec!["doc-1".to_string(), "doc-missing".to_string()])
        .await
        .unwrap();

    // The missing id has no revision to delete, so only one stub is saved.
    assert_eq!(outcome.ok, 1);

    let requests = server.received_requests().await.unwrap();
    let bulk_body: Value = requests
        .iter()
        .find(|r| r.url.path() == "/db/_bulk_docs")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .unwrap();
    let docs = bulk_body["docs"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["_id"], "doc-1");
    assert_eq!(docs[0]["_deleted"], true);
}

#[tokio::test]
async fn test_save_outcome_accounts_for_every_doc() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(BulkResponder {
            conflicts: vec!["doc-3".to_string(), "doc-7".to_string()],
        })
        .mount(&server)
        .await;

    let writer = BulkWriter::new(format!("{}/db", server.uri()))
        .with_chunk_size(4)
        .silent(true);
    let docs: Vec<Value> = (1..=10).map(|i| json!({ "_id": format!("doc-{}", i) })).collect();

    let outcome = writer.save(docs).await.unwrap();
    assert_eq!(outcome.ok, 8);
    assert_eq!(outcome.reasons.get("Document update conflict."), Some(&2));
    assert_eq!(outcome.total(), 10);
}
