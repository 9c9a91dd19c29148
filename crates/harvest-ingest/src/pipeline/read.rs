//! One logical read: an HTTP request plus parse, with bounded retry.
//!
//! Transient overload (503) responses are retried with linear backoff and a
//! hard attempt cap; the cap'd failure is terminal for that read only.
//! Not-found responses are skips. An empty parse result is a validation
//! skip, not an error and never retried.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ReadError;

/// Maximum attempts for a read that keeps hitting transient overload.
pub const DEFAULT_RETRY_LIMIT: u32 = 10;

/// One logical read request.
#[derive(Debug, Clone)]
pub struct ReadQuery {
    pub url: String,
    pub method: Method,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,

    /// Caller-supplied timeout; expiry is an ordinary read failure, not a
    /// retryable overload.
    pub timeout: Option<Duration>,
}

impl ReadQuery {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            body: None,
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            body: Some(body),
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Turns a response body into zero or more documents. An empty result marks
/// the read as invalid and it is skipped.
pub trait RecordParser: Send + Sync {
    fn parse(&self, body: &str) -> Vec<Value>;
}

impl<F> RecordParser for F
where
    F: Fn(&str) -> Vec<Value> + Send + Sync,
{
    fn parse(&self, body: &str) -> Vec<Value> {
        self(body)
    }
}

/// Parser for JSON bodies: an array becomes individual documents, an object
/// becomes one document, anything else (or malformed JSON) parses to
/// nothing.
pub struct JsonDocs;

impl RecordParser for JsonDocs {
    fn parse(&self, body: &str) -> Vec<Value> {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(items)) => items,
            Ok(obj @ Value::Object(_)) => vec![obj],
            Ok(_) | Err(_) => Vec::new(),
        }
    }
}

/// Why a read produced no records without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    EmptyParse,
}

/// Terminal result of one logical read.
#[derive(Debug)]
pub enum ReadOutcome {
    Accepted(Vec<Value>),
    Skipped(SkipReason),
    Failed(ReadError),
}

/// Backoff before the retry after failed attempt `attempt` (1-based): one
/// full unit after the first attempt, then 0.25 × attempt units.
pub(crate) fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    if attempt <= 1 {
        unit
    } else {
        unit.mul_f64(0.25 * attempt as f64)
    }
}

/// Drive one read through the retry state machine.
pub(crate) async fn execute(
    client: &Client,
    parser: &dyn RecordParser,
    query: &ReadQuery,
    retry_limit: u32,
    retry_unit: Duration,
    run_id: &str,
) -> ReadOutcome {
    let retry_limit = retry_limit.max(1);

    for attempt in 1..=retry_limit {
        let mut request = client.request(query.method.clone(), &query.url);
        if let Some(body) = &query.body {
            request = request.json(body);
        }
        for (name, value) in &query.headers {
            request = request.header(name, value);
        }
        if let Some(timeout) = query.timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!("[{}] read timed out: {}", run_id, query.url);
                return ReadOutcome::Failed(ReadError::Timeout {
                    url: query.url.clone(),
                });
            },
            Err(e) => {
                warn!("[{}] read error for {}: {}", run_id, query.url, e);
                return ReadOutcome::Failed(ReadError::Other {
                    reason: e.to_string(),
                });
            },
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!("[{}] not found, skipping: {}", run_id, query.url);
            return ReadOutcome::Skipped(SkipReason::NotFound);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            if attempt == retry_limit {
                warn!("[{}] too many retries: {}", run_id, query.url);
                return ReadOutcome::Failed(ReadError::RetryExhausted {
                    attempts: retry_limit,
                    last_status: status.as_u16(),
                });
            }
            let delay = backoff_delay(retry_unit, attempt);
            debug!(
                "[{}] overloaded (attempt {}), retrying in {:?}: {}",
                run_id, attempt, delay, query.url
            );
            tokio::time::sleep(delay).await;
            continue;
        }
        if status.is_client_error() || status.is_server_error() {
            return ReadOutcome::Failed(ReadError::Other {
                reason: format!("status {}", status),
            });
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return ReadOutcome::Failed(ReadError::Other {
                    reason: format!("missing_body: {}", e),
                });
            },
        };

        let mut docs = parser.parse(&body);
        docs.retain(|doc| !matches!(doc, Value::Object(map) if map.is_empty()));
        return if docs.is_empty() {
            ReadOutcome::Skipped(SkipReason::EmptyParse)
        } else {
            ReadOutcome::Accepted(docs)
        };
    }

    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_first_retry_is_one_unit() {
        let unit = Duration::from_secs(1);
        assert_eq!(backoff_delay(unit, 1), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_scales_linearly_after_first() {
        let unit = Duration::from_secs(1);
        assert_eq!(backoff_delay(unit, 2), Duration::from_millis(500));
        assert_eq!(backoff_delay(unit, 4), Duration::from_secs(1));
        assert_eq!(backoff_delay(unit, 8), Duration::from_secs(2));
    }

    #[test]
    fn test_json_docs_parser() {
        let parser = JsonDocs;
        assert_eq!(parser.parse(r#"[{"a":1},{"b":2}]"#).len(), 2);
        assert_eq!(parser.parse(r#"{"a":1}"#).len(), 1);
        assert!(parser.parse("null").is_empty());
        assert!(parser.parse("not json").is_empty());
    }

    #[test]
    fn test_closure_parser() {
        let parser = |body: &str| -> Vec<Value> {
            body.lines()
                .map(|l| serde_json::json!({ "line": l }))
                .collect()
        };
        assert_eq!(parser.parse("a\nb").len(), 2);
    }

    #[test]
    fn test_query_builders() {
        let q = ReadQuery::get("http://example.org/doc")
            .with_header("Accept", "application/json")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(q.method, Method::GET);
        assert_eq!(q.headers.len(), 1);
        assert_eq!(q.timeout, Some(Duration::from_secs(5)));
    }
}
