//! Document index abstraction.
//!
//! The [`DocumentIndex`] trait is the only contract the pipeline and the
//! query path have with the vector store. A request is either a filtered
//! nearest-neighbour query or a filtered, sorted scroll with continuation
//! tokens; both are expressed with the backend-neutral types in this module
//! and translated by each backend.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`elastic::ElasticIndex`] | Elasticsearch over HTTP (`_bulk`, `knn`, `search_after`) |
//! | [`memory::InMemoryIndex`] | Brute-force, process-local; tests and dry runs |

pub mod elastic;
pub mod memory;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;
use thiserror::Error;

use crate::models::IndexDocument;

/// Errors reported by an index backend.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index unreachable: {0}")]
    Unreachable(String),
    #[error("index rejected credentials: {0}")]
    Auth(String),
    #[error("index returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected index response: {0}")]
    Decode(String),
    #[error("invalid page token")]
    InvalidPageToken,
}

/// Exact-match value for a [`Condition::Match`].
#[derive(Debug, Clone, PartialEq)]
pub enum MatchValue {
    Text(String),
    Bool(bool),
}

/// One clause of a conjunctive payload filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals `value`; for array fields, any element equals it.
    Match { key: String, value: MatchValue },
    /// Inclusive numeric range; open ends are `None`.
    Range {
        key: String,
        gte: Option<i64>,
        lte: Option<i64>,
    },
}

/// All clauses must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub must: Vec<Condition>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Evaluate the filter against a JSON payload.
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|c| condition_matches(c, payload))
    }
}

fn condition_matches(condition: &Condition, payload: &Value) -> bool {
    match condition {
        Condition::Match { key, value } => {
            let field = match payload.get(key) {
                Some(f) => f,
                None => return false,
            };
            let eq = |v: &Value| match value {
                MatchValue::Text(t) => v.as_str() == Some(t.as_str()),
                MatchValue::Bool(b) => v.as_bool() == Some(*b),
            };
            match field {
                Value::Array(items) => items.iter().any(eq),
                other => eq(other),
            }
        }
        Condition::Range { key, gte, lte } => {
            let n = match payload.get(key).and_then(|v| v.as_i64()) {
                Some(n) => n,
                None => return false,
            };
            gte.map_or(true, |g| n >= g) && lte.map_or(true, |l| n <= l)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Scroll ordering: a numeric payload field, ties broken by document id.
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub key: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearestQuery {
    pub vector: Vec<f32>,
    pub filter: Filter,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollQuery {
    pub filter: Filter,
    pub sort: Sort,
    pub page_size: usize,
    /// Token from the previous page; `None` starts from the beginning.
    pub page_token: Option<String>,
}

/// A structured read request against the index.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRequest {
    /// Ranked by descending similarity to `vector`.
    Nearest(NearestQuery),
    /// Metadata-only, sorted, paginated.
    Scroll(ScrollQuery),
}

impl QueryRequest {
    pub fn filter(&self) -> &Filter {
        match self {
            QueryRequest::Nearest(q) => &q.filter,
            QueryRequest::Scroll(q) => &q.filter,
        }
    }

    pub fn vector(&self) -> Option<&[f32]> {
        match self {
            QueryRequest::Nearest(q) => Some(&q.vector),
            QueryRequest::Scroll(_) => None,
        }
    }
}

/// One returned document.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    /// Similarity score; `None` for scroll results.
    pub score: Option<f32>,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub hits: Vec<Hit>,
    /// Pass back in [`ScrollQuery::page_token`] for the next page; `None`
    /// when there are no more results.
    pub next_page_token: Option<String>,
}

/// A document the index refused during a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct DocFailure {
    pub doc_id: String,
    pub reason: String,
}

/// Outcome of one bulk upsert. Successes are committed even when some
/// documents fail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub written: usize,
    pub failed: Vec<DocFailure>,
}

/// Abstract destination index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ping`](DocumentIndex::ping) | Liveness check before a run |
/// | [`ensure_index`](DocumentIndex::ensure_index) | Create the index and mapping if absent |
/// | [`bulk_upsert`](DocumentIndex::bulk_upsert) | Create-or-replace documents by id |
/// | [`query`](DocumentIndex::query) | Nearest-neighbour or scroll request |
/// | [`count`](DocumentIndex::count) | Number of indexed documents |
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Human-readable location, for messages.
    fn describe(&self) -> String;

    async fn ping(&self) -> Result<(), IndexError>;

    /// Idempotent. Returns `true` if the index was created by this call.
    async fn ensure_index(&self, dims: usize) -> Result<bool, IndexError>;

    async fn bulk_upsert(&self, docs: &[IndexDocument]) -> Result<BulkReport, IndexError>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, IndexError>;

    async fn count(&self) -> Result<u64, IndexError>;
}

/// Encode scroll position values as an opaque token.
pub fn encode_page_token(values: &[Value]) -> String {
    let json = Value::Array(values.to_vec()).to_string();
    URL_SAFE_NO_PAD.encode(json.as_bytes())
}

/// Decode a token produced by [`encode_page_token`].
pub fn decode_page_token(token: &str) -> Result<Vec<Value>, IndexError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| IndexError::InvalidPageToken)?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Array(values)) => Ok(values),
        _ => Err(IndexError::InvalidPageToken),
    }
}
