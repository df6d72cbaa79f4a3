//! Elasticsearch backend over its REST API.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | ping | `GET /` |
//! | ensure index | `HEAD /{index}`, then `PUT /{index}` with the mapping |
//! | bulk upsert | `POST /_bulk?refresh=true` (NDJSON `index` actions) |
//! | nearest / scroll | `POST /{index}/_search` (`knn` or `sort` + `search_after`) |
//! | count | `GET /{index}/_count` |
//!
//! Scroll pages fetch one extra hit to decide whether another page exists;
//! the continuation token wraps the last returned hit's `sort` values.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    decode_page_token, encode_page_token, BulkReport, Condition, DocFailure, DocumentIndex,
    Filter, Hit, IndexError, MatchValue, NearestQuery, QueryPage, QueryRequest, ScrollQuery,
    SortOrder,
};
use crate::config::{Config, IndexConfig};
use crate::models::IndexDocument;

/// Field used to break ties between documents with equal sort keys.
const TIEBREAK_FIELD: &str = "chunk_id";

pub struct ElasticIndex {
    base_url: String,
    index: String,
    vector_field: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ElasticIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                anyhow::anyhow!("index.api_key_env is set but {} is not in the environment", var)
            })?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.name.clone(),
            vector_field: config.vector_field.clone(),
            api_key,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let rb = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.api_key {
            Some(key) => rb.header("Authorization", format!("ApiKey {}", key)),
            None => rb,
        }
    }

    async fn send(&self, rb: RequestBuilder) -> Result<reqwest::Response, IndexError> {
        let response = rb.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                IndexError::Unreachable(format!("{}: {}", self.base_url, e))
            } else {
                IndexError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Auth(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }

    async fn send_json(&self, rb: RequestBuilder) -> Result<Value, IndexError> {
        let response = self.send(rb).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| IndexError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DocumentIndex for ElasticIndex {
    fn describe(&self) -> String {
        format!("{}/{}", self.base_url, self.index)
    }

    async fn ping(&self) -> Result<(), IndexError> {
        self.send_json(self.request(Method::GET, "/")).await.map(|_| ())
    }

    async fn ensure_index(&self, dims: usize) -> Result<bool, IndexError> {
        let head = self.send(self.request(Method::HEAD, &self.index)).await?;
        match head.status() {
            s if s.is_success() => return Ok(false),
            StatusCode::NOT_FOUND => {}
            other => {
                return Err(IndexError::Rejected {
                    status: other.as_u16(),
                    body: String::new(),
                })
            }
        }

        let mapping = index_mapping(&self.vector_field, dims);
        match self
            .send_json(self.request(Method::PUT, &self.index).json(&mapping))
            .await
        {
            Ok(_) => Ok(true),
            Err(IndexError::Rejected { status: 400, body })
                if body.contains("resource_already_exists_exception") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn bulk_upsert(&self, docs: &[IndexDocument]) -> Result<BulkReport, IndexError> {
        if docs.is_empty() {
            return Ok(BulkReport::default());
        }

        let body = bulk_body(&self.index, &self.vector_field, docs);
        let json = self
            .send_json(
                self.request(Method::POST, "/_bulk?refresh=true")
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        parse_bulk_response(&json)
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, IndexError> {
        let path = format!("{}/_search", self.index);
        match request {
            QueryRequest::Nearest(q) => {
                let body = nearest_body(&self.vector_field, q);
                let json = self.send_json(self.request(Method::POST, &path).json(&body)).await?;
                let (hits, _) = parse_hits(&json)?;
                Ok(QueryPage {
                    hits,
                    next_page_token: None,
                })
            }
            QueryRequest::Scroll(q) => {
                let body = scroll_body(&self.vector_field, q)?;
                let json = self.send_json(self.request(Method::POST, &path).json(&body)).await?;
                let (mut hits, mut sorts) = parse_hits(&json)?;

                let has_more = hits.len() > q.page_size;
                hits.truncate(q.page_size);
                sorts.truncate(q.page_size);

                let next_page_token = if has_more {
                    sorts.last().map(|values| encode_page_token(values))
                } else {
                    None
                };
                Ok(QueryPage {
                    hits,
                    next_page_token,
                })
            }
        }
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let json = self
            .send_json(self.request(Method::GET, &format!("{}/_count", self.index)))
            .await?;
        json.get("count")
            .and_then(|c| c.as_u64())
            .ok_or_else(|| IndexError::Decode("missing count".to_string()))
    }
}

/// `imsg-lens init`: create the index and mapping if they do not exist.
pub async fn run_init(config: &Config) -> Result<()> {
    let index = ElasticIndex::new(&config.index)?;
    index
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("Cannot connect to index at {}: {}", index.describe(), e))?;

    let dims = config.embedding.dims();
    if index.ensure_index(dims).await? {
        println!("Created index {} ({}-d {})", index.describe(), dims, config.index.vector_field);
    } else {
        println!("Index {} already exists.", index.describe());
    }
    Ok(())
}

/// Index mapping for image and conversation-chunk documents.
pub fn index_mapping(vector_field: &str, dims: usize) -> Value {
    let mut properties = json!({
        "text": {"type": "text"},
        "sender": {"type": "keyword"},
        "sender_is_me": {"type": "boolean"},
        "participants": {"type": "keyword"},
        "participant_count": {"type": "integer"},
        "chat_id": {"type": "keyword"},
        "chat_name": {"type": "keyword"},
        "group_name": {"type": "keyword"},
        "is_dm": {"type": "boolean"},
        "is_group_chat": {"type": "boolean"},
        "timestamp": {"type": "date"},
        "start_timestamp": {"type": "date"},
        "end_timestamp": {"type": "date"},
        "start_ts": {"type": "long"},
        "end_ts": {"type": "long"},
        "year": {"type": "integer"},
        "month": {"type": "integer"},
        "day_of_week": {"type": "keyword"},
        "hour_of_day": {"type": "integer"},
        "has_attachment": {"type": "boolean"},
        "has_image": {"type": "boolean"},
        "chunk_id": {"type": "keyword"},
        "message_rowid": {"type": "long"},
        "message_count": {"type": "integer"},
        "mime_type": {"type": "keyword"},
        "size_bytes": {"type": "long"},
        "enrichment": {"type": "keyword"},
    });
    properties[vector_field] = json!({
        "type": "dense_vector",
        "dims": dims,
        "index": true,
        "similarity": "dot_product",
    });
    json!({ "mappings": { "properties": properties } })
}

/// Translate a filter into `bool.filter` clauses.
pub fn filter_clauses(filter: &Filter) -> Vec<Value> {
    filter
        .must
        .iter()
        .map(|c| match c {
            Condition::Match { key, value } => {
                let v = match value {
                    MatchValue::Text(t) => json!(t),
                    MatchValue::Bool(b) => json!(b),
                };
                json!({ "term": { key.as_str(): v } })
            }
            Condition::Range { key, gte, lte } => {
                let mut range = serde_json::Map::new();
                if let Some(g) = gte {
                    range.insert("gte".into(), json!(g));
                }
                if let Some(l) = lte {
                    range.insert("lte".into(), json!(l));
                }
                json!({ "range": { key.as_str(): range } })
            }
        })
        .collect()
}

fn bool_query(filter: &Filter) -> Value {
    if filter.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "filter": filter_clauses(filter) } })
    }
}

pub fn nearest_body(vector_field: &str, q: &NearestQuery) -> Value {
    let mut knn = json!({
        "field": vector_field,
        "query_vector": q.vector,
        "k": q.limit,
        "num_candidates": (q.limit * 10).max(100),
    });
    if !q.filter.is_empty() {
        knn["filter"] = json!({ "bool": { "filter": filter_clauses(&q.filter) } });
    }
    json!({
        "knn": knn,
        "size": q.limit,
        "_source": { "excludes": [vector_field] },
    })
}

pub fn scroll_body(vector_field: &str, q: &ScrollQuery) -> Result<Value, IndexError> {
    let order = match q.sort.order {
        SortOrder::Ascending => "asc",
        SortOrder::Descending => "desc",
    };
    let mut body = json!({
        "size": q.page_size + 1,
        "query": bool_query(&q.filter),
        "sort": [
            { q.sort.key.as_str(): { "order": order, "missing": "_last" } },
            { TIEBREAK_FIELD: { "order": "asc" } },
        ],
        "_source": { "excludes": [vector_field] },
    });
    if let Some(token) = &q.page_token {
        body["search_after"] = Value::Array(decode_page_token(token)?);
    }
    Ok(body)
}

/// NDJSON body of `index` (create-or-replace) actions.
pub fn bulk_body(index: &str, vector_field: &str, docs: &[IndexDocument]) -> String {
    let mut body = String::new();
    for doc in docs {
        let action = json!({ "index": { "_index": index, "_id": doc.doc_id } });
        let mut source = match &doc.payload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        source.insert(vector_field.to_string(), json!(doc.vector));
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&Value::Object(source).to_string());
        body.push('\n');
    }
    body
}

/// Split a `_bulk` response into written documents and per-document failures.
pub fn parse_bulk_response(json: &Value) -> Result<BulkReport, IndexError> {
    let items = json
        .get("items")
        .and_then(|i| i.as_array())
        .ok_or_else(|| IndexError::Decode("bulk response missing items".to_string()))?;

    let mut report = BulkReport::default();
    for item in items {
        let result = item
            .as_object()
            .and_then(|o| o.values().next())
            .ok_or_else(|| IndexError::Decode("malformed bulk item".to_string()))?;

        let doc_id = result
            .get("_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match result.get("error") {
            Some(error) if !error.is_null() => {
                let reason = error
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                report.failed.push(DocFailure { doc_id, reason });
            }
            _ => report.written += 1,
        }
    }
    Ok(report)
}

/// Extract hits and their `sort` values from a `_search` response.
pub fn parse_hits(json: &Value) -> Result<(Vec<Hit>, Vec<Vec<Value>>), IndexError> {
    let raw = json
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(|h| h.as_array())
        .ok_or_else(|| IndexError::Decode("search response missing hits".to_string()))?;

    let mut hits = Vec::with_capacity(raw.len());
    let mut sorts = Vec::with_capacity(raw.len());
    for hit in raw {
        hits.push(Hit {
            id: hit
                .get("_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            score: hit.get("_score").and_then(|s| s.as_f64()).map(|s| s as f32),
            payload: hit.get("_source").cloned().unwrap_or_else(|| json!({})),
        });
        sorts.push(
            hit.get("sort")
                .and_then(|s| s.as_array())
                .cloned()
                .unwrap_or_default(),
        );
    }
    Ok((hits, sorts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Sort;

    fn person_and_range() -> Filter {
        Filter {
            must: vec![
                Condition::Match {
                    key: "participants".into(),
                    value: MatchValue::Text("John".into()),
                },
                Condition::Range {
                    key: "start_ts".into(),
                    gte: Some(10),
                    lte: Some(20),
                },
            ],
        }
    }

    #[test]
    fn filter_translates_to_term_and_range() {
        let clauses = filter_clauses(&person_and_range());
        assert_eq!(clauses[0], json!({"term": {"participants": "John"}}));
        assert_eq!(clauses[1], json!({"range": {"start_ts": {"gte": 10, "lte": 20}}}));
    }

    #[test]
    fn nearest_body_carries_filter_and_limit() {
        let body = nearest_body(
            "image_embedding",
            &NearestQuery {
                vector: vec![1.0, 0.0],
                filter: person_and_range(),
                limit: 5,
            },
        );
        assert_eq!(body["knn"]["k"], 5);
        assert_eq!(body["knn"]["num_candidates"], 100);
        assert_eq!(body["knn"]["filter"]["bool"]["filter"].as_array().unwrap().len(), 2);
        assert_eq!(body["_source"]["excludes"][0], "image_embedding");
    }

    #[test]
    fn scroll_body_requests_one_extra_and_resumes() {
        let token = encode_page_token(&[json!(100), json!("img_B")]);
        let body = scroll_body(
            "image_embedding",
            &ScrollQuery {
                filter: Filter::default(),
                sort: Sort {
                    key: "start_ts".into(),
                    order: SortOrder::Descending,
                },
                page_size: 25,
                page_token: Some(token),
            },
        )
        .unwrap();
        assert_eq!(body["size"], 26);
        assert_eq!(body["query"], json!({"match_all": {}}));
        assert_eq!(body["sort"][0]["start_ts"]["order"], "desc");
        assert_eq!(body["search_after"], json!([100, "img_B"]));
    }

    #[test]
    fn bulk_body_is_ndjson_with_vector() {
        let docs = vec![IndexDocument {
            doc_id: "img_ABC123".into(),
            vector: vec![0.5, 0.5],
            payload: json!({"has_image": true}),
        }];
        let body = bulk_body("imessage_chunks", "image_embedding", &docs);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_id"], "img_ABC123");
        let source: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["image_embedding"], json!([0.5, 0.5]));
        assert_eq!(source["has_image"], true);
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn bulk_response_partial_failure() {
        let json = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "img_A", "status": 201}},
                {"index": {"_id": "img_B", "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "bad vector"}}},
                {"index": {"_id": "img_C", "status": 200}},
            ]
        });
        let report = parse_bulk_response(&json).unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(
            report.failed,
            vec![DocFailure {
                doc_id: "img_B".into(),
                reason: "bad vector".into()
            }]
        );
    }

    #[test]
    fn parse_hits_reads_scores_and_sort_values() {
        let json = json!({"hits": {"hits": [
            {"_id": "a", "_score": 0.9, "_source": {"text": "x"}},
            {"_id": "b", "_score": null, "_source": {"text": "y"}, "sort": [5, "b"]},
        ]}});
        let (hits, sorts) = parse_hits(&json).unwrap();
        assert_eq!(hits[0].score, Some(0.9));
        assert_eq!(hits[1].score, None);
        assert_eq!(sorts[1], vec![json!(5), json!("b")]);
        assert!(parse_hits(&json!({})).is_err());
    }

    #[test]
    fn mapping_uses_configured_vector_field() {
        let mapping = index_mapping("image_embedding", 512);
        let field = &mapping["mappings"]["properties"]["image_embedding"];
        assert_eq!(field["dims"], 512);
        assert_eq!(field["similarity"], "dot_product");
    }
}
