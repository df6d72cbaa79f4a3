//! In-memory [`DocumentIndex`] for tests and dry runs.
//!
//! Documents live in a `HashMap` behind `std::sync::RwLock`. Nearest-neighbour
//! search is a brute-force dot product over all stored vectors, so stored
//! vectors are expected to be normalized.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    decode_page_token, encode_page_token, BulkReport, DocumentIndex, Hit, IndexError, QueryPage,
    QueryRequest, SortOrder,
};
use crate::embedding::dot;
use crate::models::IndexDocument;

pub struct InMemoryIndex {
    docs: RwLock<HashMap<String, IndexDocument>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, doc_id: &str) -> Option<IndexDocument> {
        self.read().get(doc_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, IndexDocument>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_value(payload: &Value, key: &str) -> i64 {
    payload.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

#[async_trait]
impl DocumentIndex for InMemoryIndex {
    fn describe(&self) -> String {
        "in-memory index".to_string()
    }

    async fn ping(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn ensure_index(&self, _dims: usize) -> Result<bool, IndexError> {
        Ok(false)
    }

    async fn bulk_upsert(&self, docs: &[IndexDocument]) -> Result<BulkReport, IndexError> {
        let mut stored = self.docs.write().unwrap_or_else(|e| e.into_inner());
        for doc in docs {
            stored.insert(doc.doc_id.clone(), doc.clone());
        }
        Ok(BulkReport {
            written: docs.len(),
            failed: Vec::new(),
        })
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, IndexError> {
        let docs = self.read();

        match request {
            QueryRequest::Nearest(q) => {
                let mut hits: Vec<Hit> = docs
                    .values()
                    .filter(|d| q.filter.matches(&d.payload))
                    .map(|d| Hit {
                        id: d.doc_id.clone(),
                        score: Some(dot(&q.vector, &d.vector)),
                        payload: d.payload.clone(),
                    })
                    .collect();
                hits.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                hits.truncate(q.limit);
                Ok(QueryPage {
                    hits,
                    next_page_token: None,
                })
            }
            QueryRequest::Scroll(q) => {
                let key = q.sort.key.as_str();
                let position = match &q.page_token {
                    Some(token) => {
                        let values = decode_page_token(token)?;
                        match (values.first().and_then(|v| v.as_i64()), values.get(1).and_then(|v| v.as_str())) {
                            (Some(ts), Some(id)) => Some((ts, id.to_string())),
                            _ => return Err(IndexError::InvalidPageToken),
                        }
                    }
                    None => None,
                };

                let order_of = |a: (i64, &str), b: (i64, &str)| {
                    let primary = match q.sort.order {
                        SortOrder::Ascending => a.0.cmp(&b.0),
                        SortOrder::Descending => b.0.cmp(&a.0),
                    };
                    primary.then_with(|| a.1.cmp(b.1))
                };

                let mut matching: Vec<&IndexDocument> = docs
                    .values()
                    .filter(|d| q.filter.matches(&d.payload))
                    .filter(|d| match &position {
                        Some((ts, id)) => {
                            order_of((sort_value(&d.payload, key), d.doc_id.as_str()), (*ts, id.as_str()))
                                == Ordering::Greater
                        }
                        None => true,
                    })
                    .collect();
                matching.sort_by(|a, b| {
                    order_of(
                        (sort_value(&a.payload, key), a.doc_id.as_str()),
                        (sort_value(&b.payload, key), b.doc_id.as_str()),
                    )
                });

                let has_more = matching.len() > q.page_size;
                matching.truncate(q.page_size);

                let next_page_token = if has_more {
                    matching
                        .last()
                        .map(|d| encode_page_token(&[json!(sort_value(&d.payload, key)), json!(d.doc_id)]))
                } else {
                    None
                };

                Ok(QueryPage {
                    hits: matching
                        .into_iter()
                        .map(|d| Hit {
                            id: d.doc_id.clone(),
                            score: None,
                            payload: d.payload.clone(),
                        })
                        .collect(),
                    next_page_token,
                })
            }
        }
    }

    async fn count(&self) -> Result<u64, IndexError> {
        Ok(self.len() as u64)
    }
}
