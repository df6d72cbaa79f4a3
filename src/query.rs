//! Query resolution and the `search` / `browse` commands.
//!
//! [`QueryResolver::resolve`] turns filter criteria plus an optional free-text
//! query into a [`QueryRequest`]:
//!
//! | Query text | Request | Ordering |
//! |------------|---------|----------|
//! | present | [`QueryRequest::Nearest`] on the embedded text | descending similarity |
//! | absent or blank | [`QueryRequest::Scroll`] | `start_ts` asc/desc, ties by id |
//!
//! Filter clauses are conjunctive and only emitted for criteria that are
//! set: person (exact match on any participant), group name, inclusive date
//! range on `start_ts`, group-only. Hits are passed through [`present_hit`]
//! before they are printed.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, TimeZone};
use thiserror::Error;

use crate::config::Config;
use crate::embedding::{create_embedder, EmbedError, EmbeddingEngine};
use crate::index::elastic::ElasticIndex;
use crate::index::{
    Condition, DocumentIndex, Filter, Hit, IndexError, MatchValue, NearestQuery, QueryPage,
    QueryRequest, ScrollQuery, Sort, SortOrder,
};
use crate::models::ChunkPayload;
use crate::present::{self, TaggedLine, TimeStyle};
use crate::progress::format_number;

/// Payload field used for date filtering and scroll ordering.
pub const TIME_FIELD: &str = "start_ts";

/// User-supplied constraints for one query. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCriteria {
    pub person: Option<String>,
    /// Exact group chat name.
    pub group_name: Option<String>,
    /// Inclusive `(start, end)` in Unix seconds.
    pub date_range: Option<(i64, i64)>,
    pub group_only: bool,
    /// Maximum hits for a search, page size for a scroll.
    pub result_limit: usize,
}

impl FilterCriteria {
    pub fn new(result_limit: usize) -> Self {
        Self {
            person: None,
            group_name: None,
            date_range: None,
            group_only: false,
            result_limit,
        }
    }
}

/// Scroll-only parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollOptions {
    pub order: SortOrder,
    /// Token from the previous page; `None` restarts from the beginning.
    pub page_token: Option<String>,
}

impl Default for ScrollOptions {
    fn default() -> Self {
        Self {
            order: SortOrder::Descending,
            page_token: None,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Conjunctive filter for `criteria`; unset criteria add no clause.
pub fn build_filter(criteria: &FilterCriteria) -> Filter {
    let mut must = Vec::new();

    if let Some(person) = non_blank(&criteria.person) {
        must.push(Condition::Match {
            key: "participants".to_string(),
            value: MatchValue::Text(person.to_string()),
        });
    }
    if let Some(group) = non_blank(&criteria.group_name) {
        must.push(Condition::Match {
            key: "group_name".to_string(),
            value: MatchValue::Text(group.to_string()),
        });
    }
    if let Some((start, end)) = criteria.date_range {
        must.push(Condition::Range {
            key: TIME_FIELD.to_string(),
            gte: Some(start),
            lte: Some(end),
        });
    }
    if criteria.group_only {
        must.push(Condition::Match {
            key: "is_group_chat".to_string(),
            value: MatchValue::Bool(true),
        });
    }

    Filter { must }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    Connectivity(String),
    #[error("{0}")]
    Auth(String),
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbedError),
    #[error(transparent)]
    Index(IndexError),
    #[error("{0}")]
    InvalidInput(String),
}

impl From<IndexError> for QueryError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Unreachable(msg) => QueryError::Connectivity(msg),
            IndexError::Auth(msg) => QueryError::Auth(msg),
            other => QueryError::Index(other),
        }
    }
}

impl QueryError {
    /// One line suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            QueryError::Connectivity(detail) => format!(
                "Cannot connect to the search index ({}). Is Elasticsearch running?",
                detail
            ),
            QueryError::Auth(_) => {
                "The search index rejected the credentials. Check the API key named by index.api_key_env."
                    .to_string()
            }
            QueryError::Embedding(e) => format!("Could not embed the query: {}", e),
            QueryError::Index(IndexError::InvalidPageToken) => {
                "The page token is invalid. Run browse again without --page-token.".to_string()
            }
            QueryError::Index(e) => format!("Search failed: {}", e),
            QueryError::InvalidInput(msg) => msg.clone(),
        }
    }
}

/// Stateless translator from user input to index requests.
#[derive(Clone)]
pub struct QueryResolver {
    engine: Option<EmbeddingEngine>,
}

impl QueryResolver {
    /// `engine` is only needed for free-text queries.
    pub fn new(engine: Option<EmbeddingEngine>) -> Self {
        Self { engine }
    }

    pub async fn resolve(
        &self,
        query: Option<&str>,
        criteria: &FilterCriteria,
        scroll: &ScrollOptions,
    ) -> Result<QueryRequest, QueryError> {
        if criteria.result_limit == 0 {
            return Err(QueryError::InvalidInput(
                "result limit must be positive".to_string(),
            ));
        }
        if let Some((start, end)) = criteria.date_range {
            if start > end {
                return Err(QueryError::InvalidInput(
                    "date range start is after its end".to_string(),
                ));
            }
        }

        let filter = build_filter(criteria);
        let query = query.map(str::trim).filter(|q| !q.is_empty());

        match query {
            Some(text) => {
                let engine = self.engine.as_ref().ok_or_else(|| {
                    QueryError::Embedding(EmbedError::Unsupported(
                        "no embedding provider is configured".to_string(),
                    ))
                })?;
                let vector = engine.embed_text(text).await?;
                Ok(QueryRequest::Nearest(NearestQuery {
                    vector: vector.into_vec(),
                    filter,
                    limit: criteria.result_limit,
                }))
            }
            None => Ok(QueryRequest::Scroll(ScrollQuery {
                filter,
                sort: Sort {
                    key: TIME_FIELD.to_string(),
                    order: scroll.order,
                },
                page_size: criteria.result_limit,
                page_token: scroll.page_token.clone(),
            })),
        }
    }
}

pub async fn execute(
    index: &dyn DocumentIndex,
    request: &QueryRequest,
) -> Result<QueryPage, QueryError> {
    Ok(index.query(request).await?)
}

/// A hit with its display facts derived.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub id: String,
    pub score: Option<f32>,
    pub chat_name: String,
    pub is_group_chat: bool,
    pub participants: Vec<String>,
    pub message_count: Option<i64>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub relative: String,
    pub lines: Vec<TaggedLine>,
}

pub fn present_hit(hit: &Hit, self_name: &str, now: i64, style: TimeStyle) -> ResultRow {
    let payload = ChunkPayload::from_value(&hit.payload);
    ResultRow {
        id: hit.id.clone(),
        score: hit.score,
        chat_name: present::display_chat_name(&payload, self_name),
        is_group_chat: payload.is_group_chat || payload.group_name.is_some(),
        relative: present::relative_time(payload.start_ts, now, style),
        lines: present::colorize_lines(&payload.text, self_name),
        participants: payload.participants,
        message_count: payload.message_count,
        start_ts: payload.start_ts,
        end_ts: payload.end_ts,
    }
}

fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}': expected YYYY-MM-DD", raw))
}

/// Inclusive Unix-second bounds covering whole days in `tz`.
///
/// An open start is the epoch; an open end is unbounded.
pub fn day_range_in<Tz: TimeZone>(
    since: Option<&str>,
    until: Option<&str>,
    tz: &Tz,
) -> Result<Option<(i64, i64)>> {
    if since.is_none() && until.is_none() {
        return Ok(None);
    }

    let start = match since {
        Some(raw) => {
            let naive = parse_day(raw)?
                .and_hms_opt(0, 0, 0)
                .context("invalid start of day")?;
            tz.from_local_datetime(&naive)
                .earliest()
                .context("start date does not exist in local time")?
                .timestamp()
        }
        None => 0,
    };
    let end = match until {
        Some(raw) => {
            let naive = parse_day(raw)?
                .and_hms_opt(23, 59, 59)
                .context("invalid end of day")?;
            tz.from_local_datetime(&naive)
                .latest()
                .context("end date does not exist in local time")?
                .timestamp()
        }
        None => i64::MAX,
    };

    if start > end {
        bail!("--since must not be after --until");
    }
    Ok(Some((start, end)))
}

pub fn day_range(since: Option<&str>, until: Option<&str>) -> Result<Option<(i64, i64)>> {
    day_range_in(since, until, &Local)
}

fn connect(config: &Config) -> Result<ElasticIndex> {
    ElasticIndex::new(&config.index)
}

fn fail(e: QueryError) -> anyhow::Error {
    tracing::debug!(error = ?e, "query failed");
    anyhow::anyhow!(e.user_message())
}

/// `imsg-lens search`: semantic search with filters.
pub async fn run_search(config: &Config, query: &str, criteria: &FilterCriteria) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let index = connect(config)?;
    let engine = EmbeddingEngine::new(create_embedder(&config.embedding)?);
    let resolver = QueryResolver::new(Some(engine));

    let total = index.count().await.map_err(|e| fail(e.into()))?;
    let request = resolver
        .resolve(Some(query), criteria, &ScrollOptions::default())
        .await
        .map_err(fail)?;
    let page = execute(&index, &request).await.map_err(fail)?;

    if page.hits.is_empty() {
        println!("No results found. Try a different query or adjust filters.");
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let color = atty::is(atty::Stream::Stdout);
    let self_name = &config.search.self_name;

    println!(
        "Found {} results ({} indexed)",
        page.hits.len(),
        format_number(total)
    );
    println!();
    for (i, hit) in page.hits.iter().enumerate() {
        let row = present_hit(hit, self_name, now, TimeStyle::Long);
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            row.score.unwrap_or(0.0),
            row.chat_name
        );
        println!(
            "    {} ({})",
            present::format_timestamp(row.start_ts),
            row.relative
        );
        for line in &row.lines {
            println!("    {}", line.render(color));
        }
        println!("    id: {}", row.id);
        println!();
    }
    Ok(())
}

/// `imsg-lens browse`: metadata-only paging, no embedding.
pub async fn run_browse(
    config: &Config,
    criteria: &FilterCriteria,
    scroll: &ScrollOptions,
) -> Result<()> {
    let index = connect(config)?;
    let resolver = QueryResolver::new(None);

    let total = index.count().await.map_err(|e| fail(e.into()))?;
    let request = resolver.resolve(None, criteria, scroll).await.map_err(fail)?;
    let page = execute(&index, &request).await.map_err(fail)?;

    if page.hits.is_empty() {
        println!("No chunks found. Try adjusting filters or index more messages.");
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let color = atty::is(atty::Stream::Stdout);
    let self_name = &config.search.self_name;

    for hit in &page.hits {
        let row = present_hit(hit, self_name, now, TimeStyle::Compact);
        let kind = if row.is_group_chat { "group" } else { "chat" };
        let count = row
            .message_count
            .map(|c| c.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("{} ({}) • {} • {} msgs", row.chat_name, kind, row.relative, count);
        println!("    {}", present::format_time_span(row.start_ts, row.end_ts));
        println!("    participants: {}", row.participants.join(", "));
        println!("    id: {}", row.id);
        for line in row.lines.iter().filter(|l| !l.text.trim().is_empty()) {
            println!("    {}", line.render(color));
        }
        println!();
    }

    println!(
        "Showing {} of {} indexed",
        page.hits.len(),
        format_number(total)
    );
    match &page.next_page_token {
        Some(token) => println!("next page: --page-token {}", token),
        None => println!("end of results"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn unset_criteria_build_empty_filter() {
        assert!(build_filter(&FilterCriteria::new(10)).is_empty());
        let blank = FilterCriteria {
            person: Some("  ".into()),
            ..FilterCriteria::new(10)
        };
        assert!(build_filter(&blank).is_empty());
    }

    #[test]
    fn all_criteria_compose() {
        let criteria = FilterCriteria {
            person: Some("John".into()),
            group_name: Some("Family".into()),
            date_range: Some((1, 2)),
            group_only: true,
            result_limit: 10,
        };
        let filter = build_filter(&criteria);
        assert_eq!(filter.must.len(), 4);
        assert!(filter.matches(&json!({
            "participants": ["Me", "John"],
            "group_name": "Family",
            "start_ts": 2,
            "is_group_chat": true,
        })));
    }

    #[tokio::test]
    async fn blank_query_scrolls() {
        let resolver = QueryResolver::new(None);
        let request = resolver
            .resolve(Some("   "), &FilterCriteria::new(25), &ScrollOptions::default())
            .await
            .unwrap();
        match request {
            QueryRequest::Scroll(q) => {
                assert_eq!(q.page_size, 25);
                assert_eq!(q.sort.key, "start_ts");
                assert_eq!(q.sort.order, SortOrder::Descending);
            }
            other => panic!("expected scroll, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn text_query_without_engine_is_an_embedding_error() {
        let err = QueryResolver::new(None)
            .resolve(Some("beach"), &FilterCriteria::new(10), &ScrollOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Embedding(_)));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let criteria = FilterCriteria {
            date_range: Some((10, 1)),
            ..FilterCriteria::new(10)
        };
        let err = QueryResolver::new(None)
            .resolve(None, &criteria, &ScrollOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidInput(_)));
    }

    #[test]
    fn index_errors_classify() {
        let conn: QueryError = IndexError::Unreachable("refused".into()).into();
        assert!(matches!(conn, QueryError::Connectivity(_)));
        assert!(conn.user_message().contains("Cannot connect"));
        let auth: QueryError = IndexError::Auth("401".into()).into();
        assert!(auth.user_message().contains("credentials"));
        let token: QueryError = IndexError::InvalidPageToken.into();
        assert!(token.user_message().contains("page token"));
    }

    #[test]
    fn day_range_covers_whole_days() {
        let (start, end) = day_range_in(Some("2024-01-01"), Some("2024-01-01"), &Utc)
            .unwrap()
            .unwrap();
        assert_eq!(start, 1_704_067_200);
        assert_eq!(end, 1_704_067_200 + 86_399);
        assert_eq!(day_range_in(None, None, &Utc).unwrap(), None);
        let (_, open_end) = day_range_in(Some("2024-01-01"), None, &Utc).unwrap().unwrap();
        assert_eq!(open_end, i64::MAX);
        assert!(day_range_in(Some("2024-02-01"), Some("2024-01-01"), &Utc).is_err());
        assert!(day_range_in(Some("01/02/2024"), None, &Utc).is_err());
    }

    #[test]
    fn hit_is_presented() {
        let hit = Hit {
            id: "c1".into(),
            score: Some(0.5),
            payload: json!({
                "text": "[Me 10:00] hi\n[Ann 10:01] hey",
                "participants": ["Me", "Ann"],
                "start_ts": 1_000,
                "end_ts": 2_000,
                "message_count": 2,
            }),
        };
        let row = present_hit(&hit, "Me", 1_000 + 3 * 86_400, TimeStyle::Compact);
        assert_eq!(row.chat_name, "Ann");
        assert_eq!(row.relative, "3d ago");
        assert_eq!(row.lines.len(), 2);
        assert_eq!(row.message_count, Some(2));
    }
}
