mod common;

use serde_json::json;
use std::sync::Arc;

use common::FakeEmbedder;
use imsg_lens::embedding::{EmbeddingEngine, EmbeddingVector};
use imsg_lens::index::memory::InMemoryIndex;
use imsg_lens::index::{Condition, DocumentIndex, MatchValue, QueryRequest, SortOrder};
use imsg_lens::models::IndexDocument;
use imsg_lens::present::{LineTag, TimeStyle};
use imsg_lens::query::{execute, present_hit, FilterCriteria, QueryResolver, ScrollOptions};

fn resolver() -> QueryResolver {
    QueryResolver::new(Some(EmbeddingEngine::new(Arc::new(FakeEmbedder))))
}

fn chunk(id: &str, text: &str, participants: &[&str], start_ts: i64, group: Option<&str>) -> IndexDocument {
    let vector = EmbeddingVector::normalize(common::fake_vector(text.as_bytes()))
        .unwrap()
        .into_vec();
    IndexDocument {
        doc_id: id.to_string(),
        vector,
        payload: json!({
            "text": text,
            "participants": participants,
            "start_ts": start_ts,
            "end_ts": start_ts + 60,
            "group_name": group,
            "is_group_chat": group.is_some(),
            "message_count": 1,
            "chunk_id": id,
        }),
    }
}

async fn seeded_index() -> InMemoryIndex {
    let index = InMemoryIndex::new();
    index
        .bulk_upsert(&[
            chunk("c1", "[Me 09:00] dinner plans tonight?", &["Me", "John"], 1_000, None),
            chunk("c2", "[John 10:00] sunset at the beach", &["Me", "John"], 2_000, None),
            chunk("c3", "[Mom 11:00] sunset at the beach", &["Me", "Mom", "Dad"], 3_000, Some("Family")),
            chunk("c4", "[Ann 12:00] weekend hike", &["Me", "Ann"], 4_000, None),
        ])
        .await
        .unwrap();
    index
}

#[tokio::test]
async fn person_and_range_without_query_is_a_two_clause_scroll() {
    let criteria = FilterCriteria {
        person: Some("John".into()),
        date_range: Some((100, 200)),
        group_only: false,
        ..FilterCriteria::new(10)
    };
    let request = resolver()
        .resolve(None, &criteria, &ScrollOptions::default())
        .await
        .unwrap();

    assert!(request.vector().is_none());
    let must = &request.filter().must;
    assert_eq!(must.len(), 2);
    assert_eq!(
        must[0],
        Condition::Match {
            key: "participants".into(),
            value: MatchValue::Text("John".into()),
        }
    );
    assert_eq!(
        must[1],
        Condition::Range {
            key: "start_ts".into(),
            gte: Some(100),
            lte: Some(200),
        }
    );
}

#[tokio::test]
async fn text_query_ranks_by_similarity_within_filter() {
    let index = seeded_index().await;
    let criteria = FilterCriteria {
        person: Some("John".into()),
        ..FilterCriteria::new(5)
    };
    let request = resolver()
        .resolve(Some("[John 10:00] sunset at the beach"), &criteria, &ScrollOptions::default())
        .await
        .unwrap();
    assert!(matches!(request, QueryRequest::Nearest(_)));

    let page = execute(&index, &request).await.unwrap();
    let ids: Vec<&str> = page.hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["c2", "c1"]);
    assert!(page.hits[0].score.unwrap() > page.hits[1].score.unwrap());
    assert!((page.hits[0].score.unwrap() - 1.0).abs() < 1e-4);
}

#[tokio::test]
async fn group_only_search_excludes_direct_chats() {
    let index = seeded_index().await;
    let criteria = FilterCriteria {
        group_only: true,
        ..FilterCriteria::new(10)
    };
    let request = resolver()
        .resolve(Some("sunset at the beach"), &criteria, &ScrollOptions::default())
        .await
        .unwrap();
    let page = execute(&index, &request).await.unwrap();
    assert_eq!(page.hits.len(), 1);
    assert_eq!(page.hits[0].id, "c3");

    let row = present_hit(&page.hits[0], "Me", 3_000, TimeStyle::Long);
    assert_eq!(row.chat_name, "Family");
    assert_eq!(row.lines[0].tag, LineTag::Other);
}

#[tokio::test]
async fn no_match_is_an_empty_page_not_an_error() {
    let index = seeded_index().await;
    let criteria = FilterCriteria {
        person: Some("Nobody".into()),
        ..FilterCriteria::new(10)
    };
    let request = resolver()
        .resolve(Some("anything"), &criteria, &ScrollOptions::default())
        .await
        .unwrap();
    let page = execute(&index, &request).await.unwrap();
    assert!(page.hits.is_empty());
}

#[tokio::test]
async fn browse_pages_oldest_first_with_tokens() {
    let index = seeded_index().await;
    let resolver = QueryResolver::new(None);
    let criteria = FilterCriteria::new(3);

    let first = resolver
        .resolve(
            None,
            &criteria,
            &ScrollOptions {
                order: SortOrder::Ascending,
                page_token: None,
            },
        )
        .await
        .unwrap();
    let page = execute(&index, &first).await.unwrap();
    let ids: Vec<&str> = page.hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
    let token = page.next_page_token.clone().unwrap();

    let second = resolver
        .resolve(
            None,
            &criteria,
            &ScrollOptions {
                order: SortOrder::Ascending,
                page_token: Some(token),
            },
        )
        .await
        .unwrap();
    let page = execute(&index, &second).await.unwrap();
    assert_eq!(page.hits.len(), 1);
    assert_eq!(page.hits[0].id, "c4");
    assert!(page.next_page_token.is_none());

    let row = present_hit(&page.hits[0], "Me", 4_000 + 2 * 86_400, TimeStyle::Compact);
    assert_eq!(row.chat_name, "Ann");
    assert_eq!(row.relative, "2d ago");
}

#[tokio::test]
async fn browse_by_group_name() {
    let index = seeded_index().await;
    let criteria = FilterCriteria {
        group_name: Some("Family".into()),
        ..FilterCriteria::new(10)
    };
    let request = QueryResolver::new(None)
        .resolve(None, &criteria, &ScrollOptions::default())
        .await
        .unwrap();
    let page = execute(&index, &request).await.unwrap();
    assert_eq!(page.hits.len(), 1);
    assert_eq!(page.hits[0].id, "c3");
}
