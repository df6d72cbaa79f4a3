//! Index writer: records + vectors → upserted documents.
//!
//! Each record maps to exactly one document whose id depends only on the
//! attachment GUID, so replays overwrite instead of duplicating. Records
//! whose vector is absent are skipped. One call is one bulk request; partial
//! failures reported by the index are logged and returned, successes stay
//! committed.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};

use crate::embedding::EmbeddingVector;
use crate::index::{BulkReport, DocumentIndex, IndexError};
use crate::models::{ImagePayload, IndexDocument, SourceRecord};

/// Deterministic document id for an attachment GUID.
pub fn doc_id(external_id: &str) -> String {
    format!("img_{}", external_id)
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Build the payload for one image, with calendar fields in `tz`.
///
/// Sender and participants are placeholders marked `enrichment: "pending"`.
pub fn build_payload<Tz: TimeZone>(record: &SourceRecord, tz: &Tz) -> ImagePayload {
    let utc = DateTime::<Utc>::from_timestamp(record.created_at, 0).unwrap_or_default();
    let local = utc.with_timezone(tz);
    let iso = local.naive_local().format("%Y-%m-%dT%H:%M:%S").to_string();
    let id = doc_id(&record.external_id);

    ImagePayload {
        text: format!(
            "[Image: {}]",
            record.display_name.as_deref().unwrap_or("attachment")
        ),
        sender: "Unknown".to_string(),
        sender_is_me: false,
        participants: Vec::new(),
        participant_count: 0,
        chat_id: record
            .conversation_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        chat_name: record.chat_name.clone(),
        group_name: if record.is_group_chat {
            record.chat_name.clone()
        } else {
            None
        },
        is_dm: !record.is_group_chat,
        is_group_chat: record.is_group_chat,
        timestamp: iso.clone(),
        start_timestamp: iso.clone(),
        end_timestamp: iso,
        start_ts: record.created_at,
        end_ts: record.created_at,
        year: local.year(),
        month: local.month(),
        day_of_week: weekday_name(local.weekday()).to_string(),
        hour_of_day: local.hour(),
        has_attachment: true,
        has_image: true,
        chunk_id: id,
        message_rowid: record.message_id,
        message_count: 1,
        mime_type: record.mime_hint.clone(),
        size_bytes: record.size_bytes,
        enrichment: "pending".to_string(),
    }
}

/// Pair records with their vectors, dropping records without one.
pub fn build_documents(
    records: &[SourceRecord],
    vectors: &[Option<EmbeddingVector>],
) -> Vec<IndexDocument> {
    records
        .iter()
        .zip(vectors)
        .filter_map(|(record, vector)| {
            let vector = vector.as_ref()?;
            let payload = serde_json::to_value(build_payload(record, &chrono::Local)).ok()?;
            Some(IndexDocument {
                doc_id: doc_id(&record.external_id),
                vector: vector.as_slice().to_vec(),
                payload,
            })
        })
        .collect()
}

/// Upsert every record that has a vector, in one bulk call.
pub async fn upsert(
    index: &dyn DocumentIndex,
    records: &[SourceRecord],
    vectors: &[Option<EmbeddingVector>],
) -> Result<BulkReport, IndexError> {
    if records.len() != vectors.len() {
        tracing::warn!(
            records = records.len(),
            vectors = vectors.len(),
            "record/vector count mismatch; extra entries ignored"
        );
    }

    let docs = build_documents(records, vectors);
    if docs.is_empty() {
        return Ok(BulkReport::default());
    }

    let report = index.bulk_upsert(&docs).await?;
    for failure in &report.failed {
        tracing::warn!(doc_id = %failure.doc_id, reason = %failure.reason, "document rejected by index");
    }
    tracing::debug!(written = report.written, failed = report.failed.len(), "bulk upsert");
    Ok(report)
}
