//! Core data models used throughout the pipeline and the query path.
//!
//! [`SourceRecord`]s are read-only snapshots of archive rows. The pipeline
//! turns each one into at most one [`IndexDocument`]. Query results come back
//! as loosely typed payloads and are read through [`ChunkPayload`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An image attachment read from the Messages archive.
///
/// Identity is `record_id`; `external_id` is the attachment GUID and is the
/// only input to the document id.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub record_id: i64,
    pub external_id: String,
    /// Resolved local path of the attachment file.
    pub resource_path: PathBuf,
    pub mime_hint: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<i64>,
    /// Unix seconds; `0` when the archive has no creation date.
    pub created_at: i64,
    /// Original file name as sent (`transfer_name`).
    pub display_name: Option<String>,
    pub size_bytes: i64,
    pub chat_name: Option<String>,
    pub is_group_chat: bool,
}

/// A document ready for upsert into the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub doc_id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// Payload written for each embedded image.
///
/// Sender and participant fields are placeholders until a message-level
/// enrichment pass fills them in; `enrichment` records that state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImagePayload {
    pub text: String,
    pub sender: String,
    pub sender_is_me: bool,
    pub participants: Vec<String>,
    pub participant_count: usize,
    pub chat_id: String,
    pub chat_name: Option<String>,
    pub group_name: Option<String>,
    pub is_dm: bool,
    pub is_group_chat: bool,
    pub timestamp: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub year: i32,
    pub month: u32,
    pub day_of_week: String,
    pub hour_of_day: u32,
    pub has_attachment: bool,
    pub has_image: bool,
    pub chunk_id: String,
    /// Archive message row the attachment hangs off; the enrichment key.
    pub message_rowid: Option<i64>,
    pub message_count: i64,
    pub mime_type: String,
    pub size_bytes: i64,
    pub enrichment: String,
}

/// Read-side view of any document payload in the index.
///
/// Conversation chunks and image documents share these fields; everything
/// is optional so that partially populated documents still render.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ChunkPayload {
    pub text: String,
    pub participants: Vec<String>,
    pub group_name: Option<String>,
    pub chat_id: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: Option<i64>,
    pub is_group_chat: bool,
    pub has_image: bool,
}

impl ChunkPayload {
    /// Decode a raw payload, tolerating missing or mistyped fields.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            text: value
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_payload_fills_missing_fields() {
        let payload = ChunkPayload::from_value(&json!({
            "text": "[Me 10:00] hi",
            "participants": ["Me", "Ann"],
        }));
        assert_eq!(payload.participants, vec!["Me", "Ann"]);
        assert_eq!(payload.start_ts, 0);
        assert!(payload.group_name.is_none());
    }

    #[test]
    fn chunk_payload_survives_bad_types() {
        let payload = ChunkPayload::from_value(&json!({
            "text": "hello",
            "participants": "not a list",
        }));
        assert_eq!(payload.text, "hello");
        assert!(payload.participants.is_empty());
    }
}
