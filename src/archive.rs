//! Source reader for the Messages archive (`chat.db`).
//!
//! Reads image attachments newer than a watermark, joined to their message
//! and chat, and resolves each attachment to a file on local disk. Rows whose
//! file cannot be resolved are reported separately so that the pipeline can
//! count them as skipped and still move the watermark past them.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::models::SourceRecord;

/// Seconds between the Unix epoch and the Mac absolute-time epoch (2001-01-01).
pub const MAC_EPOCH_OFFSET: i64 = 978_307_200;

/// File suffixes accepted as images.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tiff", "bmp",
];

/// `chat.style` value the archive uses for group conversations.
const GROUP_CHAT_STYLE: i64 = 43;

/// An attachment row whose file could not be located.
#[derive(Debug, Clone, PartialEq)]
pub struct Unresolved {
    pub record_id: i64,
    pub locator: String,
}

/// Result of one read against the archive.
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    /// Resolved records, ascending by `record_id`.
    pub records: Vec<SourceRecord>,
    pub unresolved: Vec<Unresolved>,
}

impl ReadBatch {
    /// Highest record id fetched, resolved or not.
    pub fn max_record_id(&self) -> Option<i64> {
        self.records
            .iter()
            .map(|r| r.record_id)
            .chain(self.unresolved.iter().map(|u| u.record_id))
            .max()
    }

    pub fn fetched(&self) -> usize {
        self.records.len() + self.unresolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetched() == 0
    }
}

/// Read-only handle on the archive database.
pub struct ArchiveReader {
    pool: SqlitePool,
}

impl ArchiveReader {
    /// Open the archive read-only. A missing or unopenable file is an error.
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("Messages database not found at {}", path.display());
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open Messages database: {}", path.display()))?;

        Ok(Self { pool })
    }

    /// Read image attachments with `ROWID > since`, ascending, up to `limit` rows.
    ///
    /// The limit applies to archive rows, before path resolution.
    pub async fn read(&self, since: i64, limit: Option<usize>) -> Result<ReadBatch> {
        let limit_val = limit.map_or(-1, |l| l as i64);

        let rows = sqlx::query(
            r#"
            SELECT
                a.ROWID AS rowid,
                a.guid,
                a.filename,
                a.mime_type,
                a.created_date,
                a.transfer_name,
                a.total_bytes,
                maj.message_id AS message_rowid,
                c.chat_identifier,
                c.display_name AS chat_display_name,
                c.style AS chat_style
            FROM attachment a
            LEFT JOIN message_attachment_join maj ON a.ROWID = maj.attachment_id
            LEFT JOIN message m ON maj.message_id = m.ROWID
            LEFT JOIN chat_message_join cmj ON m.ROWID = cmj.message_id
            LEFT JOIN chat c ON cmj.chat_id = c.ROWID
            WHERE a.filename IS NOT NULL
              AND a.ROWID > ?
              AND (
                a.mime_type LIKE 'image/%'
                OR a.filename LIKE '%.jpg'
                OR a.filename LIKE '%.jpeg'
                OR a.filename LIKE '%.png'
                OR a.filename LIKE '%.gif'
                OR a.filename LIKE '%.webp'
                OR a.filename LIKE '%.heic'
                OR a.filename LIKE '%.heif'
                OR a.filename LIKE '%.tiff'
                OR a.filename LIKE '%.bmp'
              )
            ORDER BY a.ROWID ASC
            LIMIT ?
            "#,
        )
        .bind(since)
        .bind(limit_val)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query attachments")?;

        let mut batch = ReadBatch::default();
        let mut seen = HashSet::new();

        for row in &rows {
            let record_id: i64 = row.try_get("rowid")?;
            // An attachment linked to several chats shows up once per chat.
            if !seen.insert(record_id) {
                continue;
            }

            let locator: String = row.try_get("filename")?;
            let mime_type: Option<String> = row.try_get("mime_type")?;
            if !is_supported_image(mime_type.as_deref(), &locator) {
                continue;
            }

            let resource_path = match resolve_path(&locator) {
                Some(p) => p,
                None => {
                    tracing::debug!(record_id, locator = %locator, "attachment file not found");
                    batch.unresolved.push(Unresolved { record_id, locator });
                    continue;
                }
            };

            let created_date: Option<i64> = row.try_get("created_date")?;
            let chat_name: Option<String> = row.try_get("chat_display_name")?;
            let chat_style: Option<i64> = row.try_get("chat_style")?;

            batch.records.push(SourceRecord {
                record_id,
                external_id: row.try_get("guid")?,
                resource_path,
                mime_hint: mime_type.unwrap_or_else(|| "image/jpeg".to_string()),
                conversation_id: row.try_get("chat_identifier")?,
                message_id: row.try_get("message_rowid")?,
                created_at: created_date.filter(|d| *d != 0).map_or(0, mac_to_unix),
                display_name: row.try_get("transfer_name")?,
                size_bytes: row.try_get::<Option<i64>, _>("total_bytes")?.unwrap_or(0),
                chat_name: chat_name.filter(|n| !n.trim().is_empty()),
                is_group_chat: chat_style == Some(GROUP_CHAT_STYLE),
            });
        }

        Ok(batch)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Convert Mac absolute time (seconds, or nanoseconds on newer archives) to Unix seconds.
pub fn mac_to_unix(mac_time: i64) -> i64 {
    let secs = if mac_time > 1_000_000_000_000 {
        mac_time / 1_000_000_000
    } else {
        mac_time
    };
    secs + MAC_EPOCH_OFFSET
}

/// Whether a row is an image by MIME type or file suffix (case-insensitive).
pub fn is_supported_image(mime: Option<&str>, filename: &str) -> bool {
    if mime.is_some_and(|m| m.to_ascii_lowercase().starts_with("image/")) {
        return true;
    }
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

/// Resolve an archive locator to an existing local file.
///
/// Handles `~/` paths and `file://` URIs; anything that does not land on a
/// regular file yields `None`.
pub fn resolve_path(locator: &str) -> Option<PathBuf> {
    let locator = locator.trim();
    if locator.is_empty() {
        return None;
    }

    let locator = locator.strip_prefix("file://").unwrap_or(locator);

    let path = if locator == "~" {
        dirs::home_dir()?
    } else if let Some(rest) = locator.strip_prefix("~/") {
        dirs::home_dir()?.join(rest)
    } else {
        PathBuf::from(locator)
    };

    path.is_file().then_some(path)
}
