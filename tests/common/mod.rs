#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use imsg_lens::embedding::{EmbedError, Embedder};

/// Chat rows every test archive carries.
pub const DM_CHAT: i64 = 1;
pub const GROUP_CHAT: i64 = 2;

pub struct AttachmentRow {
    pub rowid: i64,
    pub guid: String,
    pub filename: String,
    pub mime_type: Option<String>,
    /// Mac absolute seconds.
    pub created_date: i64,
    pub chat: i64,
}

impl AttachmentRow {
    pub fn image(rowid: i64, filename: impl Into<String>) -> Self {
        Self {
            rowid,
            guid: format!("G{}", rowid),
            filename: filename.into(),
            mime_type: Some("image/jpeg".to_string()),
            created_date: 700_000_000 + rowid,
            chat: DM_CHAT,
        }
    }
}

/// Write an image file the fake embedder accepts.
pub fn write_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("pixels of {}", name)).unwrap();
    path
}

/// Write a file the fake embedder rejects.
pub fn write_corrupt_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"BAD header").unwrap();
    path
}

/// Build a miniature Messages database at `path`.
pub async fn build_archive(path: &Path, attachments: &[AttachmentRow]) {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    for ddl in [
        "CREATE TABLE attachment (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, guid TEXT, filename TEXT, mime_type TEXT, created_date INTEGER, transfer_name TEXT, total_bytes INTEGER)",
        "CREATE TABLE message (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, text TEXT)",
        "CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER)",
        "CREATE TABLE chat (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, chat_identifier TEXT, display_name TEXT, style INTEGER)",
        "CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER)",
        "INSERT INTO chat (ROWID, chat_identifier, display_name, style) VALUES (1, '+15550001', '', 45)",
        "INSERT INTO chat (ROWID, chat_identifier, display_name, style) VALUES (2, 'chat900', 'Family', 43)",
    ] {
        sqlx::query(ddl).execute(&pool).await.unwrap();
    }

    for a in attachments {
        let transfer_name = Path::new(&a.filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        sqlx::query(
            "INSERT INTO attachment (ROWID, guid, filename, mime_type, created_date, transfer_name, total_bytes) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(a.rowid)
        .bind(&a.guid)
        .bind(&a.filename)
        .bind(a.mime_type.clone())
        .bind(a.created_date)
        .bind(transfer_name)
        .bind(1024i64)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("INSERT INTO message (ROWID, text) VALUES (?, '')")
            .bind(a.rowid)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (?, ?)")
            .bind(a.rowid)
            .bind(a.rowid)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO chat_message_join (chat_id, message_id) VALUES (?, ?)")
            .bind(a.chat)
            .bind(a.rowid)
            .execute(&pool)
            .await
            .unwrap();
    }

    pool.close().await;
}

/// Deterministic embedder: a vector from file bytes or text bytes.
///
/// Files starting with `BAD` make the whole call fail, like a real image
/// decoder would.
pub struct FakeEmbedder;

pub const FAKE_DIMS: usize = 8;

pub fn fake_vector(bytes: &[u8]) -> Vec<f32> {
    let mut v = vec![0.0f32; FAKE_DIMS];
    for (i, b) in bytes.iter().enumerate() {
        v[i % FAKE_DIMS] += *b as f32;
    }
    v
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake"
    }

    fn dims(&self) -> usize {
        FAKE_DIMS
    }

    async fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(path).map_err(|e| EmbedError::Resource {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if bytes.starts_with(b"BAD") {
                return Err(EmbedError::Resource {
                    path: path.clone(),
                    reason: "cannot decode image".to_string(),
                });
            }
            out.push(fake_vector(&bytes));
        }
        Ok(out)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| fake_vector(t.as_bytes())).collect())
    }
}
